// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Trace specific errors

use core::fmt;
use std::io;

/// Errors reading or writing traces
#[derive(Debug)]
pub enum Error {
    /// A record on the given line could not be decoded
    Parse(usize, serde_json::Error),
    /// An event could not be encoded
    Serialize(serde_json::Error),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Self::Io(inner)
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Parse(_, inner) => Some(inner),
            Self::Serialize(inner) => Some(inner),
            Self::Io(inner) => Some(inner),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(line, _) => write!(f, "Malformed record on line {line}"),
            Self::Serialize(_) => write!(f, "Could not encode event"),
            Self::Io(_) => write!(f, "I/O error"),
        }
    }
}
