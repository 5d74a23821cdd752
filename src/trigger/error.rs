// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Trigger specific errors

use core::fmt;
use core::str::FromStr;
use std::io;
use std::process::ExitStatus;

/// Error parsing a trigger URI
pub type ParseError = <reqwest::Url as FromStr>::Err;

/// Trigger specific errors
#[derive(Debug)]
pub enum Error {
    InvalidUri(ParseError),
    /// No trigger exists for the given scheme
    Unsupported(String),
    /// An SSH URI without host
    MissingHost,
    /// An empty SSH helper command line
    NoHelper,
    /// The HTTP request failed
    Http(reqwest::Error),
    /// The SSH helper could not be started
    Spawn(io::Error),
    /// The SSH helper failed with the given error output
    Helper(ExitStatus, String),
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::InvalidUri(inner) => Some(inner),
            Self::Http(inner) => Some(inner),
            Self::Spawn(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(inner: reqwest::Error) -> Self {
        Self::Http(inner)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUri(_) => write!(f, "Could not parse URI"),
            Self::Unsupported(scheme) => write!(f, "Unsupported protocol '{scheme}'"),
            Self::MissingHost => write!(f, "SSH URI without host"),
            Self::NoHelper => write!(f, "No SSH helper specified"),
            Self::Http(_) => write!(f, "HTTP request failed"),
            Self::Spawn(_) => write!(f, "Could not run SSH helper"),
            Self::Helper(status, stderr) => write!(f, "SSH helper failed ({status}): {stderr}"),
        }
    }
}
