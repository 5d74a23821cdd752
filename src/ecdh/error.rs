// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! ECDH recovery specific errors

use core::fmt;
use std::io;

use crate::config::StreamLayout;
use crate::event::MissingData;

use super::Stream;

/// ECDH recovery specific errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The stream layout cannot be used for swap recovery
    InvalidLayout(StreamLayout),
    /// A stream ended before the snapshot at the given index, required for
    /// the given bit
    StreamExhausted(Stream, usize, usize),
    /// An event in one of the streams did not carry a snapshot
    MissingData(MissingData),
    /// The requested offset never changes
    NoChangeAtOffset(usize),
    /// The ground truth has the given number of bits instead of the required
    GroundTruthLength(usize, usize),
    /// None of the given number of candidate offsets matched the ground truth
    NoCandidateMatched(usize),
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::MissingData(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<MissingData> for Error {
    fn from(inner: MissingData) -> Self {
        Self::MissingData(inner)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLayout(layout) => write!(
                f,
                "Unusable layout of {} iterations with {} unknown bits",
                layout.iterations, layout.unknown_high_bits,
            ),
            Self::StreamExhausted(stream, index, bit) => write!(
                f,
                "{stream} stream has no snapshot {index} (required for bit {bit})"
            ),
            Self::MissingData(_) => write!(f, "Stream event without snapshot"),
            Self::NoChangeAtOffset(offset) => {
                write!(f, "No change observed at offset {offset:#05x}")
            }
            Self::GroundTruthLength(have, need) => {
                write!(f, "Ground truth has {have} bits instead of {need}")
            }
            Self::NoCandidateMatched(n) => {
                write!(f, "No candidate matched the ground truth ({n} tried)")
            }
        }
    }
}

/// Errors reading the victim's secret from its reply
#[derive(Debug)]
pub enum SecretError {
    /// No line carries the secret
    NotFound,
    /// The line with the given number has an unexpected number of tokens
    Tokens(usize, usize),
    /// The secret is not valid hex
    Hex(hex::FromHexError),
    Io(io::Error),
}

impl core::error::Error for SecretError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Hex(inner) => Some(inner),
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<hex::FromHexError> for SecretError {
    fn from(inner: hex::FromHexError) -> Self {
        Self::Hex(inner)
    }
}

impl From<io::Error> for SecretError {
    fn from(inner: io::Error) -> Self {
        Self::Io(inner)
    }
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "No secret found"),
            Self::Tokens(line, n) => {
                write!(f, "Line {line}: expected 2 tokens, found {n}")
            }
            Self::Hex(_) => write!(f, "Secret is not valid hex"),
            Self::Io(_) => write!(f, "Could not read secret"),
        }
    }
}
