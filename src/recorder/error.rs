// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Recorder specific errors

use core::fmt;
use std::io;

use crate::event::MissingData;
use crate::{trace, tracking};

/// Errors aborting a recording
#[derive(Debug)]
pub enum Error<E> {
    /// A call into the fault-tracking interface failed
    Tracking(tracking::Error<E>),
    /// The trace could not be written
    Output(trace::Error),
    /// Progress of the guest could not be determined
    MissingData(MissingData),
    /// Triggering the victim failed
    Victim(Box<dyn core::error::Error + Send + Sync>),
}

impl<E> From<tracking::Error<E>> for Error<E> {
    fn from(inner: tracking::Error<E>) -> Self {
        Self::Tracking(inner)
    }
}

impl<E> From<trace::Error> for Error<E> {
    fn from(inner: trace::Error) -> Self {
        Self::Output(inner)
    }
}

impl<E> From<MissingData> for Error<E> {
    fn from(inner: MissingData) -> Self {
        Self::MissingData(inner)
    }
}

impl<E> core::error::Error for Error<E>
where
    E: fmt::Debug + core::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Tracking(inner) => Some(inner),
            Self::Output(inner) => Some(inner),
            Self::MissingData(inner) => Some(inner),
            Self::Victim(inner) => Some(inner.as_ref()),
        }
    }
}

impl<E> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracking(_) => write!(f, "Recording aborted"),
            Self::Output(_) => write!(f, "Could not write trace"),
            Self::MissingData(_) => write!(f, "Cannot decide whether to re-track pages"),
            Self::Victim(_) => write!(f, "Could not trigger victim"),
        }
    }
}

/// Errors reading an allow-list
#[derive(Debug)]
pub enum AllowListError {
    /// The given line does not hold an address
    Invalid(usize, String),
    Io(io::Error),
}

impl From<io::Error> for AllowListError {
    fn from(inner: io::Error) -> Self {
        Self::Io(inner)
    }
}

impl core::error::Error for AllowListError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Invalid(..) => None,
            Self::Io(inner) => Some(inner),
        }
    }
}

impl fmt::Display for AllowListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(line, s) => write!(f, "Invalid address '{s}' on line {line}"),
            Self::Io(_) => write!(f, "Could not read allow-list"),
        }
    }
}
