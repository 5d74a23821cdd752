// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Capture specific errors

use core::fmt;

use crate::event::MissingData;
use crate::tracking;

/// Capture specific errors
#[derive(Debug, PartialEq, Eq)]
pub enum Error<E> {
    /// A call into the fault-tracking interface failed
    Tracking(tracking::Error<E>),
    /// An event lacked data required for locating the stack buffer
    MissingData(MissingData),
    /// The stack buffer pattern did not occur in the given number of faults
    StackBufferNotFound(usize),
    /// The stack buffer was located before any event was recorded
    NoEventRecorded,
    /// The buffer-location window at the given position does not close within
    /// an attack sequence of the given length
    InvalidLocateWindow(usize, usize),
    /// Guest memory read returned a wrong number of bytes
    ShortRead(u64, usize),
    /// The number of desyncs exceeded the configured limit
    ExcessiveDesync(usize),
}

impl<E> From<tracking::Error<E>> for Error<E> {
    fn from(inner: tracking::Error<E>) -> Self {
        Self::Tracking(inner)
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
            Self::MissingData(inner) => Some(inner),
            _ => None,
        }
    }
}

impl<E> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracking(_) => write!(f, "Capture aborted"),
            Self::MissingData(_) => write!(f, "Cannot locate stack buffer"),
            Self::StackBufferNotFound(n) => {
                write!(f, "No stack buffer access among {n} faults")
            }
            Self::NoEventRecorded => write!(f, "No event recorded to attach the stack buffer to"),
            Self::InvalidLocateWindow(at, len) => write!(
                f,
                "Location window at {at} does not close within {len} sequence positions"
            ),
            Self::ShortRead(gpa, len) => {
                write!(f, "Read {len} bytes instead of a page at {gpa:#x}")
            }
            Self::ExcessiveDesync(n) => write!(f, "Too many desyncs ({n})"),
        }
    }
}
