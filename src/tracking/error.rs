// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Tracking specific errors

use core::fmt;

use super::Operation;

/// A call into a [`FaultTracker`][super::FaultTracker] failed
///
/// After such a failure, the tracking state of the hypervisor is unknown.
#[derive(Debug, PartialEq, Eq)]
pub struct Error<E> {
    pub operation: Operation,
    pub inner: E,
}

impl<E> Error<E> {
    pub fn new(operation: Operation, inner: E) -> Self {
        Self { operation, inner }
    }

    /// Create a closure wrapping an inner error for `map_err`
    pub fn at(operation: Operation) -> impl FnOnce(E) -> Self {
        move |inner| Self::new(operation, inner)
    }
}

impl<E> core::error::Error for Error<E>
where
    E: fmt::Debug + core::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hypervisor call failed: {}", self.operation)
    }
}
