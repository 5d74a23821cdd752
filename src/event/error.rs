// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Event specific errors

use core::fmt;

/// Errors decoding a [`Record`][super::Record]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Captured content is not exactly one page
    ContentSize(u64, usize),
    /// A monitored address was given without content
    UnpairedMonitor(u64, u64),
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentSize(id, len) => {
                write!(f, "event {id}: content has {len} bytes instead of a page")
            }
            Self::UnpairedMonitor(id, addr) => {
                write!(f, "event {id}: monitored address {addr:#x} without content")
            }
        }
    }
}

/// Optional event data
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Rip,
    RetiredInstructions,
    Content,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rip => write!(f, "instruction pointer"),
            Self::RetiredInstructions => write!(f, "retired instruction count"),
            Self::Content => write!(f, "page content"),
        }
    }
}

/// Some algorithm required data an event did not carry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MissingData {
    pub id: u64,
    pub field: Field,
}

impl MissingData {
    pub const fn new(id: u64, field: Field) -> Self {
        Self { id, field }
    }
}

impl core::error::Error for MissingData {}

impl fmt::Display for MissingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {} carries no {}", self.id, self.field)
    }
}
