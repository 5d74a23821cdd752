// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Page fault events
//!
//! This module provides the [`FaultEvent`] reported by the fault-tracking
//! interface for every trapped page access. Events are exchanged as JSON
//! records (see [`Record`]) and may be rendered in a plain one-line format via
//! [`Display`][fmt::Display].

pub mod error;

#[cfg(test)]
mod tests;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::config::serde_utils::Base64Content;

pub use error::{Error, Field, MissingData};

/// Size of a guest page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Mask extracting the page part of a physical address
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Page fault error code
///
/// The bits follow the x86 page fault error code.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const RESERVED: u32 = 1 << 3;
    pub const FETCH: u32 = 1 << 4;

    /// Determine whether the fault was caused by a write access
    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Determine whether the fault was caused by an instruction fetch
    pub fn is_fetch(self) -> bool {
        self.0 & Self::FETCH != 0
    }

    /// Determine whether the fault originated in user mode
    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }
}

impl From<u32> for ErrorCode {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 5] = [
            (ErrorCode::PRESENT, "Present"),
            (ErrorCode::WRITE, "Write"),
            (ErrorCode::USER, "User"),
            (ErrorCode::RESERVED, "Reserved"),
            (ErrorCode::FETCH, "Fetch"),
        ];

        let mut names = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, n)| n);
        if let Some(first) = names.next() {
            write!(f, "{first}")?;
            names.try_for_each(|n| write!(f, " {n}"))
        } else {
            write!(f, "None")
        }
    }
}

/// Guest memory captured while handling a fault
///
/// Pairs the page content with the address it was read from. The monitored
/// address may differ from the faulted one.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub monitored: u64,
    pub content: Box<[u8; PAGE_SIZE]>,
}

impl Snapshot {
    /// Create a new snapshot from a page worth of data
    ///
    /// Returns [`None`] if `content` is not exactly [`PAGE_SIZE`] bytes long.
    pub fn new(monitored: u64, content: &[u8]) -> Option<Self> {
        let content: [u8; PAGE_SIZE] = content.try_into().ok()?;
        Some(Self {
            monitored,
            content: Box::new(content),
        })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("monitored", &format_args!("{:#x}", self.monitored))
            .finish_non_exhaustive()
    }
}

/// A page fault reported by the fault-tracking interface
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Record", into = "Record")]
pub struct FaultEvent {
    /// Monotonic sequence id
    pub id: u64,
    /// Page aligned address of the faulted page
    pub faulted_gpa: u64,
    pub error_code: ErrorCode,
    /// Instruction pointer, if the virtualization mode exposes it
    pub rip: Option<u64>,
    /// Retired instructions since the previous fault, if measured
    pub retired_instructions: Option<u64>,
    pub timestamp: Option<String>,
    pub snapshot: Option<Snapshot>,
}

impl FaultEvent {
    /// Create a new event without optional data
    pub fn new(id: u64, faulted_gpa: u64, error_code: u32) -> Self {
        Self {
            id,
            faulted_gpa,
            error_code: ErrorCode(error_code),
            rip: None,
            retired_instructions: None,
            timestamp: None,
            snapshot: None,
        }
    }

    /// Set the instruction pointer
    pub fn with_rip(self, rip: u64) -> Self {
        Self {
            rip: Some(rip),
            ..self
        }
    }

    /// Set the retired instruction count
    pub fn with_retired_instructions(self, count: u64) -> Self {
        Self {
            retired_instructions: Some(count),
            ..self
        }
    }

    /// Set the captured snapshot
    pub fn with_snapshot(self, snapshot: Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..self
        }
    }

    /// Retrieve the instruction pointer
    pub fn rip(&self) -> Result<u64, MissingData> {
        self.rip.ok_or(MissingData::new(self.id, Field::Rip))
    }

    /// Retrieve the retired instruction count
    pub fn retired_instructions(&self) -> Result<u64, MissingData> {
        self.retired_instructions
            .ok_or(MissingData::new(self.id, Field::RetiredInstructions))
    }

    /// Retrieve the captured page content
    pub fn content(&self) -> Result<&[u8; PAGE_SIZE], MissingData> {
        self.snapshot
            .as_ref()
            .map(|s| s.content.as_ref())
            .ok_or(MissingData::new(self.id, Field::Content))
    }

    /// Retrieve the page of the faulted address
    pub fn page(&self) -> u64 {
        self.faulted_gpa & PAGE_MASK
    }

    /// Determine whether this event was a fault on the given page
    pub fn is_on_page(&self, gpa: u64) -> bool {
        same_page(self.faulted_gpa, gpa)
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID {}, FaultedGPA {:x}, ", self.id, self.faulted_gpa)?;
        match self.rip {
            Some(rip) => write!(f, "RIP {rip:x}, ")?,
            None => write!(f, "RIP unknown, ")?,
        }
        if let Some(ts) = self.timestamp.as_ref() {
            write!(f, "Timestamp {ts}, ")?;
        }
        match self.retired_instructions {
            Some(count) => write!(f, "RetInstr {count}, ")?,
            None => write!(f, "RetInstr not measured, ")?,
        }
        write!(f, "Error Code {}", self.error_code)?;
        if let Some(snapshot) = self.snapshot.as_ref() {
            write!(f, ", Monitored {:x}", snapshot.monitored)?;
        }
        Ok(())
    }
}

/// Determine whether two physical addresses lie in the same page
pub fn same_page(a: u64, b: u64) -> bool {
    a & PAGE_MASK == b & PAGE_MASK
}

/// Wire format of a [`FaultEvent`]
///
/// Optional values are accompanied by presence flags. A value whose flag is
/// cleared is ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub faulted_gpa: u64,
    pub error_code: u32,
    #[serde(default)]
    pub have_rip_info: bool,
    #[serde(default)]
    pub rip: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub have_retired_instructions: bool,
    #[serde(default)]
    pub retired_instructions: u64,
    #[serde(default, with = "Base64Content")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub monitor_gpa: u64,
}

impl TryFrom<Record> for FaultEvent {
    type Error = Error;

    fn try_from(record: Record) -> Result<Self, Self::Error> {
        let snapshot = match (record.content, record.monitor_gpa) {
            (Some(content), monitored) => Snapshot::new(monitored, &content)
                .map(Some)
                .ok_or(Error::ContentSize(record.id, content.len()))?,
            (None, 0) => None,
            (None, monitored) => return Err(Error::UnpairedMonitor(record.id, monitored)),
        };
        Ok(Self {
            id: record.id,
            faulted_gpa: record.faulted_gpa,
            error_code: record.error_code.into(),
            rip: record.have_rip_info.then_some(record.rip),
            retired_instructions: record
                .have_retired_instructions
                .then_some(record.retired_instructions),
            timestamp: Some(record.timestamp).filter(|t| !t.is_empty()),
            snapshot,
        })
    }
}

impl From<FaultEvent> for Record {
    fn from(event: FaultEvent) -> Self {
        let (content, monitor_gpa) = event
            .snapshot
            .map(|s| (Some(s.content.to_vec()), s.monitored))
            .unwrap_or_default();
        Self {
            id: event.id,
            faulted_gpa: event.faulted_gpa,
            error_code: event.error_code.0,
            have_rip_info: event.rip.is_some(),
            rip: event.rip.unwrap_or_default(),
            timestamp: event.timestamp.unwrap_or_default(),
            have_retired_instructions: event.retired_instructions.is_some(),
            retired_instructions: event.retired_instructions.unwrap_or_default(),
            content,
            monitor_gpa,
        }
    }
}
