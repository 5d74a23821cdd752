// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Hypervisor fault-tracking interface
//!
//! The capture components drive page tracking through the [`FaultTracker`]
//! trait. Every call may block or fail independently. Implementations must
//! not retry internally and callers must not retry either, since a repeated
//! acknowledge or re-track would diverge from the hardware state.
//!
//! [`Replay`] implements the interface on top of a recorded trace.

pub mod error;
pub mod replay;


use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::event::FaultEvent;

pub use error::Error;
pub use replay::Replay;

/// Tracking mode of a page
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMode {
    /// Trap on any access
    Access,
    /// Trap on write accesses
    Write,
    /// Trap on instruction fetches
    Exec,
}

impl TrackMode {
    /// Determine whether a fault with the given error code is trapped by this mode
    pub fn traps(self, event: &FaultEvent) -> bool {
        match self {
            Self::Access => true,
            Self::Write => event.error_code.is_write(),
            Self::Exec => event.error_code.is_fetch(),
        }
    }
}

impl fmt::Display for TrackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => write!(f, "access"),
            Self::Write => write!(f, "write"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Operation of a [`FaultTracker`], used for error reporting
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Track(u64, TrackMode),
    Untrack(u64, TrackMode),
    TrackAll(TrackMode),
    UntrackAll(TrackMode),
    Poll,
    Ack(u64),
    ReadMemory(u64),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track(gpa, mode) => write!(f, "track {gpa:#x} ({mode})"),
            Self::Untrack(gpa, mode) => write!(f, "untrack {gpa:#x} ({mode})"),
            Self::TrackAll(mode) => write!(f, "track all ({mode})"),
            Self::UntrackAll(mode) => write!(f, "untrack all ({mode})"),
            Self::Poll => write!(f, "poll event"),
            Self::Ack(id) => write!(f, "ack event {id}"),
            Self::ReadMemory(gpa) => write!(f, "read memory at {gpa:#x}"),
        }
    }
}

/// Page fault tracking facility of a hypervisor
///
/// All operations take `&self` so that a poller and a consumer may share one
/// tracker.
pub trait FaultTracker {
    /// Error type returned by all operations
    type Error: core::error::Error + Send + Sync + 'static;

    /// Arm tracking of a single page
    fn track_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error>;

    /// Disarm tracking of a single page
    fn untrack_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error>;

    /// Arm tracking of all guest pages
    fn track_all(&self, mode: TrackMode) -> Result<(), Self::Error>;

    /// Disarm tracking of all guest pages
    fn untrack_all(&self, mode: TrackMode) -> Result<(), Self::Error>;

    /// Poll for the next event without blocking
    fn poll_event(&self) -> Result<Option<FaultEvent>, Self::Error>;

    /// Acknowledge a delivered event, resuming the guest
    fn ack_event(&self, id: u64) -> Result<(), Self::Error>;

    /// Read guest memory, optionally flushing caches on the given core first
    fn read_guest_memory(
        &self,
        gpa: u64,
        len: usize,
        flush_cpu: Option<u32>,
    ) -> Result<Vec<u8>, Self::Error>;
}

impl<T: FaultTracker + ?Sized> FaultTracker for &T {
    type Error = T::Error;

    fn track_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error> {
        T::track_page(self, gpa, mode)
    }

    fn untrack_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error> {
        T::untrack_page(self, gpa, mode)
    }

    fn track_all(&self, mode: TrackMode) -> Result<(), Self::Error> {
        T::track_all(self, mode)
    }

    fn untrack_all(&self, mode: TrackMode) -> Result<(), Self::Error> {
        T::untrack_all(self, mode)
    }

    fn poll_event(&self) -> Result<Option<FaultEvent>, Self::Error> {
        T::poll_event(self)
    }

    fn ack_event(&self, id: u64) -> Result<(), Self::Error> {
        T::ack_event(self, id)
    }

    fn read_guest_memory(
        &self,
        gpa: u64,
        len: usize,
        flush_cpu: Option<u32>,
    ) -> Result<Vec<u8>, Self::Error> {
        T::read_guest_memory(self, gpa, len, flush_cpu)
    }
}

/// Cancellation token shared between workers
///
/// Cancellation is the regular way of ending a capture.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Default::default()
    }

    /// Request all workers to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Busy-poll until the next event arrives
///
/// Returns [`None`] if `cancel` was cancelled before an event arrived.
pub fn wait_for_event<T: FaultTracker>(
    tracker: &T,
    cancel: &Cancellation,
) -> Result<Option<FaultEvent>, T::Error> {
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(event) = tracker.poll_event()? {
            return Ok(Some(event));
        }
        core::hint::spin_loop();
    }
}
