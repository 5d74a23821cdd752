// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Simulated hypervisor replaying recorded page accesses

use core::fmt;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::event::{FaultEvent, PAGE_MASK, PAGE_SIZE};

use super::{Cancellation, FaultTracker, TrackMode};

/// [`FaultTracker`] replaying a recorded sequence of page accesses
///
/// The recording lists every access of the victim in order. An access is
/// delivered as an event only if its page is tracked in a mode trapping it,
/// after which tracking of that page in that mode is disarmed, like a real
/// hypervisor does. Untracked accesses pass silently. While an event awaits
/// acknowledgement the guest is halted and no further events are delivered.
///
/// Snapshots in the recording update the simulated guest memory of their
/// monitored page at the point of the access, whether or not it is delivered.
/// Delivered events never carry snapshots.
pub struct Replay {
    state: Mutex<State>,
    on_exhausted: Option<Cancellation>,
}

#[derive(Default)]
struct State {
    accesses: std::vec::IntoIter<FaultEvent>,
    pages: HashSet<(u64, TrackMode)>,
    /// Modes tracked for all pages, with pages exempt after faulting
    all: HashMap<TrackMode, HashSet<u64>>,
    memory: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
    pending_ack: Option<u64>,
    next_id: u64,
    paused: bool,
    exhausted: bool,
}

impl State {
    fn is_tracked(&self, page: u64, mode: TrackMode) -> bool {
        let all = self.all.get(&mode);
        self.pages.contains(&(page, mode)) || all.is_some_and(|exempt| !exempt.contains(&page))
    }

    fn disarm(&mut self, page: u64, mode: TrackMode) {
        self.pages.remove(&(page, mode));
        if let Some(exempt) = self.all.get_mut(&mode) {
            exempt.insert(page);
        }
    }
}

impl Replay {
    /// Create a new replay of the given accesses
    pub fn new(accesses: Vec<FaultEvent>) -> Self {
        let state = State {
            accesses: accesses.into_iter(),
            next_id: 1,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            on_exhausted: None,
        }
    }

    /// Create a new replay that delivers no events until [resumed][Self::resume]
    ///
    /// This mimics a victim that only starts executing when triggered.
    pub fn paused(accesses: Vec<FaultEvent>) -> Self {
        let replay = Self::new(accesses);
        replay.lock().paused = true;
        replay
    }

    /// Start replaying accesses
    pub fn resume(&self) {
        self.lock().paused = false;
    }

    /// Queue further accesses and resume replaying
    ///
    /// Event ids continue where the previous accesses left off.
    pub fn feed(&self, accesses: Vec<FaultEvent>) {
        let mut state = self.lock();
        let mut queued: Vec<_> = state.accesses.by_ref().collect();
        queued.extend(accesses);
        state.accesses = queued.into_iter();
        state.exhausted = false;
        state.paused = false;
    }

    /// Cancel the given token once all accesses have been replayed
    pub fn with_cancellation(self, cancel: Cancellation) -> Self {
        Self {
            on_exhausted: Some(cancel),
            ..self
        }
    }

    /// Determine whether all accesses have been replayed
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// Retrieve the set of pages currently tracked in the given mode
    ///
    /// Pages tracked via [`FaultTracker::track_all`] are not included.
    pub fn tracked_pages(&self, mode: TrackMode) -> Vec<u64> {
        let mut pages: Vec<_> = self
            .lock()
            .pages
            .iter()
            .filter(|(_, m)| *m == mode)
            .map(|(p, _)| *p)
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Determine whether all pages are tracked in the given mode
    pub fn tracks_all(&self, mode: TrackMode) -> bool {
        self.lock().all.contains_key(&mode)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FaultTracker for Replay {
    type Error = Error;

    fn track_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error> {
        let mut state = self.lock();
        let page = gpa & PAGE_MASK;
        match state.all.get_mut(&mode) {
            Some(exempt) => {
                exempt.remove(&page);
            }
            None => {
                state.pages.insert((page, mode));
            }
        }
        Ok(())
    }

    fn untrack_page(&self, gpa: u64, mode: TrackMode) -> Result<(), Self::Error> {
        self.lock().disarm(gpa & PAGE_MASK, mode);
        Ok(())
    }

    fn track_all(&self, mode: TrackMode) -> Result<(), Self::Error> {
        let mut state = self.lock();
        state.pages.retain(|(_, m)| *m != mode);
        state.all.insert(mode, Default::default());
        Ok(())
    }

    fn untrack_all(&self, mode: TrackMode) -> Result<(), Self::Error> {
        let mut state = self.lock();
        state.pages.retain(|(_, m)| *m != mode);
        state.all.remove(&mode);
        Ok(())
    }

    fn poll_event(&self) -> Result<Option<FaultEvent>, Self::Error> {
        let mut state = self.lock();
        if state.pending_ack.is_some() || state.paused {
            return Ok(None);
        }

        while let Some(mut access) = state.accesses.next() {
            if let Some(snapshot) = access.snapshot.take() {
                state
                    .memory
                    .insert(snapshot.monitored & PAGE_MASK, snapshot.content);
            }

            let page = access.page();
            let modes: Vec<_> = [TrackMode::Access, TrackMode::Write, TrackMode::Exec]
                .into_iter()
                .filter(|m| m.traps(&access) && state.is_tracked(page, *m))
                .collect();
            if modes.is_empty() {
                continue;
            }
            modes.into_iter().for_each(|m| state.disarm(page, m));

            access.id = state.next_id;
            state.next_id += 1;
            state.pending_ack = Some(access.id);
            return Ok(Some(access));
        }

        if !state.exhausted {
            state.exhausted = true;
            log::debug!("Replay exhausted after {} events", state.next_id - 1);
            if let Some(cancel) = self.on_exhausted.as_ref() {
                cancel.cancel();
            }
        }
        Ok(None)
    }

    fn ack_event(&self, id: u64) -> Result<(), Self::Error> {
        let mut state = self.lock();
        match state.pending_ack {
            Some(pending) if pending == id => {
                state.pending_ack = None;
                Ok(())
            }
            _ => Err(Error::UnknownEvent(id)),
        }
    }

    fn read_guest_memory(
        &self,
        gpa: u64,
        len: usize,
        _flush_cpu: Option<u32>,
    ) -> Result<Vec<u8>, Self::Error> {
        let offset = (gpa & !PAGE_MASK) as usize;
        if offset + len > PAGE_SIZE {
            return Err(Error::CrossesPage(gpa, len));
        }
        let data = self
            .lock()
            .memory
            .get(&(gpa & PAGE_MASK))
            .map(|page| page[offset..offset + len].to_vec())
            .unwrap_or_else(|| vec![0; len]);
        Ok(data)
    }
}

/// Errors of the [`Replay`] backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An event not pending acknowledgement was acknowledged
    UnknownEvent(u64),
    /// A memory read exceeds the page boundary
    CrossesPage(u64, usize),
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownEvent(id) => write!(f, "event {id} is not pending"),
            Self::CrossesPage(gpa, len) => {
                write!(f, "read of {len} bytes at {gpa:#x} crosses a page boundary")
            }
        }
    }
}
