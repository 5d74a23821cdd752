// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Two-page toggle automaton

use crate::config::Capture;
use crate::event::FaultEvent;
use crate::tracking::{self, FaultTracker, Operation, TrackMode};

use super::{Automaton, Error, Outcome, Stats, Targets, read_snapshot};

/// Automaton toggling tracking between two pages
///
/// A fault on one target arms the other. After
/// [`ignore_cycles`][Capture::ignore_cycles] faults on the first target, all
/// pages are access tracked for one cycle. The last fault outside the targets
/// in that cycle is taken as the stack buffer, which is captured on every
/// subsequent fault on a target.
pub struct Toggle {
    config: Capture,
    targets: Targets,
    first_hits: usize,
    locating: bool,
    window: Vec<u64>,
    stack_buf: Option<u64>,
    events: Vec<FaultEvent>,
    stats: Stats,
}

impl Toggle {
    pub fn new(targets: Targets, config: Capture) -> Self {
        Self {
            config,
            targets,
            first_hits: 0,
            locating: false,
            window: Vec::new(),
            stack_buf: None,
            events: Vec::new(),
            stats: Default::default(),
        }
    }

    pub fn stack_buf(&self) -> Option<u64> {
        self.stack_buf
    }

    fn arm<T: FaultTracker>(&self, tracker: &T, gpa: u64) -> Result<(), Error<T::Error>> {
        let mode = self.config.toggle_mode;
        tracker
            .track_page(gpa, mode)
            .map_err(tracking::Error::at(Operation::Track(gpa, mode)))?;
        Ok(())
    }
}

impl Automaton for Toggle {
    fn start<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>> {
        log::info!("Tracking start page {:#x}", self.targets.first);
        self.arm(tracker, self.targets.first)
    }

    fn handle<T: FaultTracker>(
        &mut self,
        tracker: &T,
        mut event: FaultEvent,
    ) -> Result<(), Error<T::Error>> {
        self.stats.events += 1;
        let gpa = event.faulted_gpa;
        let on_first = event.is_on_page(self.targets.first);
        let on_second = event.is_on_page(self.targets.second);

        if on_first || on_second {
            if let Some(stack_buf) = self.stack_buf {
                event.snapshot = Some(read_snapshot(tracker, stack_buf, self.config.flush_cpu)?);
                self.stats.snapshots += 1;
            }
            self.events.push(event);
        }

        if on_first {
            if self.locating && self.first_hits == self.config.ignore_cycles + 1 {
                self.locating = false;
                let op = Operation::UntrackAll(TrackMode::Access);
                tracker
                    .untrack_all(TrackMode::Access)
                    .map_err(tracking::Error::at(op))?;
                let stack_buf = *self.window.last().ok_or(Error::StackBufferNotFound(0))?;
                log::info!("Located stack buffer at {stack_buf:#x}");
                self.stats.located_from = self.window.len();
                self.stack_buf = Some(stack_buf);
            }
            self.arm(tracker, self.targets.second)?;
            if self.first_hits == self.config.ignore_cycles {
                let op = Operation::TrackAll(TrackMode::Access);
                tracker
                    .track_all(TrackMode::Access)
                    .map_err(tracking::Error::at(op))?;
                self.locating = true;
            }
            self.first_hits += 1;
        } else if on_second {
            self.arm(tracker, self.targets.first)?;
        } else if self.locating {
            self.window.push(gpa);
        } else {
            self.stats.desyncs += 1;
        }
        Ok(())
    }

    fn recorded(&self) -> usize {
        self.events.len()
    }

    fn finish(self) -> Outcome {
        Outcome {
            events: self.events,
            stack_buf_gpa: self.stack_buf,
            stats: self.stats,
        }
    }
}
