// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Live capture automata
//!
//! An [`Automaton`] consumes fault events of a single victim execution,
//! decides which page to arm next and when to capture guest memory. Two
//! automata are provided:
//!
//! * [`Sequence`] follows a cyclic sequence of expected faults on two pages and
//!   captures the stack buffer at designated save points.
//! * [`Toggle`] simply toggles between two pages and captures the stack buffer
//!   on every fault once it is located.
//!
//! Both locate the stack buffer by access tracking all pages for one cycle
//! early in the capture.
//!
//! [`run`] drives an automaton until the capture is cancelled. [`capture`]
//! additionally triggers the victim on a separate thread and reports progress
//! periodically.

pub mod error;
pub mod toggle;

#[cfg(test)]
mod tests;

use core::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::channel;

use crate::config::Capture;
use crate::event::{FaultEvent, PAGE_SIZE, Snapshot, same_page};
use crate::tracking::{self, Cancellation, FaultTracker, Operation, TrackMode};

pub use error::Error;
pub use toggle::Toggle;

/// Interval between progress reports of [`capture`]
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// A capture automaton
pub trait Automaton {
    /// Arm the initial tracking
    fn start<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>>;

    /// Handle a single event
    ///
    /// The event is acknowledged by the caller after this fn returns.
    fn handle<T: FaultTracker>(
        &mut self,
        tracker: &T,
        event: FaultEvent,
    ) -> Result<(), Error<T::Error>>;

    /// Number of events recorded so far
    fn recorded(&self) -> usize;

    /// Finish the capture
    ///
    /// The events recorded so far are returned even if the stack buffer was
    /// not located yet.
    fn finish(self) -> Outcome;
}

/// The two pages toggled during a capture
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Targets {
    pub first: u64,
    pub second: u64,
}

impl Targets {
    pub fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Determine whether the given address lies in one of the target pages
    pub fn contains(&self, gpa: u64) -> bool {
        same_page(gpa, self.first) || same_page(gpa, self.second)
    }

    /// Determine the targets from an execution trace of the victim
    ///
    /// The first target is the page faulted with `marker` retired instructions,
    /// the second one is the page faulted right after. Only faults with a
    /// predecessor and a successor are considered.
    pub fn from_marker(
        events: &[FaultEvent],
        marker: u64,
    ) -> Result<Option<Self>, crate::event::MissingData> {
        for window in events.windows(3) {
            let [prev, hit, next] = window else {
                continue;
            };
            if hit.retired_instructions()? == marker {
                log::debug!("Preceding fault: {prev}");
                log::info!("Marker fault: {hit}");
                return Ok(Some(Self::new(hit.page(), next.page())));
            }
        }
        Ok(None)
    }
}

/// Capture statistics
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Events handled
    pub events: usize,
    /// Events outside the expected sequence
    pub desyncs: usize,
    /// Snapshots taken
    pub snapshots: usize,
    /// Events collected while locating the stack buffer
    pub located_from: usize,
}

/// Result of a capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Recorded events on the target pages
    pub events: Vec<FaultEvent>,
    /// Located stack buffer, if the capture got that far
    pub stack_buf_gpa: Option<u64>,
    pub stats: Stats,
}

/// Phase of a [`Sequence`] automaton
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Unrelated accesses to the target pages are drained
    Ignore,
    /// The attack sequence is followed
    Attack,
}

/// Automaton following cyclic sequences of expected faults
///
/// The automaton starts in the [`Phase::Ignore`] phase following the ignore
/// sequence and switches to the attack sequence once that sequence completed.
/// On each fault matching the current element of the sequence, execution
/// tracking is armed for the next element. Faults not matching are counted as
/// desyncs and otherwise ignored, unless all pages are access tracked for
/// locating the stack buffer.
pub struct Sequence {
    config: Capture,
    targets: Targets,
    ignore: Vec<u64>,
    attack: Vec<u64>,
    phase: Phase,
    index: usize,
    cycle: usize,
    locating: bool,
    side_buffer: Vec<FaultEvent>,
    stack_buf: Option<u64>,
    events: Vec<FaultEvent>,
    stats: Stats,
}

impl Sequence {
    /// Create a new automaton for the given targets
    ///
    /// Both sequences comprise at least one pair of targets.
    pub fn new(targets: Targets, config: Capture) -> Self {
        let pairs = |n: usize| -> Vec<u64> {
            core::iter::repeat_n([targets.first, targets.second], n.max(1))
                .flatten()
                .collect()
        };
        Self {
            ignore: pairs(config.ignore_pairs),
            attack: pairs(config.attack_pairs),
            config,
            targets,
            phase: Phase::Ignore,
            index: 0,
            cycle: 0,
            locating: false,
            side_buffer: Vec::new(),
            stack_buf: None,
            events: Vec::new(),
            stats: Default::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Position in the current sequence
    pub fn index(&self) -> usize {
        self.index
    }

    /// Completed cycles of the attack sequence
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn stack_buf(&self) -> Option<u64> {
        self.stack_buf
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Retrieve the events recorded so far
    pub fn events(&self) -> &[FaultEvent] {
        &self.events
    }

    fn sequence(&self) -> &[u64] {
        match self.phase {
            Phase::Ignore => &self.ignore,
            Phase::Attack => &self.attack,
        }
    }

    fn is_save_point(&self, gpa: u64) -> bool {
        self.phase == Phase::Attack
            && self.config.save_points.contains(&self.index)
            && same_page(self.attack[self.index], gpa)
    }

    fn at_locate_window(&self, position: usize) -> bool {
        self.phase == Phase::Attack && self.cycle == 0 && self.index == position
    }

    fn open_window<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>> {
        log::info!("Access tracking all pages for locating the stack buffer");
        let op = Operation::TrackAll(TrackMode::Access);
        tracker
            .track_all(TrackMode::Access)
            .map_err(tracking::Error::at(op))?;
        self.locating = true;
        Ok(())
    }

    fn close_window<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>> {
        self.locating = false;
        let op = Operation::UntrackAll(TrackMode::Access);
        tracker
            .untrack_all(TrackMode::Access)
            .map_err(tracking::Error::at(op))?;

        let burst = core::mem::take(&mut self.side_buffer);
        burst
            .iter()
            .filter(|e| !e.error_code.is_fetch())
            .for_each(|e| log::debug!("{e}"));
        let found = self
            .config
            .pattern
            .locate(&burst)?
            .ok_or(Error::StackBufferNotFound(burst.len()))?;
        let stack_buf = found.faulted_gpa;
        log::info!(
            "Located stack buffer at {stack_buf:#x} among {} faults (RIP {:x?})",
            burst.len(),
            found.rip,
        );
        self.stats.located_from = burst.len();
        self.stack_buf = Some(stack_buf);

        let snapshot = read_snapshot(tracker, stack_buf, self.config.flush_cpu)?;
        let last = self.events.last_mut().ok_or(Error::NoEventRecorded)?;
        last.snapshot = Some(snapshot);
        self.stats.snapshots += 1;
        Ok(())
    }

    fn advance<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>> {
        self.index = (self.index + 1) % self.sequence().len();
        if self.index == 0 {
            match self.phase {
                Phase::Ignore => {
                    log::debug!("Finished ignore sequence");
                    self.phase = Phase::Attack;
                }
                Phase::Attack => {
                    log::debug!("Cycle {} done", self.cycle);
                    self.cycle += 1;
                }
            }
        }
        let next = self.sequence()[self.index];
        tracker
            .track_page(next, TrackMode::Exec)
            .map_err(tracking::Error::at(Operation::Track(next, TrackMode::Exec)))?;
        Ok(())
    }
}

impl Automaton for Sequence {
    fn start<T: FaultTracker>(&mut self, tracker: &T) -> Result<(), Error<T::Error>> {
        if self.config.locate_at + 1 >= self.attack.len() {
            return Err(Error::InvalidLocateWindow(self.config.locate_at, self.attack.len()));
        }
        let first = self.sequence()[0];
        tracker
            .track_page(first, TrackMode::Exec)
            .map_err(tracking::Error::at(Operation::Track(first, TrackMode::Exec)))?;
        Ok(())
    }

    fn handle<T: FaultTracker>(
        &mut self,
        tracker: &T,
        mut event: FaultEvent,
    ) -> Result<(), Error<T::Error>> {
        self.stats.events += 1;
        let gpa = event.faulted_gpa;
        let matched = same_page(gpa, self.sequence()[self.index]);

        if self.targets.contains(gpa) {
            if let Some(stack_buf) = self.stack_buf.filter(|_| self.is_save_point(gpa)) {
                log::debug!(
                    "Reading stack buffer {stack_buf:#x} at RIP {:x?}",
                    event.rip
                );
                event.snapshot = Some(read_snapshot(tracker, stack_buf, self.config.flush_cpu)?);
                self.stats.snapshots += 1;
            }
            self.events.push(event);
        } else if self.locating {
            self.side_buffer.push(event);
        }

        if !matched {
            if !self.locating {
                self.stats.desyncs += 1;
                log::warn!(
                    "Unexpected fault at {gpa:#x} (cycle {}, index {})",
                    self.cycle,
                    self.index
                );
                if self
                    .config
                    .max_desyncs
                    .is_some_and(|max| self.stats.desyncs > max)
                {
                    return Err(Error::ExcessiveDesync(self.stats.desyncs));
                }
            }
            return Ok(());
        }

        log::debug!("Cycle {}, index {}", self.cycle, self.index);
        if self.at_locate_window(self.config.locate_at) {
            self.open_window(tracker)?;
        }
        if self.at_locate_window(self.config.locate_at + 1) {
            self.close_window(tracker)?;
        }
        self.advance(tracker)
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

/// Read one page of guest memory at the stack buffer
fn read_snapshot<T: FaultTracker>(
    tracker: &T,
    gpa: u64,
    flush_cpu: Option<u32>,
) -> Result<Snapshot, Error<T::Error>> {
    let data = tracker
        .read_guest_memory(gpa, PAGE_SIZE, flush_cpu)
        .map_err(tracking::Error::at(Operation::ReadMemory(gpa)))?;
    Snapshot::new(gpa, &data).ok_or(Error::ShortRead(gpa, data.len()))
}

/// Drive an automaton until the capture is cancelled
///
/// Every event is acknowledged after handling. `progress` is updated with the
/// number of recorded events. On exit, write tracking of all pages is
/// disarmed. A failure doing so is reported unless the capture itself failed.
pub fn run<A: Automaton, T: FaultTracker>(
    mut automaton: A,
    tracker: &T,
    cancel: &Cancellation,
    progress: &AtomicUsize,
) -> Result<Outcome, Error<T::Error>> {
    let result = automaton
        .start(tracker)
        .and_then(|_| drive(&mut automaton, tracker, cancel, progress));

    let op = Operation::UntrackAll(TrackMode::Write);
    let cleanup = tracker
        .untrack_all(TrackMode::Write)
        .map_err(tracking::Error::at(op));
    match (result, cleanup) {
        (Err(e), Err(c)) => {
            log::error!("{c}");
            Err(e)
        }
        (result, cleanup) => {
            result?;
            cleanup?;
            Ok(automaton.finish())
        }
    }
}

fn drive<A: Automaton, T: FaultTracker>(
    automaton: &mut A,
    tracker: &T,
    cancel: &Cancellation,
    progress: &AtomicUsize,
) -> Result<(), Error<T::Error>> {
    while let Some(event) =
        tracking::wait_for_event(tracker, cancel).map_err(tracking::Error::at(Operation::Poll))?
    {
        let id = event.id;
        automaton.handle(tracker, event)?;
        tracker
            .ack_event(id)
            .map_err(tracking::Error::at(Operation::Ack(id)))?;
        progress.store(automaton.recorded(), Ordering::Relaxed);
    }
    log::debug!("Capture cancelled");
    Ok(())
}

/// Trigger the victim and capture its execution
///
/// `victim` is executed on a separate thread. Its completion cancels the
/// capture. Progress is reported every [`PROGRESS_INTERVAL`].
pub fn capture<A, T, V, R>(
    automaton: A,
    tracker: &T,
    cancel: &Cancellation,
    victim: V,
) -> Result<(Outcome, R), Error<T::Error>>
where
    A: Automaton,
    T: FaultTracker,
    V: FnOnce() -> R + Send,
    R: Send,
{
    let progress = AtomicUsize::new(0);
    let (done, finished) = channel::bounded::<()>(0);
    std::thread::scope(|s| {
        let victim = s.spawn(move || {
            log::info!("Triggering victim");
            let payload = victim();
            log::info!("Victim done");
            cancel.cancel();
            payload
        });
        let progress = &progress;
        s.spawn(move || report_progress(progress, finished));

        let outcome = run(automaton, tracker, cancel, progress);
        cancel.cancel();
        drop(done);
        let payload = victim
            .join()
            .unwrap_or_else(|e| std::panic::resume_unwind(e));
        outcome.map(|o| (o, payload))
    })
}

fn report_progress(progress: &AtomicUsize, finished: channel::Receiver<()>) {
    let ticker = channel::tick(PROGRESS_INTERVAL);
    loop {
        let done = channel::select! {
            recv(ticker) -> _ => false,
            recv(finished) -> _ => true,
        };
        if done {
            break;
        }
        log::info!(
            "Captured {} events so far",
            progress.load(Ordering::Relaxed)
        );
    }
    log::info!("Captured {} events", progress.load(Ordering::Relaxed));
}
