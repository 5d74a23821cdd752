// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Streaming fault recorder
//!
//! The [`Recorder`] writes every fault of one or more victim runs to a trace.
//! A poller thread publishes events into a bounded queue. A consumer thread
//! writes them out, re-arms the pages that faulted before and acknowledges
//! them. Each run is enclosed in [`START_MARKER`][crate::trace::START_MARKER]
//! and [`STOP_MARKER`][crate::trace::STOP_MARKER] lines.
//!
//! # Example
//!
//! ```
//! use pf_keyrecovery::event::FaultEvent;
//! use pf_keyrecovery::recorder::Recorder;
//! use pf_keyrecovery::tracking::{Cancellation, Replay};
//!
//! let replay = Replay::paused(vec![
//!     FaultEvent::new(0, 0x1000, 0x4).with_rip(0x401000),
//!     FaultEvent::new(0, 0x2000, 0x6).with_rip(0x401008),
//! ]);
//! let cancel = Cancellation::new();
//! let mut out = Vec::new();
//! let summary = Recorder::default()
//!     .record(&replay, &mut out, &cancel, || {
//!         replay.resume();
//!         while !replay.is_exhausted() {
//!             std::thread::yield_now();
//!         }
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .unwrap();
//! assert_eq!(summary.events, 2);
//! ```

pub mod error;

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Mutex;

use crossbeam::channel;

use crate::event::{ErrorCode, FaultEvent, MissingData};
use crate::trace::{self, Format};
use crate::tracking::{self, Cancellation, FaultTracker, Operation, TrackMode};

pub use error::Error;

/// Capacity of the queue between poller and consumer
pub const QUEUE_CAPACITY: usize = 1000;

/// Lowest instruction pointer of the kernel half of the address space
pub const KERNEL_SPACE: u64 = 0xffff_8000_0000_0000;

/// Minimum number of retired instructions counting as progress
const MIN_PROGRESS: u64 = 2;

/// Streaming recorder settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recorder {
    mode: TrackMode,
    allow_list: Option<Vec<u64>>,
    find_write: bool,
    retrack: bool,
    exclude_kernel: bool,
    format: Format,
    runs: usize,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            mode: TrackMode::Access,
            allow_list: None,
            find_write: false,
            retrack: true,
            exclude_kernel: false,
            format: Format::Json,
            runs: 1,
        }
    }
}

impl Recorder {
    /// Set the [`TrackMode`] pages are tracked with
    pub fn with_mode(self, mode: TrackMode) -> Self {
        Self { mode, ..self }
    }

    /// Only track the given pages instead of all pages
    pub fn with_allow_list(self, allow_list: Vec<u64>) -> Self {
        Self {
            allow_list: Some(allow_list),
            ..self
        }
    }

    /// Additionally write track all pages
    ///
    /// Pages with a write fault are re-armed for write tracking.
    pub fn with_find_write(self, find_write: bool) -> Self {
        Self { find_write, ..self }
    }

    /// Set whether faulted pages are re-armed once the guest made progress
    pub fn with_retrack(self, retrack: bool) -> Self {
        Self { retrack, ..self }
    }

    /// Ignore faults with an instruction pointer in kernel space for re-arming
    pub fn with_kernel_excluded(self, exclude_kernel: bool) -> Self {
        Self {
            exclude_kernel,
            ..self
        }
    }

    /// Set the output [`Format`]
    pub fn with_format(self, format: Format) -> Self {
        Self { format, ..self }
    }

    /// Set the number of victim runs to record
    pub fn with_runs(self, runs: usize) -> Self {
        Self { runs, ..self }
    }

    /// Record all faults of the configured number of victim runs
    ///
    /// `victim` is called once per run and is expected to return after the
    /// victim finished. All workers are cancelled once the last run is over or
    /// any of them failed.
    pub fn record<T, W, V, E>(
        &self,
        tracker: &T,
        output: W,
        cancel: &Cancellation,
        mut victim: V,
    ) -> Result<Summary, Error<T::Error>>
    where
        T: FaultTracker + Sync,
        W: io::Write + Send,
        V: FnMut() -> Result<(), E>,
        E: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let shared = Mutex::new(Shared {
            writer: trace::Writer::new(output, self.format),
            backlog: Vec::new(),
        });
        let (sender, receiver) = channel::bounded(QUEUE_CAPACITY);

        let (result, polled, consumed) = std::thread::scope(|s| {
            let poller = s.spawn(|| poll(tracker, cancel, sender));
            let consumer = s.spawn(|| {
                let result = self.consume(tracker, &shared, receiver);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            });

            let result = self.drive(tracker, &shared, cancel, &mut victim);
            cancel.cancel();
            let polled = poller
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e));
            let consumed = consumer
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e));
            (result, polled, consumed)
        });

        let (events, retracked) = consumed?;
        polled?;
        let runs = result?;
        shared
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .writer
            .flush()?;
        log::info!("Recorded {events} events in {runs} runs");
        Ok(Summary {
            runs,
            events,
            retracked,
        })
    }

    fn drive<T, W, V, E>(
        &self,
        tracker: &T,
        shared: &Mutex<Shared<W>>,
        cancel: &Cancellation,
        victim: &mut V,
    ) -> Result<usize, Error<T::Error>>
    where
        T: FaultTracker,
        W: io::Write,
        V: FnMut() -> Result<(), E>,
        E: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let mut runs = 0;
        while runs < self.runs && !cancel.is_cancelled() {
            {
                let mut shared = lock(shared);
                shared.writer.start_run()?;
                shared.backlog.clear();
            }
            self.init_tracking(tracker)?;

            log::info!("Triggering run {}", runs + 1);
            victim().map_err(|e| Error::Victim(e.into()))?;
            runs += 1;

            lock(shared).writer.stop_run()?;
            untrack_all(tracker, self.mode)?;
            if self.find_write {
                untrack_all(tracker, TrackMode::Write)?;
            }
        }
        Ok(runs)
    }

    fn init_tracking<T: FaultTracker>(&self, tracker: &T) -> Result<(), Error<T::Error>> {
        match &self.allow_list {
            Some(pages) => {
                log::info!("Tracking {} allowed pages", pages.len());
                for &gpa in pages {
                    track_page(tracker, gpa, self.mode)?;
                }
            }
            None => {
                if self.find_write {
                    track_all(tracker, TrackMode::Write)?;
                }
                track_all(tracker, self.mode)?;
            }
        }
        Ok(())
    }

    fn consume<T, W>(
        &self,
        tracker: &T,
        shared: &Mutex<Shared<W>>,
        receiver: channel::Receiver<FaultEvent>,
    ) -> Result<(usize, usize), Error<T::Error>>
    where
        T: FaultTracker,
        W: io::Write,
    {
        let mut events = 0;
        let mut retracked = 0;
        for event in receiver {
            log::debug!("{event}");
            lock(shared).writer.write_event(&event)?;

            if self.retrack && !self.in_kernel(&event) {
                let pending = {
                    let mut shared = lock(shared);
                    let pending = if !shared.backlog.is_empty() && made_progress(&event)? {
                        core::mem::take(&mut shared.backlog)
                    } else {
                        Vec::new()
                    };
                    shared.backlog.push((event.faulted_gpa, event.error_code));
                    pending
                };
                for (gpa, code) in pending {
                    let mode = if self.find_write && code.is_write() {
                        TrackMode::Write
                    } else {
                        self.mode
                    };
                    track_page(tracker, gpa, mode)?;
                    retracked += 1;
                }
            }

            tracker
                .ack_event(event.id)
                .map_err(tracking::Error::at(Operation::Ack(event.id)))?;
            events += 1;
        }
        Ok((events, retracked))
    }

    fn in_kernel(&self, event: &FaultEvent) -> bool {
        self.exclude_kernel && event.rip.is_some_and(|rip| rip >= KERNEL_SPACE)
    }
}

/// Outcome of a recording
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Number of completed victim runs
    pub runs: usize,
    /// Number of recorded events
    pub events: usize,
    /// Number of re-armed pages
    pub retracked: usize,
}

/// State shared between the run driver and the consumer
struct Shared<W> {
    writer: trace::Writer<W>,
    backlog: Vec<(u64, ErrorCode)>,
}

fn lock<W>(shared: &Mutex<Shared<W>>) -> std::sync::MutexGuard<'_, Shared<W>> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Determine whether the guest made progress since the previous fault
fn made_progress(event: &FaultEvent) -> Result<bool, MissingData> {
    if event.rip.is_some() {
        return Ok(true);
    }
    Ok(event.retired_instructions()? > MIN_PROGRESS)
}

fn poll<T: FaultTracker>(
    tracker: &T,
    cancel: &Cancellation,
    sender: channel::Sender<FaultEvent>,
) -> Result<(), tracking::Error<T::Error>> {
    let result = loop {
        match tracking::wait_for_event(tracker, cancel) {
            Ok(Some(event)) => {
                if sender.send(event).is_err() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(tracking::Error::new(Operation::Poll, e)),
        }
    };
    if result.is_err() {
        cancel.cancel();
    }
    log::debug!("Poller stopped");
    result
}

fn track_page<T: FaultTracker>(
    tracker: &T,
    gpa: u64,
    mode: TrackMode,
) -> Result<(), tracking::Error<T::Error>> {
    tracker
        .track_page(gpa, mode)
        .map_err(tracking::Error::at(Operation::Track(gpa, mode)))
}

fn track_all<T: FaultTracker>(
    tracker: &T,
    mode: TrackMode,
) -> Result<(), tracking::Error<T::Error>> {
    tracker
        .track_all(mode)
        .map_err(tracking::Error::at(Operation::TrackAll(mode)))
}

fn untrack_all<T: FaultTracker>(
    tracker: &T,
    mode: TrackMode,
) -> Result<(), tracking::Error<T::Error>> {
    tracker
        .untrack_all(mode)
        .map_err(tracking::Error::at(Operation::UntrackAll(mode)))
}

/// Parse an allow-list of pages, one address per line
///
/// Addresses are either `0x` prefixed hex or decimal. Empty lines are skipped.
pub fn parse_allow_list(reader: impl io::BufRead) -> Result<Vec<u64>, error::AllowListError> {
    let mut pages = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let gpa = crate::config::serde_utils::parse_addr(line)
            .ok_or_else(|| error::AllowListError::Invalid(n + 1, line.into()))?;
        pages.push(gpa);
    }
    Ok(pages)
}
