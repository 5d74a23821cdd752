// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Line oriented fault traces
//!
//! A trace file contains one [`FaultEvent`] record per line, encoded as JSON.
//! Runs of the victim are delimited by `Start` and `Stop` marker lines, each
//! followed by a timestamp. Any other line is skipped.
//!
//! # Example
//!
//! ```
//! use pf_keyrecovery::trace;
//!
//! let log = concat!(
//!     "Start 2021-08-14T11:13:35Z\n",
//!     "{\"id\":1,\"faulted_gpa\":4096,\"error_code\":4}\n",
//!     "Stop 2021-08-14T11:13:36Z\n",
//! );
//! let trace = trace::parse(log.as_bytes()).unwrap();
//! assert_eq!(trace.runs().count(), 1);
//! assert_eq!(trace.events()[0].faulted_gpa, 0x1000);
//! ```

pub mod error;


use std::io;
use std::ops::Range;

use crate::event::FaultEvent;

pub use crate::event::same_page;
pub use error::Error;

/// Prefix of the run start marker line
pub const START_MARKER: &str = "Start";

/// Prefix of the run stop marker line
pub const STOP_MARKER: &str = "Stop";

/// A single classified line of a trace file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    Event(FaultEvent),
    /// Run start marker with its timestamp
    Start(String),
    /// Run stop marker with its timestamp
    Stop(String),
    /// Line that is neither a record nor a marker
    Other,
}

/// Parser for trace files
///
/// Yields one [`Line`] for every line of the input. Lines starting with `{`
/// are decoded as records and fail with [`Error::Parse`] if they can't be.
/// Unrecognized lines and records lacking optional data are each reported
/// once via [`log::warn`].
pub struct Parser<R> {
    lines: io::Lines<R>,
    line_no: usize,
    warned_other: bool,
    warned_rip: bool,
    warned_retired: bool,
}

impl<R: io::BufRead> Parser<R> {
    /// Create a new parser reading from the given source
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            warned_other: false,
            warned_rip: false,
            warned_retired: false,
        }
    }

    fn classify(&mut self, line: &str) -> Result<Line, Error> {
        let line = line.trim_start();
        if let Some(ts) = line.strip_prefix(START_MARKER) {
            return Ok(Line::Start(ts.trim().into()));
        }
        if let Some(ts) = line.strip_prefix(STOP_MARKER) {
            return Ok(Line::Stop(ts.trim().into()));
        }
        if !line.starts_with('{') {
            if !self.warned_other {
                log::warn!("Omitting non-record lines (first at line {})", self.line_no);
                self.warned_other = true;
            }
            return Ok(Line::Other);
        }

        let event: FaultEvent =
            serde_json::from_str(line).map_err(|e| Error::Parse(self.line_no, e))?;
        if event.rip.is_none() && !self.warned_rip {
            log::warn!("Some events do not carry RIP information");
            self.warned_rip = true;
        }
        if event.retired_instructions.is_none() && !self.warned_retired {
            log::warn!("Some events do not carry retired instruction counts");
            self.warned_retired = true;
        }
        Ok(Line::Event(event))
    }
}

impl<R: io::BufRead> Iterator for Parser<R> {
    type Item = Result<Line, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(Error::Io(e))),
        };
        self.line_no += 1;
        Some(self.classify(&line))
    }
}

/// An ordered sequence of [`FaultEvent`]s, optionally partitioned into runs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    events: Vec<FaultEvent>,
    runs: Vec<Range<usize>>,
}

impl Trace {
    /// Create a trace from events without any runs
    pub fn new(events: Vec<FaultEvent>) -> Self {
        Self {
            events,
            runs: Vec::new(),
        }
    }

    /// Retrieve all events in arrival order, regardless of runs
    pub fn events(&self) -> &[FaultEvent] {
        &self.events
    }

    /// Iterate over the runs of this trace
    ///
    /// Each run only contains the events between its markers.
    pub fn runs(&self) -> impl Iterator<Item = &[FaultEvent]> + '_ {
        self.runs.iter().map(|r| &self.events[r.clone()])
    }

    /// Iterate over all events on the given page
    pub fn on_page(&self, gpa: u64) -> impl Iterator<Item = &FaultEvent> + '_ {
        self.events.iter().filter(move |e| e.is_on_page(gpa))
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop all events without a snapshot
    ///
    /// Runs are discarded as their boundaries are no longer meaningful.
    pub fn retain_snapshots(self) -> Self {
        Self::new(
            self.events
                .into_iter()
                .filter(|e| e.snapshot.is_some())
                .collect(),
        )
    }

    pub fn into_events(self) -> Vec<FaultEvent> {
        self.events
    }
}

impl From<Vec<FaultEvent>> for Trace {
    fn from(events: Vec<FaultEvent>) -> Self {
        Self::new(events)
    }
}

/// Parse a complete trace
///
/// All records are collected, whether or not they are enclosed by run
/// markers. A run that is still open at the end of the input is not recorded
/// as a run.
pub fn parse(reader: impl io::BufRead) -> Result<Trace, Error> {
    let mut trace = Trace::default();
    let mut run_start = None;
    for line in Parser::new(reader) {
        match line? {
            Line::Event(event) => trace.events.push(event),
            Line::Start(_) => {
                if run_start.is_some() {
                    log::warn!("Encountered start marker inside a run");
                } else {
                    run_start = Some(trace.events.len());
                }
            }
            Line::Stop(_) => match run_start.take() {
                Some(start) => trace.runs.push(start..trace.events.len()),
                None => log::warn!("Encountered stop marker outside of a run"),
            },
            Line::Other => (),
        }
    }
    if run_start.is_some() {
        log::warn!("Dropping unterminated run at end of trace");
    }
    Ok(trace)
}

/// Output format of a [`Writer`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// One JSON record per line
    #[default]
    Json,
    /// One [`Display`][core::fmt::Display]ed event per line
    Plain,
}

/// Writer for trace files
pub struct Writer<W> {
    inner: W,
    format: Format,
}

impl<W: io::Write> Writer<W> {
    /// Create a new writer producing the given [`Format`]
    pub fn new(inner: W, format: Format) -> Self {
        Self { inner, format }
    }

    /// Write a single event
    pub fn write_event(&mut self, event: &FaultEvent) -> Result<(), Error> {
        match self.format {
            Format::Json => {
                serde_json::to_writer(&mut self.inner, event).map_err(Error::Serialize)?;
                writeln!(self.inner)?;
            }
            Format::Plain => writeln!(self.inner, "{event}")?,
        }
        Ok(())
    }

    /// Write the start marker of a new run
    pub fn start_run(&mut self) -> Result<(), Error> {
        writeln!(self.inner, "{START_MARKER} {}", now())?;
        Ok(())
    }

    /// Write the stop marker of the current run
    pub fn stop_run(&mut self) -> Result<(), Error> {
        writeln!(self.inner, "{STOP_MARKER} {}", now())?;
        Ok(())
    }

    /// Write an arbitrary line, which readers will skip
    pub fn write_note(&mut self, note: &str) -> Result<(), Error> {
        writeln!(self.inner, "{note}")?;
        Ok(())
    }

    /// Append a reply of the victim
    ///
    /// Every line of the reply is written as a note. Lines readers would take
    /// for a record or a run marker are prefixed with `> `.
    pub fn write_reply(&mut self, reply: &[u8]) -> Result<(), Error> {
        for line in String::from_utf8_lossy(reply).lines() {
            let start = line.trim_start();
            if start.starts_with('{')
                || start.starts_with(START_MARKER)
                || start.starts_with(STOP_MARKER)
            {
                writeln!(self.inner, "> {line}")?;
            } else {
                self.write_note(line)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().map_err(Error::Io)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
