// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Trace conversion
//!
//!     Usage: pf-trace [OPTIONS] <trace>
//!
//! This program converts a JSON trace into the plain text format, one line per
//! event. Run markers are preserved, all other non-record lines are dropped.
//! The output is written to stdout unless a file is given via `--output`.
//!
//! Statistics over the trace are printed to stderr: the number of runs and
//! events, how many of them carry optional data and the pages faulted most.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use pf_keyrecovery::event::FaultEvent;
use pf_keyrecovery::trace::{self, Format, Line};

fn main() -> Result<()> {
    let matches = clap::Command::new("Trace conversion")
        .arg(
            clap::arg!(<trace> "Trace in JSON format").value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(-o --output <FILE> "Output file").value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(--top <NUM> "Number of most faulted pages to list")
                .value_parser(clap::value_parser!(usize))
                .default_value("10"),
        )
        .arg(
            clap::arg!(-q --quiet "Only print statistics").action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::arg!(-d --debug "Enable additional debug output")
                .env("DEBUG")
                .action(clap::ArgAction::SetTrue)
                .value_parser(clap::builder::FalseyValueParser::new()),
        )
        .get_matches();

    let level = if matches.get_flag("debug") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let path = matches
        .get_one::<PathBuf>("trace")
        .ok_or_else(|| anyhow!("No trace specified"))?;
    let file = std::fs::File::open(path).context("Could not open trace")?;

    let output: Box<dyn Write> = match matches.get_one::<PathBuf>("output") {
        _ if matches.get_flag("quiet") => Box::new(io::sink()),
        Some(path) => {
            let file = std::fs::File::create(path).context("Could not create output file")?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let mut writer = trace::Writer::new(output, Format::Plain);

    let mut stats = Stats::default();
    for line in trace::Parser::new(BufReader::new(file)) {
        let written = match line.context("Could not parse trace")? {
            Line::Event(event) => {
                stats.add(&event);
                writer.write_event(&event)
            }
            Line::Start(ts) => {
                stats.runs += 1;
                writer.write_note(&format!("{} {ts}", trace::START_MARKER))
            }
            Line::Stop(ts) => writer.write_note(&format!("{} {ts}", trace::STOP_MARKER)),
            Line::Other => Ok(()),
        };
        written.context("Could not write output")?;
    }
    writer.flush().context("Could not write output")?;

    let top = matches.get_one::<usize>("top").copied().unwrap_or(10);
    stats.print(top);

    Ok(())
}

#[derive(Default)]
struct Stats {
    runs: usize,
    events: usize,
    writes: usize,
    with_rip: usize,
    with_retired: usize,
    with_snapshot: usize,
    pages: HashMap<u64, usize>,
}

impl Stats {
    fn add(&mut self, event: &FaultEvent) {
        self.events += 1;
        self.writes += usize::from(event.error_code.is_write());
        self.with_rip += usize::from(event.rip.is_some());
        self.with_retired += usize::from(event.retired_instructions.is_some());
        self.with_snapshot += usize::from(event.snapshot.is_some());
        *self.pages.entry(event.page()).or_default() += 1;
    }

    fn print(&self, top: usize) {
        eprintln!("Runs:              {}", self.runs);
        eprintln!("Events:            {}", self.events);
        eprintln!("Write faults:      {}", self.writes);
        eprintln!("With RIP:          {}", self.with_rip);
        eprintln!("With retired:      {}", self.with_retired);
        eprintln!("With snapshot:     {}", self.with_snapshot);
        eprintln!("Distinct pages:    {}", self.pages.len());

        let mut pages: Vec<_> = self.pages.iter().map(|(p, n)| (*n, *p)).collect();
        pages.sort_unstable_by(|a, b| b.cmp(a));
        for (count, page) in pages.into_iter().take(top) {
            eprintln!("  {page:#014x} {count:>8}");
        }
    }
}
