// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Fault recorder
//!
//!     Usage: pf-record [OPTIONS] <accesses>
//!
//! This program records every page fault of a number of victim runs. The
//! victim is simulated by a hypervisor replaying a recording of its page
//! accesses once per run. If a trigger is given via `--trigger`, it is executed
//! at the start of every run.
//!
//! By default, all pages are tracked and re-armed after the victim made
//! progress. With `--allow-list`, only the pages listed in the given file (one
//! address per line) are tracked initially.

use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use pf_keyrecovery::recorder::{self, Recorder};
use pf_keyrecovery::trace::{self, Format};
use pf_keyrecovery::tracking::{Cancellation, Replay, TrackMode};
use pf_keyrecovery::trigger::{self, Trigger};

fn main() -> Result<()> {
    let matches = clap::Command::new("Fault recorder")
        .arg(
            clap::arg!(<accesses> "Recording of the victim's page accesses")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(-o --output <FILE> "Output file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("faults.trace"),
        )
        .arg(
            clap::arg!(-f --format <FORMAT> "Output format")
                .value_parser(["json", "plain"])
                .default_value("json"),
        )
        .arg(
            clap::arg!(-m --mode <MODE> "Tracking mode")
                .value_parser(["access", "write", "exec"])
                .default_value("access"),
        )
        .arg(
            clap::arg!(--"allow-list" <FILE> "Only track the listed pages")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(--"find-write" "Additionally track write accesses")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::arg!(--"no-retrack" "Do not re-arm pages after they faulted")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::arg!(--"exclude-kernel" "Do not re-arm pages on faults in kernel space")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::arg!(-n --runs <NUM> "Number of victim runs")
                .value_parser(clap::value_parser!(NonZeroUsize))
                .default_value("1"),
        )
        .arg(clap::arg!(-t --trigger <URI> "Trigger for the victim"))
        .arg(
            clap::arg!(-d --debug "Enable additional debug output")
                .env("DEBUG")
                .action(clap::ArgAction::SetTrue)
                .value_parser(clap::builder::FalseyValueParser::new()),
        )
        .get_matches();

    init_logging(matches.get_flag("debug"));

    let format = match matches.get_one::<String>("format").map(String::as_str) {
        Some("plain") => Format::Plain,
        _ => Format::Json,
    };
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("write") => TrackMode::Write,
        Some("exec") => TrackMode::Exec,
        _ => TrackMode::Access,
    };
    let runs = matches
        .get_one::<NonZeroUsize>("runs")
        .map_or(1, |n| n.get());
    let mut recorder = Recorder::default()
        .with_mode(mode)
        .with_format(format)
        .with_runs(runs)
        .with_find_write(matches.get_flag("find-write"))
        .with_retrack(!matches.get_flag("no-retrack"))
        .with_kernel_excluded(matches.get_flag("exclude-kernel"));
    if let Some(path) = matches.get_one::<PathBuf>("allow-list") {
        let file = std::fs::File::open(path).context("Could not open allow-list")?;
        let pages =
            recorder::parse_allow_list(BufReader::new(file)).context("Could not parse allow-list")?;
        log::info!("Tracking {} allowed pages", pages.len());
        recorder = recorder.with_allow_list(pages);
    }

    let path = matches
        .get_one::<PathBuf>("accesses")
        .ok_or_else(|| anyhow!("No recording specified"))?;
    let file = std::fs::File::open(path).context("Could not open recording")?;
    let accesses = trace::parse(BufReader::new(file))
        .context("Could not parse recording")?
        .into_events();
    log::info!("Loaded {} accesses", accesses.len());

    let trigger = matches
        .get_one::<String>("trigger")
        .map(|u| Trigger::from_uri(u))
        .transpose()
        .context("Could not set up trigger")?;

    let output = matches
        .get_one::<PathBuf>("output")
        .ok_or_else(|| anyhow!("No output file specified"))?;
    let file = std::fs::File::create(output).context("Could not create output file")?;

    let cancel = Cancellation::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel())
        .context("Could not install Ctrl-C handler")?;

    let replay = Replay::paused(Vec::new());
    let victim = || {
        replay.feed(accesses.clone());
        if let Some(trigger) = trigger.as_ref() {
            let reply = trigger.execute()?;
            log::debug!("Victim replied with {} bytes", reply.len());
        }
        while !replay.is_exhausted() && !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok::<_, trigger::Error>(())
    };

    let summary = recorder
        .record(&replay, BufWriter::new(file), &cancel, victim)
        .context("Recording failed")?;
    log::info!(
        "Recorded {} events in {} runs to {}, re-armed {} pages",
        summary.events,
        summary.runs,
        output.display(),
        summary.retracked
    );

    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
