// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Offline ECDH scalar recovery
//!
//!     Usage: pf-recover-ecdh --config <FILE> --trace <FILE> [OPTIONS]
//!
//! This program recovers the victim's X25519 scalar from an attack trace and
//! the attack configuration written by `pf-capture`. The stream layout may be
//! adjusted via the stream section of a parameter file.
//!
//! If the trace file contains the victim's reply with its secret, candidates
//! are compared against it and the program fails if none matches. Otherwise,
//! all candidates are printed.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use pf_keyrecovery::config::{self, EcdhAttack, Parameters, serde_utils};
use pf_keyrecovery::ecdh::{self, Candidate, Options, SecretError};
use pf_keyrecovery::trace;

fn main() -> Result<()> {
    let matches = clap::Command::new("ECDH scalar recovery")
        .arg(
            clap::arg!(-c --config <FILE> "Attack configuration")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            clap::arg!(-t --trace <FILE> "Attack trace")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            clap::arg!(-p --params <FILE> "Parameters with the stream layout")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(--"specific-offset" <OFFSET> "Only consider this offset")
                .value_parser(parse_offset),
        )
        .arg(
            clap::arg!(--"show-all" "Print all candidates").action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::arg!(-d --debug "Enable additional debug output")
                .env("DEBUG")
                .action(clap::ArgAction::SetTrue)
                .value_parser(clap::builder::FalseyValueParser::new()),
        )
        .get_matches();

    init_logging(matches.get_flag("debug"));

    let path = matches
        .get_one::<PathBuf>("config")
        .ok_or_else(|| anyhow!("No configuration specified"))?;
    let attack = std::fs::read_to_string(path).context("Could not load attack configuration")?;
    let attack: EcdhAttack =
        config::from_toml(&attack).context("Could not parse attack configuration")?;
    log::debug!("Attack configuration: {attack:?}");

    let params: Parameters = matches
        .get_one::<PathBuf>("params")
        .map(|p| {
            let params = std::fs::read_to_string(p).context("Could not load parameters")?;
            config::from_toml::<Parameters>(&params).context("Could not parse parameters")
        })
        .transpose()?
        .unwrap_or_default();
    log::debug!("Stream layout: {:?}", params.stream);

    let path = matches
        .get_one::<PathBuf>("trace")
        .ok_or_else(|| anyhow!("No trace specified"))?;
    let file = std::fs::File::open(path).context("Could not open trace")?;
    let trace = trace::parse(BufReader::new(file)).context("Could not parse trace")?;
    log::info!("Loaded {} events", trace.len());

    let options = Options {
        specific_offset: matches.get_one::<usize>("specific-offset").copied(),
        ground_truth: ground_truth(path)?,
    };
    let report = ecdh::recover(&attack, trace.events(), &params.stream, &options)
        .context("Recovery failed")?;

    if options.ground_truth.is_none() || matches.get_flag("show-all") {
        report.scalars.iter().for_each(print_candidate);
    }
    if options.ground_truth.is_some() {
        let matched = report.matched().context("Recovery failed")?;
        println!("Match:");
        print_candidate(matched);
    }

    Ok(())
}

/// Read the victim's secret from the trace file, if it is contained
fn ground_truth(path: &Path) -> Result<Option<Vec<u8>>> {
    let file = std::fs::File::open(path).context("Could not open trace")?;
    match ecdh::parse_openssl_secret(BufReader::new(file)) {
        Ok(secret) => {
            log::info!("Found ground truth of {} bits", secret.len());
            Ok(Some(secret))
        }
        Err(SecretError::NotFound) => {
            log::info!("No ground truth in trace");
            Ok(None)
        }
        Err(e) => Err(e).context("Could not read ground truth"),
    }
}

fn print_candidate(candidate: &Candidate) {
    let distance = candidate
        .distance
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{:#05x} top swaps {:b} distance {distance:>3} scalar {}",
        candidate.offset,
        candidate.top_swaps,
        hex::encode(candidate.to_bytes()),
    );
}

fn parse_offset(s: &str) -> Result<usize, String> {
    serde_utils::parse_addr(s)
        .and_then(|o| usize::try_from(o).ok())
        .ok_or_else(|| format!("'{s}' is not an offset"))
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
