// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Offline EdDSA key recovery
//!
//!     Usage: pf-recover-eddsa --config <FILE> --trace <FILE> [OPTIONS]
//!
//! This program recovers a secret sufficient for forging signatures from an
//! attack trace and the attack configuration written by `pf-capture`. The
//! snapshot layout recorded in the configuration may be overridden by the
//! capture section of a parameter file.
//!
//! For diagnosing a failing recovery, the signer's Ed25519 seed may be given
//! via `--debug-seed`. Digits recovered at each offset are then compared
//! against the digits the signer actually used.

use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use pf_keyrecovery::config::{self, EddsaAttack, LayoutOverride, Parameters, serde_utils};
use pf_keyrecovery::eddsa::{self, Options};
use pf_keyrecovery::trace;

fn main() -> Result<()> {
    let matches = clap::Command::new("EdDSA key recovery")
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
            clap::arg!(-p --params <FILE> "Parameters overriding the snapshot layout")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::arg!(--"specific-offset" <OFFSET> "Only consider this offset")
                .value_parser(parse_offset),
        )
        .arg(
            clap::arg!(--"debug-seed" <HEX> "Signer's seed for comparing digits")
                .value_parser(parse_seed),
        )
        .arg(
            clap::arg!(-m --message <MSG> "Message to forge a signature for")
                .default_value("test message"),
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
    let mut attack: EddsaAttack =
        config::from_toml(&attack).context("Could not parse attack configuration")?;

    if let Some(path) = matches.get_one::<PathBuf>("params") {
        let params = std::fs::read_to_string(path).context("Could not load parameters")?;
        config::from_toml::<Parameters>(&params).context("Could not parse parameters")?;
        LayoutOverride::from_params(&params)
            .context("Could not parse parameters")?
            .apply(&mut attack);
    }
    log::debug!("Attack configuration: {attack:?}");

    let path = matches
        .get_one::<PathBuf>("trace")
        .ok_or_else(|| anyhow!("No trace specified"))?;
    let file = std::fs::File::open(path).context("Could not open trace")?;
    let trace = trace::parse(BufReader::new(file)).context("Could not parse trace")?;
    log::info!("Loaded {} events", trace.len());
    let events = trace.retain_snapshots().into_events();

    let message = matches
        .get_one::<String>("message")
        .map(|m| m.as_bytes().to_vec())
        .unwrap_or_else(|| eddsa::FORGED_MESSAGE.to_vec());
    let mut options = Options {
        specific_offset: matches.get_one::<usize>("specific-offset").copied(),
        message,
        ..Default::default()
    };
    if let Some(seed) = matches.get_one::<[u8; 32]>("debug-seed") {
        options = options.with_seed(seed, &attack.transcript.message);
    }

    let report = eddsa::recover(&attack, &events, &options).context("Recovery failed")?;
    let key = &report.key;
    println!("Candidates:      {}", report.candidates.len());
    println!("Offset:          {:#05x}", key.offset);
    println!("Reduced nonce:   {}", hex::encode(key.reduced_nonce));
    println!("Secret:          {}", hex::encode(key.secret));
    println!("Public key:      {}", hex::encode(key.public_key));
    println!(
        "Forged message:  {}",
        String::from_utf8_lossy(&key.forged_message)
    );
    println!("Signature:       {}", hex::encode(key.forged_signature));

    Ok(())
}

fn parse_offset(s: &str) -> Result<usize, String> {
    serde_utils::parse_addr(s)
        .and_then(|o| usize::try_from(o).ok())
        .ok_or_else(|| format!("'{s}' is not an offset"))
}

fn parse_seed(s: &str) -> Result<[u8; 32], String> {
    let seed = hex::decode(s.trim()).map_err(|e| e.to_string())?;
    seed.try_into()
        .map_err(|s: Vec<u8>| format!("seed has {} bytes instead of 32", s.len()))
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
