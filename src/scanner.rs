// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Offset and candidate scanner
//!
//! The location of the secret dependent value within the monitored page is
//! not known in advance. Any aligned block of the page that differs between
//! two snapshots is a candidate. Candidates are collected generously across
//! many snapshot pairs and weeded out by the recovery algorithms.


use std::collections::{BTreeMap, BTreeSet};

/// Find all blocks that differ between `before` and `after`
///
/// Blocks of `block` bytes start at every multiple of `alignment`. Only
/// blocks fully contained in both buffers are considered. Returns the offsets
/// of all blocks containing at least one differing byte.
///
/// # Example
///
/// ```
/// use pf_keyrecovery::scanner::updated_offsets;
///
/// let before = [0u8; 64];
/// let mut after = before;
/// after[35] = 1;
/// let offsets: Vec<_> = updated_offsets(&before, &after, 16, 16).into_iter().collect();
/// assert_eq!(offsets, [32]);
/// let offsets: Vec<_> = updated_offsets(&before, &after, 8, 32).into_iter().collect();
/// assert_eq!(offsets, [8, 16, 24, 32]);
/// ```
pub fn updated_offsets(
    before: &[u8],
    after: &[u8],
    alignment: usize,
    block: usize,
) -> BTreeSet<usize> {
    let len = before.len().min(after.len());
    if alignment == 0 || block == 0 || block > len {
        return Default::default();
    }
    (0..=len - block)
        .step_by(alignment)
        .filter(|&offset| differs(before, after, offset, block))
        .collect()
}

/// Determine whether the `len` bytes at `offset` differ between two buffers
///
/// Ranges not contained in both buffers never differ.
pub fn differs(before: &[u8], after: &[u8], offset: usize, len: usize) -> bool {
    let range = offset..offset.saturating_add(len);
    match (before.get(range.clone()), after.get(range)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// Accumulate the [`updated_offsets`] of many snapshot pairs
pub fn collect_offsets<'a>(
    pairs: impl IntoIterator<Item = (&'a [u8], &'a [u8])>,
    alignment: usize,
    block: usize,
) -> BTreeSet<usize> {
    pairs
        .into_iter()
        .flat_map(|(before, after)| updated_offsets(before, after, alignment, block))
        .collect()
}

/// Recovery candidates
///
/// Maps offsets within the monitored page to the value recovered there. The
/// set of offsets whose recovery failed is kept separately for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidates<T> {
    recovered: BTreeMap<usize, T>,
    discarded: BTreeSet<usize>,
}

impl<T> Default for Candidates<T> {
    fn default() -> Self {
        Self {
            recovered: Default::default(),
            discarded: Default::default(),
        }
    }
}

impl<T> Candidates<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a value recovered at an offset
    pub fn insert(&mut self, offset: usize, value: T) {
        self.discarded.remove(&offset);
        self.recovered.insert(offset, value);
    }

    /// Mark an offset as not yielding a valid value
    pub fn discard(&mut self, offset: usize) {
        self.recovered.remove(&offset);
        self.discarded.insert(offset);
    }

    /// Retrieve the value recovered at an offset
    pub fn get(&self, offset: usize) -> Option<&T> {
        self.recovered.get(&offset)
    }

    /// Iterate over all recovered values in order of their offsets
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.recovered.iter().map(|(o, v)| (*o, v))
    }

    pub fn discarded(&self) -> &BTreeSet<usize> {
        &self.discarded
    }

    pub fn len(&self) -> usize {
        self.recovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty()
    }
}

impl<T> IntoIterator for Candidates<T> {
    type Item = (usize, T);
    type IntoIter = std::collections::btree_map::IntoIter<usize, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.recovered.into_iter()
    }
}
