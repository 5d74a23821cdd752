// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! EdDSA recovery specific errors

use core::fmt;

use super::digits::Layout;

/// EdDSA recovery specific errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The snapshot layout cannot be used for digit recovery
    InvalidLayout(Layout),
    /// Fewer snapshots than required were captured
    TooFewSnapshots(usize, usize),
    /// The transcript's signature is malformed
    MalformedSignature,
    /// The transcript's public key does not have 32 bytes
    MalformedPublicKey(usize),
    /// None of the given number of candidate offsets yielded a working key
    NoCandidateValidated(usize),
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLayout(layout) => write!(
                f,
                "Unusable layout of {} snapshots in {} cycles",
                layout.accesses_per_cycle, layout.cycles,
            ),
            Self::TooFewSnapshots(have, need) => {
                write!(f, "Got {have} snapshots, need at least {need}")
            }
            Self::MalformedSignature => write!(f, "Malformed signature"),
            Self::MalformedPublicKey(len) => {
                write!(f, "Public key has {len} bytes instead of 32")
            }
            Self::NoCandidateValidated(n) => {
                write!(f, "No candidate validated ({n} offsets tried)")
            }
        }
    }
}
