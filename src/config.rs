// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Configuration and utilities
//!
//! Two kinds of configuration exist. [`Capture`] and [`StreamLayout`] hold
//! parameters derived by manual analysis of one particular victim binary. They
//! default to the values found for that binary and may be overridden from a
//! TOML parameter file. [`EddsaAttack`] and [`EcdhAttack`] are produced by a
//! capture run and persisted for the offline recovery run.

pub mod serde_utils;


use core::fmt;

use serde::{Deserialize, Serialize};

use crate::eddsa::Transcript;
use crate::locator::Pattern;
use crate::tracking::TrackMode;
use serde_utils::HexAddr;

/// Memory accesses (and thus snapshots) per main loop iteration
pub const MEM_ACCESSES_PER_CYCLE: usize = 10;

/// Number of main loop iterations of the windowed scalar multiplication
pub const MAIN_LOOP_CYCLES: usize = 85;

/// Alignment of the watched stack buffer
pub const STACK_BUF_ALIGNMENT: usize = 16;

/// Size of the watched stack buffer in bytes
pub const STACK_BUF_BYTES: usize = 256;

/// Positions in the attack sequence at which the stack buffer is captured
pub const SAVE_POINTS: [usize; 10] = [1, 3, 5, 7, 9, 11, 13, 15, 19, 20];

/// Parameters for the live capture
///
/// The sequences toggle between two pages. The ignore sequence consists of
/// `ignore_pairs` and the attack sequence of `attack_pairs` repetitions of the
/// two pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capture {
    /// Page pairs in the ignore sequence
    pub ignore_pairs: usize,
    /// Page pairs in the attack sequence
    pub attack_pairs: usize,
    /// Attack sequence positions at which the stack buffer is captured
    pub save_points: Vec<usize>,
    /// Attack sequence position at which the buffer-location window opens
    ///
    /// The window closes one position later.
    pub locate_at: usize,
    /// Stack buffer search pattern
    pub pattern: Pattern,
    /// Faults on the first target before locating the stack buffer when toggling
    pub ignore_cycles: usize,
    /// Tracking mode used when toggling
    pub toggle_mode: TrackMode,
    /// Retired instruction count identifying the first target in an execution trace
    pub target_marker: u64,
    /// Core on which caches are flushed before reading guest memory
    pub flush_cpu: Option<u32>,
    /// Number of desyncs tolerated before the capture is aborted
    pub max_desyncs: Option<usize>,
    /// Memory accesses per main loop iteration, recorded in the attack config
    pub mem_accesses_per_cycle: usize,
    /// Main loop iterations, recorded in the attack config
    pub main_loop_cycles: usize,
    /// Stack buffer alignment, recorded in the attack config
    pub stack_buf_alignment: usize,
    /// Stack buffer size, recorded in the attack config
    pub stack_buf_bytes: usize,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            ignore_pairs: 2,
            attack_pairs: 11,
            save_points: SAVE_POINTS.to_vec(),
            locate_at: 1,
            pattern: Default::default(),
            ignore_cycles: 3,
            toggle_mode: TrackMode::Exec,
            target_marker: 9068,
            flush_cpu: None,
            max_desyncs: None,
            mem_accesses_per_cycle: MEM_ACCESSES_PER_CYCLE,
            main_loop_cycles: MAIN_LOOP_CYCLES,
            stack_buf_alignment: STACK_BUF_ALIGNMENT,
            stack_buf_bytes: STACK_BUF_BYTES,
        }
    }
}

/// Snapshot stream layout for the Montgomery ladder attack
///
/// Iteration `i` (from the top down) maps to the base stream index advanced by
/// [`base_delta_a`][Self::base_delta_a] before and by
/// [`base_delta_b`][Self::base_delta_b] after the comparison, and to the
/// second stream index advanced by [`second_delta`][Self::second_delta] after
/// the comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamLayout {
    pub base_init: usize,
    pub base_delta_a: usize,
    pub base_delta_b: usize,
    pub second_init: usize,
    pub second_delta: usize,
    /// Ladder iterations, one per scalar bit below the top bit
    pub iterations: usize,
    /// High iterations whose swap is never observed
    pub unknown_high_bits: usize,
}

/// See [STREAM_LAYOUT] for default values of individual fields
impl Default for StreamLayout {
    fn default() -> Self {
        STREAM_LAYOUT
    }
}

/// Default [StreamLayout]
pub const STREAM_LAYOUT: StreamLayout = StreamLayout {
    base_init: 0,
    base_delta_a: 17,
    base_delta_b: 1,
    second_init: 18,
    second_delta: 18,
    iterations: 255,
    unknown_high_bits: 1,
};

/// Parameter file contents
///
/// All sections are optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub capture: Capture,
    pub stream: StreamLayout,
}

/// Persisted configuration of an EdDSA attack
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EddsaAttack {
    /// First of the two toggled pages
    #[serde(with = "HexAddr")]
    pub first_gpa: u64,
    /// Second of the two toggled pages
    #[serde(with = "HexAddr")]
    pub second_gpa: u64,
    /// Located stack buffer
    #[serde(with = "HexAddr")]
    pub stack_buf_gpa: u64,
    pub mem_accesses_per_cycle: usize,
    pub main_loop_cycles: usize,
    pub stack_buf_alignment: usize,
    pub stack_buf_bytes: usize,
    /// Transcript of the signature created during capture
    pub transcript: Transcript,
}

/// Stack buffer layout given in a parameter file
///
/// Only the fields present in the file's `capture` section replace those of
/// an [`EddsaAttack`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LayoutOverride {
    pub mem_accesses_per_cycle: Option<usize>,
    pub main_loop_cycles: Option<usize>,
    pub stack_buf_alignment: Option<usize>,
    pub stack_buf_bytes: Option<usize>,
}

impl LayoutOverride {
    /// Extract the layout from the contents of a parameter file
    pub fn from_params(s: &str) -> Result<Self, Error> {
        #[derive(Default, Deserialize)]
        #[serde(default)]
        struct File {
            capture: LayoutOverride,
        }

        from_toml::<File>(s).map(|f| f.capture)
    }

    /// Replace the present fields in the given attack configuration
    pub fn apply(&self, attack: &mut EddsaAttack) {
        if let Some(n) = self.mem_accesses_per_cycle {
            attack.mem_accesses_per_cycle = n;
        }
        if let Some(n) = self.main_loop_cycles {
            attack.main_loop_cycles = n;
        }
        if let Some(n) = self.stack_buf_alignment {
            attack.stack_buf_alignment = n;
        }
        if let Some(n) = self.stack_buf_bytes {
            attack.stack_buf_bytes = n;
        }
    }
}

/// Persisted configuration of an ECDH attack
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdhAttack {
    /// Page containing the ladder loop
    #[serde(with = "HexAddr")]
    pub base_gpa: u64,
    /// Page containing the field arithmetic
    #[serde(with = "HexAddr")]
    pub second_gpa: u64,
    /// Located stack buffer
    #[serde(with = "HexAddr")]
    pub stack_buf_gpa: u64,
}

/// Parse a configuration from TOML
pub fn from_toml<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, Error> {
    toml::from_str(s).map_err(Error::Parse)
}

/// Serialize a configuration to TOML
pub fn to_toml<T: Serialize>(config: &T) -> Result<String, Error> {
    toml::to_string(config).map_err(Error::Serialize)
}

/// Configuration (de)serialization errors
#[derive(Debug)]
pub enum Error {
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Parse(inner) => Some(inner),
            Self::Serialize(inner) => Some(inner),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(_) => write!(f, "Could not parse configuration"),
            Self::Serialize(_) => write!(f, "Could not serialize configuration"),
        }
    }
}
