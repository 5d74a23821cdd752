// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Stack buffer locator
//!
//! While all pages are access tracked, the victim initializes the stack buffer
//! of interest with a characteristic sequence of faults: a number of write
//! faults followed by a single non-write fault, all without any retired
//! instructions in between. The non-write fault hits the stack buffer.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

use crate::event::{FaultEvent, MissingData};

/// Fault pattern identifying the stack buffer
///
/// The default pattern matches three writes followed by one non-write within
/// the last ten events of a burst.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pattern {
    /// Number of consecutive write faults
    pub writes: usize,
    /// Number of events at the end of a burst to scan
    pub window: usize,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            writes: 3,
            window: 10,
        }
    }
}

impl Pattern {
    /// Find the event accessing the stack buffer in a burst of faults
    ///
    /// Start positions are taken from the last [`window`][Self::window] events,
    /// oldest first. From each start position, at most `window` events are
    /// inspected. Every inspected event must carry a retired instruction count.
    ///
    /// Returns [`None`] if the pattern does not occur.
    pub fn locate<'a>(
        &self,
        events: &'a [FaultEvent],
    ) -> Result<Option<&'a FaultEvent>, MissingData> {
        let offset = events.len().saturating_sub(self.window);
        for start in offset..events.len() {
            log::debug!("Scanning for stack buffer from {start}");
            let mut state = 0;
            for event in events[start..].iter().take(self.window) {
                let quiet = event.retired_instructions()? == 0;
                let write = event.error_code.is_write();
                if state < self.writes {
                    state = if write && quiet { state + 1 } else { 0 };
                } else if !write && quiet {
                    return Ok(Some(event));
                } else {
                    state = 0;
                }
            }
        }
        Ok(None)
    }
}
