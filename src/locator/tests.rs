// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
use super::*;

use crate::event::{ErrorCode, Field};

const WRITE: u32 = ErrorCode::WRITE | ErrorCode::USER;
const READ: u32 = ErrorCode::USER;

fn burst(faults: &[(u64, u32, u64)]) -> Vec<FaultEvent> {
    faults
        .iter()
        .enumerate()
        .map(|(id, (gpa, code, retired))| {
            FaultEvent::new(id as u64, *gpa, *code).with_retired_instructions(*retired)
        })
        .collect()
}

#[test]
fn recorded_burst() {
    let mut faults = vec![(0x6efa1000, WRITE, 0); 8];
    faults.push((0x5a1ba000, READ, 0));
    faults.push((0x6efa1000, READ, 0));
    faults.push((0x6efa1000, READ, 0));
    let events = burst(&faults);

    let found = Pattern::default().locate(&events).expect("Missing data");
    assert_eq!(found.map(|e| (e.id, e.faulted_gpa)), Some((8, 0x5a1ba000)));
}

#[test]
fn writes_then_read() {
    let events = burst(&[
        (0x1000, READ, 5),
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xb000, READ, 0),
        (0xc000, READ, 7),
    ]);
    let found = Pattern::default().locate(&events).expect("Missing data");
    assert_eq!(found.map(|e| e.faulted_gpa), Some(0xb000));
}

#[test]
fn retired_instructions_break_pattern() {
    let events = burst(&[
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 1),
        (0xa000, WRITE, 0),
        (0xb000, READ, 0),
    ]);
    assert_eq!(Pattern::default().locate(&events), Ok(None));
}

#[test]
fn fourth_write_resets() {
    let events = burst(&[
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xb000, READ, 0),
    ]);
    // From start 0 the fourth write resets the pattern, start 1 matches
    let found = Pattern::default().locate(&events).expect("Missing data");
    assert_eq!(found.map(|e| e.id), Some(4));
}

#[test]
fn only_tail_is_scanned() {
    let mut faults = vec![
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xa000, WRITE, 0),
        (0xb000, READ, 0),
    ];
    faults.extend([(0x1000, READ, 3); 10]);
    assert_eq!(Pattern::default().locate(&burst(&faults)), Ok(None));
}

#[test]
fn custom_pattern() {
    let events = burst(&[(0xa000, WRITE, 0), (0xb000, READ, 0)]);
    let pattern = Pattern {
        writes: 1,
        window: 4,
    };
    let found = pattern.locate(&events).expect("Missing data");
    assert_eq!(found.map(|e| e.faulted_gpa), Some(0xb000));
}

#[test]
fn missing_retired_instructions() {
    let events = vec![FaultEvent::new(3, 0xa000, WRITE)];
    assert_eq!(
        Pattern::default().locate(&events),
        Err(MissingData::new(3, Field::RetiredInstructions))
    );
}

#[test]
fn empty_burst() {
    assert_eq!(Pattern::default().locate(&[]), Ok(None));
}
