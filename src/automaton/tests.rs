// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
use super::*;

use crate::event::ErrorCode;
use crate::tracking::Replay;

const FIRST: u64 = 0x10000;
const SECOND: u64 = 0x20000;
const STACK: u64 = 0x30000;
const OTHER: u64 = 0x40000;
const SCRATCH: u64 = 0x70000;

const FETCH: u32 = ErrorCode::FETCH | ErrorCode::USER;
const WRITE: u32 = ErrorCode::WRITE | ErrorCode::USER;
const READ: u32 = ErrorCode::USER;

fn fetch(gpa: u64) -> FaultEvent {
    FaultEvent::new(0, gpa, FETCH).with_retired_instructions(42)
}

fn quiet(gpa: u64, code: u32) -> FaultEvent {
    FaultEvent::new(0, gpa, code).with_retired_instructions(0)
}

/// Access writing `value` to the whole stack buffer page
fn poke(value: u8) -> FaultEvent {
    let snapshot = Snapshot::new(STACK, &[value; PAGE_SIZE]).expect("no page");
    FaultEvent::new(0, SCRATCH, READ).with_snapshot(snapshot)
}

fn config() -> Capture {
    Capture {
        attack_pairs: 2,
        save_points: vec![1, 3],
        ignore_cycles: 1,
        ..Default::default()
    }
}

fn snapshots(outcome: &Outcome) -> Vec<(usize, u64, u8)> {
    outcome
        .events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.snapshot.as_ref().zip(Some(i)))
        .map(|(s, i)| (i, s.monitored, s.content[123]))
        .collect()
}

#[test]
fn sequence_capture() {
    let recording = vec![
        fetch(OTHER),
        fetch(FIRST),
        fetch(SECOND),
        fetch(FIRST),
        fetch(SECOND),
        poke(1),
        fetch(FIRST),
        fetch(SECOND),
        quiet(0x51000, WRITE),
        quiet(0x52000, WRITE),
        quiet(0x53000, WRITE),
        quiet(STACK, READ),
        fetch(FIRST),
        poke(2),
        fetch(SECOND),
        fetch(FIRST),
        poke(3),
        fetch(SECOND),
        fetch(FIRST),
        poke(4),
        fetch(SECOND),
    ];
    let cancel = Cancellation::new();
    let replay = Replay::new(recording).with_cancellation(cancel.clone());
    let progress = AtomicUsize::new(0);

    let automaton = Sequence::new(Targets::new(FIRST, SECOND), config());
    let outcome = run(automaton, &replay, &cancel, &progress).expect("Capture failed");

    assert_eq!(outcome.stack_buf_gpa, Some(STACK));
    assert_eq!(outcome.events.len(), 12);
    assert_eq!(progress.load(Ordering::Relaxed), 12);
    assert_eq!(
        snapshots(&outcome),
        vec![(6, STACK, 1), (7, STACK, 2), (9, STACK, 3), (11, STACK, 4)]
    );
    assert_eq!(
        outcome.stats,
        Stats {
            events: 16,
            desyncs: 0,
            snapshots: 4,
            located_from: 4,
        }
    );
    assert!(!replay.tracks_all(TrackMode::Access));
}

#[test]
fn sequence_without_pattern() {
    let recording = vec![
        fetch(FIRST),
        fetch(SECOND),
        fetch(FIRST),
        fetch(SECOND),
        fetch(FIRST),
        fetch(SECOND),
        quiet(STACK, READ),
        fetch(FIRST),
    ];
    let cancel = Cancellation::new();
    let replay = Replay::new(recording).with_cancellation(cancel.clone());
    let automaton = Sequence::new(Targets::new(FIRST, SECOND), config());
    let result = run(automaton, &replay, &cancel, &AtomicUsize::new(0));
    assert_eq!(result, Err(Error::StackBufferNotFound(1)));
}

#[test]
fn sequence_cancelled_early() {
    let cancel = Cancellation::new();
    let replay = Replay::new(vec![fetch(FIRST), fetch(SECOND)]).with_cancellation(cancel.clone());
    let automaton = Sequence::new(Targets::new(FIRST, SECOND), config());
    let outcome = run(automaton, &replay, &cancel, &AtomicUsize::new(0)).expect("Capture failed");
    assert_eq!(outcome.stack_buf_gpa, None);
    assert_eq!(outcome.events.len(), 2);
    assert_eq!(outcome.stats.snapshots, 0);
}

#[test]
fn locate_window_out_of_range() {
    let replay = Replay::new(Vec::new());
    let config = Capture {
        attack_pairs: 1,
        locate_at: 1,
        ..config()
    };
    let mut automaton = Sequence::new(Targets::new(FIRST, SECOND), config);
    assert_eq!(
        automaton.start(&replay),
        Err(Error::InvalidLocateWindow(1, 2))
    );
    assert!(replay.tracked_pages(TrackMode::Exec).is_empty());
}

#[test]
fn desync_tolerance() {
    let replay = Replay::new(Vec::new());
    let config = Capture {
        ignore_pairs: 1,
        ..config()
    };
    let mut automaton = Sequence::new(Targets::new(FIRST, SECOND), config);
    automaton.start(&replay).expect("Could not start");

    automaton
        .handle(&replay, fetch(FIRST))
        .expect("Could not handle");
    assert_eq!((automaton.phase(), automaton.index()), (Phase::Ignore, 1));

    automaton
        .handle(&replay, fetch(OTHER))
        .expect("Could not handle");
    assert_eq!((automaton.phase(), automaton.index()), (Phase::Ignore, 1));
    assert_eq!(automaton.stats().desyncs, 1);
    assert_eq!(automaton.events().len(), 1);

    automaton
        .handle(&replay, fetch(SECOND))
        .expect("Could not handle");
    assert_eq!((automaton.phase(), automaton.index()), (Phase::Attack, 0));
    assert!(replay.tracked_pages(TrackMode::Exec).contains(&FIRST));

    automaton
        .handle(&replay, fetch(FIRST))
        .expect("Could not handle");
    assert_eq!((automaton.phase(), automaton.index()), (Phase::Attack, 1));
    assert_eq!(automaton.cycle(), 0);
}

#[test]
fn excessive_desync() {
    let replay = Replay::new(Vec::new());
    let config = Capture {
        max_desyncs: Some(1),
        ..config()
    };
    let mut automaton = Sequence::new(Targets::new(FIRST, SECOND), config);
    automaton.start(&replay).expect("Could not start");
    automaton
        .handle(&replay, fetch(SECOND))
        .expect("Could not handle");
    assert_eq!(
        automaton.handle(&replay, fetch(OTHER)),
        Err(Error::ExcessiveDesync(2))
    );
}

#[test]
fn cycles_count() {
    let replay = Replay::new(Vec::new());
    let config = Capture {
        ignore_pairs: 1,
        attack_pairs: 1,
        locate_at: 0,
        ..config()
    };
    let burst = [
        quiet(OTHER, WRITE),
        quiet(OTHER, WRITE),
        quiet(OTHER, WRITE),
        quiet(STACK, READ),
    ];
    let mut automaton = Sequence::new(Targets::new(FIRST, SECOND), config);
    automaton.start(&replay).expect("Could not start");
    for cycle in 0..4 {
        automaton
            .handle(&replay, fetch(FIRST))
            .expect("Could not handle");
        if cycle == 1 {
            for event in burst.clone() {
                automaton.handle(&replay, event).expect("Could not handle");
            }
        }
        automaton
            .handle(&replay, fetch(SECOND))
            .expect("Could not handle");
    }
    assert_eq!(automaton.phase(), Phase::Attack);
    assert_eq!(automaton.cycle(), 3);
    assert_eq!(automaton.stack_buf(), Some(STACK));
    assert_eq!(automaton.stats().desyncs, 0);
}

#[test]
fn toggle_capture() {
    let recording = vec![
        fetch(FIRST),
        fetch(SECOND),
        poke(5),
        fetch(FIRST),
        quiet(0x51000, WRITE),
        quiet(STACK, WRITE),
        fetch(SECOND),
        fetch(FIRST),
        fetch(SECOND),
        poke(6),
        fetch(FIRST),
    ];
    let cancel = Cancellation::new();
    let replay = Replay::new(recording).with_cancellation(cancel.clone());
    let automaton = Toggle::new(Targets::new(FIRST, SECOND), config());
    let outcome = run(automaton, &replay, &cancel, &AtomicUsize::new(0)).expect("Capture failed");

    assert_eq!(outcome.stack_buf_gpa, Some(STACK));
    assert_eq!(outcome.events.len(), 7);
    assert_eq!(snapshots(&outcome), vec![(5, STACK, 5), (6, STACK, 6)]);
    assert_eq!(outcome.stats.located_from, 2);
}

#[test]
fn capture_with_victim() {
    let recording = vec![
        fetch(FIRST),
        fetch(SECOND),
        fetch(FIRST),
        quiet(STACK, READ),
        fetch(SECOND),
        fetch(FIRST),
        fetch(SECOND),
    ];
    let cancel = Cancellation::new();
    let replay = Replay::new(recording);
    let automaton = Toggle::new(Targets::new(FIRST, SECOND), config());
    let (outcome, payload) = capture(automaton, &replay, &cancel, || {
        while !replay.is_exhausted() && !cancel.is_cancelled() {
            std::thread::yield_now();
        }
        "done"
    })
    .expect("Capture failed");
    assert_eq!(payload, "done");
    assert_eq!(outcome.stack_buf_gpa, Some(STACK));
    assert_eq!(outcome.events.len(), 6);
    assert!(cancel.is_cancelled());
}

#[test]
fn targets_from_marker() {
    let events = vec![
        FaultEvent::new(0, 0x1000, FETCH).with_retired_instructions(10),
        FaultEvent::new(1, 0x2000, FETCH).with_retired_instructions(9068),
        FaultEvent::new(2, 0x3000, FETCH).with_retired_instructions(3),
    ];
    assert_eq!(
        Targets::from_marker(&events, 9068),
        Ok(Some(Targets::new(0x2000, 0x3000)))
    );
    assert_eq!(Targets::from_marker(&events, 10), Ok(None));
    assert_eq!(Targets::from_marker(&events[..2], 9068), Ok(None));
    assert!(Targets::from_marker(&[fetch(1), FaultEvent::new(7, 2, FETCH), fetch(3)], 1).is_err());
}
