// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
use super::*;

use crate::tracking::Replay;

const READ: u32 = ErrorCode::USER;
const WRITE: u32 = ErrorCode::WRITE | ErrorCode::USER;

fn access(gpa: u64, code: u32) -> FaultEvent {
    FaultEvent::new(0, gpa, code).with_rip(0x4010_0000 + gpa)
}

fn counted(gpa: u64, retired: u64) -> FaultEvent {
    FaultEvent::new(0, gpa, READ).with_retired_instructions(retired)
}

fn victim<'a>(
    replay: &'a Replay,
    cancel: &'a Cancellation,
) -> impl FnMut() -> Result<(), io::Error> + 'a {
    move || {
        replay.resume();
        while !replay.is_exhausted() && !cancel.is_cancelled() {
            std::thread::yield_now();
        }
        Ok(())
    }
}

fn record(recorder: &Recorder, recording: Vec<FaultEvent>) -> (Summary, Vec<u8>, Replay) {
    let replay = Replay::paused(recording);
    let cancel = Cancellation::new();
    let mut out = Vec::new();
    let summary = recorder
        .record(&replay, &mut out, &cancel, victim(&replay, &cancel))
        .expect("Recording failed");
    (summary, out, replay)
}

fn recorded_pages(out: &[u8]) -> Vec<Vec<u64>> {
    trace::parse(out)
        .expect("Could not parse output")
        .runs()
        .map(|r| r.iter().map(|e| e.faulted_gpa).collect())
        .collect()
}

#[test]
fn retrack_after_progress() {
    let recording = vec![
        access(0x1000, READ),
        access(0x2000, WRITE),
        access(0x1000, READ),
        access(0x3000, READ),
    ];
    let (summary, out, replay) = record(&Recorder::default(), recording);
    assert_eq!(
        summary,
        Summary {
            runs: 1,
            events: 4,
            retracked: 3,
        }
    );
    assert_eq!(
        recorded_pages(&out),
        vec![vec![0x1000, 0x2000, 0x1000, 0x3000]]
    );
    assert!(!replay.tracks_all(TrackMode::Access));
}

#[test]
fn without_retrack() {
    let recording = vec![
        access(0x1000, READ),
        access(0x2000, WRITE),
        access(0x1000, READ),
        access(0x3000, READ),
    ];
    let (summary, out, _) = record(&Recorder::default().with_retrack(false), recording);
    assert_eq!(summary.events, 3);
    assert_eq!(summary.retracked, 0);
    assert_eq!(recorded_pages(&out), vec![vec![0x1000, 0x2000, 0x3000]]);
}

#[test]
fn allow_list() {
    let recording = vec![
        access(0x1000, READ),
        access(0x2000, READ),
        access(0x1000, READ),
        access(0x3000, READ),
    ];
    let recorder = Recorder::default().with_allow_list(vec![0x1000, 0x2000]);
    let (summary, out, replay) = record(&recorder, recording);
    assert_eq!(summary.events, 3);
    assert_eq!(summary.retracked, 2);
    assert_eq!(recorded_pages(&out), vec![vec![0x1000, 0x2000, 0x1000]]);
    assert_eq!(replay.tracked_pages(TrackMode::Access), Vec::<u64>::new());
}

#[test]
fn retired_instructions_as_progress() {
    let recording = vec![
        counted(0x1000, 1),
        counted(0x2000, 1),
        counted(0x1000, 1),
        counted(0x3000, 5),
        counted(0x1000, 0),
    ];
    let (summary, out, _) = record(&Recorder::default(), recording);
    assert_eq!(
        recorded_pages(&out),
        vec![vec![0x1000, 0x2000, 0x3000, 0x1000]]
    );
    assert_eq!(summary.retracked, 2);
}

#[test]
fn missing_progress_data() {
    let recording = vec![
        FaultEvent::new(0, 0x1000, READ),
        FaultEvent::new(0, 0x2000, READ),
    ];
    let replay = Replay::paused(recording);
    let cancel = Cancellation::new();
    let result = Recorder::default().record(&replay, io::sink(), &cancel, victim(&replay, &cancel));
    assert!(matches!(result, Err(Error::MissingData(_))));
    assert!(cancel.is_cancelled());
}

#[test]
fn find_write() {
    let recording = vec![
        access(0x2000, WRITE),
        access(0x1000, READ),
        access(0x2000, READ),
        access(0x2000, WRITE),
    ];
    let recorder = Recorder::default().with_find_write(true);
    let (summary, out, replay) = record(&recorder, recording);
    assert_eq!(summary.events, 3);
    assert_eq!(recorded_pages(&out), vec![vec![0x2000, 0x1000, 0x2000]]);
    assert!(!replay.tracks_all(TrackMode::Write));
    assert!(!replay.tracks_all(TrackMode::Access));
}

#[test]
fn kernel_faults_excluded() {
    let recording = vec![
        FaultEvent::new(0, 0x1000, READ).with_rip(KERNEL_SPACE + 0x10),
        access(0x2000, READ),
        access(0x1000, READ),
    ];
    let recorder = Recorder::default()
        .with_kernel_excluded(true)
        .with_format(Format::Plain);
    let (summary, out, _) = record(&recorder, recording);
    assert_eq!(summary.events, 2);
    assert_eq!(summary.retracked, 0);

    let out = String::from_utf8(out).expect("Output is not UTF-8");
    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("Start "));
    assert!(lines[1].contains("FaultedGPA 1000"));
    assert!(lines[2].contains("FaultedGPA 2000"));
    assert!(lines[3].starts_with("Stop "));
}

#[test]
fn multiple_runs() {
    let (summary, out, _) = record(
        &Recorder::default().with_runs(2),
        vec![access(0x1000, READ), access(0x2000, READ)],
    );
    assert_eq!(summary.runs, 2);
    assert_eq!(recorded_pages(&out), vec![vec![0x1000, 0x2000], vec![]]);
}

#[test]
fn allow_list_parsing() {
    let pages = parse_allow_list("0x1000\n\n  4096\n0X7f000\n".as_bytes()).expect("Invalid list");
    assert_eq!(pages, vec![0x1000, 4096, 0x7f000]);
    assert!(matches!(
        parse_allow_list("0x1000\nzz\n".as_bytes()),
        Err(error::AllowListError::Invalid(2, s)) if s == "zz"
    ));
}
