// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
use super::*;

use std::io::{Read, Write};
use std::net::TcpListener;

use crate::automaton::{self, Targets, Toggle};
use crate::config::{Capture, STREAM_LAYOUT};
use crate::event::{ErrorCode, Field, MissingData, PAGE_SIZE, Snapshot};
use crate::trace;
use crate::tracking::{Cancellation, Replay};
use crate::trigger::Trigger;

use swaps::Step;

const STACK: u64 = 0x7f3000;
const BASE: u64 = 0x51000;
const SECOND: u64 = 0x52000;
const SIGNAL: usize = 0x120;
const NOISE: usize = 0x400;
const STATIC: usize = 0x600;

const LAYOUT: StreamLayout = StreamLayout {
    base_init: 0,
    base_delta_a: 3,
    base_delta_b: 1,
    second_init: 2,
    second_delta: 2,
    iterations: 16,
    unknown_high_bits: 1,
};

const ATTACK: EcdhAttack = EcdhAttack {
    base_gpa: BASE,
    second_gpa: SECOND,
    stack_buf_gpa: STACK,
};

const SECRET: &str = "F8:FF:2D:BF:0D:D0:DB:08:50:2F:87:99:6C:4B:00:FE:\
    57:57:9F:EB:79:B2:B0:C2:77:E9:8B:13:56:FB:F7:4C";

const SWAP_HISTORY: &str = "0 0 1 0 0 0 0 0 0 0 0 0 0 0 0 0 1 1 0 1 1 1 0 1 0 0 0 0 0 1 1 0 \
    1 1 0 1 0 0 0 0 0 0 0 1 1 1 0 0 0 1 1 0 1 1 0 1 0 0 1 1 0 0 0 0 0 0 0 1 1 1 1 1 0 0 0 1 \
    1 1 0 1 0 0 1 0 0 0 1 0 1 0 1 0 1 0 1 1 0 1 0 1 1 0 1 1 0 1 1 1 0 1 1 0 0 0 0 0 0 0 0 0 \
    1 0 0 0 0 0 0 0 0 0 1 1 1 1 1 1 0 0 1 1 1 1 1 1 0 0 0 0 1 0 1 0 0 1 1 1 1 0 0 0 1 0 1 0 \
    0 0 1 0 1 1 0 1 0 1 1 1 0 0 0 1 0 1 1 1 1 1 0 0 0 1 0 0 0 0 1 1 0 0 1 1 1 0 1 1 1 0 0 0 \
    0 1 1 1 0 0 1 0 0 1 0 1 1 0 0 0 1 0 1 1 1 1 1 1 0 1 1 0 0 0 0 0 0 0 1 1 0 0 0 1 0 1 0 1 \
    0 1 1";

/// Scalar bits of the synthetic victim, not yet clamped
fn truth() -> Vec<u8> {
    vec![1, 1, 0, 1, 0, 1, 1, 0, 0, 1, 0, 1, 1, 1, 0, 1, 0]
}

fn clamped(mut bits: Vec<u8>) -> Vec<u8> {
    swaps::clamp(&mut bits);
    bits
}

fn swaps_of(bits: &[u8]) -> Vec<u8> {
    bits.windows(2).map(|w| w[0] ^ w[1]).collect()
}

fn snapshot(blocks: &[(usize, u8)]) -> Snapshot {
    let mut content = vec![0; PAGE_SIZE];
    content[STATIC..STATIC + BLOCK].fill(0x5a);
    for (offset, value) in blocks {
        content[*offset..*offset + BLOCK].fill(*value);
    }
    Snapshot::new(STACK, &content).unwrap()
}

/// Generate a trace leaking `swaps` at [`SIGNAL`]
///
/// The block at [`NOISE`] changes across every swap, the one at [`STATIC`]
/// never does. Two setup events precede the streams.
fn synthesize(swaps: &[u8], layout: &StreamLayout) -> Vec<FaultEvent> {
    let steps: Vec<_> = swaps::steps(layout).collect();
    let base_len = steps.iter().map(|s| s.base + 1).max().unwrap_or(0);
    let second_len = steps.iter().map(|s| s.second + 1).max().unwrap_or(0);

    let base: Vec<_> = (0..base_len).map(|_| snapshot(&[(NOISE, 0xaa)])).collect();
    let mut second: Vec<_> = (0..second_len).map(|_| snapshot(&[(NOISE, 0x55)])).collect();
    for step in &steps {
        if swaps[step.bit] == 1 {
            second[step.second] = snapshot(&[(NOISE, 0x55), (SIGNAL, 0x11)]);
        }
    }

    let mut events = vec![
        FaultEvent::new(0, BASE + 0x80, ErrorCode::FETCH),
        FaultEvent::new(1, SECOND + 0x10, ErrorCode::FETCH),
    ];
    let mut base = base.into_iter();
    let mut second = second.into_iter();
    loop {
        let s = second.next().map(|s| (SECOND + 0x40, s));
        let b = base.next().map(|s| (BASE + 0x80, s));
        if s.is_none() && b.is_none() {
            break;
        }
        for (gpa, snapshot) in s.into_iter().chain(b) {
            let id = events.len() as u64;
            events.push(FaultEvent::new(id, gpa, ErrorCode::FETCH).with_snapshot(snapshot));
        }
    }
    events
}

fn synthesize_truth() -> Vec<FaultEvent> {
    synthesize(&swaps_of(&clamped(truth())), &LAYOUT)
}

#[test]
fn parse_single_byte() {
    let reply = "HTTP/1.1 200 OK\n\nsecretFromOpenSSL f0\n";
    assert_eq!(
        parse_openssl_secret(reply.as_bytes()).unwrap(),
        vec![0, 0, 0, 0, 1, 1, 1, 1]
    );
}

#[test]
fn parse_last_secret_wins() {
    let reply = "secretFromOpenSSL ff\nsecretFromOpenSSL 81:82\n";
    assert_eq!(
        parse_openssl_secret(reply.as_bytes()).unwrap(),
        vec![1, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0, 0, 1]
    );
}

#[test]
fn parse_errors() {
    assert!(matches!(
        parse_openssl_secret("no secret here\n".as_bytes()),
        Err(SecretError::NotFound)
    ));
    assert!(matches!(
        parse_openssl_secret("\nsecretFromOpenSSL 81 82\n".as_bytes()),
        Err(SecretError::Tokens(2, 3))
    ));
    assert!(matches!(
        parse_openssl_secret("secretFromOpenSSL zz\n".as_bytes()),
        Err(SecretError::Hex(_))
    ));
}

#[test]
fn bit_packing() {
    assert_eq!(pack_bits(&unpack_bits(&[0x81, 0x82])), vec![0x81, 0x82]);
    assert_eq!(pack_bits(&[1, 0, 1]), vec![0x05]);
}

#[test]
fn hamming_distance() {
    assert_eq!(hamming(&[0, 1, 1], &[0, 1, 1]), 0);
    assert_eq!(hamming(&[0, 1, 1], &[1, 1, 0]), 2);
    assert_eq!(hamming(&[0, 1], &[0, 1, 1, 0]), 2);
}

#[test]
fn clamping() {
    let mut bits = vec![1u8; 8];
    swaps::clamp(&mut bits);
    assert_eq!(bits, vec![0, 0, 0, 1, 1, 1, 1, 0]);

    let mut bits = vec![0u8; 8];
    swaps::clamp(&mut bits);
    assert_eq!(bits, vec![0, 0, 0, 0, 0, 0, 1, 0]);
}

#[test]
fn scalar_from_swap_history() {
    let swaps: Vec<u8> = SWAP_HISTORY
        .split_whitespace()
        .map(|s| s.parse().unwrap())
        .collect();
    assert_eq!(swaps.len(), STREAM_LAYOUT.iterations);

    let reply = format!("secretFromOpenSSL {SECRET}\n");
    let secret = parse_openssl_secret(reply.as_bytes()).unwrap();
    assert_eq!(secret.len(), STREAM_LAYOUT.iterations + 1);

    let scalar = clamped(swaps::scalar_from_swaps(&swaps));
    assert_eq!(scalar, clamped(secret));
}

#[test]
fn swaps_invert_scalar() {
    let bits = clamped(truth());
    assert_eq!(swaps::scalar_from_swaps(&swaps_of(&bits)), bits);
}

#[test]
fn default_steps() {
    let steps: Vec<_> = swaps::steps(&STREAM_LAYOUT).collect();
    assert_eq!(steps.len(), 254);
    assert_eq!(
        steps[0],
        Step {
            bit: 253,
            base: 17,
            second: 18
        }
    );
    assert_eq!(
        steps[1],
        Step {
            bit: 252,
            base: 35,
            second: 36
        }
    );
    assert_eq!(
        steps[253],
        Step {
            bit: 0,
            base: 254 * 17 + 253,
            second: 18 + 253 * 18
        }
    );
}

#[test]
fn setup_discarded() {
    let events = [
        FaultEvent::new(0, SECOND, ErrorCode::FETCH),
        FaultEvent::new(1, BASE, ErrorCode::FETCH),
        FaultEvent::new(2, SECOND + 0x20, ErrorCode::FETCH),
        FaultEvent::new(3, BASE + 0x20, ErrorCode::FETCH),
        FaultEvent::new(4, 0x99000, ErrorCode::FETCH),
        FaultEvent::new(5, SECOND, ErrorCode::FETCH),
    ];
    let streams = Streams::new(&ATTACK, &events);
    let ids = |s: &[&FaultEvent]| s.iter().map(|e| e.id).collect::<Vec<_>>();
    assert_eq!(ids(&streams.base[..]), vec![3]);
    assert_eq!(ids(&streams.second[..]), vec![2, 5]);
}

#[test]
fn setup_without_second_hit() {
    let events = [
        FaultEvent::new(0, SECOND, ErrorCode::FETCH),
        FaultEvent::new(1, BASE, ErrorCode::FETCH),
    ];
    let streams = Streams::new(&ATTACK, &events);
    assert!(streams.base.is_empty());
    assert!(streams.second.is_empty());
}

#[test]
fn recover_swap_sequence() {
    let expected = swaps_of(&clamped(truth()));
    let events = synthesize_truth();
    let streams = Streams::new(&ATTACK, &events);
    assert_eq!(
        swaps::candidate_offsets(&streams, &LAYOUT).unwrap(),
        BTreeSet::from([SIGNAL, NOISE])
    );

    let swaps = swaps::recover_swaps(SIGNAL, &streams, &LAYOUT).unwrap();
    assert_eq!(swaps[..15], expected[..15]);
    assert_eq!(swaps[15], 0);
    assert_eq!(
        swaps::recover_swaps(NOISE, &streams, &LAYOUT).unwrap(),
        [vec![1u8; 15], vec![0]].concat()
    );
}

#[test]
fn recover_with_ground_truth() {
    let events = synthesize_truth();
    let options = Options {
        ground_truth: Some(truth()),
        ..Default::default()
    };
    let report = recover(&ATTACK, &events, &LAYOUT, &options).unwrap();
    let offsets: Vec<_> = report.swaps.iter().map(|(o, _)| o).collect();
    assert_eq!(offsets, vec![SIGNAL, NOISE]);
    assert_eq!(report.scalars.len(), 4);
    assert_eq!(report.matching().count(), 1);

    let matched = report.matched().unwrap();
    assert_eq!(matched.offset, SIGNAL);
    assert_eq!(matched.top_swaps, 1);
    assert_eq!(matched.scalar, clamped(truth()));
    assert_eq!(matched.to_bytes(), pack_bits(&clamped(truth())));

    // All bits below the second highest are flipped with the wrong top swap
    let flipped = &report.scalars[0];
    assert_eq!((flipped.offset, flipped.top_swaps), (SIGNAL, 0));
    assert_eq!(flipped.distance, Some(12));
}

#[test]
fn recover_without_ground_truth() {
    let events = synthesize_truth();
    let report = recover(&ATTACK, &events, &LAYOUT, &Default::default()).unwrap();
    assert_eq!(report.scalars.len(), 4);
    assert!(report.scalars.iter().all(|c| c.distance.is_none()));
    assert_eq!(report.matched(), Err(Error::NoCandidateMatched(2)));
    assert!(report.scalars.iter().any(|c| c.scalar == clamped(truth())));
}

#[test]
fn specific_offset() {
    let events = synthesize_truth();
    let options = Options {
        specific_offset: Some(SIGNAL),
        ground_truth: Some(truth()),
    };
    let report = recover(&ATTACK, &events, &LAYOUT, &options).unwrap();
    assert_eq!(report.swaps.len(), 1);
    assert_eq!(report.scalars.len(), 2);
    assert_eq!(report.matched().map(|c| c.offset), Ok(SIGNAL));

    let options = Options {
        specific_offset: Some(STATIC),
        ..Default::default()
    };
    assert_eq!(
        recover(&ATTACK, &events, &LAYOUT, &options),
        Err(Error::NoChangeAtOffset(STATIC))
    );
}

#[test]
fn ground_truth_mismatch() {
    let events = synthesize_truth();
    let mut wrong = truth();
    wrong[7] ^= 1;
    let options = Options {
        ground_truth: Some(wrong),
        ..Default::default()
    };
    let report = recover(&ATTACK, &events, &LAYOUT, &options).unwrap();
    assert_eq!(report.matched(), Err(Error::NoCandidateMatched(2)));
    assert_eq!(report.scalars[1].distance, Some(1));

    let options = Options {
        ground_truth: Some(vec![0; 16]),
        ..Default::default()
    };
    assert_eq!(
        recover(&ATTACK, &events, &LAYOUT, &options),
        Err(Error::GroundTruthLength(16, 17))
    );
}

#[test]
fn exhausted_stream() {
    let mut events = synthesize_truth();
    events.pop();
    assert_eq!(
        recover(&ATTACK, &events, &LAYOUT, &Default::default()),
        Err(Error::StreamExhausted(Stream::Base, 59, 0))
    );
}

#[test]
fn missing_snapshot() {
    let mut events = synthesize_truth();
    let last = events.last_mut().unwrap();
    last.snapshot = None;
    let id = last.id;
    assert_eq!(
        recover(&ATTACK, &events, &LAYOUT, &Default::default()),
        Err(Error::MissingData(MissingData::new(id, Field::Content)))
    );
}

#[test]
fn invalid_layout() {
    let layout = StreamLayout {
        unknown_high_bits: MAX_UNKNOWN_BITS + 1,
        ..LAYOUT
    };
    assert_eq!(
        recover(&ATTACK, &[], &layout, &Default::default()),
        Err(Error::InvalidLayout(layout))
    );
}

/// Serve a single HTTP request, replying with `body`
fn serve_once(body: &'static str) -> (String, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Could not bind");
    let addr = listener.local_addr().expect("No local address");
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("No connection");
        let mut request = Vec::new();
        let mut buf = [0; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).expect("Could not read request");
            assert_ne!(n, 0);
            request.extend_from_slice(&buf[..n]);
        }
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .expect("Could not reply");
    });
    (format!("http://{addr}/ecdh"), server)
}

#[test]
fn secret_from_captured_trace() {
    let fetch = |gpa| FaultEvent::new(0, gpa, ErrorCode::FETCH | ErrorCode::USER);
    let recording = vec![
        fetch(BASE).with_retired_instructions(42),
        fetch(SECOND).with_retired_instructions(42),
        fetch(BASE).with_retired_instructions(42),
        FaultEvent::new(0, STACK, ErrorCode::USER).with_retired_instructions(0),
        fetch(SECOND).with_retired_instructions(42),
        fetch(BASE).with_retired_instructions(42),
        fetch(SECOND).with_retired_instructions(42),
    ];
    let (url, server) = serve_once("<html>\nsecretFromOpenSSL f0\n{\"status\":\"ok\"}\n");
    let trigger = Trigger::from_uri(&url).expect("Invalid trigger");

    let config = Capture {
        ignore_cycles: 1,
        ..Default::default()
    };
    let cancel = Cancellation::new();
    let replay = Replay::new(recording);
    let automaton = Toggle::new(Targets::new(BASE, SECOND), config);
    let (outcome, reply) = automaton::capture(automaton, &replay, &cancel, || {
        let reply = trigger.execute();
        while !replay.is_exhausted() && !cancel.is_cancelled() {
            std::thread::yield_now();
        }
        reply
    })
    .expect("Capture failed");
    let reply = reply.expect("Could not trigger victim");
    server.join().expect("Server failed");
    assert_eq!(outcome.stack_buf_gpa, Some(STACK));

    let mut writer = trace::Writer::new(Vec::new(), trace::Format::Json);
    outcome
        .events
        .iter()
        .try_for_each(|e| writer.write_event(e))
        .expect("Could not write");
    writer.write_reply(&reply).expect("Could not write");
    let written = writer.into_inner();

    let secret = parse_openssl_secret(written.as_slice()).expect("No secret in trace");
    assert_eq!(secret, unpack_bits(&[0xf0]));
    let trace = trace::parse(written.as_slice()).expect("Could not parse trace");
    assert_eq!(trace.events(), outcome.events.as_slice());
}
