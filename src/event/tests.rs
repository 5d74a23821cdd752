// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
use super::*;

fn page(fill: u8) -> Vec<u8> {
    vec![fill; PAGE_SIZE]
}

#[test]
fn json_round_trip() {
    let events = [
        FaultEvent::new(1, 0x7c006000, ErrorCode::WRITE | ErrorCode::USER),
        FaultEvent::new(2, 0x6efa1000, ErrorCode::USER).with_rip(0xffffffff810dbf96),
        FaultEvent::new(3, 0x6efa1000, ErrorCode::FETCH).with_retired_instructions(0),
        FaultEvent {
            timestamp: Some("2021-08-14T11:13:35.555548743Z".into()),
            ..FaultEvent::new(4, 0x1000, 0)
                .with_rip(0x5555555d1e60)
                .with_retired_instructions(17)
                .with_snapshot(Snapshot::new(0x7c006000, &page(0xa5)).expect("no page"))
        },
    ];
    for event in events {
        let json = serde_json::to_string(&event).expect("Could not serialize");
        let parsed: FaultEvent = serde_json::from_str(&json).expect("Could not parse");
        assert_eq!(parsed, event);
    }
}

#[test]
fn presence_flags_are_authoritative() {
    let json = r#"{"id":5,"faulted_gpa":4096,"error_code":2,"have_rip_info":false,"rip":1234,"have_retired_instructions":false,"retired_instructions":99}"#;
    let event: FaultEvent = serde_json::from_str(json).expect("Could not parse");
    assert_eq!(event.rip, None);
    assert_eq!(event.retired_instructions, None);
    assert_eq!(event.rip(), Err(MissingData::new(5, Field::Rip)));
    assert_eq!(
        event.retired_instructions(),
        Err(MissingData::new(5, Field::RetiredInstructions))
    );
    assert!(event.error_code.is_write());
}

#[test]
fn zero_retired_instructions_is_present() {
    let json = r#"{"id":6,"faulted_gpa":8192,"error_code":0,"have_retired_instructions":true,"retired_instructions":0}"#;
    let event: FaultEvent = serde_json::from_str(json).expect("Could not parse");
    assert_eq!(event.retired_instructions(), Ok(0));
}

#[test]
fn content_must_be_a_page() {
    let json = r#"{"id":7,"faulted_gpa":8192,"error_code":0,"content":"AAECAw==","monitor_gpa":4096}"#;
    let err = serde_json::from_str::<FaultEvent>(json).expect_err("Parsed short content");
    assert!(err.to_string().contains("instead of a page"));
}

#[test]
fn monitor_without_content() {
    let json = r#"{"id":8,"faulted_gpa":8192,"error_code":0,"content":null,"monitor_gpa":4096}"#;
    assert!(serde_json::from_str::<FaultEvent>(json).is_err());
}

#[test]
fn content_access() {
    let event = FaultEvent::new(9, 0x2000, 0);
    assert_eq!(
        event.content().map(|c| c.len()),
        Err(MissingData::new(9, Field::Content))
    );
    let event = event.with_snapshot(Snapshot::new(0x3000, &page(1)).expect("no page"));
    assert_eq!(event.content().map(|c| c[100]), Ok(1));
}

#[test]
fn snapshot_size() {
    assert!(Snapshot::new(0, &[0; 16]).is_none());
    assert!(Snapshot::new(0, &[0; PAGE_SIZE + 1]).is_none());
}

#[test]
fn error_code_names() {
    assert_eq!(ErrorCode(0).to_string(), "None");
    assert_eq!(
        ErrorCode(ErrorCode::WRITE | ErrorCode::USER).to_string(),
        "Write User"
    );
    assert_eq!(
        ErrorCode(0x1f).to_string(),
        "Present Write User Reserved Fetch"
    );
}

#[test]
fn plain_format() {
    let event = FaultEvent::new(286, 0x752b9000, ErrorCode::WRITE | ErrorCode::USER)
        .with_rip(0x5555555d1e60)
        .with_retired_instructions(0);
    assert_eq!(
        event.to_string(),
        "ID 286, FaultedGPA 752b9000, RIP 5555555d1e60, RetInstr 0, Error Code Write User"
    );
    let event = FaultEvent::new(1, 0x1000, ErrorCode::USER);
    assert_eq!(
        event.to_string(),
        "ID 1, FaultedGPA 1000, RIP unknown, RetInstr not measured, Error Code User"
    );
}

#[test]
fn pages() {
    assert!(same_page(0x1000, 0x1fff));
    assert!(!same_page(0x1fff, 0x2000));
    assert_eq!(FaultEvent::new(0, 0x1234, 0).page(), 0x1000);
    assert!(FaultEvent::new(0, 0x1234, 0).is_on_page(0x1000));
}
