// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! # Key recovery from hypervisor page fault traces
//!
//! This crate reconstructs secret scalars of a victim running inside a virtual
//! machine from page faults observed by the hypervisor. Two attacks are
//! supported:
//!
//! - an EdDSA attack, recovering the signing nonce of an Ed25519 signature
//!   from a windowed scalar multiplication and extracting a secret sufficient
//!   for forging signatures, see [eddsa]
//! - an ECDH attack, recovering an X25519 scalar from the conditional swaps of
//!   a Montgomery ladder, see [ecdh]
//!
//! Both work on traces of [`FaultEvent`][event::FaultEvent]s carrying
//! snapshots of a stack buffer of the victim. Such traces are captured by an
//! [automaton] driving a [`FaultTracker`][tracking::FaultTracker], i.e. an
//! interface to the hypervisor's fault tracking facility. The [recorder]
//! records plain fault traces without snapshots.
//!
//! # Example
//!
//! The following example reads a trace consisting of a single run and locates
//! the events on a page of interest.
//!
//! ```
//! use pf_keyrecovery::trace;
//!
//! let data = concat!(
//!     "Start 2025-01-01T00:00:00Z\n",
//!     r#"{"id":0,"faulted_gpa":4096,"error_code":20}"#, "\n",
//!     r#"{"id":1,"faulted_gpa":8200,"error_code":6}"#, "\n",
//!     r#"{"id":2,"faulted_gpa":4112,"error_code":20}"#, "\n",
//!     "Stop 2025-01-01T00:00:01Z\n",
//! );
//!
//! let trace = trace::parse(data.as_bytes()).unwrap();
//! assert_eq!(trace.runs().count(), 1);
//!
//! let ids: Vec<_> = trace.on_page(0x1000).map(|e| e.id).collect();
//! assert_eq!(ids, [0, 2]);
//! assert!(trace.events()[1].error_code.is_write());
//! ```

pub mod automaton;
pub mod config;
pub mod ecdh;
pub mod eddsa;
pub mod event;
pub mod locator;
pub mod recorder;
pub mod scanner;
pub mod trace;
pub mod tracking;
pub mod trigger;
