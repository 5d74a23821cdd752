// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Signature transcripts

use serde::{Deserialize, Serialize};

use crate::config::serde_utils::HexBytes;

use super::Error;

/// Signature algorithm name of Ed25519 SSH signatures
pub const SSH_ED25519: &str = "ssh-ed25519";

/// A signature created by the victim during capture
///
/// The transcript is delivered by the trigger as a JSON document, with all
/// byte strings encoded as hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Signature algorithm name
    pub signature_type: String,
    /// Encoded signature `R || s`
    #[serde(with = "HexBytes")]
    pub signature: Vec<u8>,
    /// Signed message
    #[serde(with = "HexBytes")]
    pub message: Vec<u8>,
    /// Encoded public key of the signer
    #[serde(with = "HexBytes")]
    pub public_key: Vec<u8>,
}

impl Transcript {
    /// Decode a transcript delivered by a trigger
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Split the signature into `R` and `s`
    ///
    /// Fails for signatures not 64 bytes long or with any of the top three bits
    /// of `s` set.
    pub fn split_signature(&self) -> Result<([u8; 32], [u8; 32]), Error> {
        let signature: &[u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedSignature)?;
        if signature[63] & 0xe0 != 0 {
            return Err(Error::MalformedSignature);
        }
        let mut r = [0; 32];
        let mut s = [0; 32];
        r.copy_from_slice(&signature[..32]);
        s.copy_from_slice(&signature[32..]);
        Ok((r, s))
    }

    /// Retrieve the encoded public key
    pub fn public_key(&self) -> Result<[u8; 32], Error> {
        self.public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedPublicKey(self.public_key.len()))
    }
}
