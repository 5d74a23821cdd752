// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Nonce validation, secret extraction and signature forging

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};

use super::digits::Digits;

/// Candidates for the unobservable lowest digit
pub const FIRST_DIGITS: [i8; 7] = [1, -1, 2, -2, 3, -3, -4];

/// Reduce a SHA-512 digest of the concatenated `parts`
fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let digest = parts
        .iter()
        .fold(Sha512::new(), |h, p| h.chain_update(p))
        .finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Compute the scalar represented by signed radix 8 digits
pub fn scalar_from_digits(digits: &[i8]) -> Scalar {
    let radix = Scalar::from(8u8);
    digits.iter().rev().fold(Scalar::ZERO, |acc, d| {
        let magnitude = Scalar::from(d.unsigned_abs());
        let digit = if *d < 0 { -magnitude } else { magnitude };
        acc * radix + digit
    })
}

/// Compute the encoded commitment `R` for the nonce given as digits
pub fn commitment(digits: &[i8]) -> [u8; 32] {
    EdwardsPoint::mul_base(&scalar_from_digits(digits))
        .compress()
        .to_bytes()
}

/// Complete digits by finding the lowest digit matching the signature's `R`
///
/// Tries every value of [`FIRST_DIGITS`]. Returns `false` and leaves the lowest
/// digit at zero if none matches.
pub fn complete(digits: &mut Digits, r: &[u8; 32]) -> bool {
    for first in FIRST_DIGITS {
        digits[0] = first;
        if commitment(&digits[..]) == *r {
            return true;
        }
    }
    digits[0] = 0;
    false
}

/// Compute the reduced nonce the signer derives from its seed
///
/// Used as ground truth when the signing key is known.
pub fn reduced_nonce(seed: &[u8; 32], message: &[u8]) -> [u8; 32] {
    let expanded = Sha512::digest(seed);
    hash_to_scalar(&[&expanded[32..], message]).to_bytes()
}

/// Compute `H(R || A || M)` reduced to a scalar
pub fn hram(r: &[u8; 32], public_key: &[u8; 32], message: &[u8]) -> Scalar {
    hash_to_scalar(&[&r[..], &public_key[..], message])
}

/// Extract the secret scalar from a signature and its reduced nonce
///
/// The secret is the signer's expanded key reduced modulo the group order,
/// which suffices for creating signatures. Returns [`None`] if the nonce or
/// `s` is not canonical.
pub fn extract_secret(
    reduced_nonce: &[u8; 32],
    s: &[u8; 32],
    public_key: &[u8; 32],
    message: &[u8],
) -> Option<Scalar> {
    let nonce = Option::<Scalar>::from(Scalar::from_canonical_bytes(*reduced_nonce))?;
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(*s))?;
    let r = EdwardsPoint::mul_base(&nonce).compress().to_bytes();
    let hram = hram(&r, public_key, message);
    if hram == Scalar::ZERO {
        return None;
    }
    Some((s - nonce) * hram.invert())
}

/// Compute the public key belonging to a secret scalar
pub fn public_key(secret: &Scalar) -> [u8; 32] {
    EdwardsPoint::mul_base(secret).compress().to_bytes()
}

/// Sign `message` using an extracted secret
///
/// The nonce is derived from the public key and the message, since the
/// signer's nonce key is not known. The result verifies like any other
/// signature under `public_key`.
pub fn forge(secret: &Scalar, public_key: &[u8; 32], message: &[u8]) -> [u8; 64] {
    let nonce = hash_to_scalar(&[&public_key[..], message]);
    let r = EdwardsPoint::mul_base(&nonce).compress().to_bytes();
    let s = hram(&r, public_key, message) * secret + nonce;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(&r);
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify a signature with the standard verification equation
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    VerifyingKey::from_bytes(public_key)
        .and_then(|key| key.verify(message, &Signature::from_bytes(signature)))
        .is_ok()
}
