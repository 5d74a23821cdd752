// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Serde-specific utilties

use core::fmt;

use base64::Engine;
use serde::{Deserializer, Serializer};

/// Serde "module" for (de)serializing physical addresses as hex strings
///
/// TOML integers are signed 64 bit values. Writing addresses as strings keeps
/// every [`u64`] intact. Plain integers are still accepted when reading.
pub struct HexAddr;

impl HexAddr {
    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(HexAddrVisitor)
    }
}

/// [`Visitor`][serde::de::Visitor] for parsing addresses
struct HexAddrVisitor;

impl serde::de::Visitor<'_> for HexAddrVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "an address as integer or hex string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v)
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Signed(v), &"a positive address"))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        parse_addr(v).ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

/// Parse an address given either in hex (`0x` prefix) or in decimal
pub fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Serde "module" for (de)serializing byte strings as hex strings
pub struct HexBytes;

impl HexBytes {
    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(HexBytesVisitor)
    }
}

/// [`Visitor`][serde::de::Visitor] for parsing hex encoded byte strings
struct HexBytesVisitor;

impl serde::de::Visitor<'_> for HexBytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "a hex encoded byte string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        hex::decode(v).map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

/// Serde "module" for optional base64 encoded page contents
///
/// This is the encoding used for captured memory in fault event records.
/// `null` and a missing field both decode to [`None`].
pub struct Base64Content;

impl Base64Content {
    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(data) => {
                serializer.serialize_some(&base64::engine::general_purpose::STANDARD.encode(data))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(Base64Visitor)
    }
}

/// [`Visitor`][serde::de::Visitor] for parsing optional base64 data
struct Base64Visitor;

impl<'de> serde::de::Visitor<'de> for Base64Visitor {
    type Value = Option<Vec<u8>>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "base64 encoded data or null")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(None)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(self)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        base64::engine::general_purpose::STANDARD
            .decode(v)
            .map(Some)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Str("<data>"), &self))
    }
}
