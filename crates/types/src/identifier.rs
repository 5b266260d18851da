//! Fixed-length source identifiers and their derived discovery keys.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an identifier in bytes.
pub const IDENTIFIER_LEN: usize = 32;

/// Length of an identifier rendered as hex.
pub const IDENTIFIER_HEX_LEN: usize = IDENTIFIER_LEN * 2;

const DISCOVERY_NAMESPACE: &[u8] = b"rehost-discovery";

/// Rejection reasons for a candidate identifier string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("invalid identifier: expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid identifier: {0}")]
    InvalidHex(String),
}

/// Content/source address. Equality is byte-exact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; IDENTIFIER_LEN]);

impl Identifier {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random identifier (used for the registry's own root).
    pub fn random() -> Self {
        let mut bytes = [0u8; IDENTIFIER_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse and validate a hex-encoded identifier.
    ///
    /// The input must be exactly [`IDENTIFIER_HEX_LEN`] characters long and
    /// contain only hex digits; no prefix or whitespace is tolerated.
    pub fn from_hex(hex_str: &str) -> Result<Self, IdentifierError> {
        if hex_str.len() != IDENTIFIER_HEX_LEN {
            return Err(IdentifierError::InvalidLength {
                expected: IDENTIFIER_HEX_LEN,
                actual: hex_str.len(),
            });
        }
        let mut bytes = [0u8; IDENTIFIER_LEN];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| IdentifierError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Swarm topic derived from this identifier.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_NAMESPACE).as_bytes())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Topic under which a source is announced and looked up in the swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryKey(pub [u8; IDENTIFIER_LEN]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.to_hex())
    }
}

impl Serialize for DiscoveryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_hex() {
        let id = Identifier::from_hex(&"a".repeat(64)).unwrap();
        assert_eq!(id.as_bytes(), &[0xaa; 32]);
        assert_eq!(id.to_string(), "a".repeat(64));
    }

    #[test]
    fn uppercase_hex_normalizes_to_lowercase() {
        let id: Identifier = "AB".repeat(32).parse().unwrap();
        assert_eq!(id.to_hex(), "ab".repeat(32));
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Identifier::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            IdentifierError::InvalidLength {
                expected: 64,
                actual: 4
            }
        );

        assert!(Identifier::from_hex(&"a".repeat(65)).is_err());
        assert!(Identifier::from_hex("").is_err());
    }

    #[test]
    fn rejects_non_hex_characters() {
        let candidate = format!("{}zz", "a".repeat(62));
        let err = Identifier::from_hex(&candidate).unwrap_err();
        assert!(matches!(err, IdentifierError::InvalidHex(_)));
    }

    #[test]
    fn rejects_prefixed_hex() {
        let candidate = format!("0x{}", "a".repeat(62));
        assert!(matches!(
            Identifier::from_hex(&candidate),
            Err(IdentifierError::InvalidHex(_))
        ));
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = Identifier::from_bytes([7u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));

        let bad: Result<Identifier, _> = serde_json::from_str("\"nothex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn discovery_key_is_stable_and_distinct() {
        let a = Identifier::from_bytes([1u8; 32]);
        let b = Identifier::from_bytes([2u8; 32]);
        assert_eq!(a.discovery_key(), a.discovery_key());
        assert_ne!(a.discovery_key(), b.discovery_key());
        assert_ne!(a.discovery_key().as_bytes(), a.as_bytes());
    }

    #[test]
    fn random_identifiers_differ() {
        assert_ne!(Identifier::random(), Identifier::random());
    }
}
