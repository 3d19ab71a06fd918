//! Content addressing for update artifacts.
//!
//! Every artifact (full image or delta patch) is identified by the BLAKE3
//! hash of its bytes. The hash is rendered as 64 lowercase hex characters on
//! the wire, in the database, and in store paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// BLAKE3 hash identifying an immutable artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hash the given bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap raw hash bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check whether `bytes` hash to this value.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// Fail with `IntegrityViolation` unless `bytes` hash to this value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityViolation`] on mismatch.
    pub fn verify(&self, bytes: &[u8]) -> Result<()> {
        let actual = Self::of(bytes);
        if actual == *self {
            Ok(())
        } else {
            Err(Error::IntegrityViolation {
                expected: *self,
                actual,
            })
        }
    }

    /// Short prefix used in log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != HASH_LEN * 2 {
            return Err(Error::validation(format!(
                "content hash must be {} hex characters, got {}",
                HASH_LEN * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::validation(format!("invalid content hash {s}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(ContentHash::of(b"image"), ContentHash::of(b"image"));
        assert_ne!(ContentHash::of(b"image"), ContentHash::of(b"imagf"));
    }

    #[test]
    fn test_hex_parse() {
        let hash = ContentHash::of(b"payload");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("abc".parse::<ContentHash>().is_err());
        assert!("zz".repeat(32).parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_verify_detects_single_byte_corruption() {
        let mut bytes = vec![7u8; 4096];
        let hash = ContentHash::of(&bytes);
        assert!(hash.verify(&bytes).is_ok());

        bytes[2048] ^= 0x01;
        let err = hash.verify(&bytes).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ContentHash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    proptest! {
        #[test]
        fn test_any_single_byte_corruption_is_detected(
            bytes in proptest::collection::vec(any::<u8>(), 1..8192),
            position in any::<usize>(),
            mask in 1u8..=255,
        ) {
            let hash = ContentHash::of(&bytes);
            let mut corrupted = bytes;
            let index = position % corrupted.len();
            corrupted[index] ^= mask;

            let err = hash.verify(&corrupted).unwrap_err();
            prop_assert!(
                matches!(err, Error::IntegrityViolation { expected, .. } if expected == hash),
                "unexpected error: {}",
                err
            );
        }
    }
}
