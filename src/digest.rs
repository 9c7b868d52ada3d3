//! Content digests.
//!
//! Every published Wasm artifact carries a **full digest** (64 hex chars,
//! `sha256(payload || canonical_json(manifest))`) and a **short digest**
//! (the first 16 hex chars of the full digest). The short digest is the
//! primary key used on disk and in the instance cache; the full digest is
//! carried alongside purely for integrity verification and is never used as
//! a map key.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

pub const SHORT_LEN: usize = 16;
pub const FULL_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("invalid digest length: expected {expected} hex chars, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex in digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A full 64-hex-char SHA-256 digest over payload + manifest.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullDigest(String);

impl FullDigest {
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if s.len() != FULL_LEN {
            return Err(DigestError::InvalidLength {
                expected: FULL_LEN,
                got: s.len(),
            });
        }
        hex::decode(s)?;
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> ShortDigest {
        ShortDigest(self.0[..SHORT_LEN].to_string())
    }
}

impl fmt::Display for FullDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The first 16 hex chars of a [`FullDigest`]; the primary on-disk and
/// in-memory key for a Version/Instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ShortDigest(String);

impl ShortDigest {
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if s.len() != SHORT_LEN {
            return Err(DigestError::InvalidLength {
                expected: SHORT_LEN,
                got: s.len(),
            });
        }
        hex::decode(s)?;
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the full digest of a payload plus its build manifest.
///
/// The manifest is re-serialized through a `BTreeMap`-backed JSON value so
/// that field order in the original request never affects the digest.
pub fn compute_full_digest(payload: &[u8], manifest: &serde_json::Value) -> FullDigest {
    let canonical = canonicalize(manifest);
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(canonical.as_bytes());
    let hash = hasher.finalize();
    FullDigest(hex::encode(hash))
}

/// Re-serialize a JSON value with object keys in sorted order, recursively.
fn canonicalize(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_digest_deterministic_regardless_of_manifest_key_order() {
        let a = serde_json::json!({"language": "rust", "wasi": true});
        let b = serde_json::json!({"wasi": true, "language": "rust"});
        assert_eq!(
            compute_full_digest(b"payload", &a),
            compute_full_digest(b"payload", &b)
        );
    }

    #[test]
    fn short_is_prefix_of_full() {
        let manifest = serde_json::json!({});
        let full = compute_full_digest(b"wasm-bytes", &manifest);
        let short = full.short();
        assert_eq!(short.as_str(), &full.as_str()[..SHORT_LEN]);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(matches!(
            ShortDigest::parse("abc"),
            Err(DigestError::InvalidLength { .. })
        ));
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = "z".repeat(SHORT_LEN);
        assert!(matches!(
            ShortDigest::parse(&bad),
            Err(DigestError::InvalidHex(_))
        ));
    }
}
