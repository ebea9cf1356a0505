//! Upload keys: deterministic identifiers for evidence artifacts.
//!
//! Two trigger paths archiving the same physical file must land on the
//! same key, so the key is derived from the artifact's content.

use std::fmt;

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Idempotency key for evidence archival.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadKey(String);

impl UploadKey {
    /// Key derived from the artifact bytes.
    pub fn from_content(data: &[u8]) -> Self {
        Self(sha256_hex(data))
    }

    /// Wrap a key previously read back from the index.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_key_is_deterministic() {
        assert_eq!(UploadKey::from_content(b"frame"), UploadKey::from_content(b"frame"));
        assert_ne!(UploadKey::from_content(b"frame"), UploadKey::from_content(b"other"));
        assert_eq!(UploadKey::from_content(b"frame").as_str().len(), 64);
    }
}
