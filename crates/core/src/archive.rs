//! Archival state shared by the upload sink and the durable index.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle of one evidence artifact in the archive index.
///
/// ```text
/// NEW ──claim──▶ UPLOADING ──▶ STORED
///                   │
///                   └──▶ FAILED (retryable) ──retries exhausted──▶ FAILED_PERMANENT
/// ```
///
/// `NEW` has no row in the index; a key is new until it is first claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Uploading,
    Stored,
    Failed,
    FailedPermanent,
}

impl ArchiveStatus {
    /// Database value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Stored => "stored",
            Self::Failed => "failed",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Parse from the database value.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "uploading" => Ok(Self::Uploading),
            "stored" => Ok(Self::Stored),
            "failed" => Ok(Self::Failed),
            "failed_permanent" => Ok(Self::FailedPermanent),
            other => Err(CoreError::Validation(format!(
                "Unknown archive status '{other}'"
            ))),
        }
    }

    /// Whether a new claim may take over an entry in this state.
    pub fn is_reclaimable(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Opaque reference to an archived object (e.g. `s3://bucket/key`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageReference(String);

impl StorageReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in [
            ArchiveStatus::Uploading,
            ArchiveStatus::Stored,
            ArchiveStatus::Failed,
            ArchiveStatus::FailedPermanent,
        ] {
            assert_eq!(ArchiveStatus::from_name(status.as_str()).unwrap(), status);
        }
        assert!(ArchiveStatus::from_name("lost").is_err());
    }

    #[test]
    fn only_retryable_failures_are_reclaimable() {
        assert!(ArchiveStatus::Failed.is_reclaimable());
        assert!(!ArchiveStatus::FailedPermanent.is_reclaimable());
        assert!(!ArchiveStatus::Stored.is_reclaimable());
        assert!(!ArchiveStatus::Uploading.is_reclaimable());
    }
}
