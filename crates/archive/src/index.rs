//! The UploadKey index: which artifacts are archived, and where.
//!
//! [`ArchiveIndex::claim`] is the single atomic insert-if-absent step that
//! makes archival idempotent across concurrent callers. Whoever gets
//! [`Claim::Acquired`] uploads; everyone else observes the owner's state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use vigil_core::archive::{ArchiveStatus, StorageReference};
use vigil_core::error::CoreError;
use vigil_core::hashing::UploadKey;
use vigil_core::record::CanonicalRecord;
use vigil_db::models::evidence_archive::{ClaimEvidence, EvidenceArchiveEntry};
use vigil_db::repositories::EvidenceArchiveRepo;
use vigil_db::DbPool;

/// How long an `uploading` claim may go untouched before another worker
/// may take it over.
pub const DEFAULT_STALE_CLAIM_AFTER: Duration = Duration::from_secs(300);

/// Result of trying to claim an upload key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the key and must upload.
    Acquired,
    /// Already archived.
    Stored(StorageReference),
    /// Another worker is uploading it.
    InProgress,
    /// An earlier upload failed for good.
    FailedPermanent(String),
}

/// Snapshot of one index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub status: ArchiveStatus,
    pub reference: Option<StorageReference>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Index database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt index entry: {0}")]
    Corrupt(#[from] CoreError),
}

#[async_trait]
pub trait ArchiveIndex: Send + Sync {
    /// Atomically claim `key` for uploading, or report its current state.
    async fn claim(&self, key: &UploadKey, record: &CanonicalRecord) -> Result<Claim, IndexError>;

    /// Move an owned claim to `stored`.
    async fn complete(&self, key: &UploadKey, reference: &StorageReference)
        -> Result<(), IndexError>;

    /// Move an owned claim to `failed` or `failed_permanent`.
    async fn fail(&self, key: &UploadKey, permanent: bool, error: &str) -> Result<(), IndexError>;

    async fn lookup(&self, key: &UploadKey) -> Result<Option<IndexEntry>, IndexError>;
}

fn failure_status(permanent: bool) -> ArchiveStatus {
    if permanent {
        ArchiveStatus::FailedPermanent
    } else {
        ArchiveStatus::Failed
    }
}

// ---------------------------------------------------------------------------
// In-memory index
// ---------------------------------------------------------------------------

/// Process-local index, used when no database is configured.
///
/// An `uploading` claim older than `stale_after` may be taken over, the
/// same as in [`PgArchiveIndex`].
pub struct MemoryArchiveIndex {
    entries: Mutex<HashMap<UploadKey, Slot>>,
    stale_after: Duration,
}

struct Slot {
    entry: IndexEntry,
    claimed_at: Instant,
}

impl Default for MemoryArchiveIndex {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after: DEFAULT_STALE_CLAIM_AFTER,
        }
    }
}

impl MemoryArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<UploadKey, Slot>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArchiveIndex for MemoryArchiveIndex {
    async fn claim(&self, key: &UploadKey, _record: &CanonicalRecord) -> Result<Claim, IndexError> {
        let mut entries = self.entries();
        let Some(slot) = entries.get_mut(key) else {
            entries.insert(
                key.clone(),
                Slot {
                    entry: IndexEntry {
                        status: ArchiveStatus::Uploading,
                        reference: None,
                        attempts: 1,
                        last_error: None,
                    },
                    claimed_at: Instant::now(),
                },
            );
            return Ok(Claim::Acquired);
        };

        let stale = slot.entry.status == ArchiveStatus::Uploading
            && slot.claimed_at.elapsed() >= self.stale_after;
        if stale {
            tracing::warn!(upload_key = %key, "Taking over stale upload claim");
        }

        let entry = &mut slot.entry;
        Ok(match entry.status {
            status if stale || status.is_reclaimable() => {
                entry.status = ArchiveStatus::Uploading;
                entry.attempts += 1;
                entry.last_error = None;
                slot.claimed_at = Instant::now();
                Claim::Acquired
            }
            ArchiveStatus::Stored => match &entry.reference {
                Some(reference) => Claim::Stored(reference.clone()),
                None => {
                    return Err(CoreError::Internal(format!(
                        "Stored entry {key} has no storage reference"
                    ))
                    .into())
                }
            },
            ArchiveStatus::FailedPermanent => {
                Claim::FailedPermanent(entry.last_error.clone().unwrap_or_default())
            }
            _ => Claim::InProgress,
        })
    }

    async fn complete(
        &self,
        key: &UploadKey,
        reference: &StorageReference,
    ) -> Result<(), IndexError> {
        if let Some(slot) = self.entries().get_mut(key) {
            slot.entry.status = ArchiveStatus::Stored;
            slot.entry.reference = Some(reference.clone());
            slot.entry.last_error = None;
        }
        Ok(())
    }

    async fn fail(&self, key: &UploadKey, permanent: bool, error: &str) -> Result<(), IndexError> {
        if let Some(slot) = self.entries().get_mut(key) {
            if slot.entry.status == ArchiveStatus::Uploading {
                slot.entry.status = failure_status(permanent);
                slot.entry.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn lookup(&self, key: &UploadKey) -> Result<Option<IndexEntry>, IndexError> {
        Ok(self.entries().get(key).map(|slot| slot.entry.clone()))
    }
}

// ---------------------------------------------------------------------------
// Postgres index
// ---------------------------------------------------------------------------

/// Durable index backed by the `evidence_archive` table.
pub struct PgArchiveIndex {
    pool: DbPool,
    stale_after: Duration,
}

impl PgArchiveIndex {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_CLAIM_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl TryFrom<EvidenceArchiveEntry> for IndexEntry {
    type Error = IndexError;

    fn try_from(row: EvidenceArchiveEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.archive_status()?,
            reference: row.storage_ref.map(StorageReference::new),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
        })
    }
}

#[async_trait]
impl ArchiveIndex for PgArchiveIndex {
    async fn claim(&self, key: &UploadKey, record: &CanonicalRecord) -> Result<Claim, IndexError> {
        let input = ClaimEvidence {
            upload_key: key.as_str(),
            plate: record.plate(),
            vehicle_type: record.vehicle_type(),
            camera_id: &record.camera().camera_id,
        };
        if EvidenceArchiveRepo::try_claim(&self.pool, &input, self.stale_after.as_secs_f64())
            .await?
            .is_some()
        {
            return Ok(Claim::Acquired);
        }

        // Lost the race or the key already has a state; report it.
        let Some(entry) = self.lookup(key).await? else {
            return Ok(Claim::InProgress);
        };
        Ok(match entry.status {
            ArchiveStatus::Stored => match entry.reference {
                Some(reference) => Claim::Stored(reference),
                None => {
                    return Err(CoreError::Internal(format!(
                        "Stored entry {key} has no storage reference"
                    ))
                    .into())
                }
            },
            ArchiveStatus::FailedPermanent => {
                Claim::FailedPermanent(entry.last_error.unwrap_or_default())
            }
            ArchiveStatus::Uploading | ArchiveStatus::Failed => Claim::InProgress,
        })
    }

    async fn complete(
        &self,
        key: &UploadKey,
        reference: &StorageReference,
    ) -> Result<(), IndexError> {
        EvidenceArchiveRepo::mark_stored(&self.pool, key.as_str(), reference.as_str()).await?;
        Ok(())
    }

    async fn fail(&self, key: &UploadKey, permanent: bool, error: &str) -> Result<(), IndexError> {
        EvidenceArchiveRepo::mark_failed(&self.pool, key.as_str(), failure_status(permanent), error)
            .await?;
        Ok(())
    }

    async fn lookup(&self, key: &UploadKey) -> Result<Option<IndexEntry>, IndexError> {
        EvidenceArchiveRepo::find(&self.pool, key.as_str())
            .await?
            .map(IndexEntry::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use vigil_core::correlation::CorrelationEngine;
    use vigil_core::record::CameraIdentity;
    use vigil_core::violation::ViolationEvent;

    fn record() -> CanonicalRecord {
        let event = ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 1,
            vehicle_type: "HMV".into(),
            plate: None,
            evidence_path: None,
            raw: None,
        };
        CorrelationEngine::new(CameraIdentity::default()).correlate(event, None)
    }

    #[tokio::test]
    async fn first_claim_acquires_second_sees_in_progress() {
        let index = MemoryArchiveIndex::new();
        let key = UploadKey::from_content(b"a");

        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::Acquired);
        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::InProgress);
    }

    #[tokio::test]
    async fn stored_key_reports_reference() {
        let index = MemoryArchiveIndex::new();
        let key = UploadKey::from_content(b"a");
        let reference = StorageReference::new("s3://b/a");

        index.claim(&key, &record()).await.unwrap();
        index.complete(&key, &reference).await.unwrap();

        assert_eq!(
            index.claim(&key, &record()).await.unwrap(),
            Claim::Stored(reference.clone())
        );
        let entry = index.lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, ArchiveStatus::Stored);
        assert_eq!(entry.reference, Some(reference));
    }

    #[tokio::test]
    async fn retryable_failure_is_reclaimable() {
        let index = MemoryArchiveIndex::new();
        let key = UploadKey::from_content(b"a");

        index.claim(&key, &record()).await.unwrap();
        index.fail(&key, false, "timeout").await.unwrap();
        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::Acquired);
        assert_eq!(index.lookup(&key).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_sticky() {
        let index = MemoryArchiveIndex::new();
        let key = UploadKey::from_content(b"a");

        index.claim(&key, &record()).await.unwrap();
        index.fail(&key, true, "access denied").await.unwrap();

        assert_matches!(
            index.claim(&key, &record()).await.unwrap(),
            Claim::FailedPermanent(msg) if msg == "access denied"
        );
    }

    #[tokio::test]
    async fn stale_claim_can_be_taken_over() {
        let index = MemoryArchiveIndex::new().with_stale_after(Duration::from_millis(20));
        let key = UploadKey::from_content(b"a");

        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::Acquired);
        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::InProgress);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::Acquired);
        assert_eq!(index.lookup(&key).await.unwrap().unwrap().attempts, 2);
        // The takeover is a fresh claim.
        assert_eq!(index.claim(&key, &record()).await.unwrap(), Claim::InProgress);
    }

    #[tokio::test]
    async fn fail_only_applies_to_owned_claims() {
        let index = MemoryArchiveIndex::new();
        let key = UploadKey::from_content(b"a");
        let reference = StorageReference::new("s3://b/a");

        index.claim(&key, &record()).await.unwrap();
        index.complete(&key, &reference).await.unwrap();
        index.fail(&key, true, "late failure").await.unwrap();

        let entry = index.lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, ArchiveStatus::Stored);
    }
}
