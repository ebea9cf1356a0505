//! Idempotent evidence archival.
//!
//! [`EvidenceUploadSink::archive`] walks one artifact through
//! `NEW -> UPLOADING -> STORED`, with transient failures passing through
//! `FAILED` and being retried up to [`UploadPolicy::max_attempts`] before
//! the key is parked in `FAILED_PERMANENT`.
//!
//! Two layers keep duplicate uploads out:
//!
//! - a per-key async lock serialises callers inside this process, so the
//!   second caller simply sees the first one's `STORED` entry;
//! - the index claim is atomic, which covers other processes sharing a
//!   durable index.
//!
//! An `archive` future dropped mid-upload (a caller's timeout, shutdown)
//! releases its claim as `FAILED`, so the key stays claimable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use vigil_core::archive::StorageReference;
use vigil_core::hashing::UploadKey;
use vigil_core::record::CanonicalRecord;

use crate::index::{ArchiveIndex, Claim, IndexError};
use crate::store::{EvidenceMetadata, EvidenceStore, StoreError};

/// Recorded on a claim whose upload was dropped before it finished.
const CANCELLED: &str = "Upload cancelled before completion";

type LockMap = Mutex<HashMap<UploadKey, Arc<AsyncMutex<()>>>>;

/// Error type for archival failures.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// May succeed if archival is attempted again later.
    #[error("Transient upload failure: {0}")]
    Transient(String),

    /// Recorded as `failed_permanent`; not retried.
    #[error("Permanent upload failure: {0}")]
    Permanent(String),

    #[error("Cannot read evidence artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Outcome of a successful `archive` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Stored {
        reference: StorageReference,
        /// `true` when the artifact was already archived.
        deduplicated: bool,
    },
    /// No artifact to archive.
    Skipped,
}

impl ArchiveOutcome {
    pub fn reference(&self) -> Option<&StorageReference> {
        match self {
            Self::Stored { reference, .. } => Some(reference),
            Self::Skipped => None,
        }
    }
}

/// Retry and wait bounds for archival.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Upload attempts per `archive` call, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long to wait for a key another worker is uploading.
    pub in_progress_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            in_progress_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl UploadPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }
}

pub struct EvidenceUploadSink {
    store: Arc<dyn EvidenceStore>,
    index: Arc<dyn ArchiveIndex>,
    policy: UploadPolicy,
    locks: LockMap,
}

impl EvidenceUploadSink {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        index: Arc<dyn ArchiveIndex>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            index,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<dyn ArchiveIndex> {
        &self.index
    }

    /// Archive the artifact at `local_path` together with `record`'s
    /// metadata.
    ///
    /// An absent path or a missing file yields [`ArchiveOutcome::Skipped`].
    pub async fn archive(
        &self,
        record: &CanonicalRecord,
        local_path: Option<&Path>,
    ) -> Result<ArchiveOutcome, UploadError> {
        let Some(path) = local_path else {
            tracing::debug!(track_id = record.track_id(), "No evidence path, archival skipped");
            return Ok(ArchiveOutcome::Skipped);
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Evidence file missing, archival skipped");
                return Ok(ArchiveOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let key = UploadKey::from_content(&bytes);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());
        let metadata = EvidenceMetadata::new(record, file_name);

        let result = {
            let _held = self.lock_key(&key).await;
            self.archive_locked(&key, record, &bytes, &metadata).await
        };

        match &result {
            Ok(ArchiveOutcome::Stored {
                reference,
                deduplicated,
            }) => tracing::info!(
                upload_key = %key,
                reference = %reference,
                deduplicated,
                "Evidence archived",
            ),
            Ok(ArchiveOutcome::Skipped) => {}
            Err(e) => tracing::error!(upload_key = %key, error = %e, "Evidence archival failed"),
        }
        result
    }

    async fn archive_locked(
        &self,
        key: &UploadKey,
        record: &CanonicalRecord,
        bytes: &[u8],
        metadata: &EvidenceMetadata,
    ) -> Result<ArchiveOutcome, UploadError> {
        let mut attempt = 0;
        let mut backoff = self.policy.initial_backoff;

        loop {
            if let Some(outcome) = self.acquire(key, record).await? {
                return Ok(outcome);
            }
            attempt += 1;
            let claim = ClaimGuard::new(&self.index, key);

            match self.store.put(key, bytes, metadata).await {
                Ok(reference) => {
                    self.index.complete(key, &reference).await?;
                    claim.resolved();
                    return Ok(ArchiveOutcome::Stored {
                        reference,
                        deduplicated: false,
                    });
                }
                Err(StoreError::Transient(msg)) if attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        upload_key = %key,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %msg,
                        "Evidence upload failed, retrying",
                    );
                    self.index.fail(key, false, &msg).await?;
                    claim.resolved();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                }
                Err(e) => {
                    let msg = match e {
                        StoreError::Transient(msg) => {
                            format!("Gave up after {attempt} attempts: {msg}")
                        }
                        StoreError::Permanent(msg) => msg,
                    };
                    self.index.fail(key, true, &msg).await?;
                    claim.resolved();
                    return Err(UploadError::Permanent(msg));
                }
            }
        }
    }

    /// Claim `key`, waiting out a claim held elsewhere.
    ///
    /// Returns `None` when the caller now owns the key, or the final
    /// outcome when the key is already resolved.
    async fn acquire(
        &self,
        key: &UploadKey,
        record: &CanonicalRecord,
    ) -> Result<Option<ArchiveOutcome>, UploadError> {
        let deadline = Instant::now() + self.policy.in_progress_wait;
        loop {
            match self.index.claim(key, record).await? {
                Claim::Acquired => return Ok(None),
                Claim::Stored(reference) => {
                    return Ok(Some(ArchiveOutcome::Stored {
                        reference,
                        deduplicated: true,
                    }))
                }
                Claim::FailedPermanent(msg) => return Err(UploadError::Permanent(msg)),
                Claim::InProgress if Instant::now() >= deadline => {
                    return Err(UploadError::Transient(format!(
                        "Upload of {key} still in progress elsewhere"
                    )))
                }
                Claim::InProgress => tokio::time::sleep(self.policy.poll_interval).await,
            }
        }
    }

    /// Hold the in-process lock for `key` until the returned guard drops.
    async fn lock_key(&self, key: &UploadKey) -> KeyLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        KeyLock {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A held per-key lock; drops its map entry once nobody else wants it.
struct KeyLock<'a> {
    locks: &'a LockMap,
    key: UploadKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        // Only the map's own handle left: nobody is waiting on this key.
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// An owned index claim that has not yet been moved out of `uploading`.
///
/// Dropping it unresolved marks the key `failed` from a spawned task.
struct ClaimGuard {
    index: Arc<dyn ArchiveIndex>,
    key: Option<UploadKey>,
}

impl ClaimGuard {
    fn new(index: &Arc<dyn ArchiveIndex>, key: &UploadKey) -> Self {
        Self {
            index: Arc::clone(index),
            key: Some(key.clone()),
        }
    }

    fn resolved(mut self) {
        self.key = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(upload_key = %key, "Upload dropped outside a runtime, claim left to expire");
            return;
        };

        tracing::warn!(upload_key = %key, "Upload cancelled, releasing claim");
        let index = Arc::clone(&self.index);
        runtime.spawn(async move {
            if let Err(e) = index.fail(&key, false, CANCELLED).await {
                tracing::error!(upload_key = %key, error = %e, "Failed to release cancelled claim");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryArchiveIndex;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_core::archive::ArchiveStatus;
    use vigil_core::correlation::CorrelationEngine;
    use vigil_core::record::CameraIdentity;
    use vigil_core::violation::ViolationEvent;

    /// Counts puts; fails the first `transient` of them, or all of them
    /// permanently. With `stall_first` the first put never finishes.
    #[derive(Default)]
    struct CountingStore {
        puts: AtomicUsize,
        transient: usize,
        permanent: bool,
        stall_first: bool,
    }

    #[async_trait]
    impl EvidenceStore for CountingStore {
        fn backend(&self) -> &'static str {
            "counting"
        }

        async fn put(
            &self,
            key: &UploadKey,
            _bytes: &[u8],
            _metadata: &EvidenceMetadata,
        ) -> Result<StorageReference, StoreError> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst);
            if self.stall_first && n == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            tokio::task::yield_now().await;
            if self.permanent {
                return Err(StoreError::Permanent("access denied".into()));
            }
            if n < self.transient {
                return Err(StoreError::Transient("timeout".into()));
            }
            Ok(StorageReference::new(format!("mem://{key}")))
        }
    }

    fn fast_policy(max_attempts: u32) -> UploadPolicy {
        UploadPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            in_progress_wait: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn sink_with(store: Arc<CountingStore>, max_attempts: u32) -> EvidenceUploadSink {
        EvidenceUploadSink::new(
            store,
            Arc::new(MemoryArchiveIndex::new()),
            fast_policy(max_attempts),
        )
    }

    fn record(evidence: &Path) -> CanonicalRecord {
        let event = ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 42,
            vehicle_type: "HMV".into(),
            plate: Some("MH12AB1234".into()),
            evidence_path: Some(evidence.display().to_string()),
            raw: None,
        };
        CorrelationEngine::new(CameraIdentity::default()).correlate(event, None)
    }

    fn artifact(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn absent_or_missing_artifact_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::default());
        let sink = sink_with(store.clone(), 3);
        let missing = dir.path().join("missing.mp4");

        let r = record(&missing);
        assert_eq!(sink.archive(&r, None).await.unwrap(), ArchiveOutcome::Skipped);
        assert_eq!(
            sink.archive(&r, Some(&missing)).await.unwrap(),
            ArchiveOutcome::Skipped
        );
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_archive_uploads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore::default());
        let sink = sink_with(store.clone(), 3);
        let r = record(&path);

        let first = sink.archive(&r, Some(&path)).await.unwrap();
        let second = sink.archive(&r, Some(&path)).await.unwrap();

        assert_matches!(&first, ArchiveOutcome::Stored { deduplicated: false, .. });
        assert_matches!(&second, ArchiveOutcome::Stored { deduplicated: true, .. });
        assert_eq!(first.reference(), second.reference());
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.lock_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_archive_uploads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore::default());
        let sink = Arc::new(sink_with(store.clone(), 3));

        let calls = (0..8).map(|_| {
            let sink = Arc::clone(&sink);
            let path = path.clone();
            tokio::spawn(async move { sink.archive(&record(&path), Some(&path)).await })
        });
        let handles: Vec<_> = calls.collect();
        let outcomes = join_outcomes(handles).await;

        let references: Vec<_> = outcomes
            .iter()
            .map(|o| o.reference().cloned().unwrap())
            .collect();
        assert!(references.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    async fn join_outcomes(
        handles: Vec<tokio::task::JoinHandle<Result<ArchiveOutcome, UploadError>>>,
    ) -> Vec<ArchiveOutcome> {
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore {
            transient: 2,
            ..Default::default()
        });
        let sink = sink_with(store.clone(), 3);

        let outcome = sink.archive(&record(&path), Some(&path)).await.unwrap();

        assert_matches!(outcome, ArchiveOutcome::Stored { deduplicated: false, .. });
        assert_eq!(store.puts.load(Ordering::SeqCst), 3);
        let key = UploadKey::from_content(b"video");
        let entry = sink.index().lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, ArchiveStatus::Stored);
        assert_eq!(entry.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore {
            transient: usize::MAX,
            ..Default::default()
        });
        let sink = sink_with(store.clone(), 2);

        let err = sink.archive(&record(&path), Some(&path)).await.unwrap_err();
        assert_matches!(err, UploadError::Permanent(msg) if msg.contains("Gave up after 2 attempts"));
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);

        // Surfaced, not retried on a later call.
        let again = sink.archive(&record(&path), Some(&path)).await.unwrap_err();
        assert_matches!(again, UploadError::Permanent(_));
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore {
            permanent: true,
            ..Default::default()
        });
        let sink = sink_with(store.clone(), 5);

        let err = sink.archive(&record(&path), Some(&path)).await.unwrap_err();
        assert_matches!(err, UploadError::Permanent(msg) if msg == "access denied");
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_upload_releases_its_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore {
            stall_first: true,
            ..Default::default()
        });
        let sink = sink_with(store.clone(), 3);
        let r = record(&path);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), sink.archive(&r, Some(&path))).await;
        assert!(timed_out.is_err());
        assert_eq!(sink.lock_count(), 0);

        let outcome = sink.archive(&r, Some(&path)).await.unwrap();
        assert_matches!(outcome, ArchiveOutcome::Stored { deduplicated: false, .. });
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);

        let key = UploadKey::from_content(b"video");
        let entry = sink.index().lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, ArchiveStatus::Stored);
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn claim_held_elsewhere_times_out_as_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, "clip.mp4", b"video");
        let store = Arc::new(CountingStore::default());
        let sink = sink_with(store.clone(), 3);
        let r = record(&path);

        // Simulate another process owning the key.
        let key = UploadKey::from_content(b"video");
        assert_eq!(sink.index().claim(&key, &r).await.unwrap(), Claim::Acquired);

        let err = sink.archive(&r, Some(&path)).await.unwrap_err();
        assert_matches!(err, UploadError::Transient(_));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }
}
