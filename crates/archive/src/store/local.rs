//! Local-directory evidence store.
//!
//! Artifacts land in `<dir>/<upload_key>.<ext>` with their metadata in a
//! `.json` file next to them. Writes go through a temporary file and a
//! rename so a crash never leaves a partial artifact under its final name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use vigil_core::archive::StorageReference;
use vigil_core::hashing::UploadKey;

use super::{object_name, EvidenceMetadata, EvidenceStore, StoreError};

pub struct LocalEvidenceStore {
    dir: PathBuf,
}

impl LocalEvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl EvidenceStore for LocalEvidenceStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        key: &UploadKey,
        bytes: &[u8],
        metadata: &EvidenceMetadata,
    ) -> Result<StorageReference, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = object_name(key, &metadata.file_name);
        let target = self.dir.join(&name);
        let reference = StorageReference::new(format!("file://{}", target.display()));

        // Content-addressed: an existing object already holds these bytes.
        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(upload_key = %key, "Object already present in local store");
            return Ok(reference);
        }

        let meta_json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StoreError::Permanent(format!("Metadata encoding failed: {e}")))?;
        self.write_atomic(&self.dir.join(format!("{name}.json")), &meta_json)
            .await?;
        self.write_atomic(&target, bytes).await?;

        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::correlation::CorrelationEngine;
    use vigil_core::record::CameraIdentity;
    use vigil_core::violation::ViolationEvent;

    fn metadata() -> EvidenceMetadata {
        let event = ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 5,
            vehicle_type: "HMV".into(),
            plate: Some("MH12AB1234".into()),
            evidence_path: None,
            raw: None,
        };
        let record = CorrelationEngine::new(CameraIdentity::default()).correlate(event, None);
        EvidenceMetadata::new(&record, "frame.jpg")
    }

    #[tokio::test]
    async fn put_writes_artifact_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalEvidenceStore::new(dir.path().join("archive"));
        let key = UploadKey::from_content(b"jpeg bytes");

        let reference = store.put(&key, b"jpeg bytes", &metadata()).await.unwrap();

        let object = dir.path().join("archive").join(format!("{key}.jpg"));
        assert_eq!(reference.as_str(), format!("file://{}", object.display()));
        assert_eq!(std::fs::read(&object).unwrap(), b"jpeg bytes");

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(object.with_extension("jpg.json")).unwrap())
                .unwrap();
        assert_eq!(meta["plate"], "MH12AB1234");
        assert_eq!(meta["camera_id"], "unknown_cam");
    }

    #[tokio::test]
    async fn repeated_put_returns_same_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalEvidenceStore::new(dir.path());
        let key = UploadKey::from_content(b"x");

        let first = store.put(&key, b"x", &metadata()).await.unwrap();
        let second = store.put(&key, b"x", &metadata()).await.unwrap();

        assert_eq!(first, second);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
