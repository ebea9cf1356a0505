//! Durable object storage for evidence artifacts.
//!
//! An [`EvidenceStore`] writes one artifact under its [`UploadKey`] and
//! returns an opaque [`StorageReference`]. Failures are classified so the
//! upload sink knows whether retrying can help.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use vigil_core::archive::StorageReference;
use vigil_core::config::StorageConfig;
use vigil_core::hashing::UploadKey;
use vigil_core::record::CanonicalRecord;

pub mod local;
pub mod s3;

pub use local::LocalEvidenceStore;
pub use s3::S3EvidenceStore;

/// Error type for storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Worth retrying: timeouts, throttling, 5xx, connection loss.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    /// Retrying the same write cannot succeed.
    #[error("Permanent storage failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                Self::Permanent(e.to_string())
            }
            _ => Self::Transient(e.to_string()),
        }
    }
}

/// Metadata stored alongside an artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceMetadata {
    pub file_name: String,
    pub plate: String,
    pub vehicle_type: String,
    pub jurisdiction: String,
    pub track_id: i64,
    pub camera_id: String,
    pub camera_name: String,
    pub camera_lat: f64,
    pub camera_lon: f64,
    pub created_at: String,
}

impl EvidenceMetadata {
    pub fn new(record: &CanonicalRecord, file_name: impl Into<String>) -> Self {
        let camera = record.camera();
        Self {
            file_name: file_name.into(),
            plate: record.plate().to_string(),
            vehicle_type: record.vehicle_type().to_string(),
            jurisdiction: record.jurisdiction().to_string(),
            track_id: record.track_id(),
            camera_id: camera.camera_id.clone(),
            camera_name: camera.camera_name.clone(),
            camera_lat: camera.camera_lat,
            camera_lon: camera.camera_lon,
            created_at: record.created_at().to_rfc3339(),
        }
    }

    /// Flat string pairs for object-store user metadata.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("file-name", self.file_name.clone()),
            ("plate", self.plate.clone()),
            ("vehicle-type", self.vehicle_type.clone()),
            ("jurisdiction", self.jurisdiction.clone()),
            ("track-id", self.track_id.to_string()),
            ("camera-id", self.camera_id.clone()),
            ("camera-name", self.camera_name.clone()),
            ("camera-lat", self.camera_lat.to_string()),
            ("camera-lon", self.camera_lon.to_string()),
            ("created-at", self.created_at.clone()),
        ]
    }

    /// Guess a MIME type from the artifact's extension.
    pub fn content_type(&self) -> &'static str {
        let ext = Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("mp4") => "video/mp4",
            Some("avi") => "video/x-msvideo",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("csv") => "text/csv",
            _ => "application/octet-stream",
        }
    }
}

/// Object name for an artifact: the upload key plus the original extension.
pub fn object_name(key: &UploadKey, file_name: &str) -> String {
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{key}.{ext}"),
        _ => key.to_string(),
    }
}

/// A durable artifact store.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Write `bytes` under `key`. Writing the same key twice must be safe.
    async fn put(
        &self,
        key: &UploadKey,
        bytes: &[u8],
        metadata: &EvidenceMetadata,
    ) -> Result<StorageReference, StoreError>;
}

/// Build the configured storage backend.
pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn EvidenceStore>, StoreError> {
    let store: Arc<dyn EvidenceStore> = match config {
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            prefix,
            credentials_path,
        } => Arc::new(
            S3EvidenceStore::connect(
                bucket.clone(),
                region.clone(),
                endpoint.clone(),
                prefix.clone(),
                credentials_path.as_deref(),
            )
            .await?,
        ),
        StorageConfig::Local { dir } => Arc::new(LocalEvidenceStore::new(dir.clone())),
    };
    tracing::info!(backend = store.backend(), "Evidence storage configured");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_keeps_extension() {
        let key = UploadKey::from_stored("abc");
        assert_eq!(object_name(&key, "clip_0007.mp4"), "abc.mp4");
        assert_eq!(object_name(&key, "noext"), "abc");
    }

    #[test]
    fn io_errors_are_classified() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!StoreError::from(denied).is_transient());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StoreError::from(reset).is_transient());
    }
}
