//! Evidence archive index models.

use serde::Serialize;
use sqlx::FromRow;
use vigil_core::archive::ArchiveStatus;
use vigil_core::error::CoreError;
use vigil_core::types::Timestamp;

/// A row from the `evidence_archive` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EvidenceArchiveEntry {
    pub upload_key: String,
    pub status: String,
    pub storage_ref: Option<String>,
    pub plate: String,
    pub vehicle_type: String,
    pub camera_id: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl EvidenceArchiveEntry {
    /// Typed view of the `status` column.
    pub fn archive_status(&self) -> Result<ArchiveStatus, CoreError> {
        ArchiveStatus::from_name(&self.status)
    }
}

/// DTO for claiming an upload key.
#[derive(Debug)]
pub struct ClaimEvidence<'a> {
    pub upload_key: &'a str,
    pub plate: &'a str,
    pub vehicle_type: &'a str,
    pub camera_id: &'a str,
}
