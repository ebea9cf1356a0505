//! Repository for the durable UploadKey index.
//!
//! Claims use a single `INSERT .. ON CONFLICT` statement so that two
//! workers (or two processes) racing on the same key cannot both observe
//! "not archived" and both upload.

use sqlx::PgPool;
use vigil_core::archive::ArchiveStatus;

use crate::models::evidence_archive::{ClaimEvidence, EvidenceArchiveEntry};

/// Column list for `evidence_archive` queries.
const COLUMNS: &str = "\
    upload_key, status, storage_ref, plate, vehicle_type, camera_id, \
    attempts, last_error, created_at, updated_at";

/// Provides claim / completion operations for archived evidence.
pub struct EvidenceArchiveRepo;

impl EvidenceArchiveRepo {
    /// Find an entry by upload key.
    pub async fn find(
        pool: &PgPool,
        upload_key: &str,
    ) -> Result<Option<EvidenceArchiveEntry>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM evidence_archive WHERE upload_key = $1");
        sqlx::query_as::<_, EvidenceArchiveEntry>(&query)
            .bind(upload_key)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim `upload_key` for uploading.
    ///
    /// Succeeds (returns the claimed row) when the key is new, when its
    /// previous attempt ended in a retryable failure, or when an
    /// `uploading` claim has not been touched for `stale_after_secs`
    /// (the claiming worker died). Returns `None` when someone else owns
    /// the key; call [`find`](Self::find) to see its state.
    pub async fn try_claim(
        pool: &PgPool,
        input: &ClaimEvidence<'_>,
        stale_after_secs: f64,
    ) -> Result<Option<EvidenceArchiveEntry>, sqlx::Error> {
        let query = format!(
            "INSERT INTO evidence_archive (upload_key, status, plate, vehicle_type, camera_id) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (upload_key) DO UPDATE SET \
                status = EXCLUDED.status, \
                attempts = evidence_archive.attempts + 1, \
                last_error = NULL, \
                updated_at = now() \
             WHERE evidence_archive.status = $6 \
                OR (evidence_archive.status = $2 \
                    AND evidence_archive.updated_at < now() - make_interval(secs => $7)) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, EvidenceArchiveEntry>(&query)
            .bind(input.upload_key)
            .bind(ArchiveStatus::Uploading.as_str())
            .bind(input.plate)
            .bind(input.vehicle_type)
            .bind(input.camera_id)
            .bind(ArchiveStatus::Failed.as_str())
            .bind(stale_after_secs)
            .fetch_optional(pool)
            .await
    }

    /// Record a successful upload.
    pub async fn mark_stored(
        pool: &PgPool,
        upload_key: &str,
        storage_ref: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE evidence_archive \
             SET status = $2, storage_ref = $3, last_error = NULL, updated_at = now() \
             WHERE upload_key = $1",
        )
        .bind(upload_key)
        .bind(ArchiveStatus::Stored.as_str())
        .bind(storage_ref)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record a failed upload, either retryable or permanent.
    pub async fn mark_failed(
        pool: &PgPool,
        upload_key: &str,
        status: ArchiveStatus,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE evidence_archive \
             SET status = $2, last_error = $3, updated_at = now() \
             WHERE upload_key = $1 AND status = $4",
        )
        .bind(upload_key)
        .bind(status.as_str())
        .bind(error)
        .bind(ArchiveStatus::Uploading.as_str())
        .execute(pool)
        .await?;
        Ok(())
    }
}
