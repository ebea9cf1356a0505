//! Evidence archival: content-keyed, idempotent uploads of violation
//! artifacts to durable storage.

use std::sync::Arc;

use vigil_core::config::ArchiveConfig;

pub mod batch;
pub mod index;
pub mod sink;
pub mod store;

pub use batch::{archive_batch, BatchItem};
pub use index::{ArchiveIndex, Claim, IndexEntry, IndexError, MemoryArchiveIndex, PgArchiveIndex};
pub use sink::{ArchiveOutcome, EvidenceUploadSink, UploadError, UploadPolicy};
pub use store::{EvidenceMetadata, EvidenceStore, LocalEvidenceStore, S3EvidenceStore, StoreError};

/// Failure to bring up the archival stack at startup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot connect to archive index database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Archive index migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Build the upload sink described by `config`.
///
/// Returns `None` when no storage backend is configured. The index is
/// durable when a database URL is set, in-memory otherwise.
pub async fn build_upload_sink(
    config: &ArchiveConfig,
) -> Result<Option<EvidenceUploadSink>, SetupError> {
    let Some(storage) = &config.storage else {
        tracing::info!("No storage backend configured; evidence archival disabled");
        return Ok(None);
    };
    let store = store::build_store(storage).await?;

    let index: Arc<dyn ArchiveIndex> = match &config.database_url {
        Some(url) => {
            let pool = vigil_db::create_pool(url).await?;
            vigil_db::health_check(&pool).await?;
            vigil_db::run_migrations(&pool).await?;
            tracing::info!("Using durable archive index");
            Arc::new(PgArchiveIndex::new(pool).with_stale_after(config.stale_claim_after))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; archive index is in-memory only");
            Arc::new(MemoryArchiveIndex::new().with_stale_after(config.stale_claim_after))
        }
    };

    Ok(Some(EvidenceUploadSink::new(
        store,
        index,
        UploadPolicy::with_max_attempts(config.max_attempts),
    )))
}
