//! Upload-triggered archival.
//!
//! After an uploaded video has been analysed, the analysis names the
//! evidence files it produced (inside an artifacts directory) and,
//! optionally, a plates CSV. Each named artifact is archived through the
//! same [`EvidenceUploadSink`] the event path uses, so an artifact reached
//! both ways is stored once.

use std::path::Path;

use vigil_core::correlation::CorrelationEngine;
use vigil_core::violation::{ViolationEvent, UNKNOWN};

use crate::sink::{ArchiveOutcome, EvidenceUploadSink, UploadError};

/// Vehicle type assumed when the analysis reports none.
///
/// The analysis backend always fills in `"unknown"` before falling back to
/// `"HMV"`, so its archive metadata reads `unknown`. Here `None` really
/// means no type was reported, and upload-path artifacts are tagged `HMV`.
pub const DEFAULT_VEHICLE_TYPE: &str = "HMV";

/// Per-file result of [`archive_batch`].
#[derive(Debug)]
pub struct BatchItem {
    pub file: String,
    pub outcome: Result<ArchiveOutcome, UploadError>,
}

/// Archive each of `evidence_files` found under `artifacts_dir`.
///
/// Only the basename of each entry (and of `plates_csv`) is used, so
/// names from the analysis cannot escape the artifacts directory. Files
/// that are not there come back as [`ArchiveOutcome::Skipped`].
pub async fn archive_batch(
    sink: &EvidenceUploadSink,
    engine: &CorrelationEngine,
    artifacts_dir: &Path,
    evidence_files: &[String],
    plates_csv: Option<&str>,
    vehicle_type: Option<&str>,
) -> Vec<BatchItem> {
    let sidecar = plates_csv
        .and_then(|name| Path::new(name).file_name())
        .map(|name| artifacts_dir.join(name));
    let vehicle_type = vehicle_type
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_VEHICLE_TYPE);

    let mut items = Vec::with_capacity(evidence_files.len());
    for file in evidence_files {
        let Some(name) = Path::new(file).file_name() else {
            tracing::debug!(file = %file, "Evidence entry has no file name, skipped");
            items.push(BatchItem {
                file: file.clone(),
                outcome: Ok(ArchiveOutcome::Skipped),
            });
            continue;
        };
        let local_path = artifacts_dir.join(name);

        let event = ViolationEvent {
            jurisdiction: UNKNOWN.to_string(),
            track_id: 0,
            vehicle_type: vehicle_type.to_string(),
            plate: None,
            evidence_path: Some(local_path.display().to_string()),
            raw: None,
        };
        let engine = engine.clone();
        let sidecar = sidecar.clone();
        let record = match tokio::task::spawn_blocking(move || {
            engine.correlate(event, sidecar.as_deref())
        })
        .await
        {
            Ok(record) => record,
            Err(e) => {
                items.push(BatchItem {
                    file: file.clone(),
                    outcome: Err(UploadError::Transient(format!("Correlation task failed: {e}"))),
                });
                continue;
            }
        };

        let outcome = sink.archive(&record, Some(&local_path)).await;
        if let Err(e) = &outcome {
            tracing::warn!(file = %file, error = %e, "Failed to archive uploaded evidence");
        }
        items.push(BatchItem {
            file: file.clone(),
            outcome,
        });
    }
    items
}
