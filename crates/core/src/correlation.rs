//! Correlation of a raw violation event into a [`CanonicalRecord`].
//!
//! Correlation fills what the detector event leaves out:
//!
//! - the plate, from the event itself or else from a plate-extraction
//!   sidecar (CSV with one header row, rows `vehicle_id, vehicle_type,
//!   plate`);
//! - the camera identity, always from deployment configuration.
//!
//! The sidecar rule takes the *first* data row and does not match rows by
//! `track_id`. A sidecar listing several vehicles can therefore attach
//! the wrong plate; this mirrors the detector's current output contract.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::record::{CameraIdentity, CanonicalRecord};
use crate::violation::ViolationEvent;

/// Extension of the plate sidecar written next to an evidence artifact.
pub const SIDECAR_EXTENSION: &str = "csv";

/// Minimum row width for the `vehicle_id, vehicle_type, plate` layout.
const PLATE_COLUMN_ROW_WIDTH: usize = 3;

/// Index of the plate column in a full-width sidecar row.
const PLATE_COLUMN: usize = 2;

// ---------------------------------------------------------------------------
// Sidecar
// ---------------------------------------------------------------------------

/// Read the plate from the first data row of a sidecar file.
///
/// Returns `None` when the file is missing, unreadable, or has no data
/// rows. Rows with at least three fields yield the third; shorter rows
/// yield the first.
pub fn read_sidecar_plate(path: &Path) -> Option<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .ok()?;

    for row in reader.records() {
        let row = row.ok()?;
        if row.len() >= PLATE_COLUMN_ROW_WIDTH {
            return Some(row[PLATE_COLUMN].to_string());
        } else if !row.is_empty() {
            return Some(row[0].to_string());
        }
    }
    None
}

/// Conventional sidecar location for an evidence artifact: same path with
/// a `.csv` extension.
pub fn sidecar_for_evidence(evidence_path: &Path) -> PathBuf {
    evidence_path.with_extension(SIDECAR_EXTENSION)
}

/// Pick the sidecar to consult for an event.
///
/// Prefers the sidecar next to the event's evidence artifact when it
/// exists, then the configured fallback path.
pub fn locate_sidecar(event: &ViolationEvent, fallback: Option<&Path>) -> Option<PathBuf> {
    if let Some(evidence) = event.evidence_path() {
        let adjacent = sidecar_for_evidence(Path::new(evidence));
        if adjacent.is_file() {
            return Some(adjacent);
        }
    }
    fallback.map(Path::to_path_buf)
}

// ---------------------------------------------------------------------------
// CorrelationEngine
// ---------------------------------------------------------------------------

/// Builds canonical records for one deployment's camera.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    identity: CameraIdentity,
}

impl CorrelationEngine {
    pub fn new(identity: CameraIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &CameraIdentity {
        &self.identity
    }

    /// Resolve `event` into a record, consulting `sidecar` only when the
    /// event has no plate.
    ///
    /// Performs blocking file I/O when a sidecar is read.
    pub fn correlate(&self, event: ViolationEvent, sidecar: Option<&Path>) -> CanonicalRecord {
        let plate = match event.plate() {
            Some(plate) => plate.to_string(),
            None => sidecar.and_then(read_sidecar_plate).unwrap_or_default(),
        };

        let evidence_local_path = event.evidence_path().map(str::to_string);

        CanonicalRecord::new(
            event.jurisdiction,
            event.track_id,
            plate,
            event.vehicle_type,
            self.identity.clone(),
            evidence_local_path,
            Utc::now(),
            event.raw,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn event(plate: Option<&str>) -> ViolationEvent {
        ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 123,
            vehicle_type: "HMV".into(),
            plate: plate.map(str::to_string),
            evidence_path: None,
            raw: None,
        }
    }

    fn sidecar(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn identity() -> CameraIdentity {
        CameraIdentity {
            camera_id: "cam-7".into(),
            camera_name: "FC Road".into(),
            camera_lat: 18.52,
            camera_lon: 73.84,
        }
    }

    #[test]
    fn event_plate_wins_over_sidecar() {
        let file = sidecar("Vehicle_ID,Vehicle_Type,Plate_Number\nV1,HMV,MH14XY9999\n");
        let record =
            CorrelationEngine::new(identity()).correlate(event(Some("MH12AB1234")), Some(file.path()));
        assert_eq!(record.plate(), "MH12AB1234");
    }

    #[test]
    fn plate_resolves_from_third_sidecar_column() {
        let file = sidecar("Vehicle_ID,Vehicle_Type,Plate_Number\nV1,HMV,MH14XY9999\n");
        let record = CorrelationEngine::new(identity()).correlate(event(None), Some(file.path()));
        assert_eq!(record.plate(), "MH14XY9999");
        assert_eq!(record.camera(), &identity());
    }

    #[test]
    fn short_row_falls_back_to_first_field() {
        let file = sidecar("plate\nKA01AA0001\n");
        assert_eq!(read_sidecar_plate(file.path()).as_deref(), Some("KA01AA0001"));
    }

    #[test]
    fn only_first_data_row_is_used() {
        let file = sidecar("id,type,plate\nV1,HMV,FIRST\nV2,LMV,SECOND\n");
        assert_eq!(read_sidecar_plate(file.path()).as_deref(), Some("FIRST"));
    }

    #[test]
    fn header_only_sidecar_resolves_empty_plate() {
        let file = sidecar("Vehicle_ID,Vehicle_Type,Plate_Number\n");
        let record = CorrelationEngine::new(identity()).correlate(event(None), Some(file.path()));
        assert_eq!(record.plate(), "");
    }

    #[test]
    fn missing_sidecar_resolves_empty_plate() {
        let record = CorrelationEngine::new(identity())
            .correlate(event(None), Some(Path::new("/nonexistent/plates.csv")));
        assert_eq!(record.plate(), "");
        let record = CorrelationEngine::new(identity()).correlate(event(None), None);
        assert_eq!(record.plate(), "");
    }

    #[test]
    fn created_at_is_stamped_at_correlation_time() {
        let before = Utc::now();
        let record = CorrelationEngine::new(identity()).correlate(event(None), None);
        assert!(record.created_at() >= before);
    }

    #[test]
    fn degraded_event_keeps_raw_text() {
        let raw = ViolationEvent::degraded("violation:pune", "{broken");
        let record = CorrelationEngine::new(identity()).correlate(raw, None);
        assert_eq!(record.raw(), Some("{broken"));
        assert_eq!(record.jurisdiction(), "pune");
    }

    #[test]
    fn adjacent_sidecar_is_preferred_over_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = dir.path().join("clip_0001.mp4");
        std::fs::write(&evidence, b"video").unwrap();
        std::fs::write(dir.path().join("clip_0001.csv"), "a,b,c\nV1,HMV,ADJ1\n").unwrap();

        let mut ev = event(None);
        ev.evidence_path = Some(evidence.display().to_string());
        let fallback = dir.path().join("fallback.csv");

        let located = locate_sidecar(&ev, Some(&fallback)).unwrap();
        assert_eq!(located, dir.path().join("clip_0001.csv"));

        ev.evidence_path = None;
        assert_eq!(locate_sidecar(&ev, Some(&fallback)), Some(fallback));
        assert_eq!(locate_sidecar(&ev, None), None);
    }
}
