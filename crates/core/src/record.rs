//! The canonical, fully-resolved view of a violation.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Static camera identity of this deployment.
///
/// Events never carry camera identity; it always comes from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIdentity {
    pub camera_id: String,
    pub camera_name: String,
    pub camera_lat: f64,
    pub camera_lon: f64,
}

impl Default for CameraIdentity {
    fn default() -> Self {
        Self {
            camera_id: "unknown_cam".to_string(),
            camera_name: "unknown".to_string(),
            camera_lat: 0.0,
            camera_lon: 0.0,
        }
    }
}

/// Resolved violation record shared by the notification and archival sinks.
///
/// Fields are private so a record cannot be changed once
/// [`CorrelationEngine`](crate::correlation::CorrelationEngine) has built it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    jurisdiction: String,
    track_id: i64,
    /// Empty string when no plate could be resolved.
    plate: String,
    vehicle_type: String,
    #[serde(flatten)]
    camera: CameraIdentity,
    evidence_local_path: Option<String>,
    created_at: Timestamp,
    #[serde(skip)]
    raw: Option<String>,
}

impl CanonicalRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        jurisdiction: String,
        track_id: i64,
        plate: String,
        vehicle_type: String,
        camera: CameraIdentity,
        evidence_local_path: Option<String>,
        created_at: Timestamp,
        raw: Option<String>,
    ) -> Self {
        Self {
            jurisdiction,
            track_id,
            plate,
            vehicle_type,
            camera,
            evidence_local_path,
            created_at,
            raw,
        }
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    pub fn track_id(&self) -> i64 {
        self.track_id
    }

    /// Resolved plate; empty when unresolved.
    pub fn plate(&self) -> &str {
        &self.plate
    }

    pub fn vehicle_type(&self) -> &str {
        &self.vehicle_type
    }

    pub fn camera(&self) -> &CameraIdentity {
        &self.camera
    }

    pub fn evidence_local_path(&self) -> Option<&str> {
        self.evidence_local_path.as_deref()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Undecoded payload text when the source event was degraded.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn is_degraded(&self) -> bool {
        self.raw.is_some()
    }

    /// JSON body forwarded to webhook sinks.
    ///
    /// Degraded records forward the raw passthrough `{"raw": ...}` instead
    /// of the structured record.
    pub fn webhook_body(&self) -> serde_json::Value {
        match &self.raw {
            Some(raw) => serde_json::json!({ "raw": raw }),
            None => serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(raw: Option<String>) -> CanonicalRecord {
        CanonicalRecord::new(
            "pune".into(),
            7,
            "MH12AB1234".into(),
            "HMV".into(),
            CameraIdentity::default(),
            None,
            Utc::now(),
            raw,
        )
    }

    #[test]
    fn webhook_body_flattens_camera_identity() {
        let body = record(None).webhook_body();
        assert_eq!(body["plate"], "MH12AB1234");
        assert_eq!(body["camera_id"], "unknown_cam");
        assert_eq!(body["camera_lat"], 0.0);
        assert!(body["evidence_local_path"].is_null());
        assert!(body.get("raw").is_none());
    }

    #[test]
    fn degraded_record_forwards_raw_passthrough() {
        let body = record(Some("garbage".into())).webhook_body();
        assert_eq!(body, serde_json::json!({ "raw": "garbage" }));
    }
}
