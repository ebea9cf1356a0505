//! Violation events as published by the upstream detector.
//!
//! Events travel as JSON on per-jurisdiction channels
//! (`violation:<jurisdiction>`). Payloads are untrusted: anything that
//! fails to decode is kept as a *degraded* event carrying the raw text
//! instead of being dropped.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Channel prefix for violation events.
pub const CHANNEL_PREFIX: &str = "violation:";

/// Wildcard pattern matching every jurisdiction channel.
pub const DEFAULT_PATTERN: &str = "violation:*";

/// Placeholder used when a field cannot be recovered from the payload.
pub const UNKNOWN: &str = "unknown";

/// Build the channel name an event for `jurisdiction` is published on.
pub fn channel_for(jurisdiction: &str) -> String {
    format!("{CHANNEL_PREFIX}{jurisdiction}")
}

/// Extract the jurisdiction suffix from a `violation:<jurisdiction>` channel.
pub fn jurisdiction_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .filter(|suffix| !suffix.is_empty())
}

// ---------------------------------------------------------------------------
// ViolationEvent
// ---------------------------------------------------------------------------

/// A violation detection fact.
///
/// `raw` is only set on degraded events, i.e. when the payload could not
/// be decoded as the structured wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub jurisdiction: String,
    pub track_id: i64,
    #[serde(default = "unknown_vehicle_type")]
    pub vehicle_type: String,
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub evidence_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub raw: Option<String>,
}

fn unknown_vehicle_type() -> String {
    UNKNOWN.to_string()
}

impl ViolationEvent {
    /// Build a degraded event that preserves the undecodable payload text.
    ///
    /// The jurisdiction is recovered from the channel name when possible.
    pub fn degraded(channel: &str, raw: impl Into<String>) -> Self {
        Self {
            jurisdiction: jurisdiction_from_channel(channel)
                .unwrap_or(UNKNOWN)
                .to_string(),
            track_id: 0,
            vehicle_type: UNKNOWN.to_string(),
            plate: None,
            evidence_path: None,
            raw: Some(raw.into()),
        }
    }

    /// Whether this event came from a payload that failed to decode.
    pub fn is_degraded(&self) -> bool {
        self.raw.is_some()
    }

    /// Non-empty plate carried by the event, if any.
    pub fn plate(&self) -> Option<&str> {
        self.plate.as_deref().filter(|p| !p.is_empty())
    }

    /// Non-empty evidence path carried by the event, if any.
    pub fn evidence_path(&self) -> Option<&str> {
        self.evidence_path.as_deref().filter(|p| !p.is_empty())
    }

    /// Encode the event to the JSON wire schema.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a bus payload into an event.
///
/// Never fails: invalid UTF-8 or JSON that does not match the wire schema
/// produce a degraded event whose `raw` field holds the (lossily decoded)
/// payload text.
pub fn decode_payload(channel: &str, payload: &[u8]) -> ViolationEvent {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => return ViolationEvent::degraded(channel, String::from_utf8_lossy(payload)),
    };

    match serde_json::from_str::<ViolationEvent>(text) {
        Ok(mut event) => {
            event.raw = None;
            event
        }
        Err(_) => ViolationEvent::degraded(channel, text),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ViolationEvent {
        ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 123,
            vehicle_type: "HMV".into(),
            plate: Some("MH12AB1234".into()),
            evidence_path: None,
            raw: None,
        }
    }

    #[test]
    fn wire_round_trip_preserves_fields() {
        let event = ViolationEvent {
            evidence_path: Some("/data/out/clip_0001.mp4".into()),
            ..sample()
        };
        let bytes = event.to_wire().unwrap();
        let decoded = decode_payload("violation:pune", &bytes);
        assert_eq!(decoded, event);
        assert!(!decoded.is_degraded());
    }

    #[test]
    fn wire_schema_uses_null_for_absent_options() {
        let value: serde_json::Value = serde_json::from_slice(&sample().to_wire().unwrap()).unwrap();
        assert_eq!(value["jurisdiction"], "pune");
        assert_eq!(value["track_id"], 123);
        assert!(value["evidence_path"].is_null());
        assert!(value.get("raw").is_none());
    }

    #[test]
    fn invalid_json_degrades_with_raw_text() {
        let event = decode_payload("violation:mumbai", b"not json at all");
        assert!(event.is_degraded());
        assert_eq!(event.raw.as_deref(), Some("not json at all"));
        assert_eq!(event.jurisdiction, "mumbai");
        assert_eq!(event.vehicle_type, UNKNOWN);
    }

    #[test]
    fn invalid_utf8_degrades_lossily() {
        let event = decode_payload("violation:pune", &[0xff, 0xfe, b'a']);
        assert!(event.is_degraded());
        assert!(event.raw.as_deref().unwrap().ends_with('a'));
    }

    #[test]
    fn schema_mismatch_degrades() {
        let event = decode_payload("violation:pune", br#"{"jurisdiction": "pune"}"#);
        assert!(event.is_degraded());
    }

    #[test]
    fn raw_field_in_payload_is_ignored() {
        let event = decode_payload(
            "violation:pune",
            br#"{"jurisdiction":"pune","track_id":1,"vehicle_type":"LMV","raw":"x"}"#,
        );
        assert!(!event.is_degraded());
        assert_eq!(event.vehicle_type, "LMV");
    }

    #[test]
    fn degraded_on_foreign_channel_uses_unknown_jurisdiction() {
        let event = ViolationEvent::degraded("other", "x");
        assert_eq!(event.jurisdiction, UNKNOWN);
        assert_eq!(jurisdiction_from_channel("violation:"), None);
    }

    #[test]
    fn empty_plate_is_treated_as_absent() {
        let event = ViolationEvent {
            plate: Some(String::new()),
            ..sample()
        };
        assert_eq!(event.plate(), None);
        assert_eq!(channel_for("pune"), "violation:pune");
    }
}
