//! Push-topic delivery through the FCM legacy HTTP API.
//!
//! Builds a human-readable notification for a record:
//!
//! - title: `Violation in {jurisdiction}`
//! - body: `{vehicle_type} - {plate or N/A}`, plus an evidence link when
//!   the record has a local artifact.
//!
//! The link carries only the artifact's file name because the backend
//! serves artifacts by name (`GET /artifact?file=<basename>`).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Serialize;
use vigil_core::record::CanonicalRecord;

use super::{DeliveryError, NotificationSink, SinkKind};

/// Fixed FCM send endpoint.
pub const FCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Placeholder shown when no plate was resolved.
const NO_PLATE: &str = "N/A";

// ---------------------------------------------------------------------------
// Message formatting
// ---------------------------------------------------------------------------

/// Notification title for a record.
pub fn push_title(record: &CanonicalRecord) -> String {
    format!("Violation in {}", record.jurisdiction())
}

/// Notification body for a record, with an evidence link when available.
pub fn push_body(record: &CanonicalRecord, public_base_url: &str) -> String {
    let plate = match record.plate() {
        "" => NO_PLATE,
        plate => plate,
    };
    let mut body = format!("{} - {}", record.vehicle_type(), plate);

    if let Some(link) = record
        .evidence_local_path()
        .and_then(|path| evidence_link(public_base_url, path))
    {
        body.push_str("\nView evidence: ");
        body.push_str(&link);
    }
    body
}

/// Public link to an artifact, built from its basename only.
pub fn evidence_link(public_base_url: &str, local_path: &str) -> Option<String> {
    let basename = Path::new(local_path).file_name()?.to_str()?;
    Some(format!(
        "{}/artifact?file={basename}",
        public_base_url.trim_end_matches('/')
    ))
}

#[derive(Debug, Serialize)]
struct PushMessage<'a> {
    to: String,
    notification: PushNotification<'a>,
}

#[derive(Debug, Serialize)]
struct PushNotification<'a> {
    title: &'a str,
    body: &'a str,
}

// ---------------------------------------------------------------------------
// PushSink
// ---------------------------------------------------------------------------

/// Sends topic notifications to the push provider.
pub struct PushSink {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
    topic: String,
    public_base_url: String,
}

impl PushSink {
    pub fn new(
        server_key: impl Into<String>,
        topic: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: FCM_SEND_URL.to_string(),
            server_key: server_key.into(),
            topic: topic.into(),
            public_base_url: public_base_url.into(),
        })
    }

    /// Send to a different provider endpoint (e.g. a local stub).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl NotificationSink for PushSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Push
    }

    async fn deliver(&self, record: &CanonicalRecord) -> Result<(), DeliveryError> {
        let title = push_title(record);
        let body = push_body(record, &self.public_base_url);
        let message = PushMessage {
            to: format!("/topics/{}", self.topic),
            notification: PushNotification {
                title: &title,
                body: &body,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("key={}", self.server_key))
            .json(&message)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }
        tracing::debug!(topic = %self.topic, "Push notification sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::correlation::CorrelationEngine;
    use vigil_core::record::CameraIdentity;
    use vigil_core::violation::ViolationEvent;

    fn record(plate: Option<&str>, evidence: Option<&str>) -> CanonicalRecord {
        let event = ViolationEvent {
            jurisdiction: "pune".into(),
            track_id: 123,
            vehicle_type: "HMV".into(),
            plate: plate.map(str::to_string),
            evidence_path: evidence.map(str::to_string),
            raw: None,
        };
        CorrelationEngine::new(CameraIdentity::default()).correlate(event, None)
    }

    #[test]
    fn golden_path_body_has_no_link() {
        let r = record(Some("MH12AB1234"), None);
        assert_eq!(push_title(&r), "Violation in pune");
        assert_eq!(push_body(&r, "http://localhost:8000"), "HMV - MH12AB1234");
    }

    #[test]
    fn missing_plate_renders_placeholder() {
        let r = record(None, None);
        assert_eq!(push_body(&r, "http://localhost:8000"), "HMV - N/A");
    }

    #[test]
    fn evidence_link_uses_basename_only() {
        let r = record(Some("MH12AB1234"), Some("/srv/ai/outputs/run42/clip_0007.mp4"));
        assert_eq!(
            push_body(&r, "https://relay.example.org/"),
            "HMV - MH12AB1234\nView evidence: https://relay.example.org/artifact?file=clip_0007.mp4"
        );
    }

    #[test]
    fn evidence_link_requires_a_file_name() {
        assert_eq!(evidence_link("http://h", "/"), None);
        assert_eq!(
            evidence_link("http://h", "frame.jpg").as_deref(),
            Some("http://h/artifact?file=frame.jpg")
        );
    }

    #[test]
    fn push_message_matches_provider_schema() {
        let message = PushMessage {
            to: "/topics/authorities".into(),
            notification: PushNotification {
                title: "t",
                body: "b",
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"to": "/topics/authorities", "notification": {"title": "t", "body": "b"}})
        );
    }
}
