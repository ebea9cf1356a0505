//! Webhook delivery.
//!
//! [`WebhookSink`] POSTs the JSON-encoded record (or the raw passthrough
//! body for degraded events) to a configured URL. Any non-2xx status or
//! transport error is a [`DeliveryError`].

use std::time::Duration;

use async_trait::async_trait;
use vigil_core::record::CanonicalRecord;

use super::{DeliveryError, NotificationSink, SinkKind};

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers records to one external webhook endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Webhook
    }

    async fn deliver(&self, record: &CanonicalRecord) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&record.webhook_body())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }
        tracing::debug!(url = %self.url, "Webhook delivered");
        Ok(())
    }
}
