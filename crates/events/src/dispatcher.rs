//! Notification fan-out.
//!
//! [`NotificationDispatcher`] delivers one record to every configured sink
//! concurrently. A failing sink never blocks or cancels its siblings: each
//! outcome is reported independently as a [`DeliveryResult`].
//!
//! Retries are opt-in (`max_retries`, default 0) and apply only to
//! failures [`DeliveryError::is_retryable`] accepts. Backoff doubles from
//! `retry_base_delay` between attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use vigil_core::config::NotifyConfig;
use vigil_core::record::CanonicalRecord;

use crate::delivery::push::PushSink;
use crate::delivery::webhook::WebhookSink;
use crate::delivery::{DeliveryError, NotificationSink, SinkKind};

/// Default delay before the first retry.
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// A configured notification destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTarget {
    Webhook { url: String },
    PushTopic { server_key: String, topic: String },
}

impl NotificationTarget {
    /// Targets enabled by `config`. Unconfigured destinations are absent.
    pub fn from_config(config: &NotifyConfig) -> Vec<Self> {
        let mut targets = Vec::new();
        if let Some(url) = &config.webhook_url {
            targets.push(Self::Webhook { url: url.clone() });
        }
        if let Some(push) = &config.push {
            targets.push(Self::PushTopic {
                server_key: push.server_key.clone(),
                topic: push.topic.clone(),
            });
        }
        targets
    }

    fn build_sink(&self, public_base_url: &str) -> Result<Arc<dyn NotificationSink>, DeliveryError> {
        let sink: Arc<dyn NotificationSink> = match self {
            Self::Webhook { url } => Arc::new(WebhookSink::new(url.clone())?),
            Self::PushTopic { server_key, topic } => Arc::new(PushSink::new(
                server_key.clone(),
                topic.clone(),
                public_base_url,
            )?),
        };
        Ok(sink)
    }
}

/// Outcome of delivering one record to one sink.
#[derive(Debug)]
pub struct DeliveryResult {
    pub sink: SinkKind,
    pub outcome: Result<(), DeliveryError>,
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Running delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Fans a record out to all configured sinks.
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    max_retries: u32,
    retry_base_delay: Duration,
    stats: DeliveryStats,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, max_retries: u32) -> Self {
        Self {
            sinks,
            max_retries,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            stats: DeliveryStats::default(),
        }
    }

    /// Build HTTP sinks for every target enabled in `config`.
    pub fn from_config(config: &NotifyConfig) -> Result<Self, DeliveryError> {
        let sinks = NotificationTarget::from_config(config)
            .iter()
            .map(|target| target.build_sink(&config.public_base_url))
            .collect::<Result<Vec<_>, _>>()?;

        if sinks.is_empty() {
            tracing::warn!("No notification targets configured; notifications are disabled");
        }
        Ok(Self::new(sinks, config.max_retries))
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn sink_kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(|s| s.kind()).collect()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deliver `record` to every sink concurrently.
    ///
    /// Never fails as a whole; per-sink failures are logged and returned.
    pub async fn dispatch(&self, record: &CanonicalRecord) -> Vec<DeliveryResult> {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let outcome = self.deliver_with_retry(sink.as_ref(), record).await;
            match &outcome {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        sink = %sink.kind(),
                        jurisdiction = record.jurisdiction(),
                        track_id = record.track_id(),
                        error = %e,
                        "Notification delivery failed",
                    );
                }
            }
            DeliveryResult {
                sink: sink.kind(),
                outcome,
            }
        });
        join_all(deliveries).await
    }

    async fn deliver_with_retry(
        &self,
        sink: &dyn NotificationSink,
        record: &CanonicalRecord,
    ) -> Result<(), DeliveryError> {
        let mut delay = self.retry_base_delay;
        let mut attempt = 0;
        loop {
            match sink.deliver(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        sink = %sink.kind(),
                        attempt,
                        error = %e,
                        "Notification attempt failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
