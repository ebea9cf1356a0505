//! The violation relay: bus subscription, correlation, notification and
//! evidence archival wired into one long-running pipeline.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vigil_archive::{build_upload_sink, SetupError};
use vigil_core::config::RelayConfig;
use vigil_core::correlation::CorrelationEngine;
use vigil_core::violation::ViolationEvent;
use vigil_events::{
    DeliveryError, EventConsumer, NotificationDispatcher, ReconnectConfig, RedisEventPublisher,
    RedisEventSource, TransportError,
};

pub mod pipeline;

pub use pipeline::{EventReport, Pipeline, PipelineError, RunSummary, Stage};

/// Failures that stop the relay before it starts consuming.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Event bus unavailable: {0}")]
    Bus(#[from] TransportError),

    #[error("Cannot build notification sinks: {0}")]
    Notify(#[from] DeliveryError),

    #[error("Cannot set up evidence archival: {0}")]
    Archive(#[from] SetupError),
}

/// Build every component from `config` and run until `cancel` fires.
pub async fn run(config: RelayConfig, cancel: CancellationToken) -> Result<RunSummary, StartupError> {
    let source = Arc::new(RedisEventSource::open(&config.bus.redis_url)?);
    let dispatcher = Arc::new(NotificationDispatcher::from_config(&config.notify)?);
    let uploader = build_upload_sink(&config.archive).await?.map(Arc::new);

    tracing::info!(
        camera_id = %config.identity.camera_id,
        sinks = ?dispatcher.sink_kinds(),
        archival = uploader.is_some(),
        "Relay configured",
    );

    let pipeline = Arc::new(
        Pipeline::new(CorrelationEngine::new(config.identity), dispatcher, uploader)
            .with_sidecar_fallback(config.sidecar_fallback)
            .with_concurrency(config.worker.concurrency)
            .with_shutdown_grace(config.worker.shutdown_grace),
    );

    let consumer = EventConsumer::new(source, ReconnectConfig::default());
    let subscription = consumer.subscribe(&config.bus.pattern, cancel.clone()).await?;

    Ok(pipeline.run(subscription, cancel).await)
}

/// The event `publish-sample` sends: a plated HMV in Pune, no evidence.
pub fn sample_event() -> ViolationEvent {
    ViolationEvent {
        jurisdiction: "pune".into(),
        track_id: 123,
        vehicle_type: "HMV".into(),
        plate: Some("MH12AB1234".into()),
        evidence_path: None,
        raw: None,
    }
}

/// Publish [`sample_event`] to the configured bus for smoke-testing a
/// running relay. Returns the number of subscribers that received it.
pub async fn publish_sample(config: &RelayConfig) -> Result<usize, TransportError> {
    let publisher = RedisEventPublisher::connect(&config.bus.redis_url).await?;
    publisher.publish(&sample_event()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_event_targets_pune_channel() {
        let (channel, payload) = RedisEventPublisher::encode(&sample_event()).unwrap();
        assert_eq!(channel, "violation:pune");

        let decoded = vigil_core::violation::decode_payload(&channel, &payload);
        assert!(!decoded.is_degraded());
        assert_eq!(decoded.plate(), Some("MH12AB1234"));
        assert_eq!(decoded.evidence_path(), None);
    }
}
