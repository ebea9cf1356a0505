//! Per-event processing and the bounded worker pool.
//!
//! Every message from the subscription becomes one task. A task
//! correlates the event, then runs notification fan-out and evidence
//! archival concurrently, each under its own timeout. Events are not
//! ordered relative to each other.
//!
//! A message is only taken off the subscription once one of the
//! `concurrency` worker slots is free, so at most that many events are
//! held in memory and the backlog stays on the bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vigil_archive::{ArchiveOutcome, EvidenceUploadSink, UploadError};
use vigil_core::correlation::{locate_sidecar, CorrelationEngine};
use vigil_core::record::CanonicalRecord;
use vigil_core::violation::ViolationEvent;
use vigil_events::{DeliveryResult, NotificationDispatcher, Subscription};

/// Default bound on notification fan-out per event.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on archival per event, retries included.
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one concurrent stage of event processing.
#[derive(Debug)]
pub enum Stage<T> {
    Done(T),
    TimedOut,
    /// The stage is not configured.
    Disabled,
}

impl<T> Stage<T> {
    pub fn done(&self) -> Option<&T> {
        match self {
            Self::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// Everything that happened to one event.
#[derive(Debug)]
pub struct EventReport {
    pub record: CanonicalRecord,
    pub deliveries: Stage<Vec<DeliveryResult>>,
    pub archive: Stage<Result<ArchiveOutcome, UploadError>>,
}

/// Totals for one [`Pipeline::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    /// Tasks that panicked.
    pub crashed: u64,
    /// Tasks still running when the shutdown grace period ran out.
    pub abandoned: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Correlation task failed: {0}")]
    Correlation(#[from] tokio::task::JoinError),
}

pub struct Pipeline {
    engine: CorrelationEngine,
    sidecar_fallback: Option<PathBuf>,
    dispatcher: Arc<NotificationDispatcher>,
    uploader: Option<Arc<EvidenceUploadSink>>,
    concurrency: usize,
    shutdown_grace: Duration,
    notify_timeout: Duration,
    archive_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        engine: CorrelationEngine,
        dispatcher: Arc<NotificationDispatcher>,
        uploader: Option<Arc<EvidenceUploadSink>>,
    ) -> Self {
        Self {
            engine,
            sidecar_fallback: None,
            dispatcher,
            uploader,
            concurrency: 16,
            shutdown_grace: Duration::from_secs(10),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            archive_timeout: DEFAULT_ARCHIVE_TIMEOUT,
        }
    }

    pub fn with_sidecar_fallback(mut self, path: Option<PathBuf>) -> Self {
        self.sidecar_fallback = path;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_timeouts(mut self, notify: Duration, archive: Duration) -> Self {
        self.notify_timeout = notify;
        self.archive_timeout = archive;
        self
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Correlate one event and hand the record to both sinks.
    pub async fn process_event(&self, event: ViolationEvent) -> Result<EventReport, PipelineError> {
        let engine = self.engine.clone();
        let fallback = self.sidecar_fallback.clone();
        let record = tokio::task::spawn_blocking(move || {
            let sidecar = locate_sidecar(&event, fallback.as_deref());
            engine.correlate(event, sidecar.as_deref())
        })
        .await?;

        let notify = async {
            match tokio::time::timeout(self.notify_timeout, self.dispatcher.dispatch(&record)).await
            {
                Ok(results) => Stage::Done(results),
                Err(_) => Stage::TimedOut,
            }
        };
        let archive = async {
            let Some(uploader) = &self.uploader else {
                return Stage::Disabled;
            };
            let evidence = record.evidence_local_path().map(PathBuf::from);
            match tokio::time::timeout(
                self.archive_timeout,
                uploader.archive(&record, evidence.as_deref()),
            )
            .await
            {
                Ok(outcome) => Stage::Done(outcome),
                Err(_) => Stage::TimedOut,
            }
        };
        let (deliveries, archive) = tokio::join!(notify, archive);

        let report = EventReport {
            record,
            deliveries,
            archive,
        };
        log_report(&report);
        Ok(report)
    }

    /// Drain `subscription` until `cancel` fires, then shut down.
    ///
    /// At most `concurrency` events are in flight; intake waits for a free
    /// slot before receiving. Intake stops as soon as cancellation is
    /// observed. In-flight tasks get the shutdown grace period to finish
    /// and are aborted after it.
    pub async fn run(
        self: Arc<Self>,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) -> RunSummary {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut summary = RunSummary::default();

        tracing::info!(concurrency = self.concurrency, "Relay pipeline running");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                reap(&mut summary, joined);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Only cancellation interrupts a pending receive, so the
            // subscription's reconnect backoff runs undisturbed.
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = subscription.next() => message,
            };
            let Some(message) = message else { break };

            let pipeline = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = pipeline.process_event(message.event).await {
                    tracing::error!(channel = %message.channel, error = %e, "Event processing failed");
                }
            });
        }

        drop(subscription);
        tracing::info!(in_flight = tasks.len(), "Intake stopped, draining in-flight events");

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                reap(&mut summary, joined);
            }
        })
        .await;

        if drained.is_err() {
            summary.abandoned = tasks.len();
            tracing::error!(
                abandoned = summary.abandoned,
                grace_secs = self.shutdown_grace.as_secs_f64(),
                "Shutdown grace period elapsed, aborting in-flight events",
            );
            tasks.shutdown().await;
        }

        let stats = self.dispatcher.stats();
        tracing::info!(
            processed = summary.processed,
            crashed = summary.crashed,
            abandoned = summary.abandoned,
            delivered = stats.delivered,
            delivery_failed = stats.failed,
            delivery_retried = stats.retried,
            "Relay pipeline stopped",
        );
        summary
    }
}

fn reap(summary: &mut RunSummary, joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => summary.processed += 1,
        Err(e) if e.is_panic() => {
            summary.crashed += 1;
            tracing::error!(error = %e, "Event task panicked");
        }
        Err(_) => {}
    }
}

fn log_report(report: &EventReport) {
    let record = &report.record;
    let delivered = report
        .deliveries
        .done()
        .map_or(0, |results| results.iter().filter(|r| r.is_delivered()).count());

    match &report.deliveries {
        Stage::TimedOut => tracing::warn!(
            jurisdiction = record.jurisdiction(),
            track_id = record.track_id(),
            "Notification fan-out timed out",
        ),
        Stage::Done(_) | Stage::Disabled => {}
    }
    if let Stage::TimedOut = report.archive {
        tracing::error!(
            jurisdiction = record.jurisdiction(),
            track_id = record.track_id(),
            "Evidence archival timed out",
        );
    }

    let reference = match &report.archive {
        Stage::Done(Ok(outcome)) => outcome.reference().map(ToString::to_string),
        _ => None,
    };
    tracing::info!(
        jurisdiction = record.jurisdiction(),
        track_id = record.track_id(),
        plate = record.plate(),
        degraded = record.is_degraded(),
        delivered,
        storage_ref = reference.as_deref().unwrap_or("-"),
        "Violation processed",
    );
}
