//! Exponential-backoff re-subscription for bus connections.
//!
//! When a subscription drops, the consumer calls [`resubscribe_loop`]
//! to keep retrying with increasing delays until either the subscription
//! is restored or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::source::{EventSource, FrameStream};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Failed attempts after which each further failure is logged at
    /// `error` instead of `warn`.
    pub report_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            report_after: 5,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Re-subscribe to `pattern` with exponential backoff.
///
/// Returns `Some(frames)` once a subscription succeeds, or `None` if
/// `cancel` is triggered first. Never gives up on its own.
pub async fn resubscribe_loop(
    source: &dyn EventSource,
    pattern: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<FrameStream> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(pattern, attempt, "Re-subscribing to bus");

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(pattern, "Re-subscribe cancelled");
                return None;
            }
            result = source.subscribe(pattern) => {
                match result {
                    Ok(frames) => {
                        tracing::info!(pattern, attempt, "Re-subscribed to bus");
                        return Some(frames);
                    }
                    Err(e) if attempt >= config.report_after => {
                        tracing::error!(
                            pattern,
                            attempt,
                            error = %e,
                            "Bus still unreachable, retrying in {}ms",
                            delay.as_millis(),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(pattern, attempt, error = %e, "Re-subscribe attempt failed");
                    }
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
