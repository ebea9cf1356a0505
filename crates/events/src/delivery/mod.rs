//! External notification sinks.
//!
//! Each sink delivers one [`CanonicalRecord`] to one destination and
//! reports failure as a [`DeliveryError`] value; retries and fan-out live
//! in the [`dispatcher`](crate::dispatcher).

use std::fmt;

use async_trait::async_trait;
use vigil_core::record::CanonicalRecord;

pub mod push;
pub mod webhook;

/// Which kind of destination a sink talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Webhook,
    Push,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Webhook => "webhook",
            Self::Push => "push",
        })
    }
}

/// Error type for notification delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server answered with a non-success status code.
    #[error("Sink returned HTTP {0}")]
    HttpStatus(u16),

    /// The sink refused the notification for another reason.
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether repeating the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder(),
            Self::HttpStatus(status) => *status >= 500 || *status == 429,
            Self::Rejected(_) => false,
        }
    }
}

/// A notification destination.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Deliver one record. A single attempt; no retry.
    async fn deliver(&self, record: &CanonicalRecord) -> Result<(), DeliveryError>;
}
