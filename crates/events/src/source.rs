//! Bus transport abstraction.
//!
//! An [`EventSource`] turns a pattern subscription into a stream of raw
//! [`BusFrame`]s. The stream ending, or yielding an error, means the
//! transport connection was lost; the consumer then re-subscribes.
//!
//! [`MemoryBus`] is an in-process source used by tests and local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Bus transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Redis connection or protocol failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An outbound event could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport refused or dropped the subscription.
    #[error("Bus disconnected: {0}")]
    Disconnected(String),
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One frame received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusFrame {
    /// A published message.
    Message { channel: String, payload: Vec<u8> },
    /// Administrative traffic (subscription acknowledgements etc.).
    Control { kind: String },
}

/// Stream of frames for one live subscription.
pub type FrameStream = BoxStream<'static, Result<BusFrame, TransportError>>;

/// A publish/subscribe transport.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new connection and subscribe to `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<FrameStream, TransportError>;
}

/// Glob match supporting a single trailing `*`, as used by
/// `violation:*`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Result<BusFrame, TransportError>>,
}

#[derive(Default)]
struct MemoryBusState {
    subscribers: Vec<Subscriber>,
    failing_subscribes: u32,
    subscribe_calls: u32,
}

/// In-process pub/sub bus.
///
/// Every successful subscription first receives a `psubscribe` control
/// frame, mirroring Redis. Connection loss and refused subscriptions can
/// be simulated with [`disconnect_all`](Self::disconnect_all) and
/// [`fail_next_subscribes`](Self::fail_next_subscribes).
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to every live subscription whose pattern matches `channel`.
    ///
    /// Returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|s| pattern_matches(&s.pattern, channel))
            .filter(|s| {
                s.tx.send(Ok(BusFrame::Message {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                }))
                .is_ok()
            })
            .count()
    }

    /// Send an administrative frame to every subscription.
    pub fn send_control(&self, kind: &str) {
        for s in &self.lock().subscribers {
            let _ = s.tx.send(Ok(BusFrame::Control {
                kind: kind.to_string(),
            }));
        }
    }

    /// Drop every live subscription, ending their frame streams.
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.lock().failing_subscribes = n;
    }

    /// Total number of subscribe attempts, failed ones included.
    pub fn subscribe_calls(&self) -> u32 {
        self.lock().subscribe_calls
    }

    /// Number of subscriptions currently attached.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSource for MemoryBus {
    async fn subscribe(&self, pattern: &str) -> Result<FrameStream, TransportError> {
        let mut state = self.lock();
        state.subscribe_calls += 1;
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(TransportError::Disconnected("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(BusFrame::Control {
            kind: "psubscribe".into(),
        }));
        state.subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });

        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(frames.boxed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_matches_prefix() {
        assert!(pattern_matches("violation:*", "violation:pune"));
        assert!(!pattern_matches("violation:*", "alerts:pune"));
        assert!(pattern_matches("violation:pune", "violation:pune"));
        assert!(!pattern_matches("violation:pune", "violation:mumbai"));
    }

    #[tokio::test]
    async fn subscription_receives_ack_then_messages() {
        let bus = MemoryBus::new();
        let mut frames = bus.subscribe("violation:*").await.unwrap();

        assert_eq!(bus.publish("violation:pune", b"{}".to_vec()), 1);
        assert_eq!(bus.publish("other:pune", b"{}".to_vec()), 0);

        let ack = frames.next().await.unwrap().unwrap();
        assert!(matches!(ack, BusFrame::Control { .. }));
        let msg = frames.next().await.unwrap().unwrap();
        assert_eq!(
            msg,
            BusFrame::Message {
                channel: "violation:pune".into(),
                payload: b"{}".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_ends_stream() {
        let bus = MemoryBus::new();
        let mut frames = bus.subscribe("violation:*").await.unwrap();
        let _ack = frames.next().await;
        bus.disconnect_all();
        assert!(frames.next().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failing_subscribes_are_counted() {
        let bus = MemoryBus::new();
        bus.fail_next_subscribes(1);
        assert!(bus.subscribe("violation:*").await.is_err());
        assert!(bus.subscribe("violation:*").await.is_ok());
        assert_eq!(bus.subscribe_calls(), 2);
    }
}
