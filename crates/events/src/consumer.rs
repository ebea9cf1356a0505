//! Violation event consumer.
//!
//! [`EventConsumer::subscribe`] returns a [`Subscription`]: a lazy,
//! effectively infinite sequence of decoded [`InboundMessage`]s.
//!
//! - Control frames are filtered out and never reach the caller.
//! - Payloads that fail to decode become degraded events; the stream
//!   keeps going.
//! - Transport loss triggers re-subscription with backoff.
//! - Cancelling the token closes the subscription for good.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use vigil_core::violation::{decode_payload, ViolationEvent};

use crate::reconnect::{resubscribe_loop, ReconnectConfig};
use crate::source::{BusFrame, EventSource, FrameStream, TransportError};

/// A message received on a violation channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: Vec<u8>,
    /// Decoded event; degraded when the payload was malformed.
    pub event: ViolationEvent,
}

impl InboundMessage {
    fn decode(channel: String, payload: Vec<u8>) -> Self {
        let event = decode_payload(&channel, &payload);
        Self {
            channel,
            payload,
            event,
        }
    }
}

/// Subscribes to the bus on behalf of the pipeline.
pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    reconnect: ReconnectConfig,
}

impl EventConsumer {
    pub fn new(source: Arc<dyn EventSource>, reconnect: ReconnectConfig) -> Self {
        Self { source, reconnect }
    }

    /// Subscribe to `pattern`.
    ///
    /// The first subscription must succeed: failing to subscribe at all is
    /// a process-level error. Later disconnections are retried.
    pub async fn subscribe(
        &self,
        pattern: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription, TransportError> {
        let frames = self.source.subscribe(pattern).await?;
        tracing::info!(pattern, "Subscribed to violation events");

        Ok(Subscription {
            source: Arc::clone(&self.source),
            pattern: pattern.to_string(),
            reconnect: self.reconnect.clone(),
            cancel,
            frames: Some(frames),
            closed: false,
        })
    }
}

/// A live pattern subscription.
///
/// Once [`next`](Self::next) returns `None` the subscription is closed
/// and stays closed.
pub struct Subscription {
    source: Arc<dyn EventSource>,
    pattern: String,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    frames: Option<FrameStream>,
    closed: bool,
}

impl Subscription {
    /// Wait for the next violation message.
    ///
    /// Returns `None` only after cancellation.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        if self.closed || self.cancel.is_cancelled() {
            self.close();
            return None;
        }

        loop {
            if self.frames.is_none() {
                match resubscribe_loop(
                    self.source.as_ref(),
                    &self.pattern,
                    &self.reconnect,
                    &self.cancel,
                )
                .await
                {
                    Some(frames) => self.frames = Some(frames),
                    None => {
                        self.close();
                        return None;
                    }
                }
            }

            let Some(frames) = self.frames.as_mut() else {
                continue;
            };

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                frame = frames.next() => Some(frame),
            };
            let Some(frame) = frame else {
                self.close();
                return None;
            };

            match frame {
                Some(Ok(BusFrame::Message { channel, payload })) => {
                    let message = InboundMessage::decode(channel, payload);
                    if let Some(raw) = message.event.raw.as_deref() {
                        tracing::warn!(
                            channel = %message.channel,
                            raw,
                            "Malformed violation payload, passing through raw",
                        );
                    }
                    return Some(message);
                }
                Some(Ok(BusFrame::Control { kind })) => {
                    tracing::debug!(kind = %kind, "Ignoring bus control frame");
                }
                Some(Err(e)) => {
                    tracing::warn!(pattern = %self.pattern, error = %e, "Bus receive error");
                    self.frames = None;
                }
                None => {
                    tracing::warn!(pattern = %self.pattern, "Bus subscription dropped");
                    self.frames = None;
                }
            }
        }
    }

    /// Whether the subscription has been closed by cancellation.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Convert into a [`Stream`] of messages.
    pub fn into_stream(self) -> impl Stream<Item = InboundMessage> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|message| (message, sub))
        })
    }

    fn close(&mut self) {
        if !self.closed {
            tracing::info!(pattern = %self.pattern, "Subscription closed");
        }
        self.closed = true;
        self.frames = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
