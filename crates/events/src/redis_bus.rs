//! Redis pub/sub transport.
//!
//! [`RedisEventSource`] opens a dedicated pub/sub connection per
//! subscription (pattern subscribe, `PSUBSCRIBE`). Redis delivers only
//! published messages on the message stream; the stream ends when the
//! connection drops. [`RedisEventPublisher`] publishes events on their
//! jurisdiction channel.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use vigil_core::violation::{channel_for, ViolationEvent};

use crate::source::{BusFrame, EventSource, FrameStream, TransportError};

/// Pub/sub source backed by a Redis server.
pub struct RedisEventSource {
    client: redis::Client,
}

impl RedisEventSource {
    /// Validate `redis_url` and build a client. Does not connect.
    pub fn open(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventSource for RedisEventSource {
    async fn subscribe(&self, pattern: &str) -> Result<FrameStream, TransportError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let frames = pubsub.into_on_message().map(|msg| {
            Ok(BusFrame::Message {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            })
        });
        Ok(frames.boxed())
    }
}

/// Publishes violation events, e.g. for smoke-testing a running relay.
#[derive(Clone)]
pub struct RedisEventPublisher {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisEventPublisher {
    pub async fn connect(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Channel and JSON payload `event` is published as.
    pub fn encode(event: &ViolationEvent) -> Result<(String, Vec<u8>), TransportError> {
        Ok((channel_for(&event.jurisdiction), event.to_wire()?))
    }

    /// Publish `event` on `violation:<jurisdiction>`.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, event: &ViolationEvent) -> Result<usize, TransportError> {
        let (channel, payload) = Self::encode(event)?;
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(&channel, payload).await?;
        tracing::debug!(channel = %channel, receivers, "Published violation event");
        Ok(receivers)
    }
}
