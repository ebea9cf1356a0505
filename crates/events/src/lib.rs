//! Violation event transport and notification delivery.
//!
//! - [`EventConsumer`] subscribes to `violation:*` and yields decoded
//!   events, reconnecting with backoff when the bus drops.
//! - [`RedisEventSource`] / [`RedisEventPublisher`] are the Redis
//!   pub/sub transport; [`MemoryBus`] is the in-process one.
//! - [`NotificationDispatcher`] fans a record out to the webhook and
//!   push sinks in [`delivery`].

pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod reconnect;
pub mod redis_bus;
pub mod source;

pub use consumer::{EventConsumer, InboundMessage, Subscription};
pub use delivery::push::PushSink;
pub use delivery::webhook::WebhookSink;
pub use delivery::{DeliveryError, NotificationSink, SinkKind};
pub use dispatcher::{
    DeliveryResult, DeliveryStatsSnapshot, NotificationDispatcher, NotificationTarget,
};
pub use reconnect::ReconnectConfig;
pub use redis_bus::{RedisEventPublisher, RedisEventSource};
pub use source::{BusFrame, EventSource, MemoryBus, TransportError};
