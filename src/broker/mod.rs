//! Broker adapter: the one seam every outbox relay, inbox consumer and
//! participant drive loop goes through to reach the wire.
//!
//! One trait — `publish`, `publish_batch`, `subscribe`, `start_consume` —
//! so the relay and participant code are backend-agnostic.

#[cfg(feature = "channel")]
pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// A message ready to go on the wire: a topic, a partition/routing key
/// (the saga id for saga-scoped traffic, so replies for one saga are
/// delivered in order), and an opaque payload (a serialized `Command`/
/// `Event` envelope).
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
        }
    }
}

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("already subscribed to topic {0}")]
    AlreadySubscribed(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("consume failed: {0}")]
    Consume(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Callback invoked for every message delivered to a subscribed topic.
///
/// Boxed-future based rather than `async_trait`-based so closures can be
/// registered directly.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: BrokerMessage) -> BoxFuture<'static, Result<()>>;
}

impl<F> MessageHandler for F
where
    F: Fn(BrokerMessage) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn handle(&self, msg: BrokerMessage) -> BoxFuture<'static, Result<()>> {
        (self)(msg)
    }
}

/// Pub/sub adapter used by the outbox relay (publish side) and by
/// participants and the saga orchestrator (subscribe side).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a single message.
    async fn publish(&self, msg: BrokerMessage) -> Result<()>;

    /// Publish a batch atomically where the backend supports it (Kafka
    /// producer transactions); falls back to a best-effort sequential
    /// publish otherwise.
    async fn publish_batch(&self, msgs: Vec<BrokerMessage>) -> Result<()>;

    /// Register a handler for a topic. Returns `AlreadySubscribed` if the
    /// topic already has a handler.
    async fn subscribe(&self, topic: &str, handler: Box<dyn MessageHandler>) -> Result<()>;

    /// Start delivering messages for the given topics to their registered
    /// handlers. Call after all `subscribe` calls for this broker instance.
    async fn start_consume(&self, topics: &[String]) -> Result<()>;
}
