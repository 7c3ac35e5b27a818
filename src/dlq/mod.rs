//! Dead letter queue: where a message goes when it can never be processed,
//! rather than being redelivered forever.
//!
//! Publishes through the same `Broker` seam the relay and participants use:
//! the original envelope bytes plus a rejection reason, wrapped as plain
//! JSON so a dead letter can carry whatever bytes failed plus why, for any
//! envelope shape.
//!
//! ## Topic naming
//!
//! One DLQ topic per domain: `dlq.{domain}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{Broker, BrokerMessage};

/// DLQ topic prefix. Full topic: `{prefix}.{domain}`.
pub const DLQ_TOPIC_PREFIX: &str = "dlq";

/// Build the DLQ topic name for a domain (e.g. `order`, `inventory`).
pub fn dlq_topic_for_domain(domain: &str) -> String {
    format!("{DLQ_TOPIC_PREFIX}.{domain}")
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail")]
pub enum RejectionReason {
    /// The envelope bytes did not deserialize.
    Malformed(String),
    /// The current saga step has no slot for this event type.
    UnknownEventType { saga_id: Option<Uuid>, event_type: String },
    /// Business logic rejected the message after exhausting retries.
    HandlerFailed(String),
    /// A catch-all for callers with a reason that doesn't fit the above.
    Other(String),
}

/// A dead-lettered message: the original bytes, where they came from, and
/// why they ended up here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub source_topic: String,
    pub source_key: String,
    pub payload: Vec<u8>,
    pub reason: RejectionReason,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(source_topic: impl Into<String>, source_key: impl Into<String>, payload: Vec<u8>, reason: RejectionReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_topic: source_topic.into(),
            source_key: source_key.into(),
            payload,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Errors from publishing to the DLQ.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("failed to publish dead letter: {0}")]
    Publish(String),
}

/// Publishes dead letters to a domain-scoped topic on the crate's own
/// `Broker` seam, rather than a dedicated transport — a dead letter is just
/// another message, and every backend already implements `Broker`.
pub struct DeadLetterPublisher<B> {
    broker: B,
    domain: String,
}

impl<B: Broker> DeadLetterPublisher<B> {
    pub fn new(broker: B, domain: impl Into<String>) -> Self {
        Self { broker, domain: domain.into() }
    }

    pub fn topic(&self) -> String {
        dlq_topic_for_domain(&self.domain)
    }

    pub async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let key = dead_letter.source_key.clone();
        let bytes = serde_json::to_vec(&dead_letter).map_err(|e| DlqError::Serialization(e.to_string()))?;
        self.broker
            .publish(BrokerMessage::new(self.topic(), key, bytes))
            .await
            .map_err(|e| DlqError::Publish(e.to_string()))
    }
}

#[cfg(all(test, feature = "channel"))]
mod tests {
    use super::*;
    use crate::broker::channel::ChannelBroker;

    #[tokio::test]
    async fn publish_sends_to_the_domain_scoped_topic() {
        let broker = ChannelBroker::new();
        let publisher = DeadLetterPublisher::new(broker, "order");
        assert_eq!(publisher.topic(), "dlq.order");

        let dl = DeadLetter::new("order.commands", "saga-1", b"garbage".to_vec(), RejectionReason::Malformed("eof".into()));
        publisher.publish(dl).await.unwrap();
    }

    #[test]
    fn dlq_topic_for_domain_formats_as_expected() {
        assert_eq!(dlq_topic_for_domain("payment"), "dlq.payment");
    }
}
