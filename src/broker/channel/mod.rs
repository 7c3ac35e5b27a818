//! In-memory topic-based broker for the `standalone` profile and tests.
//!
//! One `tokio::sync::broadcast` channel per topic, since the fabric's
//! routing unit is the topic itself rather than a hierarchical domain name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::{Broker, BrokerError, BrokerMessage, MessageHandler, Result};

const CHANNEL_CAPACITY: usize = 1024;

struct Topic {
    sender: broadcast::Sender<BrokerMessage>,
    handler: Option<Box<dyn MessageHandler>>,
}

/// In-memory broker. Clone to share the same set of topic channels across
/// multiple handles (e.g. a publisher and a subscriber in the same process).
#[derive(Clone)]
pub struct ChannelBroker {
    topics: Arc<RwLock<HashMap<String, Arc<RwLock<Topic>>>>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn topic_sender(&self, topic: &str) -> broadcast::Sender<BrokerMessage> {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            Arc::new(RwLock::new(Topic {
                sender,
                handler: None,
            }))
        });
        entry.read().await.sender.clone()
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        let sender = self.topic_sender(&msg.topic).await;
        let topic = msg.topic.clone();
        match sender.send(msg) {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "published message to channel broker");
            }
            Err(_) => {
                debug!(topic = %topic, "published message with no receivers");
            }
        }
        Ok(())
    }

    async fn publish_batch(&self, msgs: Vec<BrokerMessage>) -> Result<()> {
        for msg in msgs {
            self.publish(msg).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Box<dyn MessageHandler>) -> Result<()> {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            Arc::new(RwLock::new(Topic {
                sender,
                handler: None,
            }))
        });

        let mut guard = entry.write().await;
        if guard.handler.is_some() {
            return Err(BrokerError::AlreadySubscribed(topic.to_string()));
        }
        guard.handler = Some(handler);
        info!(topic = %topic, "handler subscribed to channel broker");
        Ok(())
    }

    async fn start_consume(&self, topics: &[String]) -> Result<()> {
        for topic_name in topics {
            let topic_entry = {
                let topics_guard = self.topics.read().await;
                topics_guard.get(topic_name).cloned()
            };

            let Some(topic_entry) = topic_entry else {
                continue;
            };

            let mut receiver = {
                let guard = topic_entry.read().await;
                guard.sender.subscribe()
            };

            let topic_name = topic_name.clone();
            let topic_entry = topic_entry.clone();

            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(msg) => {
                            let handler = {
                                let guard = topic_entry.read().await;
                                guard.handler.as_ref().map(|_| ())
                            };
                            if handler.is_none() {
                                continue;
                            }
                            let guard = topic_entry.read().await;
                            if let Some(handler) = guard.handler.as_ref() {
                                // Unlike the Kafka/AMQP adapters, a broadcast
                                // channel has no offset/ack to withhold on
                                // failure: once recv() yields a message it
                                // cannot be redelivered to this same receiver.
                                // A handler failure is logged but does not
                                // stall the topic.
                                if let Err(e) = handler.handle(msg).await {
                                    error!(topic = %topic_name, error = %e, "handler failed");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            error!(topic = %topic_name, skipped = n, "consumer lagged, skipped messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!(topic = %topic_name, "channel closed, stopping consumer");
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
