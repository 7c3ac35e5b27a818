//! AMQP (RabbitMQ) broker adapter.
//!
//! An optional backend alongside Kafka: one durable queue per topic (no
//! exchange routing-key fan-out, since a topic here is already the routing
//! unit — `order-commands`, `inventory-commands`, etc.), publish and
//! subscribe only; `publish_batch` falls back to sequential
//! publish since AMQP has no native transactional batch send here.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{Broker, BrokerError, BrokerMessage, MessageHandler, Result};

/// Configuration for an AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpBrokerConfig {
    pub url: String,
}

impl AmqpBrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// AMQP-backed `Broker`. Each topic maps 1:1 to a durable queue of the same
/// name; `key` is carried as a message property but does not affect routing
/// (RabbitMQ queues have no partitions).
pub struct AmqpBroker {
    pool: Pool,
    handlers: Arc<RwLock<std::collections::HashMap<String, Box<dyn MessageHandler>>>>,
}

impl AmqpBroker {
    pub async fn new(config: AmqpBrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BrokerError::Publish(format!("failed to create AMQP pool: {e}")))?;

        // Verify the connection works before handing back a broker instance.
        pool.get()
            .await
            .map_err(|e| BrokerError::Publish(format!("failed to connect to AMQP: {e}")))?;

        info!(url = %config.url, "connected to AMQP");

        Ok(Self {
            pool,
            handlers: Arc::new(RwLock::new(std::collections::HashMap::new())),
        })
    }

    async fn declare_queue(&self, topic: &str) -> Result<lapin::Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Publish(format!("failed to get AMQP connection: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Publish(format!("failed to create AMQP channel: {e}")))?;

        channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("failed to declare queue {topic}: {e}")))?;

        Ok(channel)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %msg.topic))]
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        let channel = self.declare_queue(&msg.topic).await?;

        let properties = BasicProperties::default().with_message_id(msg.key.clone().into());

        channel
            .basic_publish(
                "",
                &msg.topic,
                BasicPublishOptions::default(),
                &msg.value,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("failed to publish: {e}")))?
            .await
            .map_err(|e| BrokerError::Publish(format!("publish not confirmed: {e}")))?;

        debug!(topic = %msg.topic, key = %msg.key, "published message to AMQP");
        Ok(())
    }

    async fn publish_batch(&self, msgs: Vec<BrokerMessage>) -> Result<()> {
        for msg in msgs {
            self.publish(msg).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Box<dyn MessageHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(topic) {
            return Err(BrokerError::AlreadySubscribed(topic.to_string()));
        }
        handlers.insert(topic.to_string(), handler);
        Ok(())
    }

    async fn start_consume(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            let handler_present = self.handlers.read().await.contains_key(topic);
            if !handler_present {
                continue;
            }

            let channel = self.declare_queue(topic).await?;
            let consumer = channel
                .basic_consume(
                    topic,
                    &format!("{topic}-consumer"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume(format!("failed to consume {topic}: {e}")))?;

            let handlers = self.handlers.clone();
            let topic = topic.clone();

            tokio::spawn(async move {
                use futures::StreamExt;
                let mut consumer = consumer;
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            let key = delivery
                                .properties
                                .message_id()
                                .as_ref()
                                .map(|s| s.to_string())
                                .unwrap_or_default();
                            let msg = BrokerMessage::new(topic.clone(), key, delivery.data.clone());

                            let guard = handlers.read().await;
                            let handled_ok = match guard.get(&topic) {
                                Some(handler) => match handler.handle(msg).await {
                                    Ok(()) => true,
                                    Err(e) => {
                                        error!(topic = %topic, error = %e, "handler failed, message will be requeued");
                                        false
                                    }
                                },
                                None => true,
                            };
                            drop(guard);

                            // Only ack on a successful handle; a failure nacks with
                            // requeue so this message is redelivered rather than
                            // letting a later message on this queue be acked first.
                            if handled_ok {
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    error!(error = %e, "failed to ack AMQP delivery");
                                }
                            } else if let Err(e) =
                                delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await
                            {
                                error!(error = %e, "failed to nack AMQP delivery");
                            }
                        }
                        Err(e) => error!(error = %e, "AMQP consumer error"),
                    }
                }
            });
        }
        Ok(())
    }
}
