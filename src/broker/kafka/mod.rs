//! Kafka broker adapter.
//!
//! Topics are plain names (no per-domain prefixing; the fabric's topics are
//! already the routing unit, e.g. `order-commands`, `inventory-commands`),
//! and the partition key is the saga id so every message for a saga lands on
//! the same partition and is delivered in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerError, BrokerMessage, MessageHandler, Result};

/// Configuration for a Kafka-backed broker connection.
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    pub bootstrap_servers: String,
    pub group_id: Option<String>,
    pub transactional_id: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub security_protocol: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl KafkaBrokerConfig {
    /// Config for a broker used only to publish (e.g. the outbox relay).
    pub fn publisher(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: None,
            transactional_id: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Config for a broker that also consumes, under the given consumer group.
    pub fn subscriber(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: Some(group_id.into()),
            transactional_id: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Enable transactional, idempotent batch publishes for the relay's
    /// `publish_batch`.
    pub fn with_transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self
    }

    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        if let Some(ref txn_id) = self.transactional_id {
            config.set("transactional.id", txn_id);
        }
        self.apply_security_config(&mut config);
        config
    }

    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        if let Some(ref group_id) = self.group_id {
            config.set("group.id", group_id);
        }
        self.apply_security_config(&mut config);
        config
    }

    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Kafka-backed `Broker`.
///
/// Message keys are the saga id, so partitioning keeps every step of a
/// given saga strictly ordered on one partition/consumer.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaBrokerConfig,
    consumer: Option<Arc<StreamConsumer>>,
    handlers: Arc<RwLock<HashMap<String, Box<dyn MessageHandler>>>>,
}

impl KafkaBroker {
    pub async fn new(config: KafkaBrokerConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BrokerError::Publish(format!("failed to create Kafka producer: {e}")))?;

        if config.transactional_id.is_some() {
            producer
                .init_transactions(Duration::from_secs(10))
                .map_err(|e| BrokerError::Publish(format!("failed to init transactions: {e}")))?;
        }

        info!(bootstrap_servers = %config.bootstrap_servers, "connected to Kafka");

        let consumer = if config.group_id.is_some() {
            let consumer: StreamConsumer = config.build_consumer_config().create().map_err(|e| {
                BrokerError::Subscribe(format!("failed to create Kafka consumer: {e}"))
            })?;
            Some(Arc::new(consumer))
        } else {
            None
        };

        Ok(Self {
            producer,
            config,
            consumer,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %msg.topic))]
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        let record = FutureRecord::to(&msg.topic)
            .payload(&msg.value)
            .key(&msg.key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| BrokerError::Publish(format!("failed to publish: {e}")))?;

        debug!(topic = %msg.topic, key = %msg.key, "published message to Kafka");
        Ok(())
    }

    #[tracing::instrument(name = "broker.publish_batch", skip_all, fields(count = msgs.len()))]
    async fn publish_batch(&self, msgs: Vec<BrokerMessage>) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }

        if self.config.transactional_id.is_none() {
            for msg in msgs {
                self.publish(msg).await?;
            }
            return Ok(());
        }

        self.producer
            .begin_transaction()
            .map_err(|e| BrokerError::Publish(format!("failed to begin transaction: {e}")))?;

        let mut send_futures = Vec::with_capacity(msgs.len());
        for msg in &msgs {
            let record = FutureRecord::to(&msg.topic).payload(&msg.value).key(&msg.key);
            send_futures.push(self.producer.send_result(record));
        }

        let mut failed = false;
        for result in send_futures {
            match result {
                Ok(fut) => {
                    if fut.await.is_err() {
                        failed = true;
                    }
                }
                Err(_) => failed = true,
            }
        }

        if failed {
            self.producer
                .abort_transaction(Duration::from_secs(10))
                .map_err(|e| BrokerError::Publish(format!("failed to abort transaction: {e}")))?;
            return Err(BrokerError::Publish("batch publish failed, transaction aborted".into()));
        }

        self.producer
            .commit_transaction(Duration::from_secs(10))
            .map_err(|e| BrokerError::Publish(format!("failed to commit transaction: {e}")))?;

        debug!(count = msgs.len(), "published batch to Kafka transactionally");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Box<dyn MessageHandler>) -> Result<()> {
        if self.consumer.is_none() {
            return Err(BrokerError::Subscribe(
                "no consumer configured; use KafkaBrokerConfig::subscriber()".into(),
            ));
        }

        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(topic) {
            return Err(BrokerError::AlreadySubscribed(topic.to_string()));
        }
        handlers.insert(topic.to_string(), handler);
        Ok(())
    }

    async fn start_consume(&self, topics: &[String]) -> Result<()> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Consume("no consumer configured".into()))?
            .clone();

        let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Consume(format!("failed to subscribe to topics: {e}")))?;

        info!(topics = ?topics, "subscribed to Kafka topics");

        let handlers = self.handlers.clone();

        tokio::spawn(async move {
            use futures::StreamExt;
            use rdkafka::message::Message as KafkaMessage;

            let mut stream = consumer.stream();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(message) => {
                        let payload = match message.payload() {
                            Some(p) => p.to_vec(),
                            None => {
                                warn!("received Kafka message with no payload");
                                let _ = consumer
                                    .commit_message(&message, rdkafka::consumer::CommitMode::Async);
                                continue;
                            }
                        };

                        let topic = message.topic().to_string();
                        let key = message
                            .key()
                            .map(|k| String::from_utf8_lossy(k).to_string())
                            .unwrap_or_default();

                        let handler = {
                            let guard = handlers.read().await;
                            guard.get(&topic).map(|_| ())
                        };

                        let handled_ok = if handler.is_some() {
                            let guard = handlers.read().await;
                            match guard.get(&topic) {
                                Some(handler) => {
                                    let msg = BrokerMessage::new(topic.clone(), key, payload);
                                    match handler.handle(msg).await {
                                        Ok(()) => true,
                                        Err(e) => {
                                            error!(topic = %topic, error = %e, "handler failed, offset will not be committed");
                                            false
                                        }
                                    }
                                }
                                None => true,
                            }
                        } else {
                            true
                        };

                        // Only a successful handle triggers the offset commit. A
                        // handler failure leaves this partition stalled at the
                        // failing message until redelivery succeeds — no
                        // out-of-order commits past a failed message.
                        if handled_ok {
                            if let Err(e) =
                                consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async)
                            {
                                error!(error = %e, "failed to commit Kafka offset");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Kafka consumer error"),
                }
            }
        });

        Ok(())
    }
}
