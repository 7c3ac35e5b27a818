//! Configuration for the saga fabric: storage backend, broker, relay and
//! compensation tunables.
//!
//! Supports a YAML file plus environment variable overrides: file values
//! load first, then env vars like `STORAGE_CONNECTION_STRING` and
//! `RELAY_BATCH_SIZE` override individual fields, then built-in defaults
//! fill in anything still unset.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Which storage backend the outbox/inbox/saga repository use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    Postgres,
}

/// Which broker backend moves envelopes between participants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Channel,
    Kafka,
    Amqp,
}

/// Top-level fabric configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub saga_compensation: SagaCompensationConfig,
}

/// Storage configuration: which backend, and its connection string.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// SQLite file path or Postgres connection URL.
    pub connection_string: String,
    /// Max pool connections.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Sqlite,
            connection_string: "sqlite://./data/saga-fabric.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Broker configuration: which backend plus its backend-specific fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub kind: BrokerKind,
    pub kafka: Option<KafkaConfig>,
    pub amqp: Option<AmqpConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Channel,
            kafka: None,
            amqp: None,
        }
    }
}

/// Kafka-specific broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    /// Enable `enable.idempotence` on the producer, so a retried send after
    /// a timeout can't land the same message on the broker twice.
    pub idempotent_producer: bool,
    /// `acks=all` when true, `acks=1` otherwise.
    pub required_acks_all: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "saga-fabric".to_string(),
            idempotent_producer: true,
            required_acks_all: true,
        }
    }
}

/// AMQP-specific broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub url: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
        }
    }
}

/// Outbox relay worker tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub batch_size: u32,
    pub poll_interval_ms: u64,
    pub stale_pending_after_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1000,
            stale_pending_after_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Saga compensation retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaCompensationConfig {
    pub max_retry_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SagaCompensationConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 10,
            min_delay_ms: 200,
            max_delay_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from file (if `SAGA_FABRIC_CONFIG` points at one
    /// that exists) layered with environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("SAGA_FABRIC_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("STORAGE_TYPE") {
            self.storage.kind = match kind.to_lowercase().as_str() {
                "postgres" => StorageKind::Postgres,
                _ => StorageKind::Sqlite,
            };
        }
        if let Ok(conn) = std::env::var("STORAGE_CONNECTION_STRING") {
            self.storage.connection_string = conn;
        }
        if let Ok(max) = std::env::var("STORAGE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.storage.max_connections = n;
            }
        }

        if let Ok(kind) = std::env::var("BROKER_TYPE") {
            self.broker.kind = match kind.to_lowercase().as_str() {
                "kafka" => BrokerKind::Kafka,
                "amqp" => BrokerKind::Amqp,
                _ => BrokerKind::Channel,
            };
        }
        if let Ok(servers) = std::env::var("KAFKA_BOOTSTRAP_SERVERS") {
            self.broker.kafka.get_or_insert_with(KafkaConfig::default).bootstrap_servers = servers;
        }
        if let Ok(url) = std::env::var("AMQP_URL") {
            self.broker.amqp.get_or_insert_with(AmqpConfig::default).url = url;
        }

        if let Ok(batch_size) = std::env::var("RELAY_BATCH_SIZE") {
            if let Ok(n) = batch_size.parse() {
                self.relay.batch_size = n;
            }
        }
        if let Ok(interval) = std::env::var("RELAY_POLL_INTERVAL_MS") {
            if let Ok(n) = interval.parse() {
                self.relay.poll_interval_ms = n;
            }
        }

        if let Ok(attempts) = std::env::var("SAGA_COMPENSATION_MAX_RETRY_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.saga_compensation.max_retry_attempts = n;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}
