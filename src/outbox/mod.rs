//! Transactional outbox: durable pending-message table with status
//! transitions, written atomically alongside business changes.
//!
//! Lifecycle: `init` (written inside the caller's business
//! transaction) → `pending` (claimed by a relay pass) → `sent` (broker ack)
//! or `error` (terminal failure policy). All operations take an ambient
//! `sqlx` connection so the caller controls the transaction boundary —
//! there is no `publish()` that opens its own transaction, because the
//! whole point of the pattern is that the outbox write and the business
//! write commit together.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Init,
    Pending,
    Sent,
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Init => "init",
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(OutboxStatus::Init),
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            "error" => Some(OutboxStatus::Error),
            _ => None,
        }
    }
}

/// A row in the outbox table: an envelope serialized to bytes plus the
/// broker routing info needed to publish it.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Build a new row in `init` status, ready to be handed to `publish`.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            key: key.into(),
            payload,
            status: OutboxStatus::Init,
            created_at: Utc::now(),
        }
    }
}

/// Errors from outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("no transaction in scope for outbox write")]
    TxnMissing,

    #[error("no-op: expected rows did not match the legal predecessor status")]
    NoOp,

    #[error("database error: {0}")]
    Database(String),
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// Durable pending-messages store, bound to an ambient transaction handle
/// supplied by the caller.
///
/// `Conn` is the backend's transaction/connection type (`PgConnection` or
/// `SqliteConnection`) — a store is generic over exactly one backend, chosen
/// at deployment time via Cargo feature, so there is no need for a single
/// `dyn OutboxStore` spanning both.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Conn: Send;

    /// Insert with status=init. The caller is expected to be inside a
    /// transaction that also contains its business writes, so the insert
    /// commits atomically with them.
    async fn publish(&self, conn: &mut Self::Conn, msg: OutboxMessage) -> Result<()>;

    /// Oldest `init` rows, up to `limit`, ordered by `created_at` then `id`
    /// ascending — the ordering is part of the contract, not incidental.
    async fn get_not_sent(&self, conn: &mut Self::Conn, limit: u32) -> Result<Vec<OutboxMessage>>;

    /// init → pending. Fails with `NoOp` if fewer than `ids.len()` rows
    /// transitioned (a concurrent relay claimed some of them first).
    async fn batch_mark_as_pending(&self, conn: &mut Self::Conn, ids: &[Uuid]) -> Result<()>;

    /// pending → sent.
    async fn batch_mark_as_sent(&self, conn: &mut Self::Conn, ids: &[Uuid]) -> Result<()>;

    /// pending → error (terminal failure policy).
    async fn batch_mark_as_error(&self, conn: &mut Self::Conn, ids: &[Uuid]) -> Result<()>;

    /// Crash-recovery sweep: reset `pending` rows older than `claim_timeout`
    /// back to `init` so a dead relay's claim doesn't strand them forever.
    async fn reset_stale_pending(
        &self,
        conn: &mut Self::Conn,
        older_than: chrono::Duration,
    ) -> Result<u64>;
}
