//! Transactional inbox: dedup of incoming messages by producer-assigned id.
//!
//! Lifecycle: `init` (written the instant a handler first sees a message) →
//! `pending` (handler committed to processing it) → `completed` (business
//! transaction + outbox write committed) or `error` (terminal failure
//! policy). `exists` distinguishes "never seen" from "seen but not yet
//! completed" so a redelivery that crashed mid-transaction and never
//! actually completed gets reprocessed rather than silently skipped (see
//! `drive_participant`
//! in `crate::participant`).

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of an inbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Init,
    Pending,
    Completed,
    Error,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Init => "init",
            InboxStatus::Pending => "pending",
            InboxStatus::Completed => "completed",
            InboxStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(InboxStatus::Init),
            "pending" => Some(InboxStatus::Pending),
            "completed" => Some(InboxStatus::Completed),
            "error" => Some(InboxStatus::Error),
            _ => None,
        }
    }
}

/// A row in the inbox table, keyed by the producer-assigned message id.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub message_id: Uuid,
    pub message_type: String,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
}

impl InboxMessage {
    pub fn new(
        message_id: Uuid,
        message_type: impl Into<String>,
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            topic: topic.into(),
            key: key.into(),
            payload,
            status: InboxStatus::Init,
            created_at: Utc::now(),
        }
    }
}

/// Errors from inbox operations.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("no-op: expected rows did not match the legal predecessor status")]
    NoOp,

    #[error("duplicate: a concurrent insert already stored this message id")]
    Duplicate,

    #[error("database error: {0}")]
    Database(String),
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for InboxError {
    fn from(e: sqlx::Error) -> Self {
        InboxError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;

/// What `exists` tells a handler about a previously-seen message id: a
/// handler can tell "never seen" from "seen but not yet completed" and only
/// skip reprocessing once it is actually completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxLookup {
    NotSeen,
    Seen(InboxStatus),
}

impl InboxLookup {
    /// True when this message id is fully processed and safe to skip.
    pub fn already_completed(&self) -> bool {
        matches!(self, InboxLookup::Seen(InboxStatus::Completed))
    }
}

/// Dedup store, bound to an ambient transaction handle supplied by the
/// caller, mirroring `OutboxStore`'s associated-type design.
#[async_trait]
pub trait InboxStore: Send + Sync {
    type Conn: Send;

    /// Look up a message id without mutating anything.
    async fn exists(&self, conn: &mut Self::Conn, message_id: Uuid) -> Result<InboxLookup>;

    /// Insert with status=init. Fails with `Duplicate` if a concurrent
    /// insert for the same `message_id` won the race — callers that lost
    /// the race should treat the row as already owned by that winner and
    /// fall through to the same "exists but not completed" retry path.
    async fn store(&self, conn: &mut Self::Conn, msg: InboxMessage) -> Result<()>;

    /// init → pending, signalling the handler has committed to processing
    /// this message in the current attempt.
    async fn mark_as_pending(&self, conn: &mut Self::Conn, message_id: Uuid) -> Result<()>;

    /// pending → completed, written in the same transaction as the
    /// business write and the outbox insert.
    async fn mark_as_completed(&self, conn: &mut Self::Conn, message_id: Uuid) -> Result<()>;

    /// pending → error (terminal failure policy — malformed payload, unknown
    /// type after dead-lettering).
    async fn mark_as_error(&self, conn: &mut Self::Conn, message_id: Uuid) -> Result<()>;
}
