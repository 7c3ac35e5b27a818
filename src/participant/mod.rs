//! The participant handler template every business handler (order,
//! inventory, payment, product) and the saga orchestrator itself follow.
//!
//! Each handler returns the single outgoing reply its business logic
//! produces. The dedup rule: "exists" alone is not "skip" — only
//! `exists && status == completed` is; anything else retries the business
//! transaction from scratch.

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::MessageId;
use crate::inbox::{InboxLookup, InboxMessage, InboxStore};
use crate::outbox::{OutboxMessage, OutboxStore};

/// Errors from driving a participant through one message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error(transparent)]
    Inbox(#[from] crate::inbox::InboxError),

    #[error(transparent)]
    Outbox(#[from] crate::outbox::OutboxError),

    #[error("database error: {0}")]
    Database(String),

    #[error("business logic rejected the message: {0}")]
    Business(String),
}

/// What happened to a message handed to `drive_participant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// T1 and T2 both committed; a reply may have been enqueued.
    Processed,
    /// The message's id was already `completed` in the inbox; no business
    /// logic ran.
    DuplicateSkipped,
}

/// Business logic for one incoming command or event type.
///
/// `handle` runs inside T2: it may read/write the
/// participant's own business tables through `conn` and returns at most one
/// reply envelope, pre-serialized into an `OutboxMessage` ready for
/// `OutboxStore::publish` within the same transaction.
#[async_trait]
pub trait ParticipantHandler: Send + Sync {
    type Conn: Send;
    type Incoming: MessageId + Send + Sync;

    async fn handle(
        &self,
        conn: &mut Self::Conn,
        incoming: &Self::Incoming,
    ) -> Result<Option<OutboxMessage>, HandlerError>;
}

/// Drive one incoming message through the full template:
///
/// 1. Deserialize `raw` into `H::Incoming`. Malformed payloads are reported
///    as `HandlerError::Malformed` for the caller to route to the DLQ,
///    never retried in place.
/// 2. T1: dedup against the inbox. Already-`completed` → commit, skip.
///    Otherwise store (if not yet seen) and move the row to `pending`: a row
///    that `exists` but isn't `completed` means a prior attempt crashed
///    before T2 committed, so it retries from scratch rather than being
///    skipped.
/// 3. T2: run business logic, publish its reply (if any) to the outbox,
///    mark the inbox row `completed` (`pending -> completed`). All in one
///    transaction.
///
/// Callers are responsible for acking the broker message only after this
/// function returns `Ok` — a returned `Err` means T2 did not commit and the
/// message must be redelivered.
pub async fn drive_participant<DB, O, I, H>(
    pool: &sqlx::Pool<DB>,
    outbox: &O,
    inbox: &I,
    handler: &H,
    topic: &str,
    key: &str,
    raw: &[u8],
) -> Result<DriveOutcome, HandlerError>
where
    DB: sqlx::Database,
    O: OutboxStore<Conn = DB::Connection>,
    I: InboxStore<Conn = DB::Connection>,
    H: ParticipantHandler<Conn = DB::Connection>,
    H::Incoming: serde::de::DeserializeOwned,
{
    let incoming: H::Incoming =
        serde_json::from_slice(raw).map_err(|e| HandlerError::Malformed(e.to_string()))?;
    let message_id: Uuid = incoming.message_id();

    let mut tx1 = pool
        .begin()
        .await
        .map_err(|e| HandlerError::Database(e.to_string()))?;

    let lookup = inbox.exists(&mut *tx1, message_id).await?;
    if lookup.already_completed() {
        tx1.commit().await.map_err(|e| HandlerError::Database(e.to_string()))?;
        return Ok(DriveOutcome::DuplicateSkipped);
    }
    if matches!(lookup, InboxLookup::NotSeen) {
        let msg = InboxMessage::new(message_id, std::any::type_name::<H::Incoming>(), topic, key, raw.to_vec());
        match inbox.store(&mut *tx1, msg).await {
            Ok(()) => {}
            // A concurrent delivery won the race and stored the same
            // message id first; fall through and let T2 retry as if this
            // attempt had found it already `exists`-but-not-completed.
            Err(crate::inbox::InboxError::Duplicate) => {}
            Err(e) => return Err(e.into()),
        }
    }
    // The row is `init` (freshly stored or left behind by this same
    // branch on a prior attempt) or already `pending` from a crash
    // between this transition and T2's commit; either way T2's
    // `pending -> completed` transition needs it in `pending`.
    match inbox.mark_as_pending(&mut *tx1, message_id).await {
        Ok(()) => {}
        Err(crate::inbox::InboxError::NoOp) => {}
        Err(e) => return Err(e.into()),
    }
    tx1.commit().await.map_err(|e| HandlerError::Database(e.to_string()))?;

    let mut tx2 = pool
        .begin()
        .await
        .map_err(|e| HandlerError::Database(e.to_string()))?;

    let reply = match handler.handle(&mut *tx2, &incoming).await {
        Ok(reply) => reply,
        Err(e) => {
            // Business transaction did not commit; leave the inbox row
            // pending so a redelivery retries T2 from scratch.
            return Err(e);
        }
    };

    if let Some(reply_msg) = reply {
        outbox.publish(&mut *tx2, reply_msg).await?;
    }
    inbox.mark_as_completed(&mut *tx2, message_id).await?;
    tx2.commit().await.map_err(|e| HandlerError::Database(e.to_string()))?;

    Ok(DriveOutcome::Processed)
}
