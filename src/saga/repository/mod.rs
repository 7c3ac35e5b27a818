//! Saga repository: persists the saga instance so the orchestrator can
//! resume it across process restarts ("Saga repository" row).
//!
//! Plain `create`/`find`/`update` trait over the associated-`Conn` pattern
//! `OutboxStore`/`InboxStore` already use, so a single ambient transaction
//! spans the saga row and the outbox write.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use super::Saga;

/// Errors from saga repository operations.
#[derive(Debug, thiserror::Error)]
pub enum SagaRepositoryError {
    #[error("saga {0} not found")]
    NotFound(Uuid),

    #[error("saga {0} already exists")]
    AlreadyExists(Uuid),

    #[error("failed to (de)serialize saga state: {0}")]
    Serde(String),

    #[error("database error: {0}")]
    Database(String),
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for SagaRepositoryError {
    fn from(e: sqlx::Error) -> Self {
        SagaRepositoryError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SagaRepositoryError>;

/// Durable saga-instance store, bound to an ambient transaction handle,
/// mirroring `OutboxStore`/`InboxStore`'s associated-type design.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    type Conn: Send;

    /// Insert a new saga row. Fails with `AlreadyExists` if `saga.id`
    /// collides (should not happen with a fresh `Uuid::new_v4`, but the
    /// backend enforces the primary key regardless).
    async fn create(&self, conn: &mut Self::Conn, saga: &Saga) -> Result<()>;

    /// Load a saga by id, or `None` if it does not exist.
    async fn find(&self, conn: &mut Self::Conn, id: Uuid) -> Result<Option<Saga>>;

    /// Overwrite the persisted state of an existing saga. Fails with
    /// `NotFound` if no row matches `saga.id`.
    async fn update(&self, conn: &mut Self::Conn, saga: &Saga) -> Result<()>;
}
