//! SQLite inbox store, used by the `standalone` profile and by tests.

use async_trait::async_trait;
use sea_query::{ColumnDef, Expr, Iden, Query, SqliteQueryBuilder, Table};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{InboxError, InboxLookup, InboxMessage, InboxStatus, InboxStore, Result};

#[derive(Iden)]
enum Inbox {
    Table,
    MessageId,
    MessageType,
    Topic,
    Key,
    Payload,
    Status,
    CreatedAt,
}

/// SQLite-backed `InboxStore`.
#[derive(Clone, Copy)]
pub struct SqliteInboxStore;

impl SqliteInboxStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn init_schema(pool: &sqlx::SqlitePool) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Inbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Inbox::MessageId).text().primary_key())
            .col(ColumnDef::new(Inbox::MessageType).text().not_null())
            .col(ColumnDef::new(Inbox::Topic).text().not_null())
            .col(ColumnDef::new(Inbox::Key).text().not_null())
            .col(ColumnDef::new(Inbox::Payload).blob().not_null())
            .col(ColumnDef::new(Inbox::Status).text().not_null())
            .col(ColumnDef::new(Inbox::CreatedAt).text().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_table).execute(pool).await?;
        Ok(())
    }
}

impl Default for SqliteInboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboxStore for SqliteInboxStore {
    type Conn = SqliteConnection;

    async fn exists(&self, conn: &mut SqliteConnection, message_id: Uuid) -> Result<InboxLookup> {
        let sql = Query::select()
            .column(Inbox::Status)
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::MessageId).eq(message_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        match row {
            None => Ok(InboxLookup::NotSeen),
            Some(row) => {
                let status_str: String = row.get("status");
                let status = InboxStatus::from_str(&status_str).unwrap_or(InboxStatus::Error);
                Ok(InboxLookup::Seen(status))
            }
        }
    }

    async fn store(&self, conn: &mut SqliteConnection, msg: InboxMessage) -> Result<()> {
        let sql = Query::insert()
            .into_table(Inbox::Table)
            .columns([
                Inbox::MessageId,
                Inbox::MessageType,
                Inbox::Topic,
                Inbox::Key,
                Inbox::Payload,
                Inbox::Status,
                Inbox::CreatedAt,
            ])
            .values_panic([
                msg.message_id.to_string().into(),
                msg.message_type.into(),
                msg.topic.into(),
                msg.key.into(),
                msg.payload.into(),
                InboxStatus::Init.as_str().into(),
                msg.created_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&sql).execute(&mut *conn).await.map_err(|e| {
            if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) {
                InboxError::Duplicate
            } else {
                InboxError::from(e)
            }
        })?;
        Ok(())
    }

    async fn mark_as_pending(&self, conn: &mut SqliteConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Init, InboxStatus::Pending).await
    }

    async fn mark_as_completed(&self, conn: &mut SqliteConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Pending, InboxStatus::Completed).await
    }

    async fn mark_as_error(&self, conn: &mut SqliteConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Pending, InboxStatus::Error).await
    }
}

async fn transition(
    conn: &mut SqliteConnection,
    message_id: Uuid,
    from: InboxStatus,
    to: InboxStatus,
) -> Result<()> {
    let sql = Query::update()
        .table(Inbox::Table)
        .value(Inbox::Status, to.as_str())
        .and_where(Expr::col(Inbox::MessageId).eq(message_id.to_string()))
        .and_where(Expr::col(Inbox::Status).eq(from.as_str()))
        .to_string(SqliteQueryBuilder);

    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(InboxError::NoOp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteInboxStore::init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn new_message_id_is_not_seen() {
        let pool = setup().await;
        let store = SqliteInboxStore::new();
        let mut conn = pool.acquire().await.unwrap();

        let lookup = store.exists(&mut conn, Uuid::new_v4()).await.unwrap();
        assert_eq!(lookup, InboxLookup::NotSeen);
    }

    #[tokio::test]
    async fn stored_message_is_seen_but_not_completed() {
        let pool = setup().await;
        let store = SqliteInboxStore::new();
        let mut conn = pool.acquire().await.unwrap();

        let id = Uuid::new_v4();
        store
            .store(&mut conn, InboxMessage::new(id, "CreateOrder", "order-commands", "s1", b"{}".to_vec()))
            .await
            .unwrap();

        let lookup = store.exists(&mut conn, id).await.unwrap();
        assert_eq!(lookup, InboxLookup::Seen(InboxStatus::Init));
        assert!(!lookup.already_completed());
    }

    #[tokio::test]
    async fn full_lifecycle_marks_completed_and_is_then_skippable() {
        let pool = setup().await;
        let store = SqliteInboxStore::new();
        let mut conn = pool.acquire().await.unwrap();

        let id = Uuid::new_v4();
        store
            .store(&mut conn, InboxMessage::new(id, "CreateOrder", "order-commands", "s1", b"{}".to_vec()))
            .await
            .unwrap();
        store.mark_as_pending(&mut conn, id).await.unwrap();
        store.mark_as_completed(&mut conn, id).await.unwrap();

        let lookup = store.exists(&mut conn, id).await.unwrap();
        assert!(lookup.already_completed());
    }

    #[tokio::test]
    async fn a_crash_between_store_and_completed_is_retryable_not_skipped() {
        // A message that was stored but never completed must NOT be treated
        // as already handled.
        let pool = setup().await;
        let store = SqliteInboxStore::new();
        let mut conn = pool.acquire().await.unwrap();

        let id = Uuid::new_v4();
        store
            .store(&mut conn, InboxMessage::new(id, "CreateOrder", "order-commands", "s1", b"{}".to_vec()))
            .await
            .unwrap();
        store.mark_as_pending(&mut conn, id).await.unwrap();
        // Simulated crash: no mark_as_completed call.

        let lookup = store.exists(&mut conn, id).await.unwrap();
        assert!(!lookup.already_completed());
    }

    #[tokio::test]
    async fn storing_the_same_message_id_twice_is_a_duplicate_not_an_upsert() {
        let pool = setup().await;
        let store = SqliteInboxStore::new();
        let mut conn = pool.acquire().await.unwrap();

        let id = Uuid::new_v4();
        store
            .store(&mut conn, InboxMessage::new(id, "CreateOrder", "order-commands", "s1", b"{}".to_vec()))
            .await
            .unwrap();
        store.mark_as_pending(&mut conn, id).await.unwrap();
        store.mark_as_completed(&mut conn, id).await.unwrap();

        let result = store
            .store(&mut conn, InboxMessage::new(id, "CreateOrder", "order-commands", "s1", b"{}".to_vec()))
            .await;
        assert!(matches!(result, Err(InboxError::Duplicate)));

        // The losing insert must not have reset a completed row back to init.
        let lookup = store.exists(&mut conn, id).await.unwrap();
        assert!(lookup.already_completed());
    }
}
