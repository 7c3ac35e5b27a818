//! PostgreSQL inbox store.

use async_trait::async_trait;
use sea_query::{ColumnDef, Expr, Iden, PostgresQueryBuilder, Query, Table};
use sqlx::{PgConnection, Row};
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

/// PostgreSQL-backed `InboxStore`.
pub struct PostgresInboxStore;

impl PostgresInboxStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn init_schema(pool: &sqlx::PgPool) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Inbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Inbox::MessageId).uuid().primary_key())
            .col(ColumnDef::new(Inbox::MessageType).text().not_null())
            .col(ColumnDef::new(Inbox::Topic).text().not_null())
            .col(ColumnDef::new(Inbox::Key).text().not_null())
            .col(ColumnDef::new(Inbox::Payload).binary().not_null())
            .col(ColumnDef::new(Inbox::Status).text().not_null())
            .col(
                ColumnDef::new(Inbox::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_table).execute(pool).await?;
        Ok(())
    }
}

impl Default for PostgresInboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboxStore for PostgresInboxStore {
    type Conn = PgConnection;

    async fn exists(&self, conn: &mut PgConnection, message_id: Uuid) -> Result<InboxLookup> {
        let sql = Query::select()
            .column(Inbox::Status)
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::MessageId).eq(message_id.to_string()))
            .to_string(PostgresQueryBuilder);

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

    async fn store(&self, conn: &mut PgConnection, msg: InboxMessage) -> Result<()> {
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
                msg.created_at.into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&sql).execute(&mut *conn).await.map_err(|e| {
            if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) {
                InboxError::Duplicate
            } else {
                InboxError::from(e)
            }
        })?;
        Ok(())
    }

    async fn mark_as_pending(&self, conn: &mut PgConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Init, InboxStatus::Pending).await
    }

    async fn mark_as_completed(&self, conn: &mut PgConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Pending, InboxStatus::Completed).await
    }

    async fn mark_as_error(&self, conn: &mut PgConnection, message_id: Uuid) -> Result<()> {
        transition(conn, message_id, InboxStatus::Pending, InboxStatus::Error).await
    }
}

async fn transition(
    conn: &mut PgConnection,
    message_id: Uuid,
    from: InboxStatus,
    to: InboxStatus,
) -> Result<()> {
    let sql = Query::update()
        .table(Inbox::Table)
        .value(Inbox::Status, to.as_str())
        .and_where(Expr::col(Inbox::MessageId).eq(message_id.to_string()))
        .and_where(Expr::col(Inbox::Status).eq(from.as_str()))
        .to_string(PostgresQueryBuilder);

    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(InboxError::NoOp);
    }
    Ok(())
}
