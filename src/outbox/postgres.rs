//! PostgreSQL outbox store.
//!
//! `sea-query` builds the SQL, `sqlx` executes it. The outbox carries a
//! four-state lifecycle (`init`/`pending`/`sent`/`error`) so that concurrent
//! relay instances can claim rows safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Expr, Iden, Index, Order, PostgresQueryBuilder, Query, Table};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use super::{OutboxError, OutboxMessage, OutboxStatus, OutboxStore, Result};

#[derive(Iden)]
enum Outbox {
    Table,
    Id,
    Topic,
    Key,
    Payload,
    Status,
    CreatedAt,
}

/// PostgreSQL-backed `OutboxStore`.
pub struct PostgresOutboxStore;

impl PostgresOutboxStore {
    pub fn new() -> Self {
        Self
    }

    /// Create the outbox table and its `(status, created_at)` index.
    pub async fn init_schema(pool: &sqlx::PgPool) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).uuid().primary_key())
            .col(ColumnDef::new(Outbox::Topic).text().not_null())
            .col(ColumnDef::new(Outbox::Key).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).binary().not_null())
            .col(ColumnDef::new(Outbox::Status).text().not_null())
            .col(
                ColumnDef::new(Outbox::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_table).execute(pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name("idx_outbox_status_created_at")
            .table(Outbox::Table)
            .col(Outbox::Status)
            .col(Outbox::CreatedAt)
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_index).execute(pool).await?;

        Ok(())
    }
}

impl Default for PostgresOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> OutboxMessage {
    let status_str: String = row.get("status");
    OutboxMessage {
        id: row.get("id"),
        topic: row.get("topic"),
        key: row.get("key"),
        payload: row.get("payload"),
        status: OutboxStatus::from_str(&status_str).unwrap_or(OutboxStatus::Error),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Conn = PgConnection;

    async fn publish(&self, conn: &mut PgConnection, msg: OutboxMessage) -> Result<()> {
        let sql = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::Id,
                Outbox::Topic,
                Outbox::Key,
                Outbox::Payload,
                Outbox::Status,
                Outbox::CreatedAt,
            ])
            .values_panic([
                msg.id.to_string().into(),
                msg.topic.into(),
                msg.key.into(),
                msg.payload.into(),
                OutboxStatus::Init.as_str().into(),
                msg.created_at.into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    async fn get_not_sent(&self, conn: &mut PgConnection, limit: u32) -> Result<Vec<OutboxMessage>> {
        let sql = Query::select()
            .columns([
                Outbox::Id,
                Outbox::Topic,
                Outbox::Key,
                Outbox::Payload,
                Outbox::Status,
                Outbox::CreatedAt,
            ])
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Init.as_str()))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by(Outbox::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn batch_mark_as_pending(&self, conn: &mut PgConnection, ids: &[Uuid]) -> Result<()> {
        transition(conn, ids, OutboxStatus::Init, OutboxStatus::Pending).await
    }

    async fn batch_mark_as_sent(&self, conn: &mut PgConnection, ids: &[Uuid]) -> Result<()> {
        transition(conn, ids, OutboxStatus::Pending, OutboxStatus::Sent).await
    }

    async fn batch_mark_as_error(&self, conn: &mut PgConnection, ids: &[Uuid]) -> Result<()> {
        transition(conn, ids, OutboxStatus::Pending, OutboxStatus::Error).await
    }

    async fn reset_stale_pending(
        &self,
        conn: &mut PgConnection,
        older_than: chrono::Duration,
    ) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - older_than;
        let sql = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, OutboxStatus::Init.as_str())
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
            .and_where(Expr::col(Outbox::CreatedAt).lt(cutoff))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}

async fn transition(
    conn: &mut PgConnection,
    ids: &[Uuid],
    from: OutboxStatus,
    to: OutboxStatus,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let id_strs: Vec<sea_query::Value> = ids.iter().map(|id| id.to_string().into()).collect();
    let sql = Query::update()
        .table(Outbox::Table)
        .value(Outbox::Status, to.as_str())
        .and_where(Expr::col(Outbox::Id).is_in(id_strs))
        .and_where(Expr::col(Outbox::Status).eq(from.as_str()))
        .to_string(PostgresQueryBuilder);

    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    if result.rows_affected() < ids.len() as u64 {
        return Err(OutboxError::NoOp);
    }
    Ok(())
}
