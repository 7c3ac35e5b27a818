//! SQLite saga repository, used by the `standalone` profile and by tests.
//!
//! Steps and payload are stored as serialized JSON text columns rather than
//! a native JSON column type, so the schema is identical in shape to the
//! PostgreSQL store (same `sea-query` statements, different query builder
//! dialect), matching the pattern already used by the outbox/inbox stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Expr, Iden, Query, SqliteQueryBuilder, Table};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::saga::{Saga, SagaStatus};

use super::{Result, SagaRepository, SagaRepositoryError};

#[derive(Iden)]
enum Sagas {
    Table,
    Id,
    CurrentStep,
    Status,
    Steps,
    Payload,
    Compensating,
    CompensationAttempts,
    ParkedReason,
    CreatedAt,
    UpdatedAt,
}

/// SQLite-backed `SagaRepository`.
pub struct SqliteSagaRepository;

impl SqliteSagaRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn init_schema(pool: &sqlx::SqlitePool) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Sagas::Table)
            .if_not_exists()
            .col(ColumnDef::new(Sagas::Id).text().primary_key())
            .col(ColumnDef::new(Sagas::CurrentStep).integer().not_null())
            .col(ColumnDef::new(Sagas::Status).text().not_null())
            .col(ColumnDef::new(Sagas::Steps).text().not_null())
            .col(ColumnDef::new(Sagas::Payload).text().not_null())
            .col(ColumnDef::new(Sagas::Compensating).boolean().not_null())
            .col(ColumnDef::new(Sagas::CompensationAttempts).integer().not_null())
            .col(ColumnDef::new(Sagas::ParkedReason).text())
            .col(ColumnDef::new(Sagas::CreatedAt).text().not_null())
            .col(ColumnDef::new(Sagas::UpdatedAt).text().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_table).execute(pool).await?;
        Ok(())
    }
}

impl Default for SqliteSagaRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_saga(row: &sqlx::sqlite::SqliteRow) -> Result<Saga> {
    let id_str: String = row.get("id");
    let status_str: String = row.get("status");
    let steps_json: String = row.get("steps");
    let payload_json: String = row.get("payload");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");

    Ok(Saga {
        id: Uuid::parse_str(&id_str).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?,
        current_step: row.get::<i64, _>("current_step") as i32,
        status: SagaStatus::from_str(&status_str)
            .ok_or_else(|| SagaRepositoryError::Serde(format!("unknown saga status {status_str}")))?,
        steps: serde_json::from_str(&steps_json).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?,
        payload: serde_json::from_str(&payload_json).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?,
        compensating: row.get::<i64, _>("compensating") != 0,
        compensation_attempts: row.get::<i64, _>("compensation_attempts") as u32,
        parked_reason: row.get("parked_reason"),
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl SagaRepository for SqliteSagaRepository {
    type Conn = SqliteConnection;

    async fn create(&self, conn: &mut SqliteConnection, saga: &Saga) -> Result<()> {
        let steps_json = serde_json::to_string(&saga.steps).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;
        let payload_json =
            serde_json::to_string(&saga.payload).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;

        let sql = Query::insert()
            .into_table(Sagas::Table)
            .columns([
                Sagas::Id,
                Sagas::CurrentStep,
                Sagas::Status,
                Sagas::Steps,
                Sagas::Payload,
                Sagas::Compensating,
                Sagas::CompensationAttempts,
                Sagas::ParkedReason,
                Sagas::CreatedAt,
                Sagas::UpdatedAt,
            ])
            .values_panic([
                saga.id.to_string().into(),
                (saga.current_step as i64).into(),
                saga.status.as_str().into(),
                steps_json.into(),
                payload_json.into(),
                saga.compensating.into(),
                (saga.compensation_attempts as i64).into(),
                saga.parked_reason.clone().into(),
                saga.created_at.to_rfc3339().into(),
                saga.updated_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&sql).execute(&mut *conn).await.map_err(|e| {
            if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) {
                SagaRepositoryError::AlreadyExists(saga.id)
            } else {
                SagaRepositoryError::from(e)
            }
        })?;
        Ok(())
    }

    async fn find(&self, conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Saga>> {
        let sql = Query::select()
            .columns([
                Sagas::Id,
                Sagas::CurrentStep,
                Sagas::Status,
                Sagas::Steps,
                Sagas::Payload,
                Sagas::Compensating,
                Sagas::CompensationAttempts,
                Sagas::ParkedReason,
                Sagas::CreatedAt,
                Sagas::UpdatedAt,
            ])
            .from(Sagas::Table)
            .and_where(Expr::col(Sagas::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        row.map(|r| row_to_saga(&r)).transpose()
    }

    async fn update(&self, conn: &mut SqliteConnection, saga: &Saga) -> Result<()> {
        let steps_json = serde_json::to_string(&saga.steps).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;
        let payload_json =
            serde_json::to_string(&saga.payload).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;

        let sql = Query::update()
            .table(Sagas::Table)
            .values([
                (Sagas::CurrentStep, (saga.current_step as i64).into()),
                (Sagas::Status, saga.status.as_str().into()),
                (Sagas::Steps, steps_json.into()),
                (Sagas::Payload, payload_json.into()),
                (Sagas::Compensating, saga.compensating.into()),
                (Sagas::CompensationAttempts, (saga.compensation_attempts as i64).into()),
                (Sagas::ParkedReason, saga.parked_reason.clone().into()),
                (Sagas::UpdatedAt, saga.updated_at.to_rfc3339().into()),
            ])
            .and_where(Expr::col(Sagas::Id).eq(saga.id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&sql).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(SagaRepositoryError::NotFound(saga.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::new_create_order_saga;
    use sqlx::SqlitePool;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteSagaRepository::init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let pool = setup().await;
        let repo = SqliteSagaRepository::new();
        let mut conn = pool.acquire().await.unwrap();

        let saga = new_create_order_saga("u1", "m1", vec![]);
        let id = saga.id;
        repo.create(&mut conn, &saga).await.unwrap();

        let found = repo.find(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, SagaStatus::Init);
        assert_eq!(found.steps.len(), 5);
    }

    #[tokio::test]
    async fn find_missing_returns_none() {
        let pool = setup().await;
        let repo = SqliteSagaRepository::new();
        let mut conn = pool.acquire().await.unwrap();

        assert!(repo.find(&mut conn, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_persists_mutated_fields() {
        let pool = setup().await;
        let repo = SqliteSagaRepository::new();
        let mut conn = pool.acquire().await.unwrap();

        let mut saga = new_create_order_saga("u1", "m1", vec![]);
        let id = saga.id;
        repo.create(&mut conn, &saga).await.unwrap();

        saga.current_step = 1;
        saga.status = SagaStatus::Running;
        repo.update(&mut conn, &saga).await.unwrap();

        let found = repo.find(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(found.current_step, 1);
        assert_eq!(found.status, SagaStatus::Running);
    }

    #[tokio::test]
    async fn update_missing_saga_is_not_found() {
        let pool = setup().await;
        let repo = SqliteSagaRepository::new();
        let mut conn = pool.acquire().await.unwrap();

        let saga = new_create_order_saga("u1", "m1", vec![]);
        let result = repo.update(&mut conn, &saga).await;
        assert!(matches!(result, Err(SagaRepositoryError::NotFound(_))));
    }
}
