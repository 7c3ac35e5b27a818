//! PostgreSQL saga repository.
//!
//! Schema matches the logical `sagas` table (`id`, `current_step`,
//! `status`, `steps JSON`, `payload JSON`, `compensating`, timestamps), plus
//! `compensation_attempts`/`parked_reason` for the compensation retry policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Expr, Iden, PostgresQueryBuilder, Query, Table};
use sqlx::{PgConnection, Row};
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

/// PostgreSQL-backed `SagaRepository`.
pub struct PostgresSagaRepository;

impl PostgresSagaRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn init_schema(pool: &sqlx::PgPool) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Sagas::Table)
            .if_not_exists()
            .col(ColumnDef::new(Sagas::Id).uuid().primary_key())
            .col(ColumnDef::new(Sagas::CurrentStep).integer().not_null())
            .col(ColumnDef::new(Sagas::Status).text().not_null())
            .col(ColumnDef::new(Sagas::Steps).json_binary().not_null())
            .col(ColumnDef::new(Sagas::Payload).json_binary().not_null())
            .col(ColumnDef::new(Sagas::Compensating).boolean().not_null())
            .col(ColumnDef::new(Sagas::CompensationAttempts).integer().not_null())
            .col(ColumnDef::new(Sagas::ParkedReason).text())
            .col(
                ColumnDef::new(Sagas::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .col(
                ColumnDef::new(Sagas::UpdatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_table).execute(pool).await?;
        Ok(())
    }
}

impl Default for PostgresSagaRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_saga(row: &sqlx::postgres::PgRow) -> Result<Saga> {
    let status_str: String = row.get("status");
    let steps_json: serde_json::Value = row.get("steps");
    let payload_json: serde_json::Value = row.get("payload");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Saga {
        id: row.get("id"),
        current_step: row.get("current_step"),
        status: SagaStatus::from_str(&status_str)
            .ok_or_else(|| SagaRepositoryError::Serde(format!("unknown saga status {status_str}")))?,
        steps: serde_json::from_value(steps_json).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?,
        payload: serde_json::from_value(payload_json).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?,
        compensating: row.get("compensating"),
        compensation_attempts: row.get::<i32, _>("compensation_attempts") as u32,
        parked_reason: row.get("parked_reason"),
        created_at,
        updated_at,
    })
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    type Conn = PgConnection;

    async fn create(&self, conn: &mut PgConnection, saga: &Saga) -> Result<()> {
        let steps_json =
            serde_json::to_value(&saga.steps).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;
        let payload_json =
            serde_json::to_value(&saga.payload).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;

        sqlx::query(
            "INSERT INTO sagas (id, current_step, status, steps, payload, compensating, compensation_attempts, parked_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(saga.id)
        .bind(saga.current_step)
        .bind(saga.status.as_str())
        .bind(&steps_json)
        .bind(&payload_json)
        .bind(saga.compensating)
        .bind(saga.compensation_attempts as i32)
        .bind(&saga.parked_reason)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) {
                SagaRepositoryError::AlreadyExists(saga.id)
            } else {
                SagaRepositoryError::from(e)
            }
        })?;
        Ok(())
    }

    async fn find(&self, conn: &mut PgConnection, id: Uuid) -> Result<Option<Saga>> {
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
            .and_where(Expr::col(Sagas::Id).eq(id))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        row.map(|r| row_to_saga(&r)).transpose()
    }

    async fn update(&self, conn: &mut PgConnection, saga: &Saga) -> Result<()> {
        let steps_json =
            serde_json::to_value(&saga.steps).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;
        let payload_json =
            serde_json::to_value(&saga.payload).map_err(|e| SagaRepositoryError::Serde(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE sagas SET current_step = $1, status = $2, steps = $3, payload = $4, compensating = $5, \
             compensation_attempts = $6, parked_reason = $7, updated_at = $8 WHERE id = $9",
        )
        .bind(saga.current_step)
        .bind(saga.status.as_str())
        .bind(&steps_json)
        .bind(&payload_json)
        .bind(saga.compensating)
        .bind(saga.compensation_attempts as i32)
        .bind(&saga.parked_reason)
        .bind(saga.updated_at)
        .bind(saga.id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaRepositoryError::NotFound(saga.id));
        }
        Ok(())
    }
}
