use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use common::{SagaId, Version};
use domain::{ChoreographedSagaState, ChoreographedSagaStatus, SagaExecution, SagaState};

use crate::{
    Result, StoreError,
    repository::{ChoreographyRepository, SagaRepository},
};

const TERMINAL_SAGA_STATES: [&str; 2] = ["CONFIRMED", "FAILED"];
const TERMINAL_CHOREOGRAPHY_STATUSES: [&str; 3] = ["COMPLETED", "FAILED", "COMPENSATED"];

/// PostgreSQL-backed saga store.
///
/// Each record is kept as a JSONB document next to the indexed columns the
/// sweeper queries need. Writes are conditional on the stored `version`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_execution(row: PgRow) -> Result<SagaExecution> {
        let data: serde_json::Value = row.try_get("data")?;
        let mut saga: SagaExecution = serde_json::from_value(data)?;
        saga.set_version(Version::new(row.try_get("version")?));
        Ok(saga)
    }

    fn row_to_choreography(row: PgRow) -> Result<ChoreographedSagaState> {
        let data: serde_json::Value = row.try_get("data")?;
        let mut saga: ChoreographedSagaState = serde_json::from_value(data)?;
        saga.set_version(Version::new(row.try_get("version")?));
        Ok(saga)
    }

    /// Explains a conditional write that touched no rows.
    async fn missed_write(&self, table: &str, saga_id: SagaId, expected: Version) -> StoreError {
        let sql = format!("SELECT version FROM {table} WHERE saga_id = $1");
        match sqlx::query_scalar::<_, i64>(&sql)
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(actual)) => StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: Version::new(actual),
            },
            Ok(None) => StoreError::NotFound(saga_id),
            Err(e) => StoreError::Database(e),
        }
    }
}

fn map_unique_violation(e: sqlx::Error, key: String) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return StoreError::AlreadyExists(key);
    }
    StoreError::Database(e)
}

#[async_trait]
impl SagaRepository for PostgresSagaStore {
    async fn insert(&self, saga: &SagaExecution) -> Result<Version> {
        let version = Version::first();
        let data = serde_json::to_value(saga)?;

        sqlx::query(
            r#"
            INSERT INTO saga_executions (saga_id, state, version, created_at, updated_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.state().as_str())
        .bind(version.as_i64())
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, saga.saga_id().to_string()))?;

        Ok(version)
    }

    async fn update(&self, saga: &SagaExecution) -> Result<Version> {
        let next = saga.version().next();
        let data = serde_json::to_value(saga)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_executions
            SET state = $3, version = $4, updated_at = $5, data = $6
            WHERE saga_id = $1 AND version = $2
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.version().as_i64())
        .bind(saga.state().as_str())
        .bind(next.as_i64())
        .bind(saga.updated_at())
        .bind(data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_write("saga_executions", saga.saga_id(), saga.version())
                .await);
        }
        Ok(next)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        let row = sqlx::query("SELECT version, data FROM saga_executions WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_execution).transpose()
    }

    async fn find_active(&self) -> Result<Vec<SagaExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT version, data FROM saga_executions
            WHERE state <> ALL($1)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(&TERMINAL_SAGA_STATES[..])
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_execution).collect()
    }

    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>> {
        let rows = sqlx::query(
            "SELECT version, data FROM saga_executions WHERE state = $1 ORDER BY updated_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_execution).collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM saga_executions WHERE state = ANY($1) AND updated_at < $2",
        )
        .bind(&TERMINAL_SAGA_STATES[..])
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ChoreographyRepository for PostgresSagaStore {
    async fn insert(&self, saga: &ChoreographedSagaState) -> Result<Version> {
        let version = Version::first();
        let data = serde_json::to_value(saga)?;

        sqlx::query(
            r#"
            INSERT INTO choreographed_sagas
                (saga_id, correlation_id, saga_type, status, retry_count, max_retries,
                 timeout_at, version, created_at, updated_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.correlation_id())
        .bind(saga.saga_type())
        .bind(saga.status().as_str())
        .bind(saga.retry_count() as i32)
        .bind(saga.max_retries() as i32)
        .bind(saga.timeout_at())
        .bind(version.as_i64())
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, saga.correlation_id().to_string()))?;

        Ok(version)
    }

    async fn update(&self, saga: &ChoreographedSagaState) -> Result<Version> {
        let next = saga.version().next();
        let data = serde_json::to_value(saga)?;

        let result = sqlx::query(
            r#"
            UPDATE choreographed_sagas
            SET status = $3, retry_count = $4, max_retries = $5, timeout_at = $6,
                version = $7, updated_at = $8, data = $9
            WHERE saga_id = $1 AND version = $2
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.version().as_i64())
        .bind(saga.status().as_str())
        .bind(saga.retry_count() as i32)
        .bind(saga.max_retries() as i32)
        .bind(saga.timeout_at())
        .bind(next.as_i64())
        .bind(saga.updated_at())
        .bind(data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_write("choreographed_sagas", saga.saga_id(), saga.version())
                .await);
        }
        Ok(next)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<ChoreographedSagaState>> {
        let row = sqlx::query("SELECT version, data FROM choreographed_sagas WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_choreography).transpose()
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ChoreographedSagaState>> {
        let row =
            sqlx::query("SELECT version, data FROM choreographed_sagas WHERE correlation_id = $1")
                .bind(correlation_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Self::row_to_choreography).transpose()
    }

    async fn find_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ChoreographedSagaState>> {
        let rows = sqlx::query(
            r#"
            SELECT version, data FROM choreographed_sagas
            WHERE status <> ALL($1) AND timeout_at < $2
            ORDER BY timeout_at ASC
            "#,
        )
        .bind(&TERMINAL_CHOREOGRAPHY_STATUSES[..])
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_choreography).collect()
    }

    async fn find_retry_exhausted(&self) -> Result<Vec<ChoreographedSagaState>> {
        let rows = sqlx::query(
            r#"
            SELECT version, data FROM choreographed_sagas
            WHERE status = 'RETRYING' AND retry_count >= max_retries
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_choreography).collect()
    }

    async fn find_compensating(&self) -> Result<Vec<ChoreographedSagaState>> {
        let rows =
            sqlx::query("SELECT version, data FROM choreographed_sagas WHERE status = 'COMPENSATING'")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Self::row_to_choreography).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<ChoreographedSagaStatus, u64>> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS total FROM choreographed_sagas GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            let status = status.parse().map_err(StoreError::Corrupt)?;
            counts.insert(status, total as u64);
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM choreographed_sagas WHERE status = ANY($1) AND updated_at < $2",
        )
        .bind(&TERMINAL_CHOREOGRAPHY_STATUSES[..])
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
