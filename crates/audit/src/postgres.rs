use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};

use crate::level::AuditLevel;
use crate::log::AuditLog;
use crate::query::{AuditCriteria, AuditStatistics, Page, PageRequest, causal_order};
use crate::repository::AuditRepository;
use crate::{AuditError, Result};

const COLUMNS: &str = "id, event_id, event_type, aggregate_id, aggregate_type, service_name, \
     audit_level, correlation_id, causation_id, event_version, timestamp, payload, metadata, \
     compliance_tags, business_context, requires_compliance_tracking, recorded_at";

/// PostgreSQL-backed audit trail.
///
/// The unique constraint on `event_id` makes `record` idempotent.
#[derive(Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_log(row: PgRow) -> Result<AuditLog> {
        let level: String = row.try_get("audit_level")?;
        Ok(AuditLog {
            id: row.try_get("id")?,
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            service_name: row.try_get("service_name")?,
            level: level
                .parse::<AuditLevel>()
                .map_err(|_| AuditError::Corrupt(format!("audit_level '{level}'")))?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row
                .try_get::<Option<uuid::Uuid>, _>("causation_id")?
                .map(EventId::from_uuid),
            event_version: row.try_get::<i64, _>("event_version")? as i32,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            compliance_tags: row.try_get("compliance_tags")?,
            business_context: row
                .try_get::<Option<String>, _>("business_context")?
                .unwrap_or_default(),
            requires_compliance_tracking: row.try_get("requires_compliance_tracking")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, criteria: &AuditCriteria) {
        builder.push(" WHERE TRUE");
        if let Some(event_type) = &criteria.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(service) = &criteria.service_name {
            builder.push(" AND service_name = ").push_bind(service.clone());
        }
        if let Some(level) = criteria.level {
            builder.push(" AND level_rank = ").push_bind(level.rank());
        }
        if let Some(from) = criteria.from {
            builder.push(" AND timestamp >= ").push_bind(from);
        }
        if let Some(to) = criteria.to {
            builder.push(" AND timestamp < ").push_bind(to);
        }
        if criteria.compliance_only {
            builder.push(" AND requires_compliance_tracking");
        }
    }

    async fn grouped_counts(&self, column: &str) -> Result<Vec<(String, i64)>> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS n FROM audit_logs GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("n")?)))
            .collect()
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn record(&self, log: &AuditLog) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs
                (event_id, event_type, aggregate_id, aggregate_type, service_name, audit_level,
                 level_rank, correlation_id, causation_id, event_version, timestamp, payload,
                 metadata, compliance_tags, business_context, requires_compliance_tracking,
                 recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(log.event_id.as_uuid())
        .bind(&log.event_type)
        .bind(&log.aggregate_id)
        .bind(&log.aggregate_type)
        .bind(&log.service_name)
        .bind(log.level.as_str())
        .bind(log.level.rank())
        .bind(&log.correlation_id)
        .bind(log.causation_id.map(|id| id.as_uuid()))
        .bind(i64::from(log.event_version))
        .bind(log.timestamp)
        .bind(&log.payload)
        .bind(&log.metadata)
        .bind(&log.compliance_tags)
        .bind(&log.business_context)
        .bind(log.requires_compliance_tracking)
        .bind(log.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_event_id(&self, event_id: EventId) -> Result<Option<AuditLog>> {
        let sql = format!("SELECT {COLUMNS} FROM audit_logs WHERE event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_log).transpose()
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<AuditLog>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM audit_logs WHERE correlation_id = $1 ORDER BY timestamp ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;
        let trace = rows.into_iter().map(Self::row_to_log).collect::<Result<Vec<_>>>()?;
        Ok(causal_order(trace))
    }

    async fn find_by_aggregate_id(&self, aggregate_id: &str) -> Result<Vec<AuditLog>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM audit_logs WHERE aggregate_id = $1 ORDER BY timestamp DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_log).collect()
    }

    async fn search(&self, criteria: &AuditCriteria, page: PageRequest) -> Result<Page<AuditLog>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_logs");
        Self::push_filters(&mut count, criteria);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM audit_logs"));
        Self::push_filters(&mut select, criteria);
        select
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(i64::from(page.size))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select.build().fetch_all(&self.pool).await?;
        let items = rows.into_iter().map(Self::row_to_log).collect::<Result<Vec<_>>>()?;

        Ok(Page::new(items, page, total.max(0) as u64))
    }

    async fn find_critical_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLog>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM audit_logs WHERE level_rank = $1 AND timestamp >= $2 \
             ORDER BY timestamp DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(AuditLevel::Critical.rank())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_log).collect()
    }

    async fn statistics(&self) -> Result<AuditStatistics> {
        let to_map = |counts: Vec<(String, i64)>| -> BTreeMap<String, u64> {
            counts.into_iter().map(|(k, n)| (k, n.max(0) as u64)).collect()
        };
        let by_event_type = to_map(self.grouped_counts("event_type").await?);
        let by_service = to_map(self.grouped_counts("service_name").await?);
        let mut by_level = BTreeMap::new();
        for (name, n) in self.grouped_counts("audit_level").await? {
            let level = name
                .parse::<AuditLevel>()
                .map_err(|_| AuditError::Corrupt(format!("audit_level '{name}'")))?;
            by_level.insert(level, n.max(0) as u64);
        }

        Ok(AuditStatistics {
            total: by_event_type.values().sum(),
            by_event_type,
            by_service,
            by_level,
        })
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
