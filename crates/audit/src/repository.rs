use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;

use crate::Result;
use crate::level::AuditLevel;
use crate::log::AuditLog;
use crate::query::{AuditCriteria, AuditStatistics, Page, PageRequest};

/// Append-only store of audit rows.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Stores `log` unless its event id is already present. Returns `false`
    /// for a duplicate.
    async fn record(&self, log: &AuditLog) -> Result<bool>;

    async fn find_by_event_id(&self, event_id: EventId) -> Result<Option<AuditLog>>;

    /// Every row of a correlation id, causes before effects.
    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<AuditLog>>;

    /// Every row of an aggregate, newest first.
    async fn find_by_aggregate_id(&self, aggregate_id: &str) -> Result<Vec<AuditLog>>;

    /// Rows matching `criteria`, newest first.
    async fn search(&self, criteria: &AuditCriteria, page: PageRequest) -> Result<Page<AuditLog>>;

    /// CRITICAL rows at or after `since`, newest first.
    async fn find_critical_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLog>>;

    async fn statistics(&self) -> Result<AuditStatistics>;

    /// Deletes rows whose event timestamp is before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Paged shortcuts over [`AuditRepository::search`].
#[async_trait]
pub trait AuditRepositoryExt: AuditRepository {
    async fn recent(&self, page: PageRequest) -> Result<Page<AuditLog>> {
        self.search(&AuditCriteria::new(), page).await
    }

    async fn find_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<AuditLog>> {
        self.search(&AuditCriteria::new().between(Some(from), Some(to)), page)
            .await
    }

    async fn find_by_level(&self, level: AuditLevel, page: PageRequest) -> Result<Page<AuditLog>> {
        self.search(&AuditCriteria::new().with_level(level), page).await
    }

    async fn find_by_service(&self, service_name: &str, page: PageRequest) -> Result<Page<AuditLog>> {
        self.search(&AuditCriteria::new().with_service(service_name), page)
            .await
    }

    /// HIGH and CRITICAL rows.
    async fn compliance(&self, page: PageRequest) -> Result<Page<AuditLog>> {
        self.search(&AuditCriteria::new().compliance_only(), page).await
    }
}

impl<T: AuditRepository + ?Sized> AuditRepositoryExt for T {}
