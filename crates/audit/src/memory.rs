use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use tokio::sync::RwLock;

use crate::level::AuditLevel;
use crate::log::AuditLog;
use crate::query::{AuditCriteria, AuditStatistics, Page, PageRequest, causal_order};
use crate::repository::AuditRepository;
use crate::{AuditError, Result};

#[derive(Default)]
struct Rows {
    logs: Vec<AuditLog>,
    event_ids: HashSet<EventId>,
    next_id: i64,
}

/// In-memory audit trail.
#[derive(Clone, Default)]
pub struct InMemoryAuditRepository {
    rows: Arc<RwLock<Rows>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.logs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.logs.is_empty()
    }

    pub async fn all(&self) -> Vec<AuditLog> {
        self.rows.read().await.logs.clone()
    }
}

fn newest_first(logs: &mut [AuditLog]) {
    logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn record(&self, log: &AuditLog) -> Result<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("audit store is offline".into()));
        }
        let mut rows = self.rows.write().await;
        if !rows.event_ids.insert(log.event_id) {
            return Ok(false);
        }
        rows.next_id += 1;
        let mut stored = log.clone();
        stored.id = rows.next_id;
        rows.logs.push(stored);
        Ok(true)
    }

    async fn find_by_event_id(&self, event_id: EventId) -> Result<Option<AuditLog>> {
        let rows = self.rows.read().await;
        Ok(rows.logs.iter().find(|l| l.event_id == event_id).cloned())
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<AuditLog>> {
        let rows = self.rows.read().await;
        let trace = rows
            .logs
            .iter()
            .filter(|l| l.correlation_id == correlation_id)
            .cloned()
            .collect();
        Ok(causal_order(trace))
    }

    async fn find_by_aggregate_id(&self, aggregate_id: &str) -> Result<Vec<AuditLog>> {
        let rows = self.rows.read().await;
        let mut found: Vec<_> = rows
            .logs
            .iter()
            .filter(|l| l.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    async fn search(&self, criteria: &AuditCriteria, page: PageRequest) -> Result<Page<AuditLog>> {
        let rows = self.rows.read().await;
        let mut matching: Vec<_> = rows.logs.iter().filter(|l| criteria.matches(l)).cloned().collect();
        newest_first(&mut matching);
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.size as usize)
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn find_critical_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLog>> {
        let rows = self.rows.read().await;
        let mut found: Vec<_> = rows
            .logs
            .iter()
            .filter(|l| l.level == AuditLevel::Critical && l.timestamp >= since)
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    async fn statistics(&self) -> Result<AuditStatistics> {
        Ok(AuditStatistics::from_logs(&self.rows.read().await.logs))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.logs.len();
        rows.logs.retain(|l| l.timestamp >= cutoff);
        let kept: HashSet<EventId> = rows.logs.iter().map(|l| l.event_id).collect();
        rows.event_ids = kept;
        Ok((before - rows.logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::AuditRepositoryExt;
    use chrono::Duration;
    use event_bus::{DomainEvent, EventType};

    fn log_at(event_type: EventType, correlation: &str, at: DateTime<Utc>) -> AuditLog {
        let event = DomainEvent::builder(event_type)
            .aggregate_id("S-1")
            .correlation_id(correlation)
            .timestamp(at)
            .build()
            .unwrap();
        AuditLog::from_event(&event)
    }

    #[tokio::test]
    async fn one_row_per_event_id() {
        let repo = InMemoryAuditRepository::new();
        let log = log_at(EventType::PaymentProcessed, "c-1", Utc::now());
        assert!(repo.record(&log).await.unwrap());
        assert!(!repo.record(&log).await.unwrap());
        assert_eq!(repo.len().await, 1);
        assert_eq!(repo.find_by_event_id(log.event_id).await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn paged_queries() {
        let repo = InMemoryAuditRepository::new();
        let now = Utc::now();
        for (i, event_type) in [
            EventType::TransactionCreated,
            EventType::PaymentFailed,
            EventType::OrderFulfilled,
            EventType::TransactionCancelled,
        ]
        .into_iter()
        .enumerate()
        {
            repo.record(&log_at(event_type, "c-1", now + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }

        let recent = repo.recent(PageRequest::new(0, 2)).await.unwrap();
        assert_eq!(recent.total, 4);
        assert_eq!(recent.items[0].event_type, "TransactionCancelled");

        let critical = repo.find_by_level(AuditLevel::Critical, PageRequest::default()).await.unwrap();
        assert_eq!(critical.total, 2);
        let compliance = repo.compliance(PageRequest::default()).await.unwrap();
        assert_eq!(compliance.total, 3);
        let since = repo.find_critical_since(now + Duration::seconds(2)).await.unwrap();
        assert_eq!(since.len(), 1);

        let stats = repo.statistics().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.count_at(AuditLevel::Critical), 2);
        assert_eq!(stats.by_service.get("transaction-service"), Some(&2));
    }

    #[tokio::test]
    async fn purge_forgets_event_ids() {
        let repo = InMemoryAuditRepository::new();
        let old = log_at(EventType::SaleConfirmed, "c-1", Utc::now() - Duration::days(100));
        repo.record(&old).await.unwrap();
        assert_eq!(repo.purge_before(Utc::now() - Duration::days(90)).await.unwrap(), 1);
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn offline_store_rejects_writes() {
        let repo = InMemoryAuditRepository::new();
        repo.set_unavailable(true);
        let log = log_at(EventType::SaleConfirmed, "c-1", Utc::now());
        assert!(matches!(repo.record(&log).await, Err(AuditError::Unavailable(_))));
    }
}
