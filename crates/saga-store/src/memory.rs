use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use common::{SagaId, Version};
use domain::{ChoreographedSagaState, ChoreographedSagaStatus, SagaExecution, SagaState};

use crate::{
    Result, StoreError,
    repository::{ChoreographyRepository, SagaRepository},
};

/// In-memory saga store for tests and database-less deployments.
///
/// Implements both repository traits with the same version semantics as
/// the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    executions: Arc<RwLock<HashMap<SagaId, SagaExecution>>>,
    choreographies: Arc<RwLock<HashMap<SagaId, ChoreographedSagaState>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of orchestrated records held.
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }

    /// Number of choreographed records held.
    pub async fn choreography_count(&self) -> usize {
        self.choreographies.read().await.len()
    }

    pub async fn clear(&self) {
        self.executions.write().await.clear();
        self.choreographies.write().await.clear();
    }
}

fn check_version(saga_id: SagaId, expected: Version, actual: Version) -> Result<()> {
    if expected != actual {
        return Err(StoreError::ConcurrencyConflict {
            saga_id,
            expected,
            actual,
        });
    }
    Ok(())
}

#[async_trait]
impl SagaRepository for InMemorySagaStore {
    async fn insert(&self, saga: &SagaExecution) -> Result<Version> {
        let mut store = self.executions.write().await;
        if store.contains_key(&saga.saga_id()) {
            return Err(StoreError::AlreadyExists(saga.saga_id().to_string()));
        }
        let mut stored = saga.clone();
        stored.set_version(Version::first());
        store.insert(saga.saga_id(), stored);
        Ok(Version::first())
    }

    async fn update(&self, saga: &SagaExecution) -> Result<Version> {
        let mut store = self.executions.write().await;
        let current = store
            .get_mut(&saga.saga_id())
            .ok_or(StoreError::NotFound(saga.saga_id()))?;
        check_version(saga.saga_id(), saga.version(), current.version())?;

        let next = current.version().next();
        let mut stored = saga.clone();
        stored.set_version(next);
        *current = stored;
        Ok(next)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        Ok(self.executions.read().await.get(&saga_id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<SagaExecution>> {
        let store = self.executions.read().await;
        let mut active: Vec<_> = store.values().filter(|s| !s.is_terminal()).cloned().collect();
        active.sort_by_key(|s| s.updated_at());
        Ok(active)
    }

    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>> {
        let store = self.executions.read().await;
        let mut found: Vec<_> = store.values().filter(|s| s.state() == state).cloned().collect();
        found.sort_by_key(|s| s.updated_at());
        Ok(found)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut store = self.executions.write().await;
        let before = store.len();
        store.retain(|_, s| !(s.is_terminal() && s.updated_at() < cutoff));
        Ok((before - store.len()) as u64)
    }
}

#[async_trait]
impl ChoreographyRepository for InMemorySagaStore {
    async fn insert(&self, saga: &ChoreographedSagaState) -> Result<Version> {
        let mut store = self.choreographies.write().await;
        if store.contains_key(&saga.saga_id()) {
            return Err(StoreError::AlreadyExists(saga.saga_id().to_string()));
        }
        if store
            .values()
            .any(|s| s.correlation_id() == saga.correlation_id())
        {
            return Err(StoreError::AlreadyExists(saga.correlation_id().to_string()));
        }
        let mut stored = saga.clone();
        stored.set_version(Version::first());
        store.insert(saga.saga_id(), stored);
        Ok(Version::first())
    }

    async fn update(&self, saga: &ChoreographedSagaState) -> Result<Version> {
        let mut store = self.choreographies.write().await;
        let current = store
            .get_mut(&saga.saga_id())
            .ok_or(StoreError::NotFound(saga.saga_id()))?;
        check_version(saga.saga_id(), saga.version(), current.version())?;

        let next = current.version().next();
        let mut stored = saga.clone();
        stored.set_version(next);
        *current = stored;
        Ok(next)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<ChoreographedSagaState>> {
        Ok(self.choreographies.read().await.get(&saga_id).cloned())
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ChoreographedSagaState>> {
        let store = self.choreographies.read().await;
        Ok(store
            .values()
            .find(|s| s.correlation_id() == correlation_id)
            .cloned())
    }

    async fn find_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ChoreographedSagaState>> {
        let store = self.choreographies.read().await;
        let mut found: Vec<_> = store
            .values()
            .filter(|s| s.is_timed_out(now))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.timeout_at());
        Ok(found)
    }

    async fn find_retry_exhausted(&self) -> Result<Vec<ChoreographedSagaState>> {
        let store = self.choreographies.read().await;
        Ok(store
            .values()
            .filter(|s| s.status() == ChoreographedSagaStatus::Retrying && s.retries_exhausted())
            .cloned()
            .collect())
    }

    async fn find_compensating(&self) -> Result<Vec<ChoreographedSagaState>> {
        let store = self.choreographies.read().await;
        Ok(store
            .values()
            .filter(|s| s.status() == ChoreographedSagaStatus::Compensating)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<HashMap<ChoreographedSagaStatus, u64>> {
        let store = self.choreographies.read().await;
        let mut counts = HashMap::new();
        for saga in store.values() {
            *counts.entry(saga.status()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut store = self.choreographies.write().await;
        let before = store.len();
        store.retain(|_, s| !(s.is_terminal() && s.updated_at() < cutoff));
        Ok((before - store.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ChoreographyRepositoryExt, SagaRepositoryExt};
    use chrono::Duration;
    use common::Money;
    use domain::{DomainError, SALE_SAGA_TYPE, SagaStep};

    fn sale() -> SagaExecution {
        SagaExecution::new(SagaId::new(), "C1", "P1", 1, Money::from_cents(1000)).unwrap()
    }

    fn tracked() -> ChoreographedSagaState {
        let id = SagaId::new();
        ChoreographedSagaState::new(id, id.correlation_id(), SALE_SAGA_TYPE, Utc::now())
    }

    #[tokio::test]
    async fn insert_assigns_first_version() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let saga = sagas.create(sale()).await.unwrap();
        assert_eq!(saga.version(), Version::first());
        assert_eq!(sagas.get(saga.saga_id()).await.unwrap().unwrap(), saga);
        assert_eq!(store.execution_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let saga = sale();
        sagas.insert(&saga).await.unwrap();
        let err = sagas.insert(&saga).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let saga = sagas.create(sale()).await.unwrap();

        let mut first = saga.clone();
        let mut second = saga.clone();
        first.complete_step(SagaStep::VerifyStock).unwrap();
        sagas.update(&first).await.unwrap();

        second.fail(Some("late writer".into())).unwrap();
        let err = sagas.update(&second).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict { expected, actual, .. }
                if expected == Version::first() && actual == Version::new(2)
        ));

        let stored = sagas.get(saga.saga_id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), SagaState::StockVerified);
    }

    #[tokio::test]
    async fn modify_reapplies_on_latest_record() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let saga = sagas.create(sale()).await.unwrap();

        let updated = sagas
            .modify(saga.saga_id(), |s| s.complete_step(SagaStep::VerifyStock))
            .await
            .unwrap();
        assert_eq!(updated.version(), Version::new(2));

        let updated = sagas
            .modify(saga.saga_id(), |s| s.record_reservation("R-1"))
            .await
            .unwrap();
        assert_eq!(updated.state(), SagaState::StockVerified);
        assert_eq!(updated.reservation_id(), Some("R-1"));
        assert_eq!(updated.version(), Version::new(3));
    }

    #[tokio::test]
    async fn modify_surfaces_domain_rejection() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let saga = sagas.create(sale()).await.unwrap();
        let err = sagas
            .modify(saga.saga_id(), |s| s.complete_step(SagaStep::ConfirmOrder))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_modifies_all_land() {
        let store: Arc<dyn SagaRepository> = Arc::new(InMemorySagaStore::new());
        let saga = store.create(sale()).await.unwrap();
        let id = saga.saga_id();

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .modify(id, move |s| s.record_compensation_failure(format!("f{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.compensation_failures().len(), 4);
        assert_eq!(stored.version(), Version::new(5));
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_records() {
        let store = InMemorySagaStore::new();
        let sagas: &dyn SagaRepository = &store;
        let open = sagas.create(sale()).await.unwrap();
        let done = sagas.create(sale()).await.unwrap();
        sagas
            .modify(done.saga_id(), |s| s.fail(Some("x".into())))
            .await
            .unwrap();

        let purged = sagas
            .purge_terminal_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(sagas.get(open.saga_id()).await.unwrap().is_some());
        assert!(sagas.get(done.saga_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn correlation_id_is_unique() {
        let store = InMemorySagaStore::new();
        let tracker: &dyn ChoreographyRepository = &store;
        let saga = tracked();
        tracker.insert(&saga).await.unwrap();

        let clash = ChoreographedSagaState::new(
            SagaId::new(),
            saga.correlation_id(),
            SALE_SAGA_TYPE,
            Utc::now(),
        );
        let err = tracker.insert(&clash).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let found = tracker
            .find_by_correlation_id(saga.correlation_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.saga_id(), saga.saga_id());
    }

    #[tokio::test]
    async fn sweeper_queries() {
        let store = InMemorySagaStore::new();
        let tracker: &dyn ChoreographyRepository = &store;
        let now = Utc::now();

        let expired = tracked().with_timeout_at(now - Duration::seconds(1));
        tracker.insert(&expired).await.unwrap();

        let exhausted = tracker.create(tracked().with_max_retries(1)).await.unwrap();
        tracker
            .modify(exhausted.saga_id(), |s| {
                s.mark_step_failed("PaymentFailed", "declined").map(|_| ())
            })
            .await
            .unwrap();

        let timed_out = tracker.find_timed_out(now).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].saga_id(), expired.saga_id());

        let retry = tracker.find_retry_exhausted().await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].saga_id(), exhausted.saga_id());

        let counts = tracker.count_by_status().await.unwrap();
        assert_eq!(counts.get(&ChoreographedSagaStatus::Started), Some(&1));
        assert_eq!(counts.get(&ChoreographedSagaStatus::Retrying), Some(&1));
    }
}
