use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, Version};
use domain::{ChoreographedSagaState, ChoreographedSagaStatus, SagaExecution, SagaState};

use crate::{Result, StoreError};

/// Upper bound on re-read-and-reapply rounds in a modify loop.
pub const MAX_MODIFY_ATTEMPTS: u32 = 5;

/// Storage for orchestrated sale records.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Stores a new record and returns its first version.
    ///
    /// Fails with `AlreadyExists` if the saga id is taken.
    async fn insert(&self, saga: &SagaExecution) -> Result<Version>;

    /// Overwrites the stored record if its version still equals
    /// `saga.version()`. Returns the new version.
    async fn update(&self, saga: &SagaExecution) -> Result<Version>;

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>>;

    /// Returns every non-terminal record.
    async fn find_active(&self) -> Result<Vec<SagaExecution>>;

    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>>;

    /// Deletes terminal records last updated before `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Storage for choreographed sale tracking records.
#[async_trait]
pub trait ChoreographyRepository: Send + Sync {
    /// Stores a new record. Both the saga id and the correlation id must be
    /// unused.
    async fn insert(&self, saga: &ChoreographedSagaState) -> Result<Version>;

    async fn update(&self, saga: &ChoreographedSagaState) -> Result<Version>;

    async fn get(&self, saga_id: SagaId) -> Result<Option<ChoreographedSagaState>>;

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ChoreographedSagaState>>;

    /// Non-terminal sagas whose `timeout_at` is before `now`.
    async fn find_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ChoreographedSagaState>>;

    /// Sagas in `Retrying` that have used all their retries.
    async fn find_retry_exhausted(&self) -> Result<Vec<ChoreographedSagaState>>;

    /// Sagas currently in `Compensating`.
    async fn find_compensating(&self) -> Result<Vec<ChoreographedSagaState>>;

    async fn count_by_status(&self) -> Result<HashMap<ChoreographedSagaStatus, u64>>;

    /// Deletes terminal records last updated before `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Convenience methods for orchestrated sale storage.
#[async_trait]
pub trait SagaRepositoryExt: SagaRepository {
    /// Loads the record, applies `mutate` and writes it back, re-reading and
    /// reapplying on a version conflict.
    async fn modify<F>(&self, saga_id: SagaId, mutate: F) -> Result<SagaExecution>
    where
        F: Fn(&mut SagaExecution) -> domain::Result<()> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut saga = self
                .get(saga_id)
                .await?
                .ok_or(StoreError::NotFound(saga_id))?;
            mutate(&mut saga)?;
            match self.update(&saga).await {
                Ok(version) => {
                    saga.set_version(version);
                    return Ok(saga);
                }
                Err(e) if e.is_conflict() && attempt < MAX_MODIFY_ATTEMPTS => {
                    metrics::counter!("saga_store_conflicts_total").increment(1);
                    tracing::debug!(%saga_id, attempt, "stale saga version, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Inserts a new record and returns it with its stored version.
    async fn create(&self, mut saga: SagaExecution) -> Result<SagaExecution> {
        let version = self.insert(&saga).await?;
        saga.set_version(version);
        Ok(saga)
    }
}

impl<T: SagaRepository + ?Sized> SagaRepositoryExt for T {}

/// Convenience methods for choreographed sale storage.
#[async_trait]
pub trait ChoreographyRepositoryExt: ChoreographyRepository {
    /// Loads the record, applies `mutate` and writes it back, re-reading and
    /// reapplying on a version conflict.
    async fn modify<F>(&self, saga_id: SagaId, mutate: F) -> Result<ChoreographedSagaState>
    where
        F: Fn(&mut ChoreographedSagaState) -> domain::Result<()> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut saga = self
                .get(saga_id)
                .await?
                .ok_or(StoreError::NotFound(saga_id))?;
            mutate(&mut saga)?;
            match self.update(&saga).await {
                Ok(version) => {
                    saga.set_version(version);
                    return Ok(saga);
                }
                Err(e) if e.is_conflict() && attempt < MAX_MODIFY_ATTEMPTS => {
                    metrics::counter!("saga_store_conflicts_total").increment(1);
                    tracing::debug!(%saga_id, attempt, "stale choreography version, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create(&self, mut saga: ChoreographedSagaState) -> Result<ChoreographedSagaState> {
        let version = self.insert(&saga).await?;
        saga.set_version(version);
        Ok(saga)
    }
}

impl<T: ChoreographyRepository + ?Sized> ChoreographyRepositoryExt for T {}
