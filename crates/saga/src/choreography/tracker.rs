use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::SagaId;
use domain::{
    ChoreographedSagaState, ChoreographedSagaStatus, ChoreographyStep, DomainError, SALE_SAGA_TYPE,
};
use event_bus::{
    ConsumeOutcome, ConsumerError, ConsumerResult, DomainEvent, EventConsumer, EventPublisher,
    EventType,
};
use saga_store::{ChoreographyRepository, ChoreographyRepositoryExt, StoreError};

use super::{ChoreographyConfig, decode_sale};
use crate::compensation::CompensationCoordinator;
use crate::error::{Result, SagaError};
use crate::events::{self, SalePayload, TRACKER_SOURCE, order_fulfillment_failed};

/// Follows the event-driven sale per correlation id.
///
/// Opens a tracking record on the first event of a correlation id, records
/// step outcomes, re-publishes the trigger of a failed first step, and
/// starts compensation once a later step fails.
pub struct SagaTracker {
    repository: Arc<dyn ChoreographyRepository>,
    compensation: CompensationCoordinator,
    publisher: Arc<dyn EventPublisher>,
    config: ChoreographyConfig,
}

impl SagaTracker {
    pub fn new(
        repository: Arc<dyn ChoreographyRepository>,
        compensation: CompensationCoordinator,
        publisher: Arc<dyn EventPublisher>,
        config: ChoreographyConfig,
    ) -> Self {
        Self {
            repository,
            compensation,
            publisher,
            config,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ChoreographyRepository> {
        &self.repository
    }

    pub async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ChoreographedSagaState>> {
        Ok(self.repository.find_by_correlation_id(correlation_id).await?)
    }

    pub async fn statistics(&self) -> Result<HashMap<ChoreographedSagaStatus, u64>> {
        Ok(self.repository.count_by_status().await?)
    }

    async fn track(&self, event: &DomainEvent) -> Result<ConsumeOutcome> {
        let sale = decode_sale(event).map_err(|e| SagaError::Validation(e.to_string()))?;
        let (state, created) = self.ensure_tracked(event, &sale).await?;
        if state.is_terminal() {
            tracing::debug!(saga_id = %state.saga_id(), status = %state.status(), "event for finished sale");
            return Ok(ConsumeOutcome::Duplicate);
        }
        let saga_id = state.saga_id();

        match &event.event_type {
            EventType::TransactionCreated => Ok(if created {
                ConsumeOutcome::Processed
            } else {
                ConsumeOutcome::Duplicate
            }),
            EventType::PaymentProcessed => {
                self.step_completed(saga_id, ChoreographyStep::Payment, event).await
            }
            EventType::InventoryReserved => {
                self.step_completed(saga_id, ChoreographyStep::Inventory, event).await
            }
            EventType::OrderFulfilled => {
                self.step_completed(saga_id, ChoreographyStep::Fulfillment, event).await
            }
            EventType::PaymentFailed => {
                self.step_failed(saga_id, ChoreographyStep::Payment, event, sale).await
            }
            EventType::InventoryUnavailable => {
                self.step_failed(saga_id, ChoreographyStep::Inventory, event, sale).await
            }
            other if *other == order_fulfillment_failed() => {
                self.step_failed(saga_id, ChoreographyStep::Fulfillment, event, sale).await
            }
            _ => Ok(ConsumeOutcome::Duplicate),
        }
    }

    /// Returns the tracking record, creating it from the first event seen.
    async fn ensure_tracked(
        &self,
        event: &DomainEvent,
        sale: &SalePayload,
    ) -> Result<(ChoreographedSagaState, bool)> {
        let repository: &dyn ChoreographyRepository = self.repository.as_ref();
        if let Some(state) = repository.find_by_correlation_id(&event.correlation_id).await? {
            return Ok((state, false));
        }

        let state = ChoreographedSagaState::new(
            sale.saga_id,
            event.correlation_id.clone(),
            SALE_SAGA_TYPE,
            Utc::now(),
        )
        .with_timeout(self.config.saga_timeout)
        .with_max_retries(self.config.max_retries)
        .with_saga_data(serde_json::to_value(sale.clone().without_failure())?);

        match repository.create(state).await {
            Ok(state) => {
                tracing::info!(saga_id = %state.saga_id(), correlation_id = %event.correlation_id, "tracking sale");
                metrics::counter!("saga_choreography_tracked_total").increment(1);
                Ok((state, true))
            }
            Err(StoreError::AlreadyExists(_)) => {
                let state = repository
                    .find_by_correlation_id(&event.correlation_id)
                    .await?
                    .ok_or_else(|| SagaError::NotFound(event.correlation_id.clone()))?;
                Ok((state, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn step_completed(
        &self,
        saga_id: SagaId,
        step: ChoreographyStep,
        event: &DomainEvent,
    ) -> Result<ConsumeOutcome> {
        let repository: &dyn ChoreographyRepository = self.repository.as_ref();
        let applied = repository
            .modify(saga_id, |s| {
                s.record_applied_event(event.event_id)?;
                s.mark_step_completed(step.completed_name())?;
                if step.is_final() && s.status() != ChoreographedSagaStatus::Compensating {
                    s.mark_completed()?;
                }
                Ok(())
            })
            .await;
        let updated = match applied {
            Ok(updated) => updated,
            Err(e) if already_applied(&e) => return Ok(reapplied(saga_id, event)),
            Err(e) => return Err(e.into()),
        };

        match updated.status() {
            ChoreographedSagaStatus::Completed => {
                metrics::counter!("saga_choreography_outcomes_total", "status" => "COMPLETED")
                    .increment(1);
                tracing::info!(%saga_id, correlation_id = updated.correlation_id(), "choreographed sale completed");
            }
            // A step that finished after compensation began still needs undoing.
            ChoreographedSagaStatus::Compensating => self.compensate(saga_id, event).await?,
            _ => {}
        }
        Ok(ConsumeOutcome::Processed)
    }

    async fn step_failed(
        &self,
        saga_id: SagaId,
        step: ChoreographyStep,
        event: &DomainEvent,
        sale: SalePayload,
    ) -> Result<ConsumeOutcome> {
        let reason = sale
            .reason
            .clone()
            .unwrap_or_else(|| format!("{} reported", event.event_type));
        let retryable = sale.retryable.unwrap_or(true);

        let repository: &dyn ChoreographyRepository = self.repository.as_ref();
        let applied = repository
            .modify(saga_id, |s| {
                s.record_applied_event(event.event_id)?;
                let untouched = s.completed_steps().is_empty()
                    && s.status() != ChoreographedSagaStatus::Compensating;
                if untouched && !retryable {
                    s.mark_failed(reason.clone())
                } else {
                    s.mark_step_failed(step.failed_name(), reason.clone()).map(|_| ())
                }
            })
            .await;
        let updated = match applied {
            Ok(updated) => updated,
            Err(e) if already_applied(&e) => return Ok(reapplied(saga_id, event)),
            Err(e) => return Err(e.into()),
        };

        match updated.status() {
            ChoreographedSagaStatus::Compensating => self.compensate(saga_id, event).await?,
            ChoreographedSagaStatus::Retrying => {
                self.retry(&updated, step, event, sale).await?;
            }
            ChoreographedSagaStatus::Failed => {
                metrics::counter!("saga_choreography_outcomes_total", "status" => "FAILED")
                    .increment(1);
                tracing::warn!(%saga_id, %reason, "choreographed sale failed");
            }
            _ => {}
        }
        Ok(ConsumeOutcome::Processed)
    }

    /// Publishes the event that triggers `step` again.
    async fn retry(
        &self,
        state: &ChoreographedSagaState,
        step: ChoreographyStep,
        cause: &DomainEvent,
        sale: SalePayload,
    ) -> Result<()> {
        let sale = sale.without_failure();
        let trigger = match step {
            ChoreographyStep::Payment => {
                let original = serde_json::from_value::<SalePayload>(state.saga_data().clone())
                    .unwrap_or(sale);
                events::transaction_created(&original, state.correlation_id(), Some(cause.event_id))?
            }
            ChoreographyStep::Inventory => {
                events::follow_up(EventType::PaymentProcessed, cause, &sale, TRACKER_SOURCE)?
            }
            ChoreographyStep::Fulfillment => {
                events::follow_up(EventType::InventoryReserved, cause, &sale, TRACKER_SOURCE)?
            }
        };
        self.publisher.publish(&trigger).await?;
        metrics::counter!("saga_choreography_retries_total", "step" => step.failed_name())
            .increment(1);
        tracing::info!(
            saga_id = %state.saga_id(),
            retry = state.retry_count(),
            max_retries = state.max_retries(),
            trigger = %trigger.event_type,
            "retrying choreographed step"
        );
        Ok(())
    }

    async fn compensate(&self, saga_id: SagaId, cause: &DomainEvent) -> Result<()> {
        match self
            .compensation
            .compensate_choreographed(self.repository.as_ref(), saga_id, Some(cause.event_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_compensation_not_required() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn already_applied(error: &StoreError) -> bool {
    matches!(error, StoreError::Domain(DomainError::EventAlreadyApplied { .. }))
}

fn reapplied(saga_id: SagaId, event: &DomainEvent) -> ConsumeOutcome {
    tracing::debug!(%saga_id, event_id = %event.event_id, "event already applied to sale");
    metrics::counter!("saga_choreography_duplicates_total").increment(1);
    ConsumeOutcome::Duplicate
}

#[async_trait]
impl EventConsumer for SagaTracker {
    fn name(&self) -> &str {
        "saga-tracker"
    }

    fn supported_types(&self) -> Vec<EventType> {
        vec![
            EventType::TransactionCreated,
            EventType::PaymentProcessed,
            EventType::PaymentFailed,
            EventType::InventoryReserved,
            EventType::InventoryUnavailable,
            EventType::OrderFulfilled,
            order_fulfillment_failed(),
        ]
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, correlation_id = %event.correlation_id))]
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        self.track(event).await.map_err(ConsumerError::from)
    }
}
