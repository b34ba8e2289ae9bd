//! Reverse actions for completed sale steps.
//!
//! A plan is derived from the completed step names of either saga record and
//! undoes them newest first. Every action is idempotent on the collaborator
//! side, so a plan can be re-run after a partial failure.

use std::sync::Arc;

use common::{EventId, SagaId};
use domain::{ChoreographedSagaStatus, DomainError, SagaExecution, SagaState};
use event_bus::{EventPublisher, EventType};
use saga_store::{
    ChoreographyRepository, ChoreographyRepositoryExt, SagaRepository, SagaRepositoryExt,
    StoreError,
};

use crate::error::Result;
use crate::events::{self, CompensationPayload};
use crate::resilience::{
    INVENTORY_SERVICE, ORDER_SERVICE, PAYMENT_SERVICE, ServiceBreakers, StepPolicy,
    retry_with_backoff,
};
use crate::services::SaleServices;

/// A reverse action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensationAction {
    CancelOrder,
    ReleaseStock,
    RefundPayment,
}

impl CompensationAction {
    /// Reverse action for a completed step name, if the step has one.
    pub fn for_step(step: &str) -> Option<Self> {
        match step {
            "StockReserved" | "InventoryReserved" => Some(CompensationAction::ReleaseStock),
            "PaymentProcessed" => Some(CompensationAction::RefundPayment),
            "OrderConfirmed" | "OrderFulfilled" => Some(CompensationAction::CancelOrder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationAction::CancelOrder => "cancel_order",
            CompensationAction::ReleaseStock => "release_stock",
            CompensationAction::RefundPayment => "refund_payment",
        }
    }

    pub fn service(&self) -> &'static str {
        match self {
            CompensationAction::CancelOrder => ORDER_SERVICE,
            CompensationAction::ReleaseStock => INVENTORY_SERVICE,
            CompensationAction::RefundPayment => PAYMENT_SERVICE,
        }
    }

    /// Event published when the action actually undid something.
    pub fn event_type(&self) -> EventType {
        match self {
            CompensationAction::CancelOrder => EventType::OrderCancelled,
            CompensationAction::ReleaseStock => EventType::InventoryReleased,
            CompensationAction::RefundPayment => EventType::PaymentRefunded,
        }
    }
}

impl std::fmt::Display for CompensationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered reverse actions for one saga.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompensationPlan {
    actions: Vec<CompensationAction>,
}

impl CompensationPlan {
    /// Reverse actions for `completed_steps`, last completed step first. A
    /// step recorded twice is undone once.
    pub fn from_steps<S: AsRef<str>>(completed_steps: &[S]) -> Self {
        let mut actions = Vec::new();
        for action in completed_steps
            .iter()
            .rev()
            .filter_map(|s| CompensationAction::for_step(s.as_ref()))
        {
            if !actions.contains(&action) {
                actions.push(action);
            }
        }
        Self { actions }
    }

    pub fn actions(&self) -> &[CompensationAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// An action that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    pub action: CompensationAction,
    /// Identifiers undone by the action; empty if there was nothing left to
    /// undo.
    pub references: Vec<String>,
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationReport {
    pub saga_id: SagaId,
    pub executed: Vec<ExecutedAction>,
    pub failures: Vec<String>,
}

impl CompensationReport {
    fn new(saga_id: SagaId) -> Self {
        Self {
            saga_id,
            executed: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// True when every planned action succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Actions that undid something.
    pub fn effective_actions(&self) -> impl Iterator<Item = CompensationAction> + '_ {
        self.executed
            .iter()
            .filter(|e| !e.references.is_empty())
            .map(|e| e.action)
    }
}

/// Runs compensation plans for both saga paths.
#[derive(Clone)]
pub struct CompensationCoordinator {
    services: SaleServices,
    publisher: Arc<dyn EventPublisher>,
    breakers: ServiceBreakers,
    policy: StepPolicy,
}

impl CompensationCoordinator {
    pub fn new(
        services: SaleServices,
        publisher: Arc<dyn EventPublisher>,
        breakers: ServiceBreakers,
        policy: StepPolicy,
    ) -> Self {
        Self {
            services,
            publisher,
            breakers,
            policy,
        }
    }

    /// Compensates an orchestrated sale that is in `COMPENSATING`.
    ///
    /// On success the sale moves to `FAILED` keeping its error message and a
    /// `SaleFailed` event is published. On failure it stays `COMPENSATING`
    /// with the failures recorded.
    #[tracing::instrument(skip(self, repository, cause), fields(path = "orchestrated"))]
    pub async fn compensate_execution(
        &self,
        repository: &dyn SagaRepository,
        saga_id: SagaId,
        cause: Option<EventId>,
    ) -> Result<CompensationReport> {
        let saga = repository
            .get(saga_id)
            .await?
            .ok_or(StoreError::NotFound(saga_id))?;
        if saga.state() != SagaState::Compensating {
            return Err(DomainError::CompensationNotRequired(saga_id).into());
        }

        let plan = CompensationPlan::from_steps(saga.completed_steps());
        let report = self
            .execute_plan(saga_id, &saga_id.correlation_id(), &plan, cause)
            .await;

        if report.is_complete() {
            let failed = repository.modify(saga_id, |s| s.fail(None)).await?;
            self.publish_sale_failed(&failed, cause).await;
            metrics::counter!("saga_compensations_total", "path" => "orchestrated", "outcome" => "completed")
                .increment(1);
            tracing::info!(%saga_id, actions = report.executed.len(), "sale compensated");
        } else {
            let failures = report.failures.clone();
            repository
                .modify(saga_id, |s| {
                    failures
                        .iter()
                        .try_for_each(|f| s.record_compensation_failure(f.clone()))
                })
                .await?;
            metrics::counter!("saga_compensations_total", "path" => "orchestrated", "outcome" => "incomplete")
                .increment(1);
            tracing::warn!(%saga_id, failures = ?report.failures, "sale compensation incomplete");
        }
        Ok(report)
    }

    /// Compensates a choreographed sale that is in `COMPENSATING`.
    ///
    /// The record reaches `COMPENSATED` only if every action succeeded.
    #[tracing::instrument(skip(self, repository, cause), fields(path = "choreographed"))]
    pub async fn compensate_choreographed(
        &self,
        repository: &dyn ChoreographyRepository,
        saga_id: SagaId,
        cause: Option<EventId>,
    ) -> Result<CompensationReport> {
        let saga = repository
            .get(saga_id)
            .await?
            .ok_or(StoreError::NotFound(saga_id))?;
        if saga.status() != ChoreographedSagaStatus::Compensating {
            return Err(DomainError::CompensationNotRequired(saga_id).into());
        }

        let plan = CompensationPlan::from_steps(saga.completed_steps());
        let report = self
            .execute_plan(saga_id, saga.correlation_id(), &plan, cause)
            .await;

        if report.is_complete() {
            repository
                .modify(saga_id, |s| s.mark_compensation_completed())
                .await?;
            metrics::counter!("saga_compensations_total", "path" => "choreographed", "outcome" => "completed")
                .increment(1);
            tracing::info!(%saga_id, correlation_id = saga.correlation_id(), "choreographed sale compensated");
        } else {
            let summary = report.failures.join("; ");
            repository
                .modify(saga_id, |s| s.record_compensation_failure(summary.clone()))
                .await?;
            metrics::counter!("saga_compensations_total", "path" => "choreographed", "outcome" => "incomplete")
                .increment(1);
            tracing::warn!(%saga_id, failures = %summary, "choreographed compensation incomplete");
        }
        Ok(report)
    }

    /// Undoes one step whose result could not be recorded on the sale, for
    /// example because the monitor moved it to `COMPENSATING` while the step
    /// was in flight.
    pub async fn undo_step(
        &self,
        saga_id: SagaId,
        completed_step: &str,
        cause: Option<EventId>,
    ) -> CompensationReport {
        let plan = CompensationPlan::from_steps(&[completed_step]);
        self.execute_plan(saga_id, &saga_id.correlation_id(), &plan, cause)
            .await
    }

    /// Runs every action of `plan`. A failed action is recorded and the
    /// remaining actions still run.
    pub async fn execute_plan(
        &self,
        saga_id: SagaId,
        correlation_id: &str,
        plan: &CompensationPlan,
        cause: Option<EventId>,
    ) -> CompensationReport {
        let mut report = CompensationReport::new(saga_id);
        for &action in plan.actions() {
            let breaker = self.breakers.for_service(action.service());
            let outcome = retry_with_backoff(action.as_str(), action.service(), &self.policy, breaker, || {
                self.run_action(action, saga_id)
            })
            .await;

            match outcome {
                Ok(references) => {
                    if !references.is_empty() {
                        self.publish_action(action, saga_id, correlation_id, cause, &references)
                            .await;
                    }
                    tracing::debug!(%saga_id, action = action.as_str(), ?references, "compensating action done");
                    report.executed.push(ExecutedAction { action, references });
                }
                Err(e) => {
                    tracing::error!(%saga_id, action = action.as_str(), error = %e, "compensating action failed");
                    metrics::counter!("saga_compensation_failures_total", "action" => action.as_str())
                        .increment(1);
                    report.failures.push(format!("{action}: {e}"));
                }
            }
        }
        report
    }

    async fn run_action(&self, action: CompensationAction, saga_id: SagaId) -> Result<Vec<String>> {
        match action {
            CompensationAction::CancelOrder => Ok(self
                .services
                .order
                .cancel_order(saga_id)
                .await?
                .into_iter()
                .collect()),
            CompensationAction::ReleaseStock => {
                self.services.inventory.release_reservation(saga_id).await
            }
            CompensationAction::RefundPayment => Ok(self
                .services
                .payment
                .refund_payment(saga_id)
                .await?
                .into_iter()
                .collect()),
        }
    }

    async fn publish_action(
        &self,
        action: CompensationAction,
        saga_id: SagaId,
        correlation_id: &str,
        cause: Option<EventId>,
        references: &[String],
    ) {
        let payload = CompensationPayload {
            saga_id,
            action: action.as_str().to_string(),
            references: references.to_vec(),
        };
        match events::compensation_event(action.event_type(), correlation_id, cause, &payload) {
            Ok(event) => {
                events::publish_logged(self.publisher.as_ref(), &event).await;
            }
            Err(e) => tracing::error!(%saga_id, error = %e, "compensation event rejected"),
        }
    }

    /// Publishes `SaleFailed` for a sale that reached `FAILED`.
    pub(crate) async fn publish_sale_failed(&self, saga: &SagaExecution, cause: Option<EventId>) {
        match events::sale_event(EventType::SaleFailed, saga, cause) {
            Ok(event) => {
                events::publish_logged(self.publisher.as_ref(), &event).await;
            }
            Err(e) => tracing::error!(saga_id = %saga.saga_id(), error = %e, "sale failed event rejected"),
        }
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }
}
