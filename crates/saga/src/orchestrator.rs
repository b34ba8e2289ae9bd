//! Central coordinator for the orchestrated sale.

use std::sync::Arc;

use common::{EventId, Money, SagaId};
use domain::{SagaExecution, SagaState, SagaStep};
use event_bus::{EventPublisher, EventType};
use saga_store::{SagaRepository, SagaRepositoryExt, StoreError};

use crate::compensation::CompensationCoordinator;
use crate::error::{Result, SagaError};
use crate::events;
use crate::resilience::{CircuitBreakerConfig, ServiceBreakers, StepPolicy, retry_with_backoff};
use crate::services::SaleServices;

/// Tunables for the orchestrated sale.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Applied to every forward step.
    pub step_policy: StepPolicy,
    /// Applied to every compensating action.
    pub compensation_policy: StepPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_policy: StepPolicy::default().with_timeout(std::time::Duration::from_secs(5)),
            compensation_policy: StepPolicy::default().with_max_attempts(5),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_step_policy(mut self, policy: StepPolicy) -> Self {
        self.step_policy = policy;
        self
    }

    pub fn with_compensation_policy(mut self, policy: StepPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// A sale to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleRequest {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: Money,
}

impl SaleRequest {
    pub fn new(
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            amount,
        }
    }

    pub fn validate(&self) -> Result<()> {
        domain::validate_sale(&self.customer_id, &self.product_id, self.quantity, self.amount)?;
        Ok(())
    }
}

/// Where a sale ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleOutcome {
    pub saga_id: SagaId,
    pub state: SagaState,
}

/// What a forward step produced.
enum StepOutput {
    Verified,
    Reserved(String),
    Paid(String),
    Confirmed(String),
}

/// Drives a sale through verify, reserve, pay and confirm.
///
/// Each step runs under its own timeout, bounded retry and the
/// collaborator's circuit breaker. A step that cannot complete stops the
/// sequence; completed steps are then compensated.
#[derive(Clone)]
pub struct SagaOrchestrator {
    repository: Arc<dyn SagaRepository>,
    services: SaleServices,
    publisher: Arc<dyn EventPublisher>,
    breakers: ServiceBreakers,
    policy: StepPolicy,
    compensation: CompensationCoordinator,
}

impl SagaOrchestrator {
    pub fn new(
        repository: Arc<dyn SagaRepository>,
        services: SaleServices,
        publisher: Arc<dyn EventPublisher>,
        config: OrchestratorConfig,
    ) -> Self {
        let breakers = ServiceBreakers::new(&config.circuit_breaker);
        let compensation = CompensationCoordinator::new(
            services.clone(),
            Arc::clone(&publisher),
            breakers.clone(),
            config.compensation_policy,
        );
        Self {
            repository,
            services,
            publisher,
            breakers,
            policy: config.step_policy,
            compensation,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SagaRepository> {
        &self.repository
    }

    pub fn compensation(&self) -> &CompensationCoordinator {
        &self.compensation
    }

    pub fn breakers(&self) -> &ServiceBreakers {
        &self.breakers
    }

    /// Runs a new sale under a fresh saga id.
    pub async fn execute_sale(&self, request: SaleRequest) -> Result<SaleOutcome> {
        self.execute_sale_with_id(SagaId::new(), request).await
    }

    /// Runs a sale under `saga_id`.
    ///
    /// If the saga id is already stored, its current state is returned and no
    /// step is re-run.
    #[tracing::instrument(
        skip(self, saga_id, request),
        fields(%saga_id, customer_id = %request.customer_id, product_id = %request.product_id)
    )]
    pub async fn execute_sale_with_id(
        &self,
        saga_id: SagaId,
        request: SaleRequest,
    ) -> Result<SaleOutcome> {
        let execution = SagaExecution::new(
            saga_id,
            request.customer_id,
            request.product_id,
            request.quantity,
            request.amount,
        )?;

        if let Some(existing) = self.repository.get(saga_id).await? {
            tracing::info!(state = %existing.state(), "sale already started, returning current state");
            return Ok(outcome_of(&existing));
        }
        let mut saga = match self.repository.create(execution).await {
            Ok(saga) => saga,
            Err(StoreError::AlreadyExists(_)) => {
                let existing = self.load(saga_id).await?;
                return Ok(outcome_of(&existing));
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!("saga_executions_total").increment(1);
        let started = std::time::Instant::now();
        let mut cause: Option<EventId> = None;

        for step in SagaStep::SEQUENCE {
            tracing::info!(step = step.as_str(), "saga step started");
            let output = match self.run_step(&saga, step).await {
                Ok(output) => output,
                Err(error) => {
                    let outcome = self.handle_step_failure(saga_id, step, error, cause).await?;
                    record_duration(started, outcome.state);
                    return Ok(outcome);
                }
            };

            saga = match self
                .repository
                .modify(saga_id, |s| apply_step(s, step, &output))
                .await
            {
                Ok(saga) => saga,
                Err(StoreError::Domain(e)) => {
                    // The monitor moved the sale on while the step was in flight.
                    tracing::warn!(step = step.as_str(), error = %e, "sale changed underneath the orchestrator");
                    let current = self.load(saga_id).await?;
                    if !current.has_completed(step) {
                        let report = self
                            .compensation
                            .undo_step(saga_id, step.completed_name(), cause)
                            .await;
                        if !report.is_complete() {
                            tracing::error!(step = step.as_str(), failures = ?report.failures, "could not undo unrecorded step");
                        }
                    }
                    record_duration(started, current.state());
                    return Ok(outcome_of(&current));
                }
                Err(e) => return Err(e.into()),
            };

            let event = events::sale_event(step_event(step), &saga, cause)?;
            cause = events::publish_logged(self.publisher.as_ref(), &event)
                .await
                .or(cause);
            tracing::info!(step = step.as_str(), state = %saga.state(), "saga step completed");
        }

        record_duration(started, saga.state());
        tracing::info!(
            reservation_id = ?saga.reservation_id(),
            transaction_id = ?saga.payment_transaction_id(),
            order_id = ?saga.order_id(),
            "sale confirmed"
        );
        Ok(outcome_of(&saga))
    }

    /// Loads a sale by id.
    pub async fn get_sale(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.load(saga_id).await
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.repository
            .get(saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(saga_id.to_string()))
    }

    async fn run_step(&self, saga: &SagaExecution, step: SagaStep) -> Result<StepOutput> {
        let breaker = self.breakers.for_service(step.service());
        let saga_id = saga.saga_id();
        let product_id = saga.product_id();
        let quantity = saga.quantity();

        match step {
            SagaStep::VerifyStock => {
                let check = retry_with_backoff(step.as_str(), step.service(), &self.policy, breaker, || {
                    self.services.inventory.verify_stock(product_id, quantity, saga_id)
                })
                .await?;
                if !check.available {
                    return Err(SagaError::BusinessRejected {
                        service: step.service(),
                        reason: format!(
                            "Insufficient stock for {product_id}: requested {quantity}, available {}",
                            check.available_quantity
                        ),
                    });
                }
                Ok(StepOutput::Verified)
            }
            SagaStep::ReserveStock => {
                let reservation = retry_with_backoff(step.as_str(), step.service(), &self.policy, breaker, || {
                    self.services.inventory.reserve_stock(product_id, quantity, saga_id)
                })
                .await?;
                Ok(StepOutput::Reserved(reservation.reservation_id))
            }
            SagaStep::ProcessPayment => {
                let receipt = retry_with_backoff(step.as_str(), step.service(), &self.policy, breaker, || {
                    self.services
                        .payment
                        .process_payment(saga.customer_id(), saga.amount(), saga_id)
                })
                .await?;
                Ok(StepOutput::Paid(receipt.transaction_id))
            }
            SagaStep::ConfirmOrder => {
                let confirmation = retry_with_backoff(step.as_str(), step.service(), &self.policy, breaker, || {
                    self.services.order.confirm_order(
                        saga_id,
                        saga.customer_id(),
                        product_id,
                        quantity,
                        saga.amount(),
                    )
                })
                .await?;
                Ok(StepOutput::Confirmed(confirmation.order_id))
            }
        }
    }

    /// Stops the forward sequence: compensates completed steps if there are
    /// any, otherwise fails the sale directly.
    async fn handle_step_failure(
        &self,
        saga_id: SagaId,
        step: SagaStep,
        error: SagaError,
        cause: Option<EventId>,
    ) -> Result<SaleOutcome> {
        let message = error.to_string();
        tracing::warn!(step = step.as_str(), error = %message, kind = ?error.kind(), "saga step failed");
        metrics::counter!("saga_step_failures_total", "step" => step.as_str()).increment(1);

        let current = self.load(saga_id).await?;
        if current.is_terminal() {
            return Ok(outcome_of(&current));
        }

        if has_compensable_progress(current.state()) {
            self.repository
                .modify(saga_id, |s| s.begin_compensation(message.clone()))
                .await?;
            let report = self
                .compensation
                .compensate_execution(self.repository.as_ref(), saga_id, cause)
                .await?;
            let state = if report.is_complete() {
                SagaState::Failed
            } else {
                SagaState::Compensating
            };
            return Ok(SaleOutcome { saga_id, state });
        }

        let failed = self
            .repository
            .modify(saga_id, |s| s.fail(Some(message.clone())))
            .await?;
        self.compensation.publish_sale_failed(&failed, cause).await;
        Ok(outcome_of(&failed))
    }
}

/// True when the sale holds something a reverse action must undo.
pub fn has_compensable_progress(state: SagaState) -> bool {
    matches!(state, SagaState::StockReserved | SagaState::PaymentProcessed)
}

fn apply_step(saga: &mut SagaExecution, step: SagaStep, output: &StepOutput) -> domain::Result<()> {
    match output {
        StepOutput::Verified => {}
        StepOutput::Reserved(id) => saga.record_reservation(id.clone())?,
        StepOutput::Paid(id) => saga.record_payment(id.clone())?,
        StepOutput::Confirmed(id) => saga.record_order(id.clone())?,
    }
    saga.complete_step(step)
}

fn step_event(step: SagaStep) -> EventType {
    match step {
        SagaStep::VerifyStock => EventType::SaleStockVerified,
        SagaStep::ReserveStock => EventType::SaleStockReserved,
        SagaStep::ProcessPayment => EventType::SalePaymentProcessed,
        SagaStep::ConfirmOrder => EventType::SaleConfirmed,
    }
}

fn outcome_of(saga: &SagaExecution) -> SaleOutcome {
    SaleOutcome {
        saga_id: saga.saga_id(),
        state: saga.state(),
    }
}

fn record_duration(started: std::time::Instant, state: SagaState) {
    metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
    metrics::counter!("saga_outcomes_total", "state" => state.as_str()).increment(1);
}
