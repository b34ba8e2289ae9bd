//! End-to-end sale saga tests over the in-memory bus, store and collaborators.

use std::sync::Arc;
use std::time::Duration;

use audit::{AuditConsumer, AuditRepository, InMemoryAuditRepository};
use chrono::Utc;
use common::{Money, SagaId};
use domain::{
    ChoreographedSagaState, ChoreographedSagaStatus, SALE_SAGA_TYPE, SagaExecution, SagaState,
    SagaStep,
};
use event_bus::{AUDIT_QUEUE, DomainEvent, EventPublisher, EventType, InMemoryEventBus, Topology};
use saga::{
    BackoffConfig, ChoreographyConfig, InMemoryInventoryService, InMemoryOrderService,
    InMemoryPaymentService, InventoryService, MonitorConfig, PaymentService, OrchestratorConfig, RetentionConfig,
    RetentionSweeper, SagaOrchestrator, SaleChoreography, SaleRequest, SalePayload, SaleServices,
    StepPolicy, TimeoutMonitor, start_sale,
};
use saga_store::{
    ChoreographyRepository, ChoreographyRepositoryExt, InMemorySagaStore, SagaRepository,
    SagaRepositoryExt,
};

struct TestHarness {
    bus: InMemoryEventBus,
    store: Arc<InMemorySagaStore>,
    audit: InMemoryAuditRepository,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    order: InMemoryOrderService,
    orchestrator: SagaOrchestrator,
}

fn fast_policy() -> StepPolicy {
    StepPolicy::default()
        .with_timeout(Duration::from_millis(200))
        .with_backoff(BackoffConfig::default().with_base_delay(Duration::from_millis(1)))
}

impl TestHarness {
    fn new() -> Self {
        let bus = InMemoryEventBus::with_topology(Topology::sale_saga());
        let audit = InMemoryAuditRepository::new();
        bus.subscribe(AUDIT_QUEUE, Arc::new(AuditConsumer::new(Arc::new(audit.clone()))))
            .unwrap();

        let inventory = InMemoryInventoryService::new();
        inventory.set_stock("P1", 10);
        let payment = InMemoryPaymentService::new();
        let order = InMemoryOrderService::new();
        let store = Arc::new(InMemorySagaStore::new());

        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            SaleServices::in_memory(inventory.clone(), payment.clone(), order.clone()),
            Arc::new(bus.clone()),
            OrchestratorConfig::default()
                .with_step_policy(fast_policy())
                .with_compensation_policy(fast_policy()),
        );

        Self {
            bus,
            store,
            audit,
            inventory,
            payment,
            order,
            orchestrator,
        }
    }

    fn choreography(&self, config: ChoreographyConfig) -> SaleChoreography {
        let choreography = SaleChoreography::new(
            &SaleServices::in_memory(
                self.inventory.clone(),
                self.payment.clone(),
                self.order.clone(),
            ),
            Arc::new(self.bus.clone()),
            self.store.clone(),
            self.orchestrator.compensation().clone(),
            self.orchestrator.breakers(),
            config.with_step_policy(fast_policy()),
        );
        choreography.subscribe(&self.bus).unwrap();
        choreography
    }

    fn monitor(&self) -> TimeoutMonitor {
        TimeoutMonitor::new(
            self.store.clone(),
            self.store.clone(),
            self.orchestrator.compensation().clone(),
            MonitorConfig::default(),
        )
    }

    async fn audited_types(&self, correlation_id: &str) -> Vec<EventType> {
        self.audit
            .find_by_correlation_id(correlation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|log| EventType::from(log.event_type))
            .collect()
    }
}

fn request(quantity: u32) -> SaleRequest {
    SaleRequest::new("C1", "P1", quantity, Money::from_cents(5000))
}

#[tokio::test]
async fn test_orchestrated_sale_confirms_and_audits_four_events() {
    let h = TestHarness::new();

    let outcome = h.orchestrator.execute_sale(request(2)).await.unwrap();
    assert_eq!(outcome.state, SagaState::Confirmed);

    let sale = h.orchestrator.get_sale(outcome.saga_id).await.unwrap();
    assert_eq!(sale.reservation_id(), Some("R1"));
    assert_eq!(sale.payment_transaction_id(), Some("T1"));
    assert_eq!(sale.order_id(), Some("O1"));
    assert_eq!(h.inventory.stock_level("P1"), 8);

    h.bus.drain().await;
    assert_eq!(
        h.audited_types(&outcome.saga_id.correlation_id()).await,
        vec![
            EventType::SaleStockVerified,
            EventType::SaleStockReserved,
            EventType::SalePaymentProcessed,
            EventType::SaleConfirmed,
        ]
    );
}

#[tokio::test]
async fn test_reserve_failure_fails_without_compensation() {
    let h = TestHarness::new();
    h.inventory.set_fail_on_reserve(true);

    let outcome = h.orchestrator.execute_sale(request(2)).await.unwrap();
    assert_eq!(outcome.state, SagaState::Failed);

    assert_eq!(h.payment.process_calls(), 0);
    assert_eq!(h.order.confirm_calls(), 0);
    assert_eq!(h.inventory.release_calls(), 0);
    assert_eq!(h.payment.refund_calls(), 0);

    h.bus.drain().await;
    let types = h.audited_types(&outcome.saga_id.correlation_id()).await;
    assert_eq!(types.last(), Some(&EventType::SaleFailed));
    assert!(!types.contains(&EventType::InventoryReleased));
}

#[tokio::test]
async fn test_payment_failure_releases_stock_only() {
    let h = TestHarness::new();
    h.payment.set_fail_on_charge(true);

    let outcome = h.orchestrator.execute_sale(request(3)).await.unwrap();
    assert_eq!(outcome.state, SagaState::Failed);

    assert_eq!(h.inventory.stock_level("P1"), 10);
    assert_eq!(h.inventory.active_reservation_count(), 0);
    assert_eq!(h.payment.refund_calls(), 0);
    assert_eq!(h.order.cancel_calls(), 0);

    let sale = h.orchestrator.get_sale(outcome.saga_id).await.unwrap();
    assert!(sale.error_message().is_some());
}

#[tokio::test]
async fn test_multiple_independent_sagas() {
    let h = TestHarness::new();

    let first = h.orchestrator.execute_sale(request(2)).await.unwrap();
    let second = h.orchestrator.execute_sale(request(3)).await.unwrap();
    h.payment.set_fail_on_charge(true);
    let third = h.orchestrator.execute_sale(request(1)).await.unwrap();

    assert_ne!(first.saga_id, second.saga_id);
    assert_eq!(first.state, SagaState::Confirmed);
    assert_eq!(second.state, SagaState::Confirmed);
    assert_eq!(third.state, SagaState::Failed);
    assert_eq!(h.inventory.stock_level("P1"), 5);
    assert_eq!(h.order.confirmed_count(), 2);
}

#[tokio::test]
async fn test_same_saga_id_runs_once() {
    let h = TestHarness::new();
    let saga_id = SagaId::new();

    let first = h
        .orchestrator
        .execute_sale_with_id(saga_id, request(2))
        .await
        .unwrap();
    let again = h
        .orchestrator
        .execute_sale_with_id(saga_id, request(2))
        .await
        .unwrap();

    assert_eq!(first, again);
    assert_eq!(h.inventory.reserve_calls(), 1);
    assert_eq!(h.payment.process_calls(), 1);
}

#[tokio::test]
async fn test_redelivered_event_reserves_once() {
    let h = TestHarness::new();
    let _choreography = h.choreography(ChoreographyConfig::default());
    let saga_id = SagaId::new();

    let mut payload = SalePayload::new(saga_id, "C1", "P1", 2, Money::from_cents(5000));
    payload.transaction_id = Some("T9".to_string());
    let paid = DomainEvent::builder(EventType::PaymentProcessed)
        .aggregate_id(saga_id.to_string())
        .correlation_id(saga_id.correlation_id())
        .payload(&payload)
        .unwrap()
        .source("payment-service")
        .build()
        .unwrap();

    h.bus.publish(&paid).await.unwrap();
    h.bus.publish(&paid).await.unwrap();
    h.bus.drain().await;

    assert_eq!(h.inventory.reservations_for(saga_id).len(), 1);
    assert_eq!(h.inventory.stock_level("P1"), 8);
}

#[tokio::test]
async fn test_timeout_sweep_waits_for_deadline() {
    let h = TestHarness::new();
    let repository: Arc<dyn SagaRepository> = h.store.clone();
    let saga_id = SagaId::new();
    repository
        .create(SagaExecution::new(saga_id, "C1", "P1", 2, Money::from_cents(5000)).unwrap())
        .await
        .unwrap();
    let reservation = h.inventory.reserve_stock("P1", 2, saga_id).await.unwrap();
    let stuck = repository
        .modify(saga_id, |s| {
            s.complete_step(SagaStep::VerifyStock)?;
            s.complete_step(SagaStep::ReserveStock)?;
            s.record_reservation(reservation.reservation_id.clone())
        })
        .await
        .unwrap();
    assert_eq!(stuck.state(), SagaState::StockReserved);

    let monitor = h.monitor();
    let early = monitor.sweep(Utc::now()).await.unwrap();
    assert_eq!(early.resolved(), 0);
    assert_eq!(h.inventory.stock_level("P1"), 8);

    let at_deadline = monitor
        .sweep(stuck.updated_at() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(at_deadline.resolved(), 0);
    assert_eq!(at_deadline.warnings, 1);
    assert_eq!(h.inventory.stock_level("P1"), 8);

    let late = monitor
        .sweep(stuck.updated_at() + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(late.compensated, 1);
    assert_eq!(h.inventory.stock_level("P1"), 10);

    let sale = repository.get(saga_id).await.unwrap().unwrap();
    assert_eq!(sale.state(), SagaState::Failed);
    assert!(sale.error_message().unwrap().contains("STOCK_RESERVED"));
}

#[tokio::test]
async fn test_timeout_sweep_compensates_stalled_choreographed_sale() {
    let h = TestHarness::new();
    let tracking: Arc<dyn ChoreographyRepository> = h.store.clone();
    let saga_id = SagaId::new();
    let opened = tracking
        .create(ChoreographedSagaState::new(
            saga_id,
            saga_id.correlation_id(),
            SALE_SAGA_TYPE,
            Utc::now(),
        ))
        .await
        .unwrap();
    h.payment
        .process_payment("C1", Money::from_cents(5000), saga_id)
        .await
        .unwrap();
    tracking
        .modify(saga_id, |s| s.mark_step_completed("PaymentProcessed"))
        .await
        .unwrap();

    let monitor = h.monitor();
    assert_eq!(monitor.sweep(Utc::now()).await.unwrap().resolved(), 0);
    assert_eq!(monitor.sweep(opened.timeout_at()).await.unwrap().resolved(), 0);
    let untouched = tracking.get(saga_id).await.unwrap().unwrap();
    assert_eq!(untouched.status(), ChoreographedSagaStatus::InProgress);
    assert_eq!(h.payment.refund_calls(), 0);

    let report = monitor
        .sweep(opened.timeout_at() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.compensated, 1);

    let compensated = tracking.get(saga_id).await.unwrap().unwrap();
    assert_eq!(compensated.status(), ChoreographedSagaStatus::Compensated);
    assert!(compensated.compensation_completed());
    assert_eq!(h.payment.refund_calls(), 1);
    assert_eq!(h.inventory.release_calls(), 0);

    h.bus.drain().await;
    assert!(
        h.audited_types(&saga_id.correlation_id())
            .await
            .contains(&EventType::PaymentRefunded)
    );
}

#[tokio::test]
async fn test_timeout_sweep_fails_sale_out_of_retries() {
    let h = TestHarness::new();
    let tracking: Arc<dyn ChoreographyRepository> = h.store.clone();
    let saga_id = SagaId::new();
    tracking
        .create(
            ChoreographedSagaState::new(saga_id, saga_id.correlation_id(), SALE_SAGA_TYPE, Utc::now())
                .with_max_retries(1),
        )
        .await
        .unwrap();
    let retrying = tracking
        .modify(saga_id, |s| {
            s.mark_step_failed("PaymentFailed", "gateway down").map(|_| ())
        })
        .await
        .unwrap();
    assert_eq!(retrying.status(), ChoreographedSagaStatus::Retrying);
    assert!(retrying.retries_exhausted());

    let report = h.monitor().sweep(Utc::now()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.compensated, 0);

    let failed = tracking.get(saga_id).await.unwrap().unwrap();
    assert_eq!(failed.status(), ChoreographedSagaStatus::Failed);
    assert!(!failed.compensation_required());
    assert_eq!(h.payment.refund_calls(), 0);
    assert_eq!(h.inventory.release_calls(), 0);
}

#[tokio::test]
async fn test_choreographed_sale_completes() {
    let h = TestHarness::new();
    let choreography = h.choreography(ChoreographyConfig::default());

    let started = start_sale(&h.bus, &request(2)).await.unwrap();
    h.bus.drain().await;

    let tracked = choreography
        .tracker
        .find_by_correlation_id(&started.correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracked.saga_id(), started.saga_id);
    assert_eq!(tracked.status(), ChoreographedSagaStatus::Completed);
    assert_eq!(h.inventory.stock_level("P1"), 8);
    assert_eq!(h.order.confirmed_count(), 1);

    let types = h.audited_types(&started.correlation_id).await;
    assert!(types.len() >= 4);
    assert_eq!(
        &types[..4],
        &[
            EventType::TransactionCreated,
            EventType::PaymentProcessed,
            EventType::InventoryReserved,
            EventType::OrderFulfilled,
        ]
    );
}

#[tokio::test]
async fn test_choreographed_declined_payment_fails() {
    let h = TestHarness::new();
    h.payment.set_decline_above(Some(Money::from_cents(1000)));
    let choreography = h.choreography(ChoreographyConfig::default());

    let started = start_sale(&h.bus, &request(2)).await.unwrap();
    h.bus.drain().await;

    let tracked = choreography
        .tracker
        .find_by_correlation_id(&started.correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracked.status(), ChoreographedSagaStatus::Failed);
    assert_eq!(h.inventory.reserve_calls(), 0);
    assert_eq!(h.payment.refund_calls(), 0);
}

#[tokio::test]
async fn test_choreographed_stock_shortage_refunds_payment() {
    let h = TestHarness::new();
    h.inventory.set_stock("P1", 1);
    let choreography = h.choreography(ChoreographyConfig::default());

    let started = start_sale(&h.bus, &request(2)).await.unwrap();
    h.bus.drain().await;

    let tracked = choreography
        .tracker
        .find_by_correlation_id(&started.correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracked.status(), ChoreographedSagaStatus::Compensated);
    assert_eq!(h.payment.refund_calls(), 1);
    assert_eq!(h.order.confirmed_count(), 0);

    let types = h.audited_types(&started.correlation_id).await;
    assert!(types.contains(&EventType::InventoryUnavailable));
    assert!(types.contains(&EventType::PaymentRefunded));

    let stats = choreography.tracker.statistics().await.unwrap();
    assert_eq!(stats.get(&ChoreographedSagaStatus::Compensated), Some(&1));
}

#[tokio::test]
async fn test_retention_purges_finished_sales_and_old_audit_rows() {
    let h = TestHarness::new();
    let outcome = h.orchestrator.execute_sale(request(1)).await.unwrap();
    h.bus.drain().await;
    assert_eq!(h.audit.len().await, 4);

    let sweeper = RetentionSweeper::new(h.store.clone(), h.store.clone(), RetentionConfig::default())
        .with_audit(Arc::new(h.audit.clone()));

    let report = sweeper.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.executions, 0);
    assert_eq!(report.audit_entries, 0);

    let report = sweeper
        .sweep(Utc::now() + chrono::Duration::days(91))
        .await
        .unwrap();
    assert_eq!(report.executions, 1);
    assert_eq!(report.audit_entries, 4);

    let executions: Arc<dyn SagaRepository> = h.store.clone();
    assert!(executions.get(outcome.saga_id).await.unwrap().is_none());
    let choreographies: Arc<dyn ChoreographyRepository> = h.store.clone();
    assert!(choreographies.count_by_status().await.unwrap().is_empty());
}
