//! PostgreSQL integration tests for the audit trail
//!
//! ```bash
//! cargo test -p audit --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use audit::{
    AuditLevel, AuditLog, AuditRepository, AuditRepositoryExt, PageRequest,
    PostgresAuditRepository,
};
use chrono::{Duration, Utc};
use event_bus::{DomainEvent, EventType};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/002_create_audit_logs.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_repository() -> PostgresAuditRepository {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();
    sqlx::query("TRUNCATE TABLE audit_logs")
        .execute(&pool)
        .await
        .unwrap();
    PostgresAuditRepository::new(pool)
}

fn audited(event: &DomainEvent) -> AuditLog {
    AuditLog::from_event(event)
}

fn chain() -> Vec<DomainEvent> {
    let created = DomainEvent::builder(EventType::TransactionCreated)
        .aggregate_id("S-1")
        .correlation_id("corr-1")
        .source("transaction-service")
        .build()
        .unwrap();
    let paid = DomainEvent::builder(EventType::PaymentProcessed)
        .aggregate_id("S-1")
        .caused_by(&created)
        .timestamp(created.timestamp - Duration::milliseconds(5))
        .source("payment-service")
        .build()
        .unwrap();
    let unavailable = DomainEvent::builder(EventType::InventoryUnavailable)
        .aggregate_id("S-1")
        .caused_by(&paid)
        .source("inventory-service")
        .build()
        .unwrap();
    vec![created, paid, unavailable]
}

#[tokio::test]
#[serial]
async fn duplicate_event_ids_are_ignored() {
    let repo = get_test_repository().await;
    let event = &chain()[0];

    assert!(repo.record(&audited(event)).await.unwrap());
    assert!(!repo.record(&audited(event)).await.unwrap());

    let stored = repo.find_by_event_id(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.event_type, "TransactionCreated");
    assert_eq!(stored.service_name, "transaction-service");
    assert_eq!(stored.level, AuditLevel::High);
    assert!(stored.compliance_tags.contains(&"TRANSACTION_LOG".to_string()));
}

#[tokio::test]
#[serial]
async fn correlation_trace_is_causal() {
    let repo = get_test_repository().await;
    for event in chain().iter().rev() {
        repo.record(&audited(event)).await.unwrap();
    }

    let trace = repo.find_by_correlation_id("corr-1").await.unwrap();
    let types: Vec<_> = trace.iter().map(|l| l.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["TransactionCreated", "PaymentProcessed", "InventoryUnavailable"]
    );

    let history = repo.find_by_aggregate_id("S-1").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].timestamp >= history[2].timestamp);
}

#[tokio::test]
#[serial]
async fn search_statistics_and_purge() {
    let repo = get_test_repository().await;
    for event in chain() {
        repo.record(&audited(&event)).await.unwrap();
    }

    let critical = repo
        .find_by_level(AuditLevel::Critical, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(critical.total, 1);
    assert_eq!(critical.items[0].event_type, "InventoryUnavailable");

    let payments = repo
        .find_by_service("payment-service", PageRequest::new(0, 10))
        .await
        .unwrap();
    assert_eq!(payments.total, 1);

    let compliance = repo.compliance(PageRequest::new(0, 2)).await.unwrap();
    assert_eq!(compliance.total, 3);
    assert_eq!(compliance.items.len(), 2);

    let stats = repo.statistics().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.count_at(AuditLevel::High), 2);
    assert_eq!(stats.by_service.get("inventory-service"), Some(&1));

    let since = repo
        .find_critical_since(Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(since.len(), 1);

    assert_eq!(repo.purge_before(Utc::now() + Duration::seconds(1)).await.unwrap(), 3);
    assert_eq!(repo.recent(PageRequest::default()).await.unwrap().total, 0);
}
