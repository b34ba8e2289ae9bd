//! HTTP API server for sale sagas.
//!
//! Exposes the orchestrated and choreographed sale endpoints and the audit
//! trail queries, with structured logging (tracing) and Prometheus metrics.
//! [`Application`] wires stores, collaborators and the event bus together;
//! [`create_app`] builds the router on top of it.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use audit::{AuditConsumer, AuditRepository, InMemoryAuditRepository, PostgresAuditRepository};
use axum::Router;
use axum::routing::{get, post};
use event_bus::{
    AUDIT_QUEUE, EventPublisher, InMemoryEventBus, PublishRetryPolicy, RetryingPublisher, Topology,
};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, RetentionSweeper,
    SagaOrchestrator, SaleChoreography, SaleServices, TimeoutMonitor,
};
use saga_store::{ChoreographyRepository, InMemorySagaStore, PostgresSagaStore, SagaRepository};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: SagaOrchestrator,
    pub choreography: SaleChoreography,
    pub publisher: Arc<dyn EventPublisher>,
    pub audit: Arc<dyn AuditRepository>,
    pub bus: InMemoryEventBus,
}

/// Persistence behind the saga and audit repositories.
#[derive(Clone)]
pub struct Stores {
    pub executions: Arc<dyn SagaRepository>,
    pub choreographies: Arc<dyn ChoreographyRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let sagas = Arc::new(InMemorySagaStore::new());
        Self {
            executions: sagas.clone(),
            choreographies: sagas,
            audit: Arc::new(InMemoryAuditRepository::new()),
        }
    }

    /// Connects to Postgres and applies pending migrations.
    pub async fn postgres(database_url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let sagas = Arc::new(PostgresSagaStore::new(pool.clone()));
        sagas.run_migrations().await?;
        Ok(Self {
            executions: sagas.clone(),
            choreographies: sagas,
            audit: Arc::new(PostgresAuditRepository::new(pool)),
        })
    }

    /// Postgres when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        match &config.database_url {
            Some(url) => Self::postgres(url).await,
            None => {
                tracing::warn!("DATABASE_URL not set, sagas and audit rows are kept in memory");
                Ok(Self::in_memory())
            }
        }
    }
}

/// In-memory collaborators stocking `default_stock` units of every product.
pub fn in_memory_services(default_stock: u32) -> SaleServices {
    SaleServices::in_memory(
        InMemoryInventoryService::with_default_stock(default_stock),
        InMemoryPaymentService::new(),
        InMemoryOrderService::new(),
    )
}

/// Everything the server runs: request state plus the background sweepers.
pub struct Application {
    pub state: Arc<AppState>,
    pub monitor: TimeoutMonitor,
    pub retention: RetentionSweeper,
}

impl Application {
    pub fn new(stores: Stores, services: SaleServices, config: &Config) -> Self {
        let bus = InMemoryEventBus::with_topology(Topology::sale_saga());
        let publisher: Arc<dyn EventPublisher> = Arc::new(RetryingPublisher::new(
            Arc::new(bus.clone()),
            PublishRetryPolicy::default(),
        ));

        let orchestrator = SagaOrchestrator::new(
            Arc::clone(&stores.executions),
            services.clone(),
            Arc::clone(&publisher),
            config.orchestrator(),
        );
        let choreography = SaleChoreography::new(
            &services,
            Arc::clone(&publisher),
            Arc::clone(&stores.choreographies),
            orchestrator.compensation().clone(),
            orchestrator.breakers(),
            config.choreography(),
        );
        let monitor = TimeoutMonitor::new(
            Arc::clone(&stores.executions),
            Arc::clone(&stores.choreographies),
            orchestrator.compensation().clone(),
            config.monitor(),
        );
        let retention = RetentionSweeper::new(
            stores.executions,
            stores.choreographies,
            config.retention(),
        )
        .with_audit(Arc::clone(&stores.audit));

        Self {
            state: Arc::new(AppState {
                orchestrator,
                choreography,
                publisher,
                audit: stores.audit,
                bus,
            }),
            monitor,
            retention,
        }
    }

    /// Attaches the participants, the tracker and the audit sink to their
    /// queues. Must be called from within a Tokio runtime.
    pub fn subscribe(&self) -> event_bus::Result<()> {
        let state = &self.state;
        state.choreography.subscribe(&state.bus)?;
        state.bus.subscribe(
            AUDIT_QUEUE,
            Arc::new(AuditConsumer::new(Arc::clone(&state.audit))),
        )
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::operations::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::operations::health))
        .route("/saga/sales", post(routes::sales::create))
        .route("/saga/sales/{saga_id}", get(routes::sales::get))
        .route("/saga/choreography/sales", post(routes::choreography::start))
        .route(
            "/saga/choreography/statistics",
            get(routes::choreography::statistics),
        )
        .route(
            "/saga/choreography/{correlation_id}",
            get(routes::choreography::get),
        )
        .route("/audit/trail/{correlation_id}", get(routes::audit::trail))
        .route("/audit/aggregate/{aggregate_id}", get(routes::audit::aggregate))
        .route("/audit/event/{event_id}", get(routes::audit::event))
        .route("/audit/search", get(routes::audit::search))
        .route("/audit/recent", get(routes::audit::recent))
        .route("/audit/critical", get(routes::audit::critical))
        .route("/audit/compliance", get(routes::audit::compliance))
        .route("/audit/statistics", get(routes::audit::statistics))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
