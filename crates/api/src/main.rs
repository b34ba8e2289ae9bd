//! API server entry point.

use api::config::{Config, LogFormat};
use api::error::StartupError;
use api::{Application, Stores};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Units of every product the in-memory inventory starts with.
const DEFAULT_STOCK: u32 = 100;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Stores, collaborators and the bus topology
    let stores = Stores::from_config(&config).await?;
    let application = Application::new(stores, api::in_memory_services(DEFAULT_STOCK), &config);
    application.subscribe()?;

    // 4. Background sweeps
    let (shutdown_tx, _) = broadcast::channel(1);
    let monitor = tokio::spawn(application.monitor.run(shutdown_tx.subscribe()));
    let retention = tokio::spawn(application.retention.run(shutdown_tx.subscribe()));

    // 5. Build the application
    let bus = application.state.bus.clone();
    let app = api::create_app(application.state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, persistence = if config.database_url.is_some() { "postgres" } else { "memory" }, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(());
    for task in [monitor, retention] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    bus.shutdown();

    tracing::info!("server shut down gracefully");
    Ok(())
}
