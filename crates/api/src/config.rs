//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{
    BackoffConfig, ChoreographyConfig, CircuitBreakerConfig, MonitorConfig, OrchestratorConfig,
    RetentionConfig, StepPolicy,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` (default `0.0.0.0`), `PORT` (default `3000`)
/// - `RUST_LOG` tracing filter (default `info`), `LOG_FORMAT` (`json` or pretty)
/// - `DATABASE_URL` Postgres stores when set, in-memory otherwise
/// - `SAGA_STEP_MAX_RETRIES`, `SAGA_RETRY_BASE_DELAY_MS`
/// - `SAGA_CIRCUIT_FAILURE_THRESHOLD`, `SAGA_CIRCUIT_COOLDOWN_SECS`
/// - `SAGA_MONITOR_INTERVAL_SECS`, `SAGA_RETENTION_HOURS`, `AUDIT_RETENTION_DAYS`
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub step_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    pub monitor_interval_secs: u64,
    pub saga_retention_hours: i64,
    pub audit_retention_days: i64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match std::env::var("LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            step_max_retries: env_or("SAGA_STEP_MAX_RETRIES", defaults.step_max_retries),
            retry_base_delay_ms: env_or("SAGA_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            circuit_failure_threshold: env_or(
                "SAGA_CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            ),
            circuit_cooldown_secs: env_or(
                "SAGA_CIRCUIT_COOLDOWN_SECS",
                defaults.circuit_cooldown_secs,
            ),
            monitor_interval_secs: env_or(
                "SAGA_MONITOR_INTERVAL_SECS",
                defaults.monitor_interval_secs,
            ),
            saga_retention_hours: env_or("SAGA_RETENTION_HOURS", defaults.saga_retention_hours),
            audit_retention_days: env_or("AUDIT_RETENTION_DAYS", defaults.audit_retention_days),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn step_policy(&self) -> StepPolicy {
        StepPolicy::default()
            .with_max_attempts(self.step_max_retries)
            .with_backoff(
                BackoffConfig::default()
                    .with_base_delay(Duration::from_millis(self.retry_base_delay_ms)),
            )
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_step_policy(self.step_policy().with_timeout(Duration::from_secs(5)))
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(self.circuit_failure_threshold)
                    .with_cooldown(Duration::from_secs(self.circuit_cooldown_secs)),
            )
    }

    pub fn choreography(&self) -> ChoreographyConfig {
        ChoreographyConfig::default()
            .with_max_retries(self.step_max_retries)
            .with_step_policy(self.step_policy())
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig::default().with_interval(Duration::from_secs(self.monitor_interval_secs))
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig::default()
            .with_saga_retention(chrono::Duration::hours(self.saga_retention_hours))
            .with_audit_retention(chrono::Duration::days(self.audit_retention_days))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            step_max_retries: 3,
            retry_base_delay_ms: 100,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 30,
            monitor_interval_secs: 30,
            saga_retention_hours: 168,
            audit_retention_days: 90,
        }
    }
}
