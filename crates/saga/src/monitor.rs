//! Background sweeps over the saga records.
//!
//! [`TimeoutMonitor`] resolves sales that stopped making progress;
//! [`RetentionSweeper`] deletes finished records once they are old enough.
//! Both run on an interval until a shutdown signal arrives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use audit::AuditRepository;
use chrono::{DateTime, Utc};
use common::SagaId;
use domain::{ChoreographedSagaState, ChoreographedSagaStatus, SagaExecution, SagaState};
use saga_store::{ChoreographyRepository, ChoreographyRepositoryExt, SagaRepository, SagaRepositoryExt};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{info, warn};

use crate::compensation::CompensationCoordinator;
use crate::error::Result;
use crate::orchestrator::has_compensable_progress;

/// Deadlines used by the [`TimeoutMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub initiated_timeout: chrono::Duration,
    pub stock_verified_timeout: chrono::Duration,
    pub stock_reserved_timeout: chrono::Duration,
    pub payment_processed_timeout: chrono::Duration,
    pub compensating_timeout: chrono::Duration,
    /// Share of a deadline after which a sale is reported as slow.
    pub warning_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initiated_timeout: chrono::Duration::seconds(30),
            stock_verified_timeout: chrono::Duration::seconds(30),
            stock_reserved_timeout: chrono::Duration::seconds(60),
            payment_processed_timeout: chrono::Duration::seconds(30),
            compensating_timeout: chrono::Duration::minutes(5),
            warning_ratio: 0.8,
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides the deadline of one non-terminal state.
    pub fn with_state_timeout(mut self, state: SagaState, timeout: chrono::Duration) -> Self {
        match state {
            SagaState::Initiated => self.initiated_timeout = timeout,
            SagaState::StockVerified => self.stock_verified_timeout = timeout,
            SagaState::StockReserved => self.stock_reserved_timeout = timeout,
            SagaState::PaymentProcessed => self.payment_processed_timeout = timeout,
            SagaState::Compensating => self.compensating_timeout = timeout,
            SagaState::Confirmed | SagaState::Failed => {}
        }
        self
    }

    pub fn with_warning_ratio(mut self, ratio: f64) -> Self {
        self.warning_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Time a sale may spend in `state`; `None` for terminal states.
    pub fn timeout_for(&self, state: SagaState) -> Option<chrono::Duration> {
        match state {
            SagaState::Initiated => Some(self.initiated_timeout),
            SagaState::StockVerified => Some(self.stock_verified_timeout),
            SagaState::StockReserved => Some(self.stock_reserved_timeout),
            SagaState::PaymentProcessed => Some(self.payment_processed_timeout),
            SagaState::Compensating => Some(self.compensating_timeout),
            SagaState::Confirmed | SagaState::Failed => None,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sales whose compensation ran to completion.
    pub compensated: usize,
    /// Sales whose compensation is still incomplete.
    pub still_compensating: usize,
    /// Sales failed without anything to undo.
    pub failed: usize,
    /// Sales past the warning share of their deadline.
    pub warnings: usize,
    /// Sales that could not be resolved this time.
    pub errors: usize,
}

impl SweepReport {
    pub fn resolved(&self) -> usize {
        self.compensated + self.still_compensating + self.failed
    }

    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Compensated => self.compensated += 1,
            Resolution::StillCompensating => self.still_compensating += 1,
            Resolution::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Compensated,
    StillCompensating,
    Failed,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Resolution::Compensated => "compensated",
            Resolution::StillCompensating => "compensating",
            Resolution::Failed => "failed",
        }
    }
}

/// Resolves sales that ran out of time or retries.
#[derive(Clone)]
pub struct TimeoutMonitor {
    executions: Arc<dyn SagaRepository>,
    choreographies: Arc<dyn ChoreographyRepository>,
    compensation: CompensationCoordinator,
    config: MonitorConfig,
}

impl TimeoutMonitor {
    pub fn new(
        executions: Arc<dyn SagaRepository>,
        choreographies: Arc<dyn ChoreographyRepository>,
        compensation: CompensationCoordinator,
        config: MonitorConfig,
    ) -> Self {
        Self {
            executions,
            choreographies,
            compensation,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Sweeps on the configured interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.config.interval, "starting saga timeout monitor");
        let mut interval = time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("saga timeout monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report.resolved() > 0 || report.errors > 0 => {
                            info!(?report, "saga sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "saga sweep failed"),
                    }
                }
            }
        }
    }

    /// Resolves every sale whose deadline lies before `now`.
    ///
    /// Errors on individual sales are counted and the sweep moves on; only
    /// a failing query aborts it.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        let timed_out = self.choreographies.find_timed_out(now).await?;
        let exhausted = self.choreographies.find_retry_exhausted().await?;
        for (saga, reason) in timed_out
            .into_iter()
            .map(|s| (s, "sale timed out"))
            .chain(exhausted.into_iter().map(|s| (s, "retries exhausted")))
        {
            if !seen.insert(saga.saga_id()) {
                continue;
            }
            match self.resolve_choreographed(&saga, reason).await {
                Ok(resolution) => {
                    metrics::counter!(
                        "saga_monitor_timeouts_total",
                        "path" => "choreographed",
                        "outcome" => resolution.as_str()
                    )
                    .increment(1);
                    report.record(resolution);
                }
                Err(e) => {
                    warn!(saga_id = %saga.saga_id(), error = %e, "could not resolve choreographed sale");
                    report.errors += 1;
                }
            }
        }

        for saga in self.executions.find_active().await? {
            let Some(timeout) = self.config.timeout_for(saga.state()) else {
                continue;
            };
            let deadline = saga.updated_at() + timeout;
            if deadline < now {
                match self.resolve_execution(&saga).await {
                    Ok(resolution) => {
                        metrics::counter!(
                            "saga_monitor_timeouts_total",
                            "path" => "orchestrated",
                            "outcome" => resolution.as_str()
                        )
                        .increment(1);
                        report.record(resolution);
                    }
                    Err(e) => {
                        warn!(saga_id = %saga.saga_id(), error = %e, "could not resolve sale");
                        report.errors += 1;
                    }
                }
            } else if saga.updated_at() + self.warning_after(timeout) <= now {
                warn!(
                    saga_id = %saga.saga_id(),
                    state = saga.state().as_str(),
                    %deadline,
                    "sale approaching its timeout"
                );
                metrics::counter!("saga_monitor_warnings_total", "state" => saga.state().as_str())
                    .increment(1);
                report.warnings += 1;
            }
        }

        Ok(report)
    }

    fn warning_after(&self, timeout: chrono::Duration) -> chrono::Duration {
        let millis = timeout.num_milliseconds() as f64 * self.config.warning_ratio;
        chrono::Duration::milliseconds(millis as i64)
    }

    async fn resolve_choreographed(
        &self,
        saga: &ChoreographedSagaState,
        reason: &str,
    ) -> Result<Resolution> {
        let saga_id = saga.saga_id();
        let repository: &dyn ChoreographyRepository = self.choreographies.as_ref();
        if saga.status() != ChoreographedSagaStatus::Compensating {
            if saga.completed_steps().is_empty() {
                repository.modify(saga_id, |s| s.mark_failed(reason)).await?;
                info!(%saga_id, reason, "choreographed sale failed by monitor");
                return Ok(Resolution::Failed);
            }
            repository
                .modify(saga_id, |s| s.require_compensation(reason))
                .await?;
        }

        let report = self
            .compensation
            .compensate_choreographed(repository, saga_id, None)
            .await?;
        Ok(if report.is_complete() {
            Resolution::Compensated
        } else {
            Resolution::StillCompensating
        })
    }

    async fn resolve_execution(&self, saga: &SagaExecution) -> Result<Resolution> {
        let saga_id = saga.saga_id();
        let repository: &dyn SagaRepository = self.executions.as_ref();
        let reason = format!("timed out in {}", saga.state().as_str());

        if saga.state() != SagaState::Compensating {
            if !has_compensable_progress(saga.state()) {
                let failed = repository
                    .modify(saga_id, |s| s.fail(Some(reason.clone())))
                    .await?;
                self.compensation.publish_sale_failed(&failed, None).await;
                info!(%saga_id, %reason, "sale failed by monitor");
                return Ok(Resolution::Failed);
            }
            repository
                .modify(saga_id, |s| s.begin_compensation(reason.clone()))
                .await?;
        }

        self.compensate_execution(saga_id).await
    }

    async fn compensate_execution(&self, saga_id: SagaId) -> Result<Resolution> {
        let report = self
            .compensation
            .compensate_execution(self.executions.as_ref(), saga_id, None)
            .await?;
        Ok(if report.is_complete() {
            Resolution::Compensated
        } else {
            Resolution::StillCompensating
        })
    }
}

/// Retention windows for finished records.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub interval: Duration,
    /// Age after which terminal saga records are deleted.
    pub saga_retention: chrono::Duration,
    /// Age after which audit rows are deleted.
    pub audit_retention: chrono::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            saga_retention: chrono::Duration::hours(168),
            audit_retention: chrono::Duration::days(90),
        }
    }
}

impl RetentionConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_saga_retention(mut self, retention: chrono::Duration) -> Self {
        self.saga_retention = retention;
        self
    }

    pub fn with_audit_retention(mut self, retention: chrono::Duration) -> Self {
        self.audit_retention = retention;
        self
    }
}

/// Rows deleted by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub executions: u64,
    pub choreographies: u64,
    pub audit_entries: u64,
}

/// Deletes terminal saga records and old audit rows.
#[derive(Clone)]
pub struct RetentionSweeper {
    executions: Arc<dyn SagaRepository>,
    choreographies: Arc<dyn ChoreographyRepository>,
    audit: Option<Arc<dyn AuditRepository>>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        executions: Arc<dyn SagaRepository>,
        choreographies: Arc<dyn ChoreographyRepository>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            executions,
            choreographies,
            audit: None,
            config,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditRepository>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.config.interval, "starting retention sweeper");
        let mut interval = time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("retention sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!(error = %e, "retention sweep failed");
                        metrics::counter!("saga_retention_errors_total").increment(1);
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let saga_cutoff = now - self.config.saga_retention;
        let mut report = RetentionReport {
            executions: self.executions.purge_terminal_before(saga_cutoff).await?,
            choreographies: self.choreographies.purge_terminal_before(saga_cutoff).await?,
            audit_entries: 0,
        };
        if let Some(audit) = &self.audit {
            report.audit_entries = audit.purge_before(now - self.config.audit_retention).await?;
        }

        metrics::counter!("saga_retention_deleted_total", "kind" => "execution")
            .increment(report.executions);
        metrics::counter!("saga_retention_deleted_total", "kind" => "choreography")
            .increment(report.choreographies);
        metrics::counter!("saga_retention_deleted_total", "kind" => "audit")
            .increment(report.audit_entries);
        if report != RetentionReport::default() {
            info!(?report, "retention sweep deleted records");
        }
        Ok(report)
    }
}
