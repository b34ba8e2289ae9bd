//! Event-driven sale tracking record.

use chrono::{DateTime, Duration, Utc};
use common::{EventId, SagaId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::machine::{StateGraph, Transitionable, next_timestamp, transition};

/// Default saga type for the event-driven sale.
pub const SALE_SAGA_TYPE: &str = "SALE_PROCESSING";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

/// Status of a choreographed saga.
///
/// ```text
/// Started ──► InProgress ◄──► Retrying
///    │            │              │
///    ├────────────┴──────┬───────┴──► Completed
///    │                   ▼
///    │             Compensating ──► Compensated
///    │                   │
///    └───────────────────┴──────────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChoreographedSagaStatus {
    #[default]
    Started,
    InProgress,
    Retrying,
    Compensating,
    Completed,
    Failed,
    Compensated,
}

impl ChoreographedSagaStatus {
    pub const ALL: [ChoreographedSagaStatus; 7] = [
        ChoreographedSagaStatus::Started,
        ChoreographedSagaStatus::InProgress,
        ChoreographedSagaStatus::Retrying,
        ChoreographedSagaStatus::Compensating,
        ChoreographedSagaStatus::Completed,
        ChoreographedSagaStatus::Failed,
        ChoreographedSagaStatus::Compensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChoreographedSagaStatus::Started => "STARTED",
            ChoreographedSagaStatus::InProgress => "IN_PROGRESS",
            ChoreographedSagaStatus::Retrying => "RETRYING",
            ChoreographedSagaStatus::Compensating => "COMPENSATING",
            ChoreographedSagaStatus::Completed => "COMPLETED",
            ChoreographedSagaStatus::Failed => "FAILED",
            ChoreographedSagaStatus::Compensated => "COMPENSATED",
        }
    }
}

impl StateGraph for ChoreographedSagaStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChoreographedSagaStatus::Completed
                | ChoreographedSagaStatus::Failed
                | ChoreographedSagaStatus::Compensated
        )
    }

    fn successors(&self) -> &'static [Self] {
        use ChoreographedSagaStatus::*;
        match self {
            Started => &[InProgress, Retrying, Compensating, Completed, Failed],
            InProgress => &[Retrying, Compensating, Completed, Failed],
            Retrying => &[InProgress, Compensating, Completed, Failed],
            Compensating => &[Compensated, Failed],
            Completed | Failed | Compensated => &[],
        }
    }
}

impl std::fmt::Display for ChoreographedSagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChoreographedSagaStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown choreographed saga status: {s}"))
    }
}

/// A participant step of the event-driven sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChoreographyStep {
    Payment,
    Inventory,
    Fulfillment,
}

impl ChoreographyStep {
    pub const SEQUENCE: [ChoreographyStep; 3] = [
        ChoreographyStep::Payment,
        ChoreographyStep::Inventory,
        ChoreographyStep::Fulfillment,
    ];

    /// Step name recorded on success.
    pub fn completed_name(&self) -> &'static str {
        match self {
            ChoreographyStep::Payment => "PaymentProcessed",
            ChoreographyStep::Inventory => "InventoryReserved",
            ChoreographyStep::Fulfillment => "OrderFulfilled",
        }
    }

    /// Step name recorded on failure.
    pub fn failed_name(&self) -> &'static str {
        match self {
            ChoreographyStep::Payment => "PaymentFailed",
            ChoreographyStep::Inventory => "InventoryUnavailable",
            ChoreographyStep::Fulfillment => "OrderFulfillmentFailed",
        }
    }

    /// True for the step whose completion finishes the saga.
    pub fn is_final(&self) -> bool {
        matches!(self, ChoreographyStep::Fulfillment)
    }
}

/// Tracking record of one event-driven sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoreographedSagaState {
    saga_id: SagaId,
    correlation_id: String,
    saga_type: String,
    status: ChoreographedSagaStatus,
    completed_steps: Vec<String>,
    failed_steps: Vec<String>,
    compensation_required: bool,
    compensation_completed: bool,
    retry_count: u32,
    max_retries: u32,
    timeout_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    saga_data: serde_json::Value,
    /// Ids of the events already applied, so a redelivery changes nothing.
    #[serde(default)]
    applied_events: Vec<EventId>,
    version: Version,
}

impl ChoreographedSagaState {
    /// Starts tracking a saga first seen at `now`.
    pub fn new(
        saga_id: SagaId,
        correlation_id: impl Into<String>,
        saga_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            correlation_id: correlation_id.into(),
            saga_type: saga_type.into(),
            status: ChoreographedSagaStatus::Started,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            compensation_required: false,
            compensation_completed: false,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_at: now + Duration::minutes(DEFAULT_TIMEOUT_MINUTES),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            saga_data: serde_json::Value::Null,
            applied_events: Vec::new(),
            version: Version::initial(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_at = self.created_at + timeout;
        self
    }

    pub fn with_timeout_at(mut self, timeout_at: DateTime<Utc>) -> Self {
        self.timeout_at = timeout_at;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_saga_data(mut self, data: serde_json::Value) -> Self {
        self.saga_data = data;
        self
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> ChoreographedSagaStatus {
        self.status
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    pub fn compensation_required(&self) -> bool {
        self.compensation_required
    }

    pub fn compensation_completed(&self) -> bool {
        self.compensation_completed
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout_at(&self) -> DateTime<Utc> {
        self.timeout_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn saga_data(&self) -> &serde_json::Value {
        &self.saga_data
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn retries_exhausted(&self) -> bool {
        !self.can_retry()
    }

    /// True once `timeout_at` is strictly before `now` and the saga is still open.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.timeout_at < now
    }

    pub fn has_applied(&self, event_id: EventId) -> bool {
        self.applied_events.contains(&event_id)
    }

    /// Marks `event_id` as applied. Fails if it already was, leaving the
    /// record untouched.
    pub fn record_applied_event(&mut self, event_id: EventId) -> Result<()> {
        if self.has_applied(event_id) {
            return Err(DomainError::EventAlreadyApplied {
                saga_id: self.saga_id,
                event_id,
            });
        }
        self.applied_events.push(event_id);
        Ok(())
    }

    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Records a completed step.
    ///
    /// A saga that is compensating keeps its status; the step is still
    /// recorded so compensation can undo it.
    pub fn mark_step_completed(&mut self, step: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.has_completed(step) {
            self.completed_steps.push(step.to_string());
        }
        match self.status {
            ChoreographedSagaStatus::Started | ChoreographedSagaStatus::Retrying => {
                transition(self, ChoreographedSagaStatus::InProgress)
            }
            _ => {
                self.touch();
                Ok(())
            }
        }
    }

    /// Finishes the saga successfully.
    pub fn mark_completed(&mut self) -> Result<()> {
        transition(self, ChoreographedSagaStatus::Completed)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Records a failed step and returns the resulting status.
    ///
    /// Partial progress triggers compensation; otherwise the step is retried
    /// while retries remain, and the saga fails once they are exhausted.
    pub fn mark_step_failed(
        &mut self,
        step: &str,
        error: impl Into<String>,
    ) -> Result<ChoreographedSagaStatus> {
        self.ensure_open()?;
        let error = error.into();
        if !self.failed_steps.iter().any(|s| s == step) {
            self.failed_steps.push(step.to_string());
        }

        if self.status == ChoreographedSagaStatus::Compensating {
            self.error_message = Some(error);
            self.touch();
        } else if !self.completed_steps.is_empty() {
            self.require_compensation(error)?;
        } else if self.can_retry() {
            self.error_message = Some(error);
            if self.status == ChoreographedSagaStatus::Retrying {
                self.touch();
            } else {
                transition(self, ChoreographedSagaStatus::Retrying)?;
            }
            self.retry_count += 1;
        } else {
            self.mark_failed(error)?;
        }
        Ok(self.status)
    }

    /// Flags the saga for compensation and moves it to `Compensating`.
    pub fn require_compensation(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        if self.status != ChoreographedSagaStatus::Compensating {
            transition(self, ChoreographedSagaStatus::Compensating)?;
        } else {
            self.touch();
        }
        self.compensation_required = true;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Records a reverse action that could not be completed. The saga stays
    /// in `Compensating`.
    pub fn record_compensation_failure(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.error_message = Some(error.into());
        self.touch();
        Ok(())
    }

    /// Finishes compensation.
    pub fn mark_compensation_completed(&mut self) -> Result<()> {
        if !self.compensation_required {
            return Err(DomainError::CompensationNotRequired(self.saga_id));
        }
        transition(self, ChoreographedSagaStatus::Compensated)?;
        self.compensation_completed = true;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Fails the saga.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        transition(self, ChoreographedSagaStatus::Failed)?;
        self.error_message = Some(error.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(DomainError::TerminalRecord {
                saga_id: self.saga_id,
                state: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = next_timestamp(self.updated_at);
    }
}

impl Transitionable for ChoreographedSagaState {
    type State = ChoreographedSagaStatus;

    fn status(&self) -> ChoreographedSagaStatus {
        self.status
    }

    fn apply_transition(&mut self, target: ChoreographedSagaStatus, at: DateTime<Utc>) {
        self.status = target;
        self.updated_at = at;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::can_transition;
    use ChoreographedSagaStatus::*;

    fn tracked() -> ChoreographedSagaState {
        let id = SagaId::new();
        ChoreographedSagaState::new(id, id.correlation_id(), SALE_SAGA_TYPE, Utc::now())
    }

    #[test]
    fn status_graph_pairs() {
        let edges = [
            (Started, InProgress),
            (Started, Retrying),
            (Started, Compensating),
            (Started, Completed),
            (Started, Failed),
            (InProgress, Retrying),
            (InProgress, Compensating),
            (InProgress, Completed),
            (InProgress, Failed),
            (Retrying, InProgress),
            (Retrying, Compensating),
            (Retrying, Completed),
            (Retrying, Failed),
            (Compensating, Compensated),
            (Compensating, Failed),
        ];
        for a in ChoreographedSagaStatus::ALL {
            for b in ChoreographedSagaStatus::ALL {
                assert_eq!(can_transition(a, b), edges.contains(&(a, b)), "{a} -> {b}");
            }
        }
    }

    #[test]
    fn defaults() {
        let saga = tracked();
        assert_eq!(saga.status(), Started);
        assert_eq!(saga.max_retries(), 3);
        assert_eq!(saga.timeout_at() - saga.created_at(), Duration::minutes(30));
    }

    #[test]
    fn failure_without_progress_retries_then_fails() {
        let mut saga = tracked().with_max_retries(2);
        assert_eq!(saga.mark_step_failed("PaymentFailed", "declined").unwrap(), Retrying);
        assert_eq!(saga.retry_count(), 1);
        assert_eq!(saga.mark_step_failed("PaymentFailed", "declined").unwrap(), Retrying);
        assert_eq!(saga.retry_count(), 2);
        assert_eq!(saga.mark_step_failed("PaymentFailed", "declined").unwrap(), Failed);
        assert!(saga.completed_at().is_some());
        assert!(!saga.compensation_required());
    }

    #[test]
    fn failure_after_progress_requires_compensation() {
        let mut saga = tracked();
        saga.mark_step_completed("PaymentProcessed").unwrap();
        assert_eq!(saga.status(), InProgress);
        let status = saga
            .mark_step_failed("InventoryUnavailable", "out of stock")
            .unwrap();
        assert_eq!(status, Compensating);
        assert!(saga.compensation_required());
        assert!(!saga.compensation_completed());
        assert_eq!(saga.failed_steps(), &["InventoryUnavailable"]);
    }

    #[test]
    fn compensation_completed_implies_required() {
        let mut saga = tracked();
        assert!(matches!(
            saga.mark_compensation_completed(),
            Err(DomainError::CompensationNotRequired(_))
        ));
        saga.require_compensation("timeout").unwrap();
        saga.mark_compensation_completed().unwrap();
        assert_eq!(saga.status(), Compensated);
        assert!(saga.compensation_required() && saga.compensation_completed());
    }

    #[test]
    fn terminal_status_never_regresses() {
        let mut saga = tracked();
        saga.mark_step_completed("PaymentProcessed").unwrap();
        saga.mark_completed().unwrap();
        assert!(saga.mark_step_completed("InventoryReserved").is_err());
        assert!(saga.mark_step_failed("PaymentFailed", "late").is_err());
        assert!(saga.require_compensation("late").is_err());
        assert_eq!(saga.status(), Completed);
    }

    #[test]
    fn late_completion_during_compensation_is_recorded() {
        let mut saga = tracked();
        saga.mark_step_completed("PaymentProcessed").unwrap();
        saga.require_compensation("timeout").unwrap();
        saga.mark_step_completed("InventoryReserved").unwrap();
        assert_eq!(saga.status(), Compensating);
        assert!(saga.has_completed("InventoryReserved"));
    }

    #[test]
    fn an_event_applies_once() {
        let mut saga = tracked();
        let event_id = EventId::new();
        saga.record_applied_event(event_id).unwrap();
        assert!(saga.has_applied(event_id));
        assert!(matches!(
            saga.record_applied_event(event_id),
            Err(DomainError::EventAlreadyApplied { .. })
        ));
        saga.record_applied_event(EventId::new()).unwrap();
    }

    #[test]
    fn applied_events_survive_serialization() {
        let mut saga = tracked();
        let event_id = EventId::new();
        saga.record_applied_event(event_id).unwrap();
        let restored: ChoreographedSagaState =
            serde_json::from_value(serde_json::to_value(&saga).unwrap()).unwrap();
        assert!(restored.has_applied(event_id));
    }

    #[test]
    fn timeout_is_strict() {
        let now = Utc::now();
        let saga = tracked().with_timeout_at(now);
        assert!(!saga.is_timed_out(now));
        assert!(saga.is_timed_out(now + Duration::milliseconds(1)));
    }
}
