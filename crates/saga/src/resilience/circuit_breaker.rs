//! Per-collaborator circuit breaker.
//!
//! - Closed: calls pass, consecutive failures are counted
//! - Open: calls are rejected until the cooldown elapses
//! - HalfOpen: trial calls pass; enough successes close the circuit, any
//!   failure reopens it

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Time spent open before a trial call is let through.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
    failures: Arc<AtomicU32>,
    successes: Arc<AtomicU32>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            })),
            failures: Arc::new(AtomicU32::new(0)),
            successes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns false while the circuit is open and the cooldown has not
    /// elapsed. An elapsed cooldown moves the circuit to half-open.
    pub async fn can_proceed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    self.successes.store(0, Ordering::SeqCst);
                    self.set_state(&mut inner, CircuitState::HalfOpen);
                }
                cooled
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        self.failures.store(0, Ordering::SeqCst);
        if inner.state == CircuitState::HalfOpen {
            let successes = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                self.successes.store(0, Ordering::SeqCst);
                inner.opened_at = None;
                self.set_state(&mut inner, CircuitState::Closed);
                info!(service = %self.service, "circuit closed, collaborator recovered");
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        match inner.state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.set_state(&mut inner, CircuitState::Open);
                error!(service = %self.service, failures, "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.successes.store(0, Ordering::SeqCst);
                self.set_state(&mut inner, CircuitState::Open);
                error!(service = %self.service, "circuit reopened, trial call failed");
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.failures.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
        inner.opened_at = None;
        self.set_state(&mut inner, CircuitState::Closed);
    }

    fn set_state(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state != next {
            tracing::debug!(
                service = %self.service,
                from = inner.state.as_str(),
                to = next.as_str(),
                "circuit state transition"
            );
            metrics::counter!(
                "saga_circuit_transitions_total",
                "service" => self.service.clone(),
                "to" => next.as_str()
            )
            .increment(1);
            inner.state = next;
        }
    }
}
