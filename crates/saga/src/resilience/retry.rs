//! Bounded retry with exponential backoff and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::circuit_breaker::CircuitBreaker;
use crate::error::{Result, SagaError};

/// Exponential backoff: `min(base * 2^retry, max)` plus up to
/// `jitter_factor` of random spread either way.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry_count` (0-indexed).
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(31));
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let millis = delay.as_millis() as i64;
        let jitter_range = (millis as f64 * self.jitter_factor) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };
        Duration::from_millis((millis + jitter).max(0) as u64)
    }
}

/// How one collaborator call is attempted.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    pub max_attempts: u32,
    /// Bound on each individual attempt.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl StepPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs `op` through the breaker, retrying transient failures.
///
/// Business rejections and non-transient errors are returned as-is. An open
/// circuit fails fast without consuming attempts. Exhausted retries come back
/// as [`SagaError::RetriesExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(
    step: &str,
    service: &'static str,
    policy: &StepPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if !breaker.can_proceed().await {
            metrics::counter!("saga_circuit_rejections_total", "service" => service).increment(1);
            return Err(SagaError::CircuitOpen {
                service: service.to_string(),
            });
        }

        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SagaError::Timeout {
                service,
                timeout: policy.timeout,
            }),
        };

        let error = match outcome {
            Ok(value) => {
                breaker.record_success().await;
                return Ok(value);
            }
            Err(e) if e.is_transient() => e,
            Err(e) => {
                if matches!(e, SagaError::BusinessRejected { .. }) {
                    breaker.record_success().await;
                }
                return Err(e);
            }
        };

        breaker.record_failure().await;
        if !policy.can_retry(attempt) {
            tracing::warn!(step, service, attempt, error = %error, "retries exhausted");
            return Err(SagaError::RetriesExhausted {
                step: step.to_string(),
                attempts: attempt,
                last_error: error.to_string(),
            });
        }

        let delay = policy.backoff.calculate_delay(attempt - 1);
        tracing::debug!(
            step,
            service,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retrying"
        );
        metrics::counter!("saga_step_retries_total", "step" => step.to_string()).increment(1);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("inventory-service", CircuitBreakerConfig::default())
    }

    fn policy() -> StepPolicy {
        StepPolicy::default().with_backoff(BackoffConfig::default().with_jitter_factor(0.0))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let backoff = BackoffConfig::default()
            .with_jitter_factor(0.0)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(backoff.calculate_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = BackoffConfig::default().with_jitter_factor(0.2);
        for _ in 0..100 {
            let delay = backoff.calculate_delay(1).as_millis();
            assert!((160..=240).contains(&delay), "{delay}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = retry_with_backoff("reserve_stock", "inventory-service", &policy(), &breaker(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SagaError::unavailable("inventory-service", "503"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn business_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = retry_with_backoff::<(), _, _>("process_payment", "payment-service", &policy(), &breaker(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SagaError::rejected("payment-service", "declined")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SagaError::BusinessRejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempts() {
        let err = retry_with_backoff::<(), _, _>("confirm_order", "order-service", &policy(), &breaker(), || async {
            Err(SagaError::unavailable("order-service", "503"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SagaError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let policy = policy()
            .with_max_attempts(1)
            .with_timeout(Duration::from_millis(50));
        let err = retry_with_backoff("verify_stock", "inventory-service", &policy, &breaker(), || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            SagaError::RetriesExhausted { last_error, .. } => {
                assert!(last_error.contains("did not answer"), "{last_error}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast() {
        let cb = CircuitBreaker::new(
            "payment-service",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_secs(60)),
        );
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = retry_with_backoff("process_payment", "payment-service", &policy(), &cb, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SagaError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
