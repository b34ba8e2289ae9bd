//! Publisher-side retry for a briefly unavailable exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::EventPublisher;
use crate::envelope::DomainEvent;
use crate::error::{BusError, Result};

/// Backoff schedule for failed publishes: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone)]
pub struct PublishRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl PublishRetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Wraps a publisher and retries [`BusError::Unavailable`] failures.
///
/// Validation and serialization failures are returned at once.
#[derive(Clone)]
pub struct RetryingPublisher {
    inner: Arc<dyn EventPublisher>,
    policy: PublishRetryPolicy,
}

impl RetryingPublisher {
    pub fn new(inner: Arc<dyn EventPublisher>, policy: PublishRetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &PublishRetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl EventPublisher for RetryingPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.publish(event).await {
                Ok(()) => return Ok(()),
                Err(BusError::Unavailable(reason)) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        event_id = %event.event_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "publish failed, retrying"
                    );
                    metrics::counter!("bus_publish_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(BusError::Unavailable(reason)) => {
                    tracing::error!(event_id = %event.event_id, attempt, error = %reason, "publish abandoned");
                    return Err(BusError::PublishFailed {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
