//! Retry, backoff and circuit breaking around collaborator calls.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{BackoffConfig, StepPolicy, retry_with_backoff};

pub const INVENTORY_SERVICE: &str = "inventory-service";
pub const PAYMENT_SERVICE: &str = "payment-service";
pub const ORDER_SERVICE: &str = "order-service";

/// One breaker per collaborator, shared by every caller of that collaborator.
#[derive(Debug, Clone)]
pub struct ServiceBreakers {
    pub inventory: CircuitBreaker,
    pub payment: CircuitBreaker,
    pub order: CircuitBreaker,
}

impl ServiceBreakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            inventory: CircuitBreaker::new(INVENTORY_SERVICE, config.clone()),
            payment: CircuitBreaker::new(PAYMENT_SERVICE, config.clone()),
            order: CircuitBreaker::new(ORDER_SERVICE, config.clone()),
        }
    }

    /// Breaker guarding `service`. Unknown names fall back to the order
    /// breaker.
    pub fn for_service(&self, service: &str) -> &CircuitBreaker {
        match service {
            INVENTORY_SERVICE => &self.inventory,
            PAYMENT_SERVICE => &self.payment,
            _ => &self.order,
        }
    }
}

impl Default for ServiceBreakers {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}
