//! Collaborator contracts and in-memory implementations.
//!
//! Each collaborator dedupes on the saga id so a retried or re-delivered
//! request never creates a second reservation, payment or order.

pub mod inventory;
pub mod order;
pub mod payment;

use std::sync::Arc;
use std::time::Duration;

pub use inventory::{
    InMemoryInventoryService, InventoryService, ReservationStatus, StockCheck, StockReservation,
};
pub use order::{InMemoryOrderService, OrderConfirmation, OrderService, OrderStatus};
pub use payment::{InMemoryPaymentService, PaymentReceipt, PaymentService, PaymentStatus};

use crate::error::{Result, SagaError};

/// The three collaborators a sale talks to.
#[derive(Clone)]
pub struct SaleServices {
    pub inventory: Arc<dyn InventoryService>,
    pub payment: Arc<dyn PaymentService>,
    pub order: Arc<dyn OrderService>,
}

impl SaleServices {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        payment: Arc<dyn PaymentService>,
        order: Arc<dyn OrderService>,
    ) -> Self {
        Self {
            inventory,
            payment,
            order,
        }
    }

    /// Wraps in-memory collaborators. Clones of the handles stay usable for
    /// seeding stock and injecting failures.
    pub fn in_memory(
        inventory: InMemoryInventoryService,
        payment: InMemoryPaymentService,
        order: InMemoryOrderService,
    ) -> Self {
        Self::new(Arc::new(inventory), Arc::new(payment), Arc::new(order))
    }
}

/// Failure injection for one collaborator operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fault {
    /// Calls that fail transiently before the operation recovers.
    pub unavailable_for: u32,
    /// Business rejection returned on every call while set.
    pub reject: Option<String>,
    /// Latency added before the call is answered.
    pub delay: Option<Duration>,
}

impl Fault {
    /// Consumes one injected failure, if any, and returns the delay to apply.
    pub fn trip(&mut self, service: &'static str) -> (Option<Duration>, Result<()>) {
        let outcome = if self.unavailable_for > 0 {
            self.unavailable_for -= 1;
            Err(SagaError::unavailable(service, "service temporarily unavailable"))
        } else if let Some(reason) = &self.reject {
            Err(SagaError::rejected(service, reason.clone()))
        } else {
            Ok(())
        };
        (self.delay, outcome)
    }
}

/// Sleeps for the injected delay, then yields the injected outcome.
pub(crate) async fn apply_fault(tripped: (Option<Duration>, Result<()>)) -> Result<()> {
    let (delay, outcome) = tripped;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    outcome
}
