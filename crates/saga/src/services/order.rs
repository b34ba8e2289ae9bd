//! Order service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use common::{Money, SagaId};

use super::{Fault, apply_fault};
use crate::error::Result;

const SERVICE: &str = "order-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Trait for order confirmation operations.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Confirms the sale's order, once per saga.
    async fn confirm_order(
        &self,
        saga_id: SagaId,
        customer_id: &str,
        product_id: &str,
        quantity: u32,
        amount: Money,
    ) -> Result<OrderConfirmation>;

    /// Cancels the saga's order. Returns the cancelled order id, or `None`
    /// if no confirmed order exists.
    async fn cancel_order(&self, saga_id: SagaId) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<SagaId, OrderConfirmation>,
    next_id: u32,
    confirm_fault: Fault,
    cancel_fault: Fault,
    confirm_calls: u32,
    cancel_calls: u32,
}

/// In-memory order service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_confirm(&self, fail: bool) {
        self.state().confirm_fault.reject = fail.then(|| "Order rejected".to_string());
    }

    pub fn set_confirm_unavailable_for(&self, calls: u32) {
        self.state().confirm_fault.unavailable_for = calls;
    }

    pub fn set_cancel_unavailable_for(&self, calls: u32) {
        self.state().cancel_fault.unavailable_for = calls;
    }

    pub fn confirm_calls(&self) -> u32 {
        self.state().confirm_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        self.state().cancel_calls
    }

    pub fn confirmed_count(&self) -> usize {
        self.state()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Confirmed)
            .count()
    }

    pub fn status_for(&self, saga_id: SagaId) -> Option<OrderStatus> {
        self.state().orders.get(&saga_id).map(|o| o.status)
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryOrderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn confirm_order(
        &self,
        saga_id: SagaId,
        _customer_id: &str,
        _product_id: &str,
        _quantity: u32,
        _amount: Money,
    ) -> Result<OrderConfirmation> {
        let tripped = {
            let mut state = self.state();
            state.confirm_calls += 1;
            state.confirm_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        if let Some(existing) = state.orders.get(&saga_id) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let confirmation = OrderConfirmation {
            order_id: format!("O{}", state.next_id),
            status: OrderStatus::Confirmed,
        };
        state.orders.insert(saga_id, confirmation.clone());
        Ok(confirmation)
    }

    async fn cancel_order(&self, saga_id: SagaId) -> Result<Option<String>> {
        let tripped = {
            let mut state = self.state();
            state.cancel_calls += 1;
            state.cancel_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        match state.orders.get_mut(&saga_id) {
            Some(order) if order.status == OrderStatus::Confirmed => {
                order.status = OrderStatus::Cancelled;
                Ok(Some(order.order_id.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_is_deduped_and_cancel_is_idempotent() {
        let service = InMemoryOrderService::new();
        let saga_id = SagaId::new();
        let amount = Money::from_cents(5000);

        let first = service
            .confirm_order(saga_id, "C1", "P1", 2, amount)
            .await
            .unwrap();
        let again = service
            .confirm_order(saga_id, "C1", "P1", 2, amount)
            .await
            .unwrap();
        assert_eq!(first.order_id, "O1");
        assert_eq!(first, again);

        assert_eq!(
            service.cancel_order(saga_id).await.unwrap(),
            Some("O1".into())
        );
        assert_eq!(service.cancel_order(saga_id).await.unwrap(), None);
        assert_eq!(service.status_for(saga_id), Some(OrderStatus::Cancelled));
        assert_eq!(service.cancel_calls(), 2);
    }
}
