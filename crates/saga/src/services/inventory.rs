//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::SagaId;

use super::{Fault, apply_fault};
use crate::error::{Result, SagaError};

const SERVICE: &str = "inventory-service";
const RESERVATION_TTL_MINUTES: i64 = 15;

/// Answer to a stock availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockCheck {
    pub available: bool,
    pub available_quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Active,
    Released,
    Confirmed,
}

/// Stock held for one saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReservation {
    pub reservation_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub saga_id: SagaId,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
}

/// Trait for stock operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn verify_stock(
        &self,
        product_id: &str,
        quantity: u32,
        saga_id: SagaId,
    ) -> Result<StockCheck>;

    /// Holds `quantity` units for the saga.
    ///
    /// Returns the existing reservation if the saga already holds one for
    /// this product.
    async fn reserve_stock(
        &self,
        product_id: &str,
        quantity: u32,
        saga_id: SagaId,
    ) -> Result<StockReservation>;

    /// Releases every active reservation of the saga. Returns the released
    /// reservation ids, empty if there was nothing to release.
    async fn release_reservation(&self, saga_id: SagaId) -> Result<Vec<String>>;

    async fn has_active_reservation(&self, product_id: &str, saga_id: SagaId) -> Result<bool>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<String, u32>,
    default_stock: u32,
    reservations: Vec<StockReservation>,
    next_id: u32,
    verify_fault: Fault,
    reserve_fault: Fault,
    release_fault: Fault,
    verify_calls: u32,
    reserve_calls: u32,
    release_calls: u32,
}

impl InMemoryInventoryState {
    fn on_hand(&self, product_id: &str) -> u32 {
        self.stock
            .get(product_id)
            .copied()
            .unwrap_or(self.default_stock)
    }
}

/// In-memory inventory service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a service where unknown products have no stock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service where unknown products start with `quantity` units.
    pub fn with_default_stock(quantity: u32) -> Self {
        let service = Self::new();
        service.state().default_stock = quantity;
        service
    }

    pub fn set_stock(&self, product_id: impl Into<String>, quantity: u32) {
        self.state().stock.insert(product_id.into(), quantity);
    }

    /// Units currently available for `product_id`.
    pub fn stock_level(&self, product_id: &str) -> u32 {
        self.state().on_hand(product_id)
    }

    /// Makes the next `calls` reservations fail transiently.
    pub fn set_reserve_unavailable_for(&self, calls: u32) {
        self.state().reserve_fault.unavailable_for = calls;
    }

    /// Makes reservations fail with a business rejection while set.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.state().reserve_fault.reject = fail.then(|| "Insufficient stock".to_string());
    }

    pub fn set_verify_unavailable_for(&self, calls: u32) {
        self.state().verify_fault.unavailable_for = calls;
    }

    pub fn set_verify_delay(&self, delay: Option<std::time::Duration>) {
        self.state().verify_fault.delay = delay;
    }

    pub fn set_release_unavailable_for(&self, calls: u32) {
        self.state().release_fault.unavailable_for = calls;
    }

    pub fn verify_calls(&self) -> u32 {
        self.state().verify_calls
    }

    pub fn reserve_calls(&self) -> u32 {
        self.state().reserve_calls
    }

    pub fn release_calls(&self) -> u32 {
        self.state().release_calls
    }

    /// Number of active reservations across all sagas.
    pub fn active_reservation_count(&self) -> usize {
        self.state()
            .reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Active)
            .count()
    }

    pub fn reservations_for(&self, saga_id: SagaId) -> Vec<StockReservation> {
        self.state()
            .reservations
            .iter()
            .filter(|r| r.saga_id == saga_id)
            .cloned()
            .collect()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn verify_stock(
        &self,
        product_id: &str,
        quantity: u32,
        _saga_id: SagaId,
    ) -> Result<StockCheck> {
        let tripped = {
            let mut state = self.state();
            state.verify_calls += 1;
            state.verify_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let available_quantity = self.state().on_hand(product_id);
        Ok(StockCheck {
            available: available_quantity >= quantity,
            available_quantity,
        })
    }

    async fn reserve_stock(
        &self,
        product_id: &str,
        quantity: u32,
        saga_id: SagaId,
    ) -> Result<StockReservation> {
        let tripped = {
            let mut state = self.state();
            state.reserve_calls += 1;
            state.reserve_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        if let Some(existing) = state.reservations.iter().find(|r| {
            r.saga_id == saga_id && r.product_id == product_id && r.status == ReservationStatus::Active
        }) {
            return Ok(existing.clone());
        }

        let on_hand = state.on_hand(product_id);
        if on_hand < quantity {
            return Err(SagaError::rejected(
                SERVICE,
                format!("Insufficient stock for {product_id}: requested {quantity}, available {on_hand}"),
            ));
        }
        state.stock.insert(product_id.to_string(), on_hand - quantity);

        state.next_id += 1;
        let reservation = StockReservation {
            reservation_id: format!("R{}", state.next_id),
            product_id: product_id.to_string(),
            quantity,
            saga_id,
            status: ReservationStatus::Active,
            expires_at: Utc::now() + Duration::minutes(RESERVATION_TTL_MINUTES),
        };
        state.reservations.push(reservation.clone());
        Ok(reservation)
    }

    async fn release_reservation(&self, saga_id: SagaId) -> Result<Vec<String>> {
        let tripped = {
            let mut state = self.state();
            state.release_calls += 1;
            state.release_fault.trip(SERVICE)
        };
        apply_fault(tripped).await?;

        let mut state = self.state();
        let mut restored = Vec::new();
        let mut released = Vec::new();
        for reservation in state.reservations.iter_mut() {
            if reservation.saga_id == saga_id && reservation.status == ReservationStatus::Active {
                reservation.status = ReservationStatus::Released;
                restored.push((reservation.product_id.clone(), reservation.quantity));
                released.push(reservation.reservation_id.clone());
            }
        }
        for (product_id, quantity) in restored {
            let on_hand = state.on_hand(&product_id);
            state.stock.insert(product_id, on_hand + quantity);
        }
        Ok(released)
    }

    async fn has_active_reservation(&self, product_id: &str, saga_id: SagaId) -> Result<bool> {
        Ok(self.state().reservations.iter().any(|r| {
            r.saga_id == saga_id && r.product_id == product_id && r.status == ReservationStatus::Active
        }))
    }
}
