//! The orchestrated sale record.

use chrono::{DateTime, Utc};
use common::{Money, SagaId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::machine::{StateGraph, Transitionable, next_timestamp, transition};
use crate::state::SagaState;

/// One forward step of the orchestrated sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStep {
    VerifyStock,
    ReserveStock,
    ProcessPayment,
    ConfirmOrder,
}

impl SagaStep {
    /// Steps in execution order.
    pub const SEQUENCE: [SagaStep; 4] = [
        SagaStep::VerifyStock,
        SagaStep::ReserveStock,
        SagaStep::ProcessPayment,
        SagaStep::ConfirmOrder,
    ];

    /// Name recorded in `completed_steps` once the step succeeds.
    pub fn completed_name(&self) -> &'static str {
        match self {
            SagaStep::VerifyStock => "StockVerified",
            SagaStep::ReserveStock => "StockReserved",
            SagaStep::ProcessPayment => "PaymentProcessed",
            SagaStep::ConfirmOrder => "OrderConfirmed",
        }
    }

    /// State the saga moves to when the step succeeds.
    pub fn target_state(&self) -> SagaState {
        match self {
            SagaStep::VerifyStock => SagaState::StockVerified,
            SagaStep::ReserveStock => SagaState::StockReserved,
            SagaStep::ProcessPayment => SagaState::PaymentProcessed,
            SagaStep::ConfirmOrder => SagaState::Confirmed,
        }
    }

    /// Collaborator the step calls.
    pub fn service(&self) -> &'static str {
        match self {
            SagaStep::VerifyStock | SagaStep::ReserveStock => "inventory-service",
            SagaStep::ProcessPayment => "payment-service",
            SagaStep::ConfirmOrder => "order-service",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::VerifyStock => "verify_stock",
            SagaStep::ReserveStock => "reserve_stock",
            SagaStep::ProcessPayment => "process_payment",
            SagaStep::ConfirmOrder => "confirm_order",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress record of one orchestrated sale.
///
/// Every mutator refuses to touch a terminal record, and every mutation
/// strictly advances `updated_at`. The state field is written only through
/// [`transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    saga_id: SagaId,
    state: SagaState,
    customer_id: String,
    product_id: String,
    quantity: u32,
    amount: Money,
    reservation_id: Option<String>,
    payment_transaction_id: Option<String>,
    order_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
    completed_steps: Vec<String>,
    compensation_failures: Vec<String>,
    version: Version,
}

/// Checks the input of a sale before any record is opened for it.
pub fn validate_sale(customer_id: &str, product_id: &str, quantity: u32, amount: Money) -> Result<()> {
    if customer_id.trim().is_empty() {
        return Err(DomainError::Validation("customerId is required".into()));
    }
    if product_id.trim().is_empty() {
        return Err(DomainError::Validation("productId is required".into()));
    }
    if quantity == 0 {
        return Err(DomainError::Validation(
            "quantity must be greater than zero".into(),
        ));
    }
    if !amount.is_positive() {
        return Err(DomainError::Validation(
            "amount must be greater than zero".into(),
        ));
    }
    Ok(())
}

impl SagaExecution {
    /// Creates a record in the `Initiated` state.
    pub fn new(
        saga_id: SagaId,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        amount: Money,
    ) -> Result<Self> {
        let customer_id = customer_id.into();
        let product_id = product_id.into();
        validate_sale(&customer_id, &product_id, quantity, amount)?;

        let now = Utc::now();
        Ok(Self {
            saga_id,
            state: SagaState::Initiated,
            customer_id,
            product_id,
            quantity,
            amount,
            reservation_id: None,
            payment_transaction_id: None,
            order_id: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            completed_steps: Vec::new(),
            compensation_failures: Vec::new(),
            version: Version::initial(),
        })
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn reservation_id(&self) -> Option<&str> {
        self.reservation_id.as_deref()
    }

    pub fn payment_transaction_id(&self) -> Option<&str> {
        self.payment_transaction_id.as_deref()
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Names of completed steps, in completion order.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn compensation_failures(&self) -> &[String] {
        &self.compensation_failures
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Sets the stored version. Called by repositories after a write.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if the step has already completed.
    pub fn has_completed(&self, step: SagaStep) -> bool {
        self.completed_steps
            .iter()
            .any(|s| s == step.completed_name())
    }

    /// Moves to the step's target state and records the step as completed.
    pub fn complete_step(&mut self, step: SagaStep) -> Result<()> {
        self.ensure_mutable()?;
        transition(self, step.target_state())?;
        if !self.has_completed(step) {
            self.completed_steps.push(step.completed_name().to_string());
        }
        Ok(())
    }

    pub fn record_reservation(&mut self, reservation_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.reservation_id = Some(reservation_id.into());
        self.touch();
        Ok(())
    }

    pub fn record_payment(&mut self, transaction_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.payment_transaction_id = Some(transaction_id.into());
        self.touch();
        Ok(())
    }

    pub fn record_order(&mut self, order_id: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.order_id = Some(order_id.into());
        self.touch();
        Ok(())
    }

    /// Enters compensation, capturing the error that stopped the sale.
    pub fn begin_compensation(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        transition(self, SagaState::Compensating)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Records a reverse action that could not be completed.
    pub fn record_compensation_failure(&mut self, failure: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.compensation_failures.push(failure.into());
        self.touch();
        Ok(())
    }

    /// Marks the sale failed. Keeps an earlier error message if `error` is `None`.
    pub fn fail(&mut self, error: Option<String>) -> Result<()> {
        self.ensure_mutable()?;
        transition(self, SagaState::Failed)?;
        if let Some(error) = error {
            self.error_message = Some(error);
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(DomainError::TerminalRecord {
                saga_id: self.saga_id,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = next_timestamp(self.updated_at);
    }
}

impl Transitionable for SagaExecution {
    type State = SagaState;

    fn status(&self) -> SagaState {
        self.state
    }

    fn apply_transition(&mut self, target: SagaState, at: DateTime<Utc>) {
        self.state = target;
        self.updated_at = at;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
