//! Orchestrated sale state graph.

use serde::{Deserialize, Serialize};

use crate::machine::StateGraph;

/// The state of an orchestrated sale.
///
/// State transitions:
/// ```text
/// Initiated ──► StockVerified ──► StockReserved ──► PaymentProcessed ──► Confirmed
///     │              │                 │    │              │    │
///     │              │                 │    └──► Compensating ◄┘    │
///     │              │                 │              │             │
///     └──────────────┴─────────────────┴──────────────┴─────────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Record created, no collaborator has been called yet.
    #[default]
    Initiated,

    /// Stock availability confirmed.
    StockVerified,

    /// Stock reserved for this saga.
    StockReserved,

    /// Payment captured.
    PaymentProcessed,

    /// Order confirmed (terminal state).
    Confirmed,

    /// Reverse actions for completed steps are in progress.
    Compensating,

    /// Sale did not complete (terminal state).
    Failed,
}

impl SagaState {
    /// Every state, in declaration order.
    pub const ALL: [SagaState; 7] = [
        SagaState::Initiated,
        SagaState::StockVerified,
        SagaState::StockReserved,
        SagaState::PaymentProcessed,
        SagaState::Confirmed,
        SagaState::Compensating,
        SagaState::Failed,
    ];

    /// Returns the state name as used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Initiated => "INITIATED",
            SagaState::StockVerified => "STOCK_VERIFIED",
            SagaState::StockReserved => "STOCK_RESERVED",
            SagaState::PaymentProcessed => "PAYMENT_PROCESSED",
            SagaState::Confirmed => "CONFIRMED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Failed => "FAILED",
        }
    }

    /// Returns the non-terminal states.
    pub fn active() -> impl Iterator<Item = SagaState> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal())
    }
}

impl StateGraph for SagaState {
    fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Confirmed | SagaState::Failed)
    }

    fn successors(&self) -> &'static [Self] {
        use SagaState::*;
        match self {
            Initiated => &[StockVerified, Failed],
            StockVerified => &[StockReserved, Failed],
            StockReserved => &[PaymentProcessed, Compensating, Failed],
            PaymentProcessed => &[Confirmed, Compensating, Failed],
            Compensating => &[Failed],
            Confirmed | Failed => &[],
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown saga state: {s}"))
    }
}
