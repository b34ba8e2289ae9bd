use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a decimal amount cannot be represented as money.
#[derive(Debug, Error, PartialEq)]
pub enum MoneyError {
    #[error("amount must be a finite number")]
    NotFinite,

    #[error("amount must be greater than zero, got {0}")]
    NotPositive(f64),

    #[error("amount {0} has more than two decimal places")]
    TooPrecise(f64),
}

/// Monetary amount stored in cents to avoid floating point drift.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates an amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Converts a positive decimal amount (e.g. `50.00`) to cents.
    pub fn try_from_decimal(amount: f64) -> Result<Self, MoneyError> {
        if !amount.is_finite() {
            return Err(MoneyError::NotFinite);
        }
        if amount <= 0.0 {
            return Err(MoneyError::NotPositive(amount));
        }
        let scaled = amount * 100.0;
        let cents = scaled.round();
        if (scaled - cents).abs() > 1e-6 {
            return Err(MoneyError::TooPrecise(amount));
        }
        Ok(Self(cents as i64))
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the amount as a decimal number.
    pub fn to_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{sign}{}.{:02}", (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_conversion() {
        let amount = Money::try_from_decimal(50.0).unwrap();
        assert_eq!(amount.cents(), 5000);
        assert_eq!(amount.to_string(), "50.00");
        assert_eq!(Money::try_from_decimal(19.99).unwrap().cents(), 1999);
    }

    #[test]
    fn rejects_invalid_amounts() {
        assert_eq!(Money::try_from_decimal(0.0), Err(MoneyError::NotPositive(0.0)));
        assert_eq!(Money::try_from_decimal(-3.5), Err(MoneyError::NotPositive(-3.5)));
        assert_eq!(Money::try_from_decimal(f64::NAN), Err(MoneyError::NotFinite));
        assert_eq!(Money::try_from_decimal(1.005), Err(MoneyError::TooPrecise(1.005)));
    }

    #[test]
    fn display_pads_cents() {
        assert_eq!(Money::from_cents(705).to_string(), "7.05");
        assert_eq!(Money::from_cents(-250).to_string(), "-2.50");
    }
}
