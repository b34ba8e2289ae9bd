use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// Importance of an audited event, ordered `Info < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

const CRITICAL_KEYWORDS: [&str; 4] = ["failed", "cancelled", "error", "timeout"];
const HIGH_KEYWORDS: [&str; 4] = ["payment", "refund", "inventory", "transaction"];
const MEDIUM_KEYWORDS: [&str; 4] = ["order", "fulfilled", "delivered", "reserved"];
const LOW_KEYWORDS: [&str; 3] = ["notification", "status", "update"];

impl AuditLevel {
    pub const ALL: [AuditLevel; 5] = [
        AuditLevel::Info,
        AuditLevel::Low,
        AuditLevel::Medium,
        AuditLevel::High,
        AuditLevel::Critical,
    ];

    /// Level of an event type, by the first keyword group it contains.
    pub fn from_event_type(event_type: &str) -> Self {
        let lower = event_type.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if contains_any(&CRITICAL_KEYWORDS) {
            AuditLevel::Critical
        } else if contains_any(&HIGH_KEYWORDS) {
            AuditLevel::High
        } else if contains_any(&MEDIUM_KEYWORDS) {
            AuditLevel::Medium
        } else if contains_any(&LOW_KEYWORDS) {
            AuditLevel::Low
        } else {
            AuditLevel::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Low => "LOW",
            AuditLevel::Medium => "MEDIUM",
            AuditLevel::High => "HIGH",
            AuditLevel::Critical => "CRITICAL",
        }
    }

    /// Numeric rank stored next to the name for range queries.
    pub fn rank(&self) -> i16 {
        match self {
            AuditLevel::Info => 0,
            AuditLevel::Low => 1,
            AuditLevel::Medium => 2,
            AuditLevel::High => 3,
            AuditLevel::Critical => 4,
        }
    }

    pub fn requires_compliance_tracking(&self) -> bool {
        *self >= AuditLevel::High
    }

    pub fn requires_immediate_notification(&self) -> bool {
        *self == AuditLevel::Critical
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditLevel {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AuditError::InvalidQuery(format!("unknown audit level '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_groups() {
        assert_eq!(AuditLevel::from_event_type("PaymentFailed"), AuditLevel::Critical);
        assert_eq!(AuditLevel::from_event_type("TransactionCancelled"), AuditLevel::Critical);
        assert_eq!(AuditLevel::from_event_type("PaymentProcessed"), AuditLevel::High);
        assert_eq!(AuditLevel::from_event_type("InventoryReserved"), AuditLevel::High);
        assert_eq!(AuditLevel::from_event_type("OrderFulfilled"), AuditLevel::Medium);
        assert_eq!(AuditLevel::from_event_type("SaleStockReserved"), AuditLevel::Medium);
        assert_eq!(AuditLevel::from_event_type("StatusChanged"), AuditLevel::Low);
        assert_eq!(AuditLevel::from_event_type("SaleConfirmed"), AuditLevel::Info);
    }

    #[test]
    fn ordering_and_parsing() {
        assert!(AuditLevel::Info < AuditLevel::Low);
        assert!(AuditLevel::High < AuditLevel::Critical);
        assert_eq!("critical".parse::<AuditLevel>().unwrap(), AuditLevel::Critical);
        assert!("urgent".parse::<AuditLevel>().is_err());
        assert!(AuditLevel::High.requires_compliance_tracking());
        assert!(!AuditLevel::Medium.requires_compliance_tracking());
    }
}
