use chrono::{DateTime, Utc};
use common::EventId;
use event_bus::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::level::AuditLevel;

/// One audited event. Written once per event id and never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    /// Surrogate key assigned by the store; zero until recorded.
    pub id: i64,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub service_name: String,
    pub level: AuditLevel,
    pub correlation_id: String,
    pub causation_id: Option<EventId>,
    pub event_version: i32,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub compliance_tags: Vec<String>,
    pub business_context: String,
    pub requires_compliance_tracking: bool,
    pub recorded_at: DateTime<Utc>,
}

impl AuditLog {
    /// Snapshots `event` and classifies it.
    pub fn from_event(event: &DomainEvent) -> Self {
        let event_type = event.event_type.as_str().to_string();
        let level = AuditLevel::from_event_type(&event_type);
        Self {
            id: 0,
            event_id: event.event_id,
            service_name: service_name(event),
            compliance_tags: compliance_tags(&event_type, level),
            business_context: business_context(&event_type).to_string(),
            requires_compliance_tracking: level.requires_compliance_tracking(),
            level,
            event_type,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            correlation_id: event.correlation_id.clone(),
            causation_id: event.causation_id,
            event_version: event.version,
            timestamp: event.timestamp,
            payload: event.payload.clone(),
            metadata: serde_json::to_value(&event.metadata).unwrap_or(serde_json::Value::Null),
            recorded_at: Utc::now(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.compliance_tags.iter().any(|t| t == tag)
    }
}

/// Service that emitted `event`.
///
/// The `source` metadata entry wins; otherwise the name is guessed from the
/// event type, then from the aggregate type.
pub fn service_name(event: &DomainEvent) -> String {
    if let Some(source) = event.source().filter(|s| !s.trim().is_empty()) {
        return source.to_string();
    }

    let lower = event.event_type.as_str().to_lowercase();
    let by_convention = if lower.contains("transaction") {
        Some("transaction-service")
    } else if lower.contains("payment") {
        Some("payment-service")
    } else if lower.contains("inventory") {
        Some("inventory-service")
    } else if ["order", "fulfilled", "delivered"].iter().any(|k| lower.contains(k)) {
        Some("order-service")
    } else if lower.contains("sale") || lower.contains("saga") {
        Some("saga-orchestrator")
    } else {
        None
    };

    match by_convention {
        Some(name) => name.to_string(),
        None if !event.aggregate_type.trim().is_empty() => {
            format!("{}-service", event.aggregate_type.to_lowercase())
        }
        None => "unknown-service".to_string(),
    }
}

/// Regulatory tags that apply to an event type at `level`.
pub fn compliance_tags(event_type: &str, level: AuditLevel) -> Vec<String> {
    let lower = event_type.to_lowercase();
    let mut tags = Vec::new();
    if lower.contains("payment") || lower.contains("refund") {
        tags.extend(["PCI_DSS", "FINANCIAL_TRANSACTION"]);
    }
    if lower.contains("transaction") {
        tags.extend(["TRANSACTION_LOG", "BUSINESS_CRITICAL"]);
    }
    if lower.contains("inventory") {
        tags.push("INVENTORY_CONTROL");
    }
    if lower.contains("failed") || lower.contains("error") {
        tags.extend(["ERROR_TRACKING", "INCIDENT_MANAGEMENT"]);
    }
    if level == AuditLevel::Critical {
        tags.extend(["CRITICAL_EVENT", "IMMEDIATE_ATTENTION"]);
    }
    tags.into_iter().map(String::from).collect()
}

/// Business area an event type belongs to.
pub fn business_context(event_type: &str) -> &'static str {
    if event_type.contains("Transaction") {
        "E-COMMERCE_TRANSACTION"
    } else if event_type.contains("Payment") {
        "PAYMENT_PROCESSING"
    } else if event_type.contains("Inventory") {
        "INVENTORY_MANAGEMENT"
    } else if event_type.contains("Order") {
        "ORDER_FULFILLMENT"
    } else if event_type.contains("Sale") {
        "SALE_PROCESSING"
    } else {
        "GENERAL_BUSINESS_EVENT"
    }
}
