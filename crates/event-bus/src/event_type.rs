use serde::{Deserialize, Serialize};

/// Identifier of a business event.
///
/// Known events get a variant; anything else round-trips through
/// [`EventType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    TransactionCreated,
    TransactionCompleted,
    TransactionCancelled,
    PaymentProcessed,
    PaymentFailed,
    PaymentRefunded,
    InventoryReserved,
    InventoryUnavailable,
    InventoryReleased,
    OrderFulfilled,
    OrderDelivered,
    OrderCancelled,
    SaleStockVerified,
    SaleStockReserved,
    SalePaymentProcessed,
    SaleConfirmed,
    SaleFailed,
    Other(String),
}

impl EventType {
    /// Every named variant.
    pub const KNOWN: [EventType; 17] = [
        EventType::TransactionCreated,
        EventType::TransactionCompleted,
        EventType::TransactionCancelled,
        EventType::PaymentProcessed,
        EventType::PaymentFailed,
        EventType::PaymentRefunded,
        EventType::InventoryReserved,
        EventType::InventoryUnavailable,
        EventType::InventoryReleased,
        EventType::OrderFulfilled,
        EventType::OrderDelivered,
        EventType::OrderCancelled,
        EventType::SaleStockVerified,
        EventType::SaleStockReserved,
        EventType::SalePaymentProcessed,
        EventType::SaleConfirmed,
        EventType::SaleFailed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::TransactionCreated => "TransactionCreated",
            EventType::TransactionCompleted => "TransactionCompleted",
            EventType::TransactionCancelled => "TransactionCancelled",
            EventType::PaymentProcessed => "PaymentProcessed",
            EventType::PaymentFailed => "PaymentFailed",
            EventType::PaymentRefunded => "PaymentRefunded",
            EventType::InventoryReserved => "InventoryReserved",
            EventType::InventoryUnavailable => "InventoryUnavailable",
            EventType::InventoryReleased => "InventoryReleased",
            EventType::OrderFulfilled => "OrderFulfilled",
            EventType::OrderDelivered => "OrderDelivered",
            EventType::OrderCancelled => "OrderCancelled",
            EventType::SaleStockVerified => "SaleStockVerified",
            EventType::SaleStockReserved => "SaleStockReserved",
            EventType::SalePaymentProcessed => "SalePaymentProcessed",
            EventType::SaleConfirmed => "SaleConfirmed",
            EventType::SaleFailed => "SaleFailed",
            EventType::Other(name) => name,
        }
    }

    /// Aggregate type that conventionally emits this event.
    pub fn default_aggregate_type(&self) -> Option<&'static str> {
        match self {
            EventType::TransactionCreated
            | EventType::TransactionCompleted
            | EventType::TransactionCancelled => Some("Transaction"),
            EventType::PaymentProcessed | EventType::PaymentFailed | EventType::PaymentRefunded => {
                Some("Payment")
            }
            EventType::InventoryReserved
            | EventType::InventoryUnavailable
            | EventType::InventoryReleased => Some("Inventory"),
            EventType::OrderFulfilled | EventType::OrderDelivered | EventType::OrderCancelled => {
                Some("Order")
            }
            EventType::SaleStockVerified
            | EventType::SaleStockReserved
            | EventType::SalePaymentProcessed
            | EventType::SaleConfirmed
            | EventType::SaleFailed => Some("Sale"),
            EventType::Other(_) => None,
        }
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::KNOWN
            .into_iter()
            .find(|known| known.as_str() == name)
            .unwrap_or(EventType::Other(name))
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::from(name.to_string())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
