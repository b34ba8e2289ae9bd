//! Exchange, queue and dead-letter declarations.

use std::time::Duration;

use crate::routing::binding_matches;

/// The single topic exchange all business events are published to.
pub const BUSINESS_EVENTS_EXCHANGE: &str = "business.events";

pub const AUDIT_QUEUE: &str = "audit.events";
pub const AUDIT_DLX: &str = "audit.dlx";
pub const AUDIT_DLQ: &str = "audit.dlq";

pub const PAYMENT_QUEUE: &str = "payment.transaction.queue";
pub const INVENTORY_QUEUE: &str = "inventory.events.queue";
pub const FULFILLMENT_QUEUE: &str = "order.inventory.queue";
pub const SAGA_TRACKER_QUEUE: &str = "saga.tracker.queue";

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const AUDIT_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_DELIVERIES: u32 = 3;
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// Where a queue sends messages it gives up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

impl DeadLetterTarget {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// A durable queue bound to the business exchange.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub bindings: Vec<String>,
    /// Messages older than this at dequeue time are dead-lettered.
    pub message_ttl: Duration,
    pub dead_letter: DeadLetterTarget,
    /// Deliveries attempted before a transiently failing message is poison.
    pub max_deliveries: u32,
    pub redelivery_delay: Duration,
    /// Concurrent workers. One keeps arrival order.
    pub workers: usize,
}

impl QueueConfig {
    /// Declares a queue with the default TTL and a `<name>.dlq` dead-letter key
    /// on the default exchange.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let dead_letter = DeadLetterTarget::new("", format!("{name}.dlq"));
        Self {
            name,
            bindings: Vec::new(),
            message_ttl: DEFAULT_TTL,
            dead_letter,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            workers: 1,
        }
    }

    /// The audit sink's queue: everything, one hour TTL, own dead-letter exchange.
    pub fn audit() -> Self {
        Self::new(AUDIT_QUEUE)
            .with_binding("#")
            .with_message_ttl(AUDIT_TTL)
            .with_dead_letter(DeadLetterTarget::new(AUDIT_DLX, AUDIT_DLQ))
    }

    pub fn with_binding(mut self, pattern: impl Into<String>) -> Self {
        self.bindings.push(pattern.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn with_dead_letter(mut self, target: DeadLetterTarget) -> Self {
        self.dead_letter = target;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Returns true if any binding matches `routing_key`.
    pub fn accepts(&self, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|pattern| binding_matches(pattern, routing_key))
    }
}

/// The full set of queues on the business exchange.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchange: String,
    pub queues: Vec<QueueConfig>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            exchange: BUSINESS_EVENTS_EXCHANGE.to_string(),
            queues: Vec::new(),
        }
    }

    /// Participant, tracker and audit queues for the sale saga.
    pub fn sale_saga() -> Self {
        Self::new()
            .with_queue(QueueConfig::new(PAYMENT_QUEUE).with_binding("transaction.#"))
            .with_queue(
                QueueConfig::new(INVENTORY_QUEUE)
                    .with_binding("payment.#")
                    .with_binding("transaction.transaction.cancelled"),
            )
            .with_queue(QueueConfig::new(FULFILLMENT_QUEUE).with_binding("inventory.#"))
            .with_queue(
                QueueConfig::new(SAGA_TRACKER_QUEUE)
                    .with_binding("transaction.#")
                    .with_binding("payment.#")
                    .with_binding("inventory.#")
                    .with_binding("order.#"),
            )
            .with_queue(QueueConfig::audit())
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Names of the queues a message with `routing_key` lands in.
    pub fn route<'a>(&'a self, routing_key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.queues
            .iter()
            .filter(move |q| q.accepts(routing_key))
            .map(|q| q.name.as_str())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_queue_preset() {
        let audit = QueueConfig::audit();
        assert_eq!(audit.name, "audit.events");
        assert_eq!(audit.message_ttl, Duration::from_secs(3600));
        assert_eq!(audit.dead_letter, DeadLetterTarget::new("audit.dlx", "audit.dlq"));
        assert!(audit.accepts("sale.sale.confirmed"));
    }

    #[test]
    fn default_dead_letter_key() {
        let queue = QueueConfig::new("payment.transaction.queue");
        assert_eq!(queue.dead_letter.exchange, "");
        assert_eq!(queue.dead_letter.routing_key, "payment.transaction.queue.dlq");
        assert_eq!(queue.workers, 1);
    }

    #[test]
    fn sale_saga_routes() {
        let topology = Topology::sale_saga();
        let queues: Vec<_> = topology.route("payment.payment.processed").collect();
        assert_eq!(queues, vec![INVENTORY_QUEUE, SAGA_TRACKER_QUEUE, AUDIT_QUEUE]);

        let queues: Vec<_> = topology.route("sale.sale.confirmed").collect();
        assert_eq!(queues, vec![AUDIT_QUEUE]);
    }
}
