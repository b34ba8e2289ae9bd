//! Business event plumbing shared by the saga participants and the audit sink.
//!
//! - [`DomainEvent`] is the immutable wire envelope.
//! - [`routing`] derives topic routing keys and matches binding patterns.
//! - [`Topology`] declares the exchange, queues, TTLs and dead-letter targets.
//! - [`EventConsumer`] is the capability contract every handler implements.
//! - [`InMemoryEventBus`] delivers at-least-once with per-queue ordering and
//!   dead-letters poison, rejected, malformed and expired messages.

pub mod bus;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod event_type;
pub mod publisher;
pub mod routing;
pub mod topology;

pub use bus::{EventPublisher, InMemoryEventBus};
pub use consumer::{
    ConsumeOutcome, ConsumerRegistry, ConsumerResult, EventConsumer, IdempotencyGuard,
};
pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
pub use envelope::{DomainEvent, DomainEventBuilder, SCHEMA_VERSION};
pub use error::{BusError, ConsumerError, Result};
pub use event_type::EventType;
pub use publisher::{PublishRetryPolicy, RetryingPublisher};
pub use routing::{binding_matches, dot_case, routing_key};
pub use topology::{
    AUDIT_DLQ, AUDIT_DLX, AUDIT_QUEUE, BUSINESS_EVENTS_EXCHANGE, DeadLetterTarget, QueueConfig,
    Topology,
};
