//! The consumer capability contract, its registration table and
//! per-consumer duplicate suppression.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::EventId;

use crate::envelope::DomainEvent;
use crate::error::ConsumerError;
use crate::event_type::EventType;

/// Successful handling of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The event changed something.
    Processed,
    /// The event was already seen; nothing was done.
    Duplicate,
}

pub type ConsumerResult = std::result::Result<ConsumeOutcome, ConsumerError>;

/// Something that reacts to business events.
///
/// Consumers declare which event types they handle and are composed through
/// [`ConsumerRegistry`]. A consumer marked as catch-all receives every type.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    fn supported_types(&self) -> Vec<EventType>;

    /// True for a sink that wants every event regardless of type.
    fn is_catch_all(&self) -> bool {
        false
    }

    fn can_handle(&self, event_type: &EventType) -> bool {
        self.is_catch_all() || self.supported_types().contains(event_type)
    }

    async fn process(&self, event: &DomainEvent) -> ConsumerResult;
}

const DEFAULT_GUARD_CAPACITY: usize = 10_000;

/// Remembers recently processed event ids.
///
/// Bounded: once `capacity` ids are held, the oldest is forgotten.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    inner: Arc<Mutex<GuardState>>,
}

#[derive(Debug)]
struct GuardState {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GUARD_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GuardState {
                seen: HashSet::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    pub fn is_processed(&self, event_id: EventId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .contains(&event_id)
    }

    /// Records `event_id`. Returns false if it was already recorded.
    pub fn mark_processed(&self, event_id: EventId) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.seen.insert(event_id) {
            return false;
        }
        state.order.push_back(event_id);
        if state.order.len() > state.capacity
            && let Some(oldest) = state.order.pop_front()
        {
            state.seen.remove(&oldest);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

struct Registration {
    consumer: Arc<dyn EventConsumer>,
    guard: IdempotencyGuard,
}

/// Maps event types to the consumers that handle them.
///
/// The registry is itself an [`EventConsumer`], so one queue subscription can
/// fan out to several handlers. Each handler has its own guard: when a
/// redelivery follows a partial failure, handlers that already succeeded are
/// skipped.
pub struct ConsumerRegistry {
    name: String,
    registrations: Vec<Registration>,
    by_type: HashMap<EventType, Vec<usize>>,
    catch_all: Vec<usize>,
}

impl ConsumerRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registrations: Vec::new(),
            by_type: HashMap::new(),
            catch_all: Vec::new(),
        }
    }

    pub fn register(&mut self, consumer: Arc<dyn EventConsumer>) {
        let index = self.registrations.len();
        if consumer.is_catch_all() {
            self.catch_all.push(index);
        } else {
            for event_type in consumer.supported_types() {
                self.by_type.entry(event_type).or_default().push(index);
            }
        }
        tracing::debug!(registry = %self.name, consumer = consumer.name(), "consumer registered");
        self.registrations.push(Registration {
            consumer,
            guard: IdempotencyGuard::new(),
        });
    }

    pub fn with(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.register(consumer);
        self
    }

    /// Handlers for `event_type`, in registration order.
    pub fn handlers_for(&self, event_type: &EventType) -> Vec<Arc<dyn EventConsumer>> {
        self.indices_for(event_type)
            .into_iter()
            .map(|i| Arc::clone(&self.registrations[i].consumer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn indices_for(&self, event_type: &EventType) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .by_type
            .get(event_type)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        indices.extend(&self.catch_all);
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

#[async_trait]
impl EventConsumer for ConsumerRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_types(&self) -> Vec<EventType> {
        self.by_type.keys().cloned().collect()
    }

    fn is_catch_all(&self) -> bool {
        !self.catch_all.is_empty()
    }

    /// Runs every matching handler. The first failure stops the fan-out and
    /// is reported for the whole delivery.
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        let mut outcome = ConsumeOutcome::Duplicate;
        for index in self.indices_for(&event.event_type) {
            let registration = &self.registrations[index];
            if registration.guard.is_processed(event.event_id) {
                continue;
            }
            if registration.consumer.process(event).await? == ConsumeOutcome::Processed {
                outcome = ConsumeOutcome::Processed;
            }
            registration.guard.mark_processed(event.event_id);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        name: &'static str,
        types: Vec<EventType>,
        catch_all: bool,
        calls: AtomicU32,
        fail_first: AtomicU32,
    }

    impl Counting {
        fn new(name: &'static str, types: Vec<EventType>) -> Arc<Self> {
            Arc::new(Self {
                name,
                types,
                catch_all: false,
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
            })
        }

        fn sink(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                types: Vec::new(),
                catch_all: true,
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EventConsumer for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn supported_types(&self) -> Vec<EventType> {
            self.types.clone()
        }

        fn is_catch_all(&self) -> bool {
            self.catch_all
        }

        async fn process(&self, _event: &DomainEvent) -> ConsumerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ConsumerError::Transient("flaky".into()));
            }
            Ok(ConsumeOutcome::Processed)
        }
    }

    fn event(event_type: EventType) -> DomainEvent {
        DomainEvent::builder(event_type)
            .aggregate("Payment", "PAY-1")
            .correlation_id("corr")
            .build()
            .unwrap()
    }

    #[test]
    fn guard_remembers_and_evicts() {
        let guard = IdempotencyGuard::with_capacity(2);
        let (a, b, c) = (EventId::new(), EventId::new(), EventId::new());
        assert!(guard.mark_processed(a));
        assert!(!guard.mark_processed(a));
        guard.mark_processed(b);
        guard.mark_processed(c);
        assert!(!guard.is_processed(a));
        assert!(guard.is_processed(b) && guard.is_processed(c));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn only_catch_all_sees_every_type() {
        let payment = Counting::new("payment", vec![EventType::TransactionCreated]);
        let audit = Counting::sink("audit");
        let registry = ConsumerRegistry::new("test").with(payment).with(audit);

        assert_eq!(registry.handlers_for(&EventType::TransactionCreated).len(), 2);
        let others = registry.handlers_for(&EventType::OrderDelivered);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].name(), "audit");
    }

    #[tokio::test]
    async fn registry_fans_out_and_suppresses_repeats() {
        let a = Counting::new("a", vec![EventType::PaymentProcessed]);
        let b = Counting::new("b", vec![EventType::PaymentProcessed]);
        let registry = ConsumerRegistry::new("test")
            .with(a.clone())
            .with(b.clone());

        let e = event(EventType::PaymentProcessed);
        assert_eq!(registry.process(&e).await, Ok(ConsumeOutcome::Processed));
        assert_eq!(registry.process(&e).await, Ok(ConsumeOutcome::Duplicate));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivery_skips_handlers_that_succeeded() {
        let a = Counting::new("a", vec![EventType::PaymentProcessed]);
        let b = Counting::new("b", vec![EventType::PaymentProcessed]);
        b.fail_first.store(1, Ordering::SeqCst);
        let registry = ConsumerRegistry::new("test")
            .with(a.clone())
            .with(b.clone());

        let e = event(EventType::PaymentProcessed);
        assert!(matches!(
            registry.process(&e).await,
            Err(ConsumerError::Transient(_))
        ));
        assert_eq!(registry.process(&e).await, Ok(ConsumeOutcome::Processed));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }
}
