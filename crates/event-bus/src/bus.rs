//! In-process topic bus.
//!
//! Publishing routes a serialized envelope to every queue whose bindings
//! match its routing key. Each subscribed queue is drained by its own worker
//! pool; with the default single worker, messages are handled in arrival
//! order. Delivery is at-least-once: transient consumer failures are retried
//! in place until the queue's delivery budget runs out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::consumer::{ConsumeOutcome, EventConsumer, IdempotencyGuard};
use crate::dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use crate::envelope::DomainEvent;
use crate::error::{BusError, ConsumerError, Result};
use crate::topology::{QueueConfig, Topology};

/// Anything events can be published to.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<()>;
}

#[derive(Debug)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    enqueued_at: Instant,
}

struct QueueState {
    config: QueueConfig,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: AtomicUsize,
    subscribed: AtomicBool,
}

struct BusInner {
    exchange: String,
    queues: RwLock<Vec<Arc<QueueState>>>,
    dead_letters: DeadLetterQueue,
    idle: Notify,
    fail_next_publishes: AtomicU32,
    published: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// In-memory implementation of the business event bus.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<BusInner>,
}

impl InMemoryEventBus {
    /// Creates a bus with no queues declared.
    pub fn new() -> Self {
        Self::with_topology(Topology::new())
    }

    /// Creates a bus and declares every queue of `topology`.
    pub fn with_topology(topology: Topology) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                exchange: topology.exchange.clone(),
                queues: RwLock::new(Vec::new()),
                dead_letters: DeadLetterQueue::new(),
                idle: Notify::new(),
                fail_next_publishes: AtomicU32::new(0),
                published: AtomicU64::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        };
        for queue in topology.queues {
            bus.declare_queue(queue);
        }
        bus
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Declares a queue. Redeclaring an existing name is a no-op.
    pub fn declare_queue(&self, config: QueueConfig) {
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if queues.iter().any(|q| q.config.name == config.name) {
            return;
        }
        tracing::debug!(queue = %config.name, bindings = ?config.bindings, "queue declared");
        let (sender, receiver) = mpsc::unbounded_channel();
        queues.push(Arc::new(QueueState {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            pending: AtomicUsize::new(0),
            subscribed: AtomicBool::new(false),
        }));
    }

    /// Attaches `consumer` to `queue` and starts its worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, queue: &str, consumer: Arc<dyn EventConsumer>) -> Result<()> {
        let state = self
            .find_queue(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        let receiver = state
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BusError::AlreadySubscribed(queue.to_string()))?;
        state.subscribed.store(true, Ordering::SeqCst);

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let guard = IdempotencyGuard::new();
        let mut handles = Vec::with_capacity(state.config.workers);
        for worker in 0..state.config.workers {
            let worker_ctx = Worker {
                bus: Arc::clone(&self.inner),
                queue: Arc::clone(&state),
                consumer: Arc::clone(&consumer),
                guard: guard.clone(),
            };
            let receiver = Arc::clone(&receiver);
            handles.push(tokio::spawn(async move {
                worker_ctx.run(worker, receiver).await;
            }));
        }
        tracing::info!(
            queue,
            consumer = consumer.name(),
            workers = state.config.workers,
            "consumer subscribed"
        );
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        Ok(())
    }

    /// Publishes a raw body under `routing_key`. Returns how many queues
    /// received it.
    pub fn publish_raw(&self, routing_key: &str, body: Vec<u8>) -> Result<usize> {
        self.take_injected_failure()?;
        Ok(self.route(routing_key, body))
    }

    /// Makes the next `count` publishes fail with [`BusError::Unavailable`].
    pub fn set_fail_next_publishes(&self, count: u32) {
        self.inner.fail_next_publishes.store(count, Ordering::SeqCst);
    }

    /// Number of messages accepted by the exchange.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> DeadLetterQueue {
        self.inner.dead_letters.clone()
    }

    /// Messages routed to subscribed queues and not yet settled.
    pub fn pending(&self) -> usize {
        self.queues()
            .iter()
            .filter(|q| q.subscribed.load(Ordering::SeqCst))
            .map(|q| q.pending.load(Ordering::SeqCst))
            .sum()
    }

    /// Waits until every subscribed queue has settled all its messages,
    /// including messages published by consumers while draining.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops every worker. Unsettled messages are dropped.
    pub fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
    }

    fn queues(&self) -> Vec<Arc<QueueState>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn find_queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.queues().into_iter().find(|q| q.config.name == name)
    }

    fn take_injected_failure(&self) -> Result<()> {
        let injected = self.inner.fail_next_publishes.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            metrics::counter!("bus_publish_failures_total").increment(1);
            return Err(BusError::Unavailable(format!(
                "exchange {} rejected the message",
                self.inner.exchange
            )));
        }
        Ok(())
    }

    fn route(&self, routing_key: &str, body: Vec<u8>) -> usize {
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("bus_messages_published_total").increment(1);

        let mut delivered = 0;
        for queue in self.queues() {
            if !queue.config.accepts(routing_key) {
                continue;
            }
            queue.pending.fetch_add(1, Ordering::SeqCst);
            let message = Message {
                routing_key: routing_key.to_string(),
                body: body.clone(),
                enqueued_at: Instant::now(),
            };
            if queue.sender.send(message).is_err() {
                queue.pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            delivered += 1;
        }
        if delivered == 0 {
            tracing::debug!(routing_key, "message unroutable, dropped");
        }
        delivered
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, correlation_id = %event.correlation_id)
    )]
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        event.validate()?;
        self.take_injected_failure()?;
        let body = event.to_bytes()?;
        let routing_key = event.routing_key();
        let queues = self.route(&routing_key, body);
        tracing::debug!(%routing_key, queues, "event published");
        Ok(())
    }
}

struct Worker {
    bus: Arc<BusInner>,
    queue: Arc<QueueState>,
    consumer: Arc<dyn EventConsumer>,
    guard: IdempotencyGuard,
}

impl Worker {
    async fn run(
        self,
        worker: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    ) {
        loop {
            let message = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(message) = message else {
                tracing::debug!(queue = %self.queue.config.name, worker, "queue closed");
                break;
            };
            self.deliver(message).await;
            self.queue.pending.fetch_sub(1, Ordering::SeqCst);
            self.bus.idle.notify_waiters();
        }
    }

    async fn deliver(&self, message: Message) {
        let config = &self.queue.config;
        if message.enqueued_at.elapsed() > config.message_ttl {
            self.dead_letter(message, DeadLetterReason::Expired, None, 0);
            return;
        }

        let event = match DomainEvent::from_bytes(&message.body) {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter(message, DeadLetterReason::Malformed, Some(e.to_string()), 0);
                return;
            }
        };

        if !self.consumer.can_handle(&event.event_type) {
            tracing::trace!(queue = %config.name, event_type = %event.event_type, "not handled, acked");
            return;
        }
        if self.guard.is_processed(event.event_id) {
            metrics::counter!("bus_messages_duplicate_total", "queue" => config.name.clone())
                .increment(1);
            return;
        }

        let mut deliveries = 0;
        loop {
            deliveries += 1;
            match self.consumer.process(&event).await {
                Ok(outcome) => {
                    self.guard.mark_processed(event.event_id);
                    if outcome == ConsumeOutcome::Duplicate {
                        metrics::counter!("bus_messages_duplicate_total", "queue" => config.name.clone())
                            .increment(1);
                    }
                    metrics::counter!("bus_messages_acked_total", "queue" => config.name.clone())
                        .increment(1);
                    return;
                }
                Err(ConsumerError::Rejected(reason)) => {
                    self.dead_letter(message, DeadLetterReason::Rejected, Some(reason), deliveries);
                    return;
                }
                Err(ConsumerError::Transient(reason)) if deliveries < config.max_deliveries => {
                    tracing::warn!(
                        queue = %config.name,
                        event_id = %event.event_id,
                        deliveries,
                        error = %reason,
                        "transient consumer failure, redelivering"
                    );
                    metrics::counter!("bus_messages_redelivered_total", "queue" => config.name.clone())
                        .increment(1);
                    tokio::time::sleep(config.redelivery_delay).await;
                }
                Err(ConsumerError::Transient(reason)) => {
                    self.dead_letter(message, DeadLetterReason::Poison, Some(reason), deliveries);
                    return;
                }
            }
        }
    }

    fn dead_letter(
        &self,
        message: Message,
        reason: DeadLetterReason,
        error: Option<String>,
        deliveries: u32,
    ) {
        let config = &self.queue.config;
        tracing::warn!(
            queue = %config.name,
            routing_key = %message.routing_key,
            dead_letter_key = %config.dead_letter.routing_key,
            %reason,
            error = error.as_deref().unwrap_or(""),
            "message dead-lettered"
        );
        metrics::counter!(
            "bus_messages_dead_lettered_total",
            "queue" => config.name.clone(),
            "reason" => reason.as_str()
        )
        .increment(1);
        self.bus.dead_letters.push(DeadLetter {
            queue: config.name.clone(),
            target: config.dead_letter.clone(),
            routing_key: message.routing_key,
            reason,
            error,
            deliveries,
            body: message.body,
            dead_lettered_at: Utc::now(),
        });
    }
}
