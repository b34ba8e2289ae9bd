use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::envelope::DomainEvent;
use crate::topology::DeadLetterTarget;

/// Why a message left its queue without being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Transient failures exhausted the delivery budget.
    Poison,
    /// The consumer refused the message outright.
    Rejected,
    /// The body was not a valid envelope.
    Malformed,
    /// The message outlived the queue TTL before it was dequeued.
    Expired,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Poison => "poison",
            DeadLetterReason::Rejected => "rejected",
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message parked for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub target: DeadLetterTarget,
    pub routing_key: String,
    pub reason: DeadLetterReason,
    pub error: Option<String>,
    pub deliveries: u32,
    pub body: Vec<u8>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// The parked envelope, if the body is one.
    pub fn event(&self) -> Option<DomainEvent> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Inspectable store of dead-lettered messages, shared by every queue.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQueue {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, letter: DeadLetter) {
        self.lock().push(letter);
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.lock().clone()
    }

    /// Letters that came from the named source queue.
    pub fn from_queue(&self, queue: &str) -> Vec<DeadLetter> {
        self.lock()
            .iter()
            .filter(|l| l.queue == queue)
            .cloned()
            .collect()
    }

    /// Letters delivered to a dead-letter routing key such as `audit.dlq`.
    pub fn at(&self, routing_key: &str) -> Vec<DeadLetter> {
        self.lock()
            .iter()
            .filter(|l| l.target.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns everything parked so far.
    pub fn take(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
