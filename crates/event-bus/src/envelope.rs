use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::event_type::EventType;
use crate::routing;

/// Current envelope schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Metadata key naming the service that emitted an event.
pub const SOURCE_METADATA_KEY: &str = "source";

/// An immutable business event as it travels over the bus.
///
/// The event id is the deduplication key for every consumer. The correlation
/// id ties all events of one saga together and the causation id points at
/// the event that triggered this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: i32,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DomainEvent {
    pub fn builder(event_type: impl Into<EventType>) -> DomainEventBuilder {
        DomainEventBuilder::new(event_type.into())
    }

    /// Topic routing key for this event.
    pub fn routing_key(&self) -> String {
        routing::routing_key(&self.aggregate_type, self.event_type.as_str())
    }

    /// Checks the identifiers every consumer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.as_uuid().is_nil() {
            return Err(BusError::InvalidEnvelope("eventId is empty".into()));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(BusError::InvalidEnvelope("aggregateId is empty".into()));
        }
        if self.aggregate_type.trim().is_empty() {
            return Err(BusError::InvalidEnvelope("aggregateType is empty".into()));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(BusError::InvalidEnvelope("correlationId is empty".into()));
        }
        Ok(())
    }

    /// Service named in the `source` metadata entry, if any.
    pub fn source(&self) -> Option<&str> {
        self.metadata
            .get(SOURCE_METADATA_KEY)
            .and_then(|v| v.as_str())
    }

    /// Decodes the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses and validates a wire message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let event: DomainEvent = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }
}

/// Builder for [`DomainEvent`].
#[derive(Debug)]
pub struct DomainEventBuilder {
    event_id: Option<EventId>,
    event_type: EventType,
    aggregate_id: Option<String>,
    aggregate_type: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<EventId>,
    timestamp: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
}

impl DomainEventBuilder {
    fn new(event_type: EventType) -> Self {
        Self {
            event_id: None,
            event_type,
            aggregate_id: None,
            aggregate_type: None,
            correlation_id: None,
            causation_id: None,
            timestamp: None,
            payload: serde_json::Value::Object(Default::default()),
            metadata: HashMap::new(),
        }
    }

    /// Sets the event id. A fresh id is generated otherwise.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn aggregate(mut self, aggregate_type: impl Into<String>, id: impl ToString) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(id.to_string());
        self
    }

    /// Sets the aggregate id and keeps the type defaulted from the event type.
    pub fn aggregate_id(mut self, id: impl ToString) -> Self {
        self.aggregate_id = Some(id.to_string());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn causation_id(mut self, causation_id: Option<EventId>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Continues the causal chain of `cause`: same correlation id, causation
    /// pointing at `cause`.
    pub fn caused_by(mut self, cause: &DomainEvent) -> Self {
        self.correlation_id = Some(cause.correlation_id.clone());
        self.causation_id = Some(cause.event_id);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Records the emitting service under the `source` metadata key.
    pub fn source(self, service: &str) -> Self {
        self.metadata(SOURCE_METADATA_KEY, serde_json::Value::from(service))
    }

    /// Builds and validates the envelope.
    ///
    /// The aggregate type defaults to the event type's conventional emitter.
    pub fn build(self) -> Result<DomainEvent> {
        let aggregate_type = self
            .aggregate_type
            .or_else(|| self.event_type.default_aggregate_type().map(String::from))
            .ok_or_else(|| BusError::InvalidEnvelope("aggregateType is required".into()))?;
        let aggregate_id = self
            .aggregate_id
            .ok_or_else(|| BusError::InvalidEnvelope("aggregateId is required".into()))?;
        let correlation_id = self
            .correlation_id
            .ok_or_else(|| BusError::InvalidEnvelope("correlationId is required".into()))?;

        let event = DomainEvent {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type,
            aggregate_id,
            aggregate_type,
            version: SCHEMA_VERSION,
            correlation_id,
            causation_id: self.causation_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload,
            metadata: self.metadata,
        };
        event.validate()?;
        Ok(event)
    }
}
