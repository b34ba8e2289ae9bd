use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{
    ConsumeOutcome, ConsumerError, ConsumerResult, DomainEvent, EventConsumer, EventType,
};

use crate::log::AuditLog;
use crate::repository::AuditRepository;

/// Catch-all sink that writes every business event to the audit trail.
pub struct AuditConsumer {
    repository: Arc<dyn AuditRepository>,
}

impl AuditConsumer {
    pub fn new(repository: Arc<dyn AuditRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventConsumer for AuditConsumer {
    fn name(&self) -> &str {
        "audit-consumer"
    }

    fn supported_types(&self) -> Vec<EventType> {
        EventType::KNOWN.to_vec()
    }

    fn is_catch_all(&self) -> bool {
        true
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    async fn process(&self, event: &DomainEvent) -> ConsumerResult {
        let log = AuditLog::from_event(event);
        match self.repository.record(&log).await {
            Ok(true) => {
                metrics::counter!("audit_events_ingested_total", "level" => log.level.as_str())
                    .increment(1);
                if log.level.requires_immediate_notification() {
                    tracing::warn!(
                        correlation_id = %log.correlation_id,
                        service = %log.service_name,
                        tags = ?log.compliance_tags,
                        "critical business event"
                    );
                } else {
                    tracing::debug!(level = %log.level, service = %log.service_name, "event audited");
                }
                Ok(ConsumeOutcome::Processed)
            }
            Ok(false) => {
                tracing::debug!("event already audited");
                Ok(ConsumeOutcome::Duplicate)
            }
            Err(e) => {
                metrics::counter!("audit_ingestion_failures_total").increment(1);
                tracing::error!(error = %e, "failed to audit event");
                Err(ConsumerError::Transient(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAuditRepository;

    fn event(event_type: impl Into<EventType>) -> DomainEvent {
        DomainEvent::builder(event_type)
            .aggregate("Sale", "S-1")
            .correlation_id("corr-1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn audits_unknown_types_too() {
        let repo = InMemoryAuditRepository::new();
        let consumer = AuditConsumer::new(Arc::new(repo.clone()));
        let custom = event("LoyaltyPointsGranted");
        assert!(consumer.can_handle(&custom.event_type));
        assert_eq!(consumer.process(&custom).await, Ok(ConsumeOutcome::Processed));
        assert_eq!(consumer.process(&custom).await, Ok(ConsumeOutcome::Duplicate));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn store_outage_is_transient() {
        let repo = InMemoryAuditRepository::new();
        repo.set_unavailable(true);
        let consumer = AuditConsumer::new(Arc::new(repo));
        assert!(matches!(
            consumer.process(&event(EventType::SaleFailed)).await,
            Err(ConsumerError::Transient(_))
        ));
    }
}
