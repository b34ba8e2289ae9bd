//! Audit trail queries.

use std::sync::Arc;

use audit::{
    AuditCriteria, AuditLevel, AuditLog, AuditRepository, AuditRepositoryExt, AuditStatistics,
    Page, PageRequest,
};
use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Duration, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// `page` is zero-based; `size` is clamped by [`PageRequest`].
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
}

impl PageQuery {
    fn request(&self) -> PageRequest {
        let default = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(default.page),
            self.size.unwrap_or(default.size),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub level: Option<String>,
    pub service: Option<String>,
    pub event_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compliance_only: bool,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

impl SearchQuery {
    fn criteria(&self) -> Result<AuditCriteria, ApiError> {
        let mut criteria = AuditCriteria::new().between(self.from, self.to);
        if let Some(level) = &self.level {
            criteria = criteria.with_level(level.parse::<AuditLevel>()?);
        }
        if let Some(service) = &self.service {
            criteria = criteria.with_service(service.clone());
        }
        if let Some(event_type) = &self.event_type {
            criteria = criteria.with_event_type(event_type.clone());
        }
        if self.compliance_only {
            criteria = criteria.compliance_only();
        }
        Ok(criteria)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CriticalQuery {
    /// Defaults to the last 24 hours.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailResponse {
    pub correlation_id: String,
    pub events: Vec<AuditLog>,
}

/// GET /audit/trail/{correlation_id}, in causal order.
#[tracing::instrument(skip(state))]
pub async fn trail(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<TrailResponse>, ApiError> {
    let events = state.audit.find_by_correlation_id(&correlation_id).await?;
    Ok(Json(TrailResponse {
        correlation_id,
        events,
    }))
}

/// GET /audit/aggregate/{aggregate_id}, newest first.
#[tracing::instrument(skip(state))]
pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    Path(aggregate_id): Path<String>,
) -> Result<Json<Vec<AuditLog>>, ApiError> {
    Ok(Json(state.audit.find_by_aggregate_id(&aggregate_id).await?))
}

/// GET /audit/event/{event_id}
#[tracing::instrument(skip(state))]
pub async fn event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<Json<AuditLog>, ApiError> {
    let id = EventId::parse(&event_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid event id: {e}")))?;
    state
        .audit
        .find_by_event_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Event {event_id} not audited")))
}

/// GET /audit/search
#[tracing::instrument(skip(state))]
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Page<AuditLog>>, ApiError> {
    let criteria = query.criteria()?;
    let page = PageQuery {
        page: query.page,
        size: query.size,
    }
    .request();
    Ok(Json(state.audit.search(&criteria, page).await?))
}

/// GET /audit/recent
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<AuditLog>>, ApiError> {
    Ok(Json(state.audit.recent(page.request()).await?))
}

/// GET /audit/critical
pub async fn critical(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CriticalQuery>,
) -> Result<Json<Vec<AuditLog>>, ApiError> {
    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
    Ok(Json(state.audit.find_critical_since(since).await?))
}

/// GET /audit/compliance
pub async fn compliance(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<AuditLog>>, ApiError> {
    Ok(Json(state.audit.compliance(page.request()).await?))
}

/// GET /audit/statistics
pub async fn statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AuditStatistics>, ApiError> {
    Ok(Json(state.audit.statistics().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_query_builds_criteria() {
        let query = SearchQuery {
            level: Some("critical".into()),
            service: Some("payment-service".into()),
            compliance_only: true,
            ..SearchQuery::default()
        };
        let criteria = query.criteria().unwrap();
        assert_eq!(criteria.level, Some(AuditLevel::Critical));
        assert_eq!(criteria.service_name.as_deref(), Some("payment-service"));
        assert!(criteria.compliance_only);
        assert!(criteria.event_type.is_none());
    }

    #[test]
    fn unknown_level_is_rejected() {
        let query = SearchQuery {
            level: Some("LOUD".into()),
            ..SearchQuery::default()
        };
        assert!(query.criteria().is_err());
    }

    #[test]
    fn page_defaults() {
        let page = PageQuery::default().request();
        assert_eq!(page, PageRequest::default());
    }
}
