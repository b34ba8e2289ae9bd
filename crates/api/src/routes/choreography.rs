//! Event-driven sale endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use domain::ChoreographedSagaState;
use saga::start_sale;
use serde::Serialize;

use super::sales::CreateSaleRequest;
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedResponse {
    pub saga_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSaleResponse {
    pub saga_id: String,
    pub correlation_id: String,
    pub saga_type: String,
    pub status: &'static str,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub compensation_required: bool,
    pub compensation_completed: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<&ChoreographedSagaState> for TrackedSaleResponse {
    fn from(saga: &ChoreographedSagaState) -> Self {
        Self {
            saga_id: saga.saga_id().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            saga_type: saga.saga_type().to_string(),
            status: saga.status().as_str(),
            completed_steps: saga.completed_steps().to_vec(),
            failed_steps: saga.failed_steps().to_vec(),
            compensation_required: saga.compensation_required(),
            compensation_completed: saga.compensation_completed(),
            retry_count: saga.retry_count(),
            max_retries: saga.max_retries(),
            timeout_at: saga.timeout_at(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
            completed_at: saga.completed_at(),
            error_message: saga.error_message().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsResponse {
    pub total: u64,
    pub by_status: BTreeMap<&'static str, u64>,
}

/// POST /saga/choreography/sales
///
/// Publishes the opening event and answers before any participant runs.
#[tracing::instrument(skip(state, req), fields(customer_id = %req.customer_id))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSaleRequest>,
) -> Result<(StatusCode, Json<StartedResponse>), ApiError> {
    let request = req.into_sale()?;
    let started = start_sale(state.publisher.as_ref(), &request).await?;
    metrics::counter!("api_choreographed_sales_total").increment(1);
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse {
            saga_id: started.saga_id.to_string(),
            correlation_id: started.correlation_id,
        }),
    ))
}

/// GET /saga/choreography/{correlation_id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<TrackedSaleResponse>, ApiError> {
    let saga = state
        .choreography
        .tracker
        .find_by_correlation_id(&correlation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No sale tracked for {correlation_id}")))?;
    Ok(Json(TrackedSaleResponse::from(&saga)))
}

/// GET /saga/choreography/statistics
pub async fn statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    let counts = state.choreography.tracker.statistics().await?;
    let by_status: BTreeMap<_, _> = counts
        .into_iter()
        .map(|(status, n)| (status.as_str(), n))
        .collect();
    Ok(Json(StatisticsResponse {
        total: by_status.values().sum(),
        by_status,
    }))
}
