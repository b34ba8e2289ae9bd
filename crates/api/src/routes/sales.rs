//! Orchestrated sale endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{Money, SagaId};
use domain::{SagaExecution, SagaState};
use saga::SaleRequest;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

/// Sale as submitted by a client. `amount` is a decimal such as `50.00`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSaleRequest {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: f64,
}

impl CreateSaleRequest {
    pub fn into_sale(self) -> Result<SaleRequest, ApiError> {
        let amount = Money::try_from_decimal(self.amount)
            .map_err(|e| ApiError::BadRequest(format!("Invalid amount: {e}")))?;
        let request = SaleRequest::new(self.customer_id, self.product_id, self.quantity, amount);
        request.validate()?;
        Ok(request)
    }
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleCreatedResponse {
    pub saga_id: String,
    pub state: SagaState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleResponse {
    pub saga_id: String,
    pub state: SagaState,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: f64,
    pub reservation_id: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub order_id: Option<String>,
    pub completed_steps: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl From<&SagaExecution> for SaleResponse {
    fn from(saga: &SagaExecution) -> Self {
        Self {
            saga_id: saga.saga_id().to_string(),
            state: saga.state(),
            customer_id: saga.customer_id().to_string(),
            product_id: saga.product_id().to_string(),
            quantity: saga.quantity(),
            amount: saga.amount().to_decimal(),
            reservation_id: saga.reservation_id().map(str::to_string),
            payment_transaction_id: saga.payment_transaction_id().map(str::to_string),
            order_id: saga.order_id().map(str::to_string),
            completed_steps: saga.completed_steps().to_vec(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
            error_message: saga.error_message().map(str::to_string),
        }
    }
}

// -- Handlers --

/// POST /saga/sales
///
/// 201 once confirmed, 202 while the saga is still settling, 400 when a
/// collaborator turned the sale down.
#[tracing::instrument(skip(state, req), fields(customer_id = %req.customer_id, product_id = %req.product_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSaleRequest>,
) -> Result<(StatusCode, Json<SaleCreatedResponse>), ApiError> {
    let request = req.into_sale()?;
    let outcome = state.orchestrator.execute_sale(request).await?;

    let status = match outcome.state {
        SagaState::Confirmed => StatusCode::CREATED,
        SagaState::Failed => StatusCode::BAD_REQUEST,
        _ => StatusCode::ACCEPTED,
    };
    let error_message = if outcome.state == SagaState::Failed {
        state
            .orchestrator
            .get_sale(outcome.saga_id)
            .await?
            .error_message()
            .map(str::to_string)
    } else {
        None
    };
    metrics::counter!("api_sale_requests_total", "state" => outcome.state.as_str()).increment(1);
    tracing::info!(saga_id = %outcome.saga_id, state = %outcome.state, "sale request answered");

    Ok((
        status,
        Json(SaleCreatedResponse {
            saga_id: outcome.saga_id.to_string(),
            state: outcome.state,
            error_message,
        }),
    ))
}

/// GET /saga/sales/{saga_id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(saga_id): Path<String>,
) -> Result<Json<SaleResponse>, ApiError> {
    let saga_id = parse_saga_id(&saga_id)?;
    let saga = state.orchestrator.get_sale(saga_id).await?;
    Ok(Json(SaleResponse::from(&saga)))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
