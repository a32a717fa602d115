use axum::Json;
use axum::extract::{Path, Query, State};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::engine::{CreatePayment, PaymentEngine, PaymentFilter, PaymentPage, PaymentView,
    StrategyHealthView};
use crate::model::{PaymentId, PaymentState};

use super::error::ApiError;

#[derive(Debug, Serialize, JsonSchema)]
pub struct CreatePaymentResponse {
    pub payment_id: PaymentId,
}

pub async fn create_payment(
    State(engine): State<PaymentEngine>,
    Json(request): Json<CreatePayment>,
) -> Result<Json<CreatePaymentResponse>, ApiError> {
    let payment_id = engine.create_payment(request).await?;
    Ok(Json(CreatePaymentResponse { payment_id }))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReleasePaymentRequest {
    pub caller: String,
    pub client_token: String,
}

pub async fn release_payment(
    State(engine): State<PaymentEngine>,
    Path(payment_id): Path<String>,
    Json(request): Json<ReleasePaymentRequest>,
) -> Result<Json<PaymentView>, ApiError> {
    let view = engine
        .release_payment(&payment_id, &request.caller, &request.client_token)
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelPaymentRequest {
    pub caller: String,
    pub client_token: String,
}

pub async fn cancel_payment(
    State(engine): State<PaymentEngine>,
    Path(payment_id): Path<String>,
    Json(request): Json<CancelPaymentRequest>,
) -> Result<Json<PaymentView>, ApiError> {
    let view = engine
        .cancel_payment(&payment_id, &request.caller, &request.client_token)
        .await?;
    Ok(Json(view))
}

pub async fn get_payment(
    State(engine): State<PaymentEngine>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentView>, ApiError> {
    Ok(Json(engine.get_payment(&payment_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPaymentsQuery {
    pub state: Option<PaymentState>,
    pub user: Option<String>,
    pub merchant: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_payments(
    State(engine): State<PaymentEngine>,
    Query(query): Query<ListPaymentsQuery>,
) -> Json<PaymentPage> {
    let filter = PaymentFilter {
        state: query.state,
        user: query.user,
        merchant: query.merchant,
    };
    Json(engine.list_payments(&filter, query.cursor.as_deref(), query.limit.unwrap_or(50)))
}

pub async fn strategy_health(
    State(engine): State<PaymentEngine>,
    Path(strategy_id): Path<String>,
) -> Result<Json<StrategyHealthView>, ApiError> {
    Ok(Json(engine.strategy_health(&strategy_id)?))
}
