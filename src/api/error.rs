use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::EngineError;

/// Transport wrapper mapping engine errors onto status codes. The error
/// identifier rides along so clients can branch without parsing messages.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::InvalidParameters(_) => (StatusCode::BAD_REQUEST, "invalid_parameters"),
            EngineError::ComplianceRejected { .. } => (StatusCode::FORBIDDEN, "compliance_rejected"),
            EngineError::Duplicate { .. } => (StatusCode::CONFLICT, "duplicate"),
            EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            EngineError::Unauthorized => (StatusCode::FORBIDDEN, "unauthorized"),
            EngineError::AdapterUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "adapter_unavailable")
            }
            EngineError::BridgeTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "bridge_timeout"),
            EngineError::DoubleSpendSuspected { .. } => {
                (StatusCode::CONFLICT, "double_spend_suspected")
            }
            EngineError::Overloaded => (StatusCode::TOO_MANY_REQUESTS, "overloaded"),
            EngineError::Storage(_) | EngineError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = json!({ "error": code, "message": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
