use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::error::{MarketError, ValidationError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Signal provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Payout halted: {0}")]
    PayoutHalted(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        match err {
            MarketError::Validation(v) => match v {
                ValidationError::UnknownToken(_) | ValidationError::UnknownMarket(_) => {
                    ApiError::NotFound(v.to_string())
                }
                ValidationError::DuplicatePosition(_) => ApiError::Conflict(v.to_string()),
                _ => ApiError::BadRequest(v.to_string()),
            },
            MarketError::ConcurrencyConflict(msg) => ApiError::Conflict(msg),
            MarketError::ProviderUnavailable(msg) => ApiError::ProviderUnavailable(msg),
            MarketError::Storage(msg) => ApiError::DatabaseError(msg),
            e @ MarketError::InconsistentPayout { .. } => ApiError::PayoutHalted(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("invalid input: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(format!("invalid input: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ProviderUnavailable(_) | ApiError::DatabaseError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::PayoutHalted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}
