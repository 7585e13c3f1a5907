//! API error types.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use crosstalk_ports::{BrokerError, StoreError};
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest { message: String },
    BrokerUnavailable { message: String },
    Internal { message: String },
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::BadRequest { message } => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::BrokerUnavailable { message } => {
                (StatusCode::SERVICE_UNAVAILABLE, message.clone())
            }
            ApiError::Internal { message } => {
                tracing::error!(error = %message, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error,
            code: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError::BrokerUnavailable {
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal {
            message: e.to_string(),
        }
    }
}
