//! Error → HTTP response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::model::KeyError;
use crate::storage::GatewayError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(e) => match e {
                GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
                GatewayError::Conflict { .. } => StatusCode::CONFLICT,
                GatewayError::InvalidValue(_) | GatewayError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                GatewayError::Compacted { .. } => StatusCode::GONE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        }
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let ApiError::Gateway(GatewayError::Conflict { current }) = &self {
            body["current_version"] = serde_json::json!(current);
        }
        (status, Json(body)).into_response()
    }
}
