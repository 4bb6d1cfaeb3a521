//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beecounter_core::prefs::PrefsError;
use beecounter_core::DeviceError;
use serde_json::json;
use tracing::{error, warn};

/// Handler result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Error returned by API handlers; rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PrefsError> for ApiError {
    fn from(err: PrefsError) -> Self {
        ApiError::Device(DeviceError::from(err))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Device(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::MissingParam(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
