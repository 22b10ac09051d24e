//! JSON error bodies for the HTTP surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crew::error::WorktreeError;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
            details: None,
        }
    }
}

impl From<WorktreeError> for ApiError {
    fn from(err: WorktreeError) -> Self {
        let (status, details) = match &err {
            WorktreeError::Invalid(_) => (StatusCode::BAD_REQUEST, None),
            WorktreeError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            WorktreeError::Locked { id, reason } => (
                StatusCode::LOCKED,
                Some(json!({ "id": id, "reason": reason })),
            ),
            WorktreeError::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            WorktreeError::Conflict(_) => (StatusCode::CONFLICT, None),
            WorktreeError::Limit { max } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(json!({ "max": max })))
            }
            WorktreeError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        Self {
            status,
            code: err.code(),
            message: format!("{err:#}"),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        (self.status, Json(self)).into_response()
    }
}
