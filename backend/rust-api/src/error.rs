use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::attempt::AttemptState;

/// Error taxonomy for the attempt lifecycle core.
///
/// `Transient` wraps infrastructure failures bubbling up from the store and
/// broker layers; everything else is a caller-visible outcome of the request.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version conflict: expected {expected}, stored {stored}")]
    VersionConflict { expected: i64, stored: i64 },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("operation not allowed while attempt is {state:?}")]
    StateConflict { state: AttemptState },

    #[error("transient infrastructure failure")]
    Transient(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::VersionConflict { .. } => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::StateConflict { .. } => StatusCode::CONFLICT,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_tag(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::VersionConflict { .. } => "version_conflict",
            CoreError::NotFound { .. } => "not_found",
            CoreError::StateConflict { .. } => "state_conflict",
            CoreError::Transient(_) => "transient_error",
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        if let CoreError::Transient(ref source) = self {
            tracing::error!(error = %source, "request failed on infrastructure");
        }

        let body = json!({
            "error": self.error_tag(),
            "message": self.to_string(),
        });

        (self.status_code(), Json(body)).into_response()
    }
}
