//! Error types shared by the control plane modules.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors crossing a control-plane component boundary
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("node inactive: {0}")]
    NodeInactive(String),
    #[error("invalid node credential")]
    Unauthorized,
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("scoring pass already running")]
    PassInProgress,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::NodeInactive(_) => StatusCode::FORBIDDEN,
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::PassInProgress => StatusCode::CONFLICT,
            ControlError::Store(_)
            | ControlError::Io(_)
            | ControlError::Config(_)
            | ControlError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        // internal details stay in the log
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}
