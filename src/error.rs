//! Error taxonomy for the engine.
//!
//! Internal plumbing (I/O, process spawn, serialization) propagates as
//! [`anyhow::Error`]. At the control-plane boundary every error is downcast
//! or mapped into one of the fixed kinds below, each carrying its own HTTP
//! status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("function is stopped: {0}")]
    Stopped(String),
    #[error("call timed out after {0}ms")]
    Timeout(u64),
    #[error("build failed: {0}")]
    BuildError(String),
    #[error("plugin error: {0}")]
    PluginError(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Stopped(_) => "Stopped",
            Self::Timeout(_) => "Timeout",
            Self::BuildError(_) => "BuildError",
            Self::PluginError(_) => "PluginError",
            Self::Integrity(_) => "Integrity",
            Self::BadRequest(_) => "BadRequest",
            Self::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Stopped(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BuildError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PluginError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    code: u16,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = ?self, "internal error serving request");
        } else {
            tracing::debug!(kind = self.kind(), "request failed: {self}");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            code: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
