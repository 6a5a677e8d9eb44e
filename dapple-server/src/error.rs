//! Request error taxonomy.
//!
//! Handlers return `Result<T, ServeError>`; the [`IntoResponse`] impl turns
//! each variant into a JSON `{"error": ...}` body with its own status code, so
//! callers can tell a slow model from a broken one.

use std::fmt;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dapple_core::codec::CodecError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Phase of a request that can run out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Load => f.write_str("model load"),
            Stage::Generate => f.write_str("generation"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    /// The request body is not usable JSON or describes an unusable request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The body exceeds the configured size limit.
    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("invalid reference image: {0}")]
    Decode(#[from] CodecError),

    /// Neither the primary nor the fallback model could be loaded.
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: Stage, after: Duration },

    #[error("generation failed: {0}")]
    Generation(String),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::InvalidRequest(_) | ServeError::Decode(_) => StatusCode::BAD_REQUEST,
            ServeError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ServeError::Load(_) | ServeError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body extraction failures get the same JSON shape as every other error.
impl From<JsonRejection> for ServeError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServeError::PayloadTooLarge(rejection.body_text())
        } else {
            ServeError::InvalidRequest(rejection.body_text())
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_has_a_distinct_status() {
        let timeout = ServeError::Timeout {
            stage: Stage::Generate,
            after: Duration::from_secs(900),
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.to_string(), "generation timed out after 900s");
        assert_eq!(
            ServeError::Decode(CodecError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServeError::Load("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServeError::Generation("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
