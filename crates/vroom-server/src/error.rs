use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use vroom_core::{AuthError, LookupError, SessionId};

/// Request-level failures. None of these ever create a connection.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("malformed query: {0}")]
    BadQuery(String),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadQuery(_) => StatusCode::BAD_REQUEST,
            Self::Lookup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Don't echo verifier details back to the caller.
            Self::Unauthorized(AuthError::Invalid(_)) => "invalid credential".to_string(),
            Self::Lookup(_) => "session lookup failed".to_string(),
            other => other.to_string(),
        };
        match &self {
            Self::Lookup(e) => tracing::error!(error = %e, "request failed"),
            other => tracing::debug!(status = status.as_u16(), error = %other, "request rejected"),
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
