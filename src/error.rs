//! API error taxonomy
//!
//! Every failure surfaced over HTTP maps to one of the kinds below. Internal
//! plumbing uses `anyhow`; handlers convert at the boundary.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by API operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown session or remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation on an already-exited session.
    #[error("session already exited")]
    Gone,

    /// Cleanup of a running session, or a duplicate name/id at registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Schema/validation failure, bad path, bad name.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// PTY or process creation failed.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// HQ cannot reach the owning remote.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Unexpected.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Gone => StatusCode::GONE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });

        if matches!(self, ApiError::Unauthorized) {
            return (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"VibeTunnel\"")],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

/// Convenience alias for handler results.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Gone.status(), StatusCode::GONE);
        assert_eq!(
            ApiError::Conflict("dup".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::SpawnFailed("no such file".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::UpstreamUnavailable("remote down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
