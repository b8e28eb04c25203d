//! Gateway error taxonomy
//!
//! Every pipeline stage fails with a [`GatewayError`]. The client only ever sees
//! a fixed message and the status code; the detail is logged.

use crate::auth::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure that ends a request, one variant per failure class
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("no route for path '{0}'")]
    RouteNotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("upstream timeout: {0}")]
    BackendTimeout(String),

    #[error("upstream I/O error: {0}")]
    BackendIo(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body: `{"error": "...", "status": 401}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingToken | GatewayError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendIo(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to clients
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::MissingToken => "Authorization header is missing or invalid",
            GatewayError::InvalidToken(_) => "Invalid or expired token",
            GatewayError::RouteNotFound(_) => "No matching route found",
            GatewayError::ServiceUnavailable(_) => "Service unavailable",
            GatewayError::BackendTimeout(_) => "Upstream service timed out",
            GatewayError::BackendIo(_) => "Failed to reach upstream service",
            GatewayError::Internal(_) => "Internal server error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.client_message().to_string(),
            status: self.status().as_u16(),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => GatewayError::MissingToken,
            AuthError::InvalidToken { reason } => GatewayError::InvalidToken(reason),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::Internal(_) => tracing::error!(error = %self, "Request failed"),
            _ => tracing::debug!(error = %self, "Request rejected"),
        }
        (self.status(), Json(self.body())).into_response()
    }
}
