use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::upstream::ProviderError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("upstream provider is not configured")]
    NotConfigured,
    #[error(
        "upstream quota exceeded for the configured API key; add billing or switch to a key with available credits, then retry"
    )]
    QuotaExceeded(String),
    #[error("upstream error: {0}")]
    UpstreamFault(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamFault(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request_error",
            AppError::NotConfigured => "not_configured",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::UpstreamFault(_) => "upstream_error",
            AppError::Timeout(_) => "timeout",
        }
    }

    /// Text appended to an already-started body when the session fails.
    pub fn in_band_marker(&self) -> String {
        format!("\n\n[relay-error:{}] {}", self.kind(), self)
    }
}

impl From<ProviderError> for AppError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::QuotaExceeded(detail) => AppError::QuotaExceeded(detail),
            ProviderError::Fault(detail) => AppError::UpstreamFault(detail),
            ProviderError::Timeout(detail) => AppError::Timeout(detail),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: self.kind(),
            },
        };

        (self.status(), Json(payload)).into_response()
    }
}
