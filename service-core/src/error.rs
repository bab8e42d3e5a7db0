use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Error returned across the HTTP boundary.
///
/// Every variant renders as a single JSON object `{ "error": ..., "code"?: ... }`.
/// Upstream and internal variants never expose their detail to the caller; the
/// detail is logged instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {message}")]
    BadRequest {
        message: String,
        code: Option<String>,
    },

    #[error("Unauthorized: {message}")]
    Unauthorized {
        message: String,
        code: Option<String>,
    },

    #[error("Forbidden: {message}")]
    Forbidden {
        message: String,
        code: Option<String>,
    },

    #[error("Too many requests: {message}")]
    TooManyRequests {
        message: String,
        code: Option<String>,
        retry_after: Option<u64>,
    },

    #[error("Upstream error: {0}")]
    Upstream(anyhow::Error),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>, code: &str) -> Self {
        AppError::BadRequest {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    pub fn unauthorized(message: impl Into<String>, code: &str) -> Self {
        AppError::Unauthorized {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    pub fn forbidden(message: impl Into<String>, code: &str) -> Self {
        AppError::Forbidden {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    pub fn too_many_requests(message: impl Into<String>, code: &str, retry_after: Option<u64>) -> Self {
        AppError::TooManyRequests {
            message: message.into(),
            code: Some(code.to_string()),
            retry_after,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_)
            | AppError::UpstreamTimeout(_)
            | AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (error_message, code, retry_after) = match self {
            AppError::ValidationError(err) => (
                format!("Validation error: {}", err),
                Some("VALIDATION_ERROR".to_string()),
                None,
            ),
            AppError::BadRequest { message, code } => (message, code, None),
            AppError::Unauthorized { message, code } => (message, code, None),
            AppError::Forbidden { message, code } => (message, code, None),
            AppError::TooManyRequests {
                message,
                code,
                retry_after,
            } => (message, code, retry_after),
            AppError::Upstream(err) => {
                tracing::error!(error = ?err, "Upstream failure");
                (
                    "An upstream service failed while processing your request. Please try again."
                        .to_string(),
                    Some("UPSTREAM_ERROR".to_string()),
                    None,
                )
            }
            AppError::UpstreamTimeout(what) => {
                tracing::error!(operation = %what, "Upstream timed out");
                (
                    "The search provider took too long to respond. Please try again.".to_string(),
                    Some("UPSTREAM_TIMEOUT".to_string()),
                    None,
                )
            }
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    "An error occurred while processing your request. Please try again."
                        .to_string(),
                    Some("INTERNAL_ERROR".to_string()),
                    None,
                )
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    "An error occurred while processing your request. Please try again."
                        .to_string(),
                    Some("INTERNAL_ERROR".to_string()),
                    None,
                )
            }
            AppError::ServiceUnavailable => ("Service unavailable".to_string(), None, None),
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Configuration error".to_string(), None, None)
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                code,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
