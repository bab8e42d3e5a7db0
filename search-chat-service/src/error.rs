//! Pipeline error taxonomy and its mapping onto HTTP errors.

use service_core::error::AppError;
use thiserror::Error;

pub const GUEST_WEB_SEARCH_RESTRICTED_MESSAGE: &str =
    "Web search is not available for guest users. Please sign in to search the web.";
pub const INSUFFICIENT_CREDITS_MESSAGE: &str =
    "Insufficient credits for this model. Upgrade your plan or use your own API key.";

/// Everything that can stop a request before its stream starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("guest requested web search")]
    GuestSearchRestricted,

    #[error("guest message quota exceeded")]
    GuestQuotaExceeded,

    #[error("model {0} is not available")]
    ModelUnavailable(String),

    #[error("model {0} is not included in the caller's tier")]
    TierRestricted(String),

    #[error("insufficient credits")]
    InsufficientCredits,

    /// A required key is missing and the caller supplied no fallback.
    #[error("missing key: {0}")]
    MissingKey(String),

    #[error("upstream failure: {0:#}")]
    Upstream(anyhow::Error),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("processing failure: {0:#}")]
    Processing(anyhow::Error),

    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) | PipelineError::UnknownModel(_) => "validation",
            PipelineError::GuestSearchRestricted
            | PipelineError::ModelUnavailable(_)
            | PipelineError::TierRestricted(_) => "policy",
            PipelineError::GuestQuotaExceeded | PipelineError::InsufficientCredits => "quota",
            PipelineError::MissingKey(_) => "configuration",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::UpstreamTimeout(_) => "upstream_timeout",
            PipelineError::Processing(_) => "processing",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(msg) => AppError::bad_request(msg, "VALIDATION_ERROR"),
            PipelineError::UnknownModel(model) => {
                AppError::bad_request(format!("Unknown model: {}", model), "UNKNOWN_MODEL")
            }
            PipelineError::GuestSearchRestricted => AppError::forbidden(
                GUEST_WEB_SEARCH_RESTRICTED_MESSAGE,
                "GUEST_WEB_SEARCH_RESTRICTED",
            ),
            PipelineError::GuestQuotaExceeded => AppError::too_many_requests(
                "You have used all free guest messages. Please sign in to continue.",
                "GUEST_QUOTA_EXCEEDED",
                None,
            ),
            PipelineError::ModelUnavailable(model) => AppError::forbidden(
                format!("Model {} is currently unavailable.", model),
                "MODEL_UNAVAILABLE",
            ),
            PipelineError::TierRestricted(model) => AppError::forbidden(
                format!("Your plan does not include {}.", model),
                "TIER_RESTRICTED",
            ),
            PipelineError::InsufficientCredits => {
                AppError::forbidden(INSUFFICIENT_CREDITS_MESSAGE, "INSUFFICIENT_CREDITS")
            }
            PipelineError::MissingKey(what) => AppError::unauthorized(
                format!("No API key is configured for {}. Provide your own key.", what),
                "MISSING_API_KEY",
            ),
            PipelineError::Upstream(err) => AppError::Upstream(err),
            PipelineError::UpstreamTimeout(what) => AppError::UpstreamTimeout(what),
            PipelineError::Processing(err) => AppError::InternalError(err),
            PipelineError::Cancelled => AppError::bad_request("Request cancelled", "REQUEST_CANCELLED"),
        }
    }
}
