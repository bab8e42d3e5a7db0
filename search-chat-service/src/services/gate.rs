//! Request Gate: payload validation, caller classification and the
//! anonymous guest quota.

use crate::config::{ChatConfig, ModelSpec};
use crate::error::PipelineError;
use crate::models::{ChatRequest, ModelClass};
use crate::services::stores::GuestQuotaStore;
use axum::http::HeaderMap;
use service_core::middleware::forwarded_ip;
use std::net::IpAddr;
use std::sync::Arc;
use validator::Validate;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const EMAIL_VERIFIED_HEADER: &str = "x-email-verified";

/// What the trusted identity provider and the transport tell us about the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub email_verified: bool,
    /// Stable server-side key for unauthenticated callers.
    pub anonymous_id: String,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn is_proxy_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        // Only addresses the server observes; client-chosen ids are ignored.
        // X-Forwarded-For counts only when it was set by a proxy on our side.
        let observed = match peer {
            Some(ip) if !is_proxy_address(ip) => Some(ip),
            _ => forwarded_ip(headers).or(peer),
        };
        let anonymous_id = observed
            .map(|ip| format!("ip:{}", ip))
            .unwrap_or_else(|| "ip:unknown".to_string());

        Self {
            user_id: header_str(headers, USER_ID_HEADER).map(str::to_string),
            email_verified: header_str(headers, EMAIL_VERIFIED_HEADER)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            anonymous_id,
        }
    }
}

/// Classified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Guest { anonymous_id: String },
    User { user_id: String, email_verified: bool },
}

impl Caller {
    pub fn is_guest(&self) -> bool {
        matches!(self, Caller::Guest { .. })
    }

    /// Key used in logs: user id or anonymous id.
    pub fn log_id(&self) -> &str {
        match self {
            Caller::Guest { anonymous_id } => anonymous_id,
            Caller::User { user_id, .. } => user_id,
        }
    }
}

/// A request that passed the gate.
#[derive(Debug, Clone)]
pub struct AdmittedRequest {
    pub request: ChatRequest,
    pub caller: Caller,
    pub model: ModelSpec,
    /// Trimmed content of the last user message.
    pub query: String,
}

/// Decode and validate a raw body. Shape errors become validation errors.
pub fn parse_request(body: &[u8]) -> Result<ChatRequest, PipelineError> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Validation(format!("Invalid request body: {}", e)))?;
    request
        .validate()
        .map_err(|e| PipelineError::Validation(format!("Validation error: {}", e)))?;
    Ok(request)
}

pub struct RequestGate {
    config: Arc<ChatConfig>,
    quota: Arc<dyn GuestQuotaStore>,
}

impl RequestGate {
    pub fn new(config: Arc<ChatConfig>, quota: Arc<dyn GuestQuotaStore>) -> Self {
        Self { config, quota }
    }

    fn classify(request: &ChatRequest, identity: &Identity) -> Caller {
        let user_id = identity
            .user_id
            .clone()
            .or_else(|| request.user_id.clone())
            .filter(|id| !id.trim().is_empty());

        match user_id {
            Some(user_id) if !request.is_guest => Caller::User {
                user_id,
                email_verified: identity.email_verified,
            },
            _ => Caller::Guest {
                anonymous_id: identity.anonymous_id.clone(),
            },
        }
    }

    /// Run every gate check. Guest quota is consumed last, only when all
    /// other checks passed.
    #[tracing::instrument(skip_all, fields(model = %request.model))]
    pub async fn admit(
        &self,
        request: ChatRequest,
        identity: &Identity,
    ) -> Result<AdmittedRequest, PipelineError> {
        let caller = Self::classify(&request, identity);

        // Fixed refusal, decided before any other field is looked at.
        if let (Caller::Guest { anonymous_id }, true) = (&caller, request.web_search) {
            tracing::info!(anonymous_id = %anonymous_id, "Guest requested web search");
            return Err(PipelineError::GuestSearchRestricted);
        }

        let query = request
            .last_user_message()
            .ok_or_else(|| PipelineError::Validation("A user message is required".to_string()))?
            .to_string();

        let model = self
            .config
            .model(&request.model)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownModel(request.model.clone()))?;

        if let Caller::Guest { anonymous_id } = &caller {
            if model.class != ModelClass::Free {
                return Err(PipelineError::TierRestricted(model.id.clone()));
            }

            let decision = self
                .quota
                .try_consume(anonymous_id, self.config.guest.message_quota)
                .await
                .map_err(|e| PipelineError::Processing(anyhow::Error::new(e)))?;
            if !decision.allowed {
                tracing::info!(anonymous_id = %anonymous_id, used = decision.used, "Guest quota exhausted");
                return Err(PipelineError::GuestQuotaExceeded);
            }
        }

        Ok(AdmittedRequest {
            request,
            caller,
            model,
            query,
        })
    }
}
