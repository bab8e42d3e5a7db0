use crate::models::ModelClass;
use crate::services::search::BackendKind;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_optional_env};
use service_core::error::AppError;
use std::time::Duration;

/// Wait budget for the credit debit before continuing optimistically.
const DEFAULT_DEBIT_TIMEOUT_SECS: u64 = 10;

/// Race budget for the direct keyword search call.
const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 15;

/// Budget for the auxiliary sub-query generation call.
const DEFAULT_EXPANSION_TIMEOUT_SECS: u64 = 8;

const DEFAULT_GUEST_MESSAGE_QUOTA: u32 = 2;
const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 30;

/// Immutable service configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub common: core_config::Config,
    pub engine: EngineConfig,
    pub models: Vec<ModelSpec>,
    pub search: SearchConfig,
    pub credits: CreditConfig,
    pub guest: GuestConfig,
    pub generation: GenerationConfig,
    pub tools: ToolConfig,
    pub rate_limit: RateLimitConfig,
    pub mongodb: Option<MongoConfig>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Service-wide key. Requests may bring their own instead.
    pub api_key: Option<String>,
    pub base_url: String,
}

/// One entry of the model catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSpec {
    /// Id the client sends.
    pub id: String,
    /// Id the generation engine expects.
    pub provider_model: String,
    pub class: ModelClass,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub tavily_api_key: Option<String>,
    pub tavily_base_url: String,
    pub parallel_api_key: Option<String>,
    pub parallel_base_url: String,
    pub default_backend: BackendKind,
    pub search_timeout: Duration,
    pub expansion_timeout: Duration,
    /// Model used for sub-query expansion.
    pub expansion_model: String,
}

#[derive(Debug, Clone)]
pub struct CreditConfig {
    pub debit_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GuestConfig {
    pub message_quota: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_tool_rounds: usize,
}

#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub geocoding_base_url: String,
    pub forecast_base_url: String,
    pub retrieval_max_chars: usize,
    pub retrieval_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

/// Catalog used when `CHAT_MODELS` is not set.
pub fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            id: "gemini-2.0-flash".to_string(),
            provider_model: "gemini-2.0-flash".to_string(),
            class: ModelClass::Free,
            available: true,
        },
        ModelSpec {
            id: "gemini-2.5-flash".to_string(),
            provider_model: "gemini-2.5-flash".to_string(),
            class: ModelClass::Premium,
            available: true,
        },
        ModelSpec {
            id: "gemini-2.5-pro".to_string(),
            provider_model: "gemini-2.5-pro".to_string(),
            class: ModelClass::SuperPremium,
            available: true,
        },
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            tavily_api_key: None,
            tavily_base_url: "https://api.tavily.com".to_string(),
            parallel_api_key: None,
            parallel_base_url: "https://api.parallel.ai".to_string(),
            default_backend: BackendKind::Parallel,
            search_timeout: Duration::from_secs(DEFAULT_SEARCH_TIMEOUT_SECS),
            expansion_timeout: Duration::from_secs(DEFAULT_EXPANSION_TIMEOUT_SECS),
            expansion_model: "gemini-2.0-flash".to_string(),
        }
    }
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            debit_timeout: Duration::from_secs(DEFAULT_DEBIT_TIMEOUT_SECS),
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            message_quota: DEFAULT_GUEST_MESSAGE_QUOTA,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            geocoding_base_url: "https://geocoding-api.open-meteo.com".to_string(),
            forecast_base_url: "https://api.open-meteo.com".to_string(),
            retrieval_max_chars: 6000,
            retrieval_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
        }
    }
}

impl ChatConfig {
    /// Defaults for every setting, keys unset. Used as the base for `load`
    /// and by tests that point the service at fixture servers.
    pub fn with_defaults(common: core_config::Config) -> Self {
        Self {
            common,
            engine: EngineConfig::default(),
            models: default_models(),
            search: SearchConfig::default(),
            credits: CreditConfig::default(),
            guest: GuestConfig::default(),
            generation: GenerationConfig::default(),
            tools: ToolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            mongodb: None,
        }
    }

    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_production();
        let mut config = Self::with_defaults(common);

        config.engine.api_key = get_optional_env("GOOGLE_API_KEY");
        if is_prod && config.engine.api_key.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "GOOGLE_API_KEY is required in production but not set"
            )));
        }
        config.engine.base_url = get_env("GEMINI_BASE_URL", Some(&config.engine.base_url), false)?;

        if let Some(raw) = get_optional_env("CHAT_MODELS") {
            config.models = serde_json::from_str(&raw).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("CHAT_MODELS is not a valid catalog: {}", e))
            })?;
        }

        config.search.tavily_api_key = get_optional_env("TAVILY_API_KEY");
        config.search.parallel_api_key = get_optional_env("PARALLEL_API_KEY");
        config.search.tavily_base_url =
            get_env("TAVILY_BASE_URL", Some(&config.search.tavily_base_url), false)?;
        config.search.parallel_base_url =
            get_env("PARALLEL_BASE_URL", Some(&config.search.parallel_base_url), false)?;
        config.search.default_backend = get_env("DEFAULT_SEARCH_BACKEND", Some("parallel"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        config.search.search_timeout = Duration::from_secs(parse_or(
            "SEARCH_TIMEOUT_SECS",
            DEFAULT_SEARCH_TIMEOUT_SECS,
        ));
        config.search.expansion_timeout = Duration::from_secs(parse_or(
            "QUERY_EXPANSION_TIMEOUT_SECS",
            DEFAULT_EXPANSION_TIMEOUT_SECS,
        ));
        config.search.expansion_model = get_env(
            "QUERY_EXPANSION_MODEL",
            Some(&config.search.expansion_model),
            false,
        )?;

        config.credits.debit_timeout =
            Duration::from_secs(parse_or("CREDIT_DEBIT_TIMEOUT_SECS", DEFAULT_DEBIT_TIMEOUT_SECS));
        config.guest.message_quota = parse_or("GUEST_MESSAGE_QUOTA", DEFAULT_GUEST_MESSAGE_QUOTA);
        config.generation.max_tool_rounds = parse_or("MAX_TOOL_ROUNDS", DEFAULT_MAX_TOOL_ROUNDS);
        config.rate_limit.requests_per_minute =
            parse_or("CHAT_RATE_LIMIT_PER_MINUTE", DEFAULT_RATE_LIMIT_PER_MINUTE);

        config.tools.geocoding_base_url = get_env(
            "WEATHER_GEOCODING_BASE_URL",
            Some(&config.tools.geocoding_base_url),
            false,
        )?;
        config.tools.forecast_base_url = get_env(
            "WEATHER_FORECAST_BASE_URL",
            Some(&config.tools.forecast_base_url),
            false,
        )?;

        config.mongodb = match get_optional_env("MONGODB_URI") {
            Some(uri) => Some(MongoConfig {
                uri,
                database: get_env("MONGODB_DATABASE", Some("search_chat_db"), false)?,
            }),
            None => None,
        };

        Ok(config)
    }

    /// Look up a client model id in the catalog.
    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    get_optional_env(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = ChatConfig::with_defaults(core_config::Config::default());
        assert_eq!(config.credits.debit_timeout, Duration::from_secs(10));
        assert_eq!(config.search.search_timeout, Duration::from_secs(15));
        assert_eq!(config.guest.message_quota, 2);
        assert_eq!(config.search.default_backend, BackendKind::Parallel);
    }

    #[test]
    fn model_lookup_uses_client_id() {
        let config = ChatConfig::with_defaults(core_config::Config::default());
        let spec = config.model("gemini-2.5-pro").unwrap();
        assert_eq!(spec.class, ModelClass::SuperPremium);
        assert!(config.model("gpt-unknown").is_none());
    }

    #[test]
    fn catalog_deserializes_from_json() {
        let models: Vec<ModelSpec> = serde_json::from_str(
            r#"[{"id":"fast","provider_model":"gemini-2.0-flash","class":"free"}]"#,
        )
        .unwrap();
        assert_eq!(models[0].class, ModelClass::Free);
        assert!(models[0].available);
    }
}
