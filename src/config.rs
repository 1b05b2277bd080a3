use crate::llm::ModelDescriptor;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "openai/gpt-4o";
const DEFAULT_FALLBACKS: &str = "openai/gpt-4o,anthropic/claude-3.5-sonnet,google/gemini-pro-1.5";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required environment variable `{0}` is not set")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub enhance: EnhanceSettings,
    pub server: ServerSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub default_model: ModelDescriptor,
    pub fallback_models: Vec<ModelDescriptor>,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub app_url: Option<String>,
    pub app_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnhanceSettings {
    pub concurrency: usize,
    pub batch_deadline: Option<Duration>,
    pub max_batch_records: usize,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub body_limit: usize,
    pub queue_capacity: usize,
    pub job_retention: usize,
    pub metrics_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Missing or
    /// unparsable optional values fall back to defaults; only the API key is
    /// mandatory.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("LLM_API_KEY")
            .or_else(|| get("OPENROUTER_API_KEY"))
            .ok_or(ConfigError::Missing("LLM_API_KEY"))?;

        let base_url = get("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        match reqwest::Url::parse(&base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::Invalid {
                    key: "LLM_BASE_URL",
                    reason: format!("unsupported scheme `{}`", url.scheme()),
                });
            }
            Err(err) => {
                return Err(ConfigError::Invalid {
                    key: "LLM_BASE_URL",
                    reason: err.to_string(),
                });
            }
        }

        let default_model = ModelDescriptor::new(
            get("LLM_DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        );
        let fallback_models = parse_model_list(
            &get("LLM_FALLBACK_MODELS").unwrap_or_else(|| DEFAULT_FALLBACKS.to_string()),
        );
        if fallback_models.is_empty() {
            return Err(ConfigError::Invalid {
                key: "LLM_FALLBACK_MODELS",
                reason: "no models listed".into(),
            });
        }

        let temperature = parse_or(&get, "LLM_TEMPERATURE", 0.7_f32);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid {
                key: "LLM_TEMPERATURE",
                reason: format!("{temperature} is outside 0.0..=2.0"),
            });
        }

        let llm = LlmSettings {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            fallback_models,
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", 3_usize).max(1),
            retry_delay: Duration::from_millis(parse_or(&get, "LLM_RETRY_DELAY_MS", 1000_u64)),
            temperature,
            max_tokens: parse_or(&get, "LLM_MAX_TOKENS", 2000_u32).max(1),
            app_url: get("LLM_APP_URL"),
            app_title: get("LLM_APP_TITLE"),
        };

        let enhance = EnhanceSettings {
            concurrency: parse_or(&get, "ENHANCE_CONCURRENCY", 1_usize).max(1),
            batch_deadline: get("BATCH_DEADLINE_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            max_batch_records: parse_or(&get, "MAX_BATCH_RECORDS", 500_usize).max(1),
        };

        let server = ServerSettings {
            port: parse_or(&get, "PORT", 8000_u16),
            body_limit: parse_or(&get, "REQUEST_MAX_BYTES", 2 * 1024 * 1024_usize).max(1),
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", 64_usize).max(1),
            job_retention: parse_or(&get, "JOB_RETENTION", 256_usize).max(1),
            metrics_key: get("METRICS_KEY"),
        };

        let http = HttpSettings {
            timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 60_u64)),
            connect_timeout: Duration::from_secs(parse_or(&get, "HTTP_CONNECT_TIMEOUT_SECS", 5_u64)),
        };

        Ok(Self {
            llm,
            enhance,
            server,
            http,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_model_list(raw: &str) -> Vec<ModelDescriptor> {
    let mut models: Vec<ModelDescriptor> = Vec::new();
    for entry in raw.split([',', '\n', ' ']).map(str::trim) {
        if entry.is_empty() {
            continue;
        }
        let model = ModelDescriptor::new(entry);
        if !models.contains(&model) {
            models.push(model);
        }
    }
    models
}
