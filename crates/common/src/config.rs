//! Environment-derived relay configuration.
//!
//! All knobs come from environment variables; `from_lookup` takes the
//! variable source as a closure so tests can inject maps instead of
//! mutating the process environment.

use std::path::PathBuf;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

const DEFAULT_TASK_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_PUSH_PORT: u16 = 8790;
const DEFAULT_PUSH_PATH: &str = "/relay/messages";
const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 10;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;
const DEFAULT_MAX_QUEUE: usize = 100;
const DEFAULT_GATEWAY_WS_URL: &str = "ws://127.0.0.1:18789";
const DEFAULT_SCOPES: &str = "operator.admin";
const DEFAULT_STT_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub relay_token: String,
    pub backend_base_url: String,
    pub instance_id: String,
    pub task_timeout_ms: u64,
    pub concurrency: usize,
    pub message_flow_log: bool,
    pub push: PushConfig,
    pub gateway: GatewayConfig,
    pub stt: Option<SttConfig>,
}

#[derive(Clone, Debug)]
pub struct PushConfig {
    pub port: u16,
    pub path: String,
    pub rate_limit_per_second: u32,
    pub max_concurrent_requests: usize,
    pub max_queue: usize,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub ws_url: String,
    pub config_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub token: Option<String>,
    pub password: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    Deepgram,
    OpenAi,
}

#[derive(Clone, Debug)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub api_key: String,
    pub model: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("gateway config read failed: {0}")]
    GatewayConfigFile(String),
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let relay_token = require(lookup, "RELAY_TOKEN")?;
        let backend_base_url = require(lookup, "BACKEND_BASE_URL")?;
        if !backend_base_url.starts_with("http://") && !backend_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                var: "BACKEND_BASE_URL",
                reason: "expected an http(s) url".to_string(),
            });
        }
        let backend_base_url = backend_base_url.trim_end_matches('/').to_string();

        let instance_id = match non_empty(lookup("RELAY_INSTANCE_ID")) {
            Some(value) => value,
            None => generate_instance_id(lookup),
        };

        let push = PushConfig {
            port: parse_or(lookup, "RELAY_PUSH_PORT", DEFAULT_PUSH_PORT)?,
            path: push_path(lookup)?,
            rate_limit_per_second: parse_or(
                lookup,
                "RELAY_PUSH_RATE_LIMIT_PER_SEC",
                DEFAULT_RATE_LIMIT_PER_SECOND,
            )?,
            max_concurrent_requests: parse_or(
                lookup,
                "RELAY_PUSH_MAX_CONCURRENT_REQUESTS",
                DEFAULT_MAX_CONCURRENT_REQUESTS,
            )?,
            max_queue: parse_or(lookup, "RELAY_PUSH_MAX_QUEUE", DEFAULT_MAX_QUEUE)?,
        };

        let ws_url = non_empty(lookup("OPENCLAW_GATEWAY_WS_URL"))
            .unwrap_or_else(|| DEFAULT_GATEWAY_WS_URL.to_string());
        if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                var: "OPENCLAW_GATEWAY_WS_URL",
                reason: "expected a ws(s) url".to_string(),
            });
        }

        let config_path = non_empty(lookup("OPENCLAW_CONFIG_PATH")).map(PathBuf::from);
        let token = match non_empty(lookup("OPENCLAW_GATEWAY_TOKEN")) {
            Some(value) => Some(value),
            None => gateway_token_from_config(config_path.as_deref())?,
        };

        let gateway = GatewayConfig {
            ws_url,
            config_path,
            state_dir: state_dir(lookup),
            token,
            password: non_empty(lookup("OPENCLAW_GATEWAY_PASSWORD")),
            scopes: parse_scopes(lookup("OPENCLAW_SCOPES")),
        };

        Ok(Self {
            relay_token,
            backend_base_url,
            instance_id,
            task_timeout_ms: parse_or(lookup, "RELAY_TASK_TIMEOUT_MS", DEFAULT_TASK_TIMEOUT_MS)?,
            concurrency: parse_or(lookup, "RELAY_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            message_flow_log: flag(lookup("MESSAGE_FLOW_LOG")),
            push,
            gateway,
            stt: stt_config(lookup)?,
        })
    }
}

fn require(lookup: &dyn Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    non_empty(lookup(name)).ok_or(ConfigError::Missing(name))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn flag(value: Option<String>) -> bool {
    matches!(
        non_empty(value).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn parse_or<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(name)) {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            var: name,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn push_path(lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let path =
        non_empty(lookup("RELAY_PUSH_PATH")).unwrap_or_else(|| DEFAULT_PUSH_PATH.to_string());
    if !path.starts_with('/') {
        return Err(ConfigError::Invalid {
            var: "RELAY_PUSH_PATH",
            reason: "path must start with '/'".to_string(),
        });
    }
    Ok(path)
}

fn parse_scopes(raw: Option<String>) -> Vec<String> {
    let csv = non_empty(raw).unwrap_or_else(|| DEFAULT_SCOPES.to_string());
    csv.split(',')
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .map(str::to_string)
        .collect()
}

fn state_dir(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(value) = non_empty(lookup("OPENCLAW_STATE_DIR")) {
        return PathBuf::from(value);
    }
    dirs::home_dir()
        .map(|home| home.join(".openclaw"))
        .unwrap_or_else(|| PathBuf::from(".openclaw"))
}

fn generate_instance_id(lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let host = non_empty(lookup("HOSTNAME")).unwrap_or_else(|| "relay".to_string());
    let pid = std::process::id();
    let suffix: u32 = rand::rng().random_range(0..0xff_ffff);
    format!("{host}-{pid}-{suffix:06x}")
}

/// Fall back to `gateway.auth.token` from the Gateway's JSON config when no
/// token env var is set. A missing file is fine; an unreadable or
/// unparseable one is a startup error.
fn gateway_token_from_config(path: Option<&std::path::Path>) -> Result<Option<String>, ConfigError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::GatewayConfigFile(format!("read failed: {err}")))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| ConfigError::GatewayConfigFile(format!("parse failed: {err}")))?;
    Ok(value
        .pointer("/gateway/auth/token")
        .and_then(Value::as_str)
        .map(str::to_string))
}

fn stt_config(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Option<SttConfig>, ConfigError> {
    let Some(provider_raw) = non_empty(lookup("STT_PROVIDER")) else {
        return Ok(None);
    };
    let provider = match provider_raw.to_ascii_lowercase().as_str() {
        "deepgram" => SttProvider::Deepgram,
        "openai" => SttProvider::OpenAi,
        other => {
            return Err(ConfigError::Invalid {
                var: "STT_PROVIDER",
                reason: format!("unknown provider: {other}"),
            })
        }
    };
    let key_var = match provider {
        SttProvider::Deepgram => "DEEPGRAM_API_KEY",
        SttProvider::OpenAi => "OPENAI_API_KEY",
    };
    let Some(api_key) = non_empty(lookup(key_var)) else {
        // Provider configured without a key: transcription stays disabled.
        return Ok(None);
    };
    Ok(Some(SttConfig {
        provider,
        api_key,
        model: non_empty(lookup("STT_MODEL")),
        language: non_empty(lookup("STT_LANGUAGE")),
        timeout_ms: parse_or(lookup, "STT_TIMEOUT_MS", DEFAULT_STT_TIMEOUT_MS)?,
    }))
}
