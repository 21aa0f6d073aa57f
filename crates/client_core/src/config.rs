use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Bounded reconnection: fixed attempt count and inter-attempt delay. The
/// session is short-lived and user-facing, so no exponential backoff.
pub const RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Quiet period after which a local typing announcement auto-expires.
pub const TYPING_QUIET_PERIOD: Duration = Duration::from_secs(2);

const API_BASE_VAR: &str = "CHAT_API_BASE";
const SOCKET_URL_VAR: &str = "CHAT_SOCKET_URL";
const MEDIA_ORIGIN_VAR: &str = "CHAT_MEDIA_ORIGIN";

const DEFAULT_API_BASE: &str = "http://localhost:5000/api";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid origin ({value:?}): {source}")]
    InvalidOrigin {
        var: &'static str,
        value: String,
        source: url::ParseError,
    },
}

/// Environment-supplied configuration, read once at startup. No runtime
/// reconfiguration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base origin for the REST API, e.g. `http://localhost:5000/api`.
    pub api_base: String,
    /// Origin of the live transport; defaults to the API base.
    pub socket_url: String,
    /// Origin prefixed onto relative attachment paths; defaults to the API
    /// base with a trailing `/api` segment stripped.
    pub media_origin: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub typing_quiet_period: Duration,
}

impl ClientConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        let api_base = trim_trailing_slash(api_base.into());
        let media_origin = strip_api_suffix(&api_base);
        Self {
            socket_url: api_base.clone(),
            media_origin,
            api_base,
            reconnect_attempts: RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            typing_quiet_period: TYPING_QUIET_PERIOD,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base = env_or(API_BASE_VAR, DEFAULT_API_BASE);
        validate_origin(API_BASE_VAR, &api_base)?;

        let mut config = Self::new(api_base);
        if let Ok(socket_url) = std::env::var(SOCKET_URL_VAR) {
            validate_origin(SOCKET_URL_VAR, &socket_url)?;
            config.socket_url = trim_trailing_slash(socket_url);
        }
        if let Ok(media_origin) = std::env::var(MEDIA_ORIGIN_VAR) {
            validate_origin(MEDIA_ORIGIN_VAR, &media_origin)?;
            config.media_origin = trim_trailing_slash(media_origin);
        }
        Ok(config)
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn validate_origin(var: &'static str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidOrigin {
            var,
            value: value.to_string(),
            source,
        })
}

fn trim_trailing_slash(mut origin: String) -> String {
    while origin.ends_with('/') {
        origin.pop();
    }
    origin
}

/// Derives the media origin from the API base by dropping a trailing `/api`
/// segment, so `http://host:5000/api` serves images from `http://host:5000`.
fn strip_api_suffix(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    // Byte-wise suffix check: origins may end in multibyte characters, so
    // slicing by a fixed offset is not safe.
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b"/api") {
        trimmed[..trimmed.len() - 4].to_string()
    } else {
        trimmed.to_string()
    }
}
