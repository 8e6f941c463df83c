//! Presence Coordinator configuration.
//!
//! Configuration is loaded from environment variables. The engine token is
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default concurrent connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5000;

/// Default per-call media engine timeout in milliseconds.
pub const DEFAULT_ENGINE_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default delay before a paused consumer is resumed at the engine.
pub const DEFAULT_CONSUMER_RESUME_DELAY_MS: u64 = 1000;

/// Default delay of the extra snapshot sent after a fresh connection.
pub const DEFAULT_FRESH_SNAPSHOT_DELAY_MS: u64 = 1000;

/// Default start bitrate hint for the video codec, in kbps.
pub const DEFAULT_VIDEO_START_BITRATE_KBPS: u32 = 1000;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "pc";

/// Presence Coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// Base URL of the media engine control API.
    pub media_engine_url: String,

    /// Bearer token for the engine API.
    pub media_engine_token: Option<SecretString>,

    /// WebSocket listener (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Connections beyond this cap are rejected with a capacity error.
    pub max_connections: usize,

    pub engine_request_timeout: Duration,

    pub consumer_resume_delay: Duration,

    pub fresh_snapshot_delay: Duration,

    pub video_start_bitrate_kbps: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("media_engine_url", &self.media_engine_url)
            .field(
                "media_engine_token",
                &self.media_engine_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("max_connections", &self.max_connections)
            .field("engine_request_timeout", &self.engine_request_timeout)
            .field("consumer_resume_delay", &self.consumer_resume_delay)
            .field("fresh_snapshot_delay", &self.fresh_snapshot_delay)
            .field("video_start_bitrate_kbps", &self.video_start_bitrate_kbps)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let media_engine_url = vars
            .get("PC_MEDIA_ENGINE_URL")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("PC_MEDIA_ENGINE_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let media_engine_token = vars
            .get("PC_MEDIA_ENGINE_TOKEN")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let signaling_bind_address = vars
            .get("PC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("PC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let instance_id = vars.get("PC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{}", uuid::Uuid::new_v4())
        });

        let max_connections =
            parse_positive(vars, "PC_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;

        let engine_request_timeout = Duration::from_millis(parse_positive(
            vars,
            "PC_ENGINE_REQUEST_TIMEOUT_MS",
            DEFAULT_ENGINE_REQUEST_TIMEOUT_MS,
        )?);
        let consumer_resume_delay = Duration::from_millis(parse_positive(
            vars,
            "PC_CONSUMER_RESUME_DELAY_MS",
            DEFAULT_CONSUMER_RESUME_DELAY_MS,
        )?);
        let fresh_snapshot_delay = Duration::from_millis(parse_positive(
            vars,
            "PC_FRESH_SNAPSHOT_DELAY_MS",
            DEFAULT_FRESH_SNAPSHOT_DELAY_MS,
        )?);

        let video_start_bitrate_kbps = parse_positive(
            vars,
            "PC_VIDEO_START_BITRATE_KBPS",
            DEFAULT_VIDEO_START_BITRATE_KBPS,
        )?;

        Ok(Config {
            media_engine_url,
            media_engine_token,
            signaling_bind_address,
            health_bind_address,
            instance_id,
            max_connections,
            engine_request_timeout,
            consumer_resume_delay,
            fresh_snapshot_delay,
            video_start_bitrate_kbps,
        })
    }
}

/// Parse an optional numeric variable that must be greater than zero.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw} is not a number")))?;

    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{key} must be > 0")));
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "PC_MEDIA_ENGINE_URL".to_string(),
            "http://media-engine:4000/".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.media_engine_url, "http://media-engine:4000");
        assert!(config.media_engine_token.is_none());
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.engine_request_timeout, Duration::from_secs(10));
        assert_eq!(config.consumer_resume_delay, Duration::from_secs(1));
        assert_eq!(config.fresh_snapshot_delay, Duration::from_secs(1));
        assert_eq!(config.video_start_bitrate_kbps, 1000);
        assert!(config.instance_id.starts_with("pc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("PC_MEDIA_ENGINE_TOKEN".into(), "engine-token-123".into());
        vars.insert("PC_SIGNALING_BIND_ADDRESS".into(), "127.0.0.1:3100".into());
        vars.insert("PC_HEALTH_BIND_ADDRESS".into(), "127.0.0.1:8082".into());
        vars.insert("PC_INSTANCE_ID".into(), "pc-custom-001".into());
        vars.insert("PC_MAX_CONNECTIONS".into(), "64".into());
        vars.insert("PC_ENGINE_REQUEST_TIMEOUT_MS".into(), "2500".into());
        vars.insert("PC_CONSUMER_RESUME_DELAY_MS".into(), "250".into());
        vars.insert("PC_FRESH_SNAPSHOT_DELAY_MS".into(), "500".into());
        vars.insert("PC_VIDEO_START_BITRATE_KBPS".into(), "1500".into());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(
            config
                .media_engine_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            Some("engine-token-123".to_string())
        );
        assert_eq!(config.signaling_bind_address, "127.0.0.1:3100");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.instance_id, "pc-custom-001");
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.engine_request_timeout, Duration::from_millis(2500));
        assert_eq!(config.consumer_resume_delay, Duration::from_millis(250));
        assert_eq!(config.fresh_snapshot_delay, Duration::from_millis(500));
        assert_eq!(config.video_start_bitrate_kbps, 1500);
    }

    #[test]
    fn test_from_vars_missing_engine_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "PC_MEDIA_ENGINE_URL")
        );
    }

    #[test]
    fn test_zero_delay_rejected() {
        let mut vars = base_vars();
        vars.insert("PC_CONSUMER_RESUME_DELAY_MS".into(), "0".into());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut vars = base_vars();
        vars.insert("PC_MAX_CONNECTIONS".into(), "lots".into());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("PC_MAX_CONNECTIONS"))
        );
    }

    #[test]
    fn test_debug_redacts_engine_token() {
        let mut vars = base_vars();
        vars.insert("PC_MEDIA_ENGINE_TOKEN".into(), "super-secret-token".into());
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super-secret-token"));
    }
}
