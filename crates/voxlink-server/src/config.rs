//! Server configuration loading from file and environment variables.

use crate::middleware::RateLimit;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use voxlink_voice::VoiceConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Speech backend selection and settings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Voice stream connection settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Rate limit rules.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxlink_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Per-connection settings for `/voice-stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// How long a client may take to send its start message.
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,

    /// Capacity of the channel carrying server notices to the outbound pump.
    #[serde(default = "default_notice_buffer")]
    pub notice_buffer: usize,
}

impl StreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Rate limit rules for the protected operations.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Audio and control frames on a voice stream, per user.
    #[serde(default = "default_voice_messages_limit")]
    pub voice_messages: RateLimit,

    /// `GET /api/voice/sessions`, per remote address.
    #[serde(default = "default_sessions_api_limit")]
    pub sessions_api: RateLimit,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8765
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handshake_timeout_seconds() -> u64 {
    30
}

fn default_notice_buffer() -> usize {
    32
}

fn default_voice_messages_limit() -> RateLimit {
    RateLimit::new(600, 60)
}

fn default_sessions_api_limit() -> RateLimit {
    RateLimit::new(30, 60)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
            notice_buffer: default_notice_buffer(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            voice_messages: default_voice_messages_limit(),
            sessions_api: default_sessions_api_limit(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is syntactically valid but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXLINK_HOST` overrides `server.host`
/// - `VOXLINK_PORT` overrides `server.port`
/// - `VOXLINK_LOG_LEVEL` overrides `logging.level`
/// - `VOXLINK_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXLINK_VOICE_BACKEND` overrides `voice.backend`
/// - `VOXLINK_WHISPER_BINARY` overrides `voice.whisper.binary_path`
/// - `VOXLINK_WHISPER_MODEL` overrides `voice.whisper.model_path`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting values fail validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = var("VOXLINK_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("VOXLINK_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("VOXLINK_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("VOXLINK_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(backend) = var("VOXLINK_VOICE_BACKEND") {
        config.voice.backend = backend.parse().map_err(ConfigError::Invalid)?;
    }
    if let Some(binary) = var("VOXLINK_WHISPER_BINARY") {
        config.voice.whisper.binary_path = binary.into();
    }
    if let Some(model) = var("VOXLINK_WHISPER_MODEL") {
        config.voice.whisper.model_path = model.into();
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.stream.handshake_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "stream.handshake_timeout_seconds must be positive".to_string(),
        ));
    }
    if config.stream.notice_buffer == 0 {
        return Err(ConfigError::Invalid(
            "stream.notice_buffer must be positive".to_string(),
        ));
    }
    for (name, rule) in [
        ("voice_messages", config.rate_limit.voice_messages),
        ("sessions_api", config.rate_limit.sessions_api),
    ] {
        if rule.window_seconds == 0 {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.{}.window_seconds must be positive",
                name
            )));
        }
    }
    Ok(())
}
