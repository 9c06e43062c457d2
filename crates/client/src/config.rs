//! Configuration management for the tieba-wire client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tieba-wire/config.toml`.
//! Timeouts are written as seconds (fractions allowed) and exposed as
//! [`Duration`] through accessor methods.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default push-channel endpoint.
pub const DEFAULT_WS_URL: &str = "ws://im.tieba.baidu.com:8000";

/// Default base URL of the mobile API.
pub const DEFAULT_APP_BASE_URL: &str = "http://tiebac.baidu.com";

/// Default base URL of the desktop web API.
pub const DEFAULT_WEB_BASE_URL: &str = "https://tieba.baidu.com";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("timeout {name} must be a finite, non-negative number of seconds, got {value}")]
    InvalidTimeout { name: &'static str, value: f64 },

    #[error("ws_url must start with ws:// or wss://, got {0}")]
    InvalidWsUrl(String),

    #[error("base url must start with http:// or https://, got {0}")]
    InvalidBaseUrl(String),

    #[error("proxy url must use http, https or socks5, got {0}")]
    InvalidProxyUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Endpoints and transport selection.
    pub network: NetworkConfig,

    /// Per-step timeouts.
    pub timeout: TimeoutConfig,

    /// Outbound HTTP proxy.
    pub proxy: ProxyConfig,

    /// Login tokens.
    pub account: AccountConfig,

    /// Logging.
    pub log: LogConfig,
}

/// Endpoints and transport selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Push-channel websocket URL.
    pub ws_url: String,

    /// Base URL for mobile API requests.
    pub app_base_url: String,

    /// Base URL for desktop web requests.
    pub web_base_url: String,

    /// Prefer the websocket for endpoints that support both transports.
    pub try_ws: bool,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Waiting for a pooled HTTP connection.
    pub http_acquire_conn: f64,

    /// Reading an HTTP response.
    pub http_read: f64,

    /// Establishing an HTTP connection.
    pub http_connect: f64,

    /// Idle lifetime of a pooled HTTP connection.
    pub http_keepalive: f64,

    /// Writing one websocket frame.
    pub ws_send: f64,

    /// Waiting for a websocket response.
    pub ws_read: f64,

    /// Idle time after which the websocket is closed.
    pub ws_keepalive: f64,

    /// Interval between websocket pings. Unset disables pings.
    pub ws_heartbeat: Option<f64>,

    /// DNS cache lifetime.
    pub dns_ttl: f64,
}

/// Outbound proxy for HTTP requests.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://127.0.0.1:8080`.
    pub url: Option<String>,

    /// Basic-auth user name.
    pub username: Option<String>,

    /// Basic-auth password.
    pub password: Option<String>,
}

/// Login tokens.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AccountConfig {
    /// BDUSS token (192 characters) or empty.
    pub bduss: String,

    /// STOKEN token (64 characters) or empty.
    pub stoken: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            app_base_url: DEFAULT_APP_BASE_URL.to_string(),
            web_base_url: DEFAULT_WEB_BASE_URL.to_string(),
            try_ws: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            http_acquire_conn: 4.0,
            http_read: 12.0,
            http_connect: 3.0,
            http_keepalive: 30.0,
            ws_send: 3.0,
            ws_read: 8.0,
            ws_keepalive: 300.0,
            ws_heartbeat: None,
            dns_ttl: 600.0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Largest accepted timeout, one year in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Seconds to `Duration`, clamped into `0..=MAX_TIMEOUT_SECS`. NaN becomes zero.
fn secs(value: f64) -> Duration {
    let clamped = value.max(0.0).min(MAX_TIMEOUT_SECS);
    Duration::try_from_secs_f64(clamped).unwrap_or(Duration::ZERO)
}

impl TimeoutConfig {
    pub fn http_acquire_conn(&self) -> Duration {
        secs(self.http_acquire_conn)
    }

    pub fn http_read(&self) -> Duration {
        secs(self.http_read)
    }

    pub fn http_connect(&self) -> Duration {
        secs(self.http_connect)
    }

    pub fn http_keepalive(&self) -> Duration {
        secs(self.http_keepalive)
    }

    pub fn ws_send(&self) -> Duration {
        secs(self.ws_send)
    }

    pub fn ws_read(&self) -> Duration {
        secs(self.ws_read)
    }

    pub fn ws_keepalive(&self) -> Duration {
        secs(self.ws_keepalive)
    }

    pub fn ws_heartbeat(&self) -> Option<Duration> {
        self.ws_heartbeat.map(secs)
    }

    /// DNS cache lifetime.
    ///
    /// Validated and kept for config compatibility; the HTTP client uses the
    /// system resolver and does not read it yet.
    pub fn dns_ttl(&self) -> Duration {
        secs(self.dns_ttl)
    }

    /// Connect timeout for the websocket upgrade.
    ///
    /// The push channel has no dedicated knob; it shares the HTTP connect and
    /// read budget like the upgrade request it is.
    pub fn ws_connect(&self) -> Duration {
        secs(self.http_connect + self.http_read)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let fields = [
            ("http_acquire_conn", self.http_acquire_conn),
            ("http_read", self.http_read),
            ("http_connect", self.http_connect),
            ("http_keepalive", self.http_keepalive),
            ("ws_send", self.ws_send),
            ("ws_read", self.ws_read),
            ("ws_keepalive", self.ws_keepalive),
            ("dns_ttl", self.dns_ttl),
        ];
        for (name, value) in fields {
            if !value.is_finite() || !(0.0..=MAX_TIMEOUT_SECS).contains(&value) {
                return Err(ConfigError::InvalidTimeout { name, value });
            }
        }
        if let Some(value) = self.ws_heartbeat {
            if !value.is_finite() || value <= 0.0 || value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::InvalidTimeout {
                    name: "ws_heartbeat",
                    value,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("bduss", &mask(&self.bduss))
            .field("stoken", &mask(&self.stoken))
            .finish()
    }
}

fn mask(token: &str) -> &'static str {
    if token.is_empty() {
        ""
    } else {
        "[REDACTED]"
    }
}

impl ProxyConfig {
    /// Copy with the password replaced by a placeholder, for display.
    pub fn masked(&self) -> Self {
        Self {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.as_ref().map(|_| "[REDACTED]".to_string()),
        }
    }
}

impl AccountConfig {
    /// Copy with tokens replaced by a placeholder, for display.
    pub fn masked(&self) -> Self {
        Self {
            bduss: mask(&self.bduss).to_string(),
            stoken: mask(&self.stoken).to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tieba-wire")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TIEBA_WIRE_WS_URL: Override the push-channel URL
    /// - TIEBA_WIRE_PROXY: Override the HTTP proxy URL
    /// - TIEBA_WIRE_LOG_LEVEL: Override log level
    /// - TIEBA_WIRE_BDUSS / TIEBA_WIRE_STOKEN: Override login tokens
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = env_value("TIEBA_WIRE_WS_URL") {
            tracing::info!(ws_url = %url, "Overriding ws_url from environment");
            self.network.ws_url = url;
        }

        if let Some(proxy) = env_value("TIEBA_WIRE_PROXY") {
            tracing::info!(proxy = %proxy, "Overriding proxy from environment");
            self.proxy.url = Some(proxy);
        }

        if let Some(level) = env_value("TIEBA_WIRE_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log level from environment");
            self.log.level = level;
        }

        if let Some(bduss) = env_value("TIEBA_WIRE_BDUSS") {
            tracing::info!("Overriding BDUSS from environment");
            self.account.bduss = bduss;
        }

        if let Some(stoken) = env_value("TIEBA_WIRE_STOKEN") {
            tracing::info!("Overriding STOKEN from environment");
            self.account.stoken = stoken;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.timeout.validate()?;

        let ws_url = &self.network.ws_url;
        if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
            return Err(ConfigError::InvalidWsUrl(ws_url.clone()));
        }

        for base in [&self.network.app_base_url, &self.network.web_base_url] {
            if !base.starts_with("http://") && !base.starts_with("https://") {
                return Err(ConfigError::InvalidBaseUrl(base.clone()));
            }
        }

        if let Some(proxy) = &self.proxy.url {
            let scheme_ok = ["http://", "https://", "socks5://"]
                .iter()
                .any(|scheme| proxy.starts_with(scheme));
            if !scheme_ok {
                return Err(ConfigError::InvalidProxyUrl(proxy.clone()));
            }
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
