//! Configuration management for callcore engines
//!
//! Values come from the process environment (optionally seeded from a
//! `.env` file). Keys use the `CALLCORE_` prefix and `__` for nesting:
//!
//! ```text
//! CALLCORE_BIND_ADDRESS=0.0.0.0:0
//! CALLCORE_STUN_SERVER=stun.example.net:3478
//! CALLCORE_RELAY_SERVERS=198.51.100.7:596,198.51.100.8:596
//! CALLCORE_PROXY__HOST=127.0.0.1
//! CALLCORE_PROXY__PORT=9050
//! CALLCORE_TIMEOUTS__CONNECTIVITY_TIMEOUT_SECS=20
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

const ENV_PREFIX: &str = "CALLCORE";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// SOCKS-style proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy endpoint as `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credentials, if both parts are present and non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Call lifecycle timeouts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long an unanswered call rings before it is ended as missed
    pub ring_timeout_secs: u64,
    /// Deadline for the key exchange to complete
    pub key_exchange_timeout_secs: u64,
    /// Deadline for the first candidate to validate
    pub connectivity_timeout_secs: u64,
    /// Silence on the active candidate before it is considered lost
    pub candidate_grace_ms: u64,
    /// Deadline for a single reconnection attempt
    pub reconnect_timeout_secs: u64,
    /// Reconnection attempts before the call fails
    pub max_reconnect_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            ring_timeout_secs: 45,
            key_exchange_timeout_secs: 10,
            connectivity_timeout_secs: 15,
            candidate_grace_ms: 3_000,
            reconnect_timeout_secs: 10,
            max_reconnect_attempts: 3,
        }
    }
}

/// Audio format settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub frame_ms: u32,
    /// Preferred codec name ("pcm" or "opus")
    pub codec: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            sample_rate: 48_000,
            frame_ms: 20,
            codec: "pcm".to_string(),
        }
    }
}

/// Jitter buffer and concealment settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JitterSettings {
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub initial_latency_ms: u32,
    pub max_conceal_frames: usize,
}

impl Default for JitterSettings {
    fn default() -> Self {
        JitterSettings {
            min_latency_ms: 20,
            max_latency_ms: 300,
            initial_latency_ms: 40,
            max_conceal_frames: 5,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Local UDP bind address
    pub bind_address: String,
    /// Optional STUN server used for reflexive candidates
    pub stun_server: Option<String>,
    /// Relay servers offered as relayed candidates
    pub relay_servers: Vec<String>,
    /// Optional SOCKS5 proxy; absence means direct connectivity
    pub proxy: Option<ProxyConfig>,
    /// Whether incoming calls are surfaced to the host or auto-declined
    pub accept_incoming: bool,
    pub timeouts: TimeoutConfig,
    pub audio: AudioSettings,
    pub jitter: JitterSettings,
    pub log_level: String,
    /// "json" or "console"
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_address: "0.0.0.0:0".to_string(),
            stun_server: None,
            relay_servers: Vec::new(),
            proxy: None,
            accept_incoming: true,
            timeouts: TimeoutConfig::default(),
            audio: AudioSettings::default(),
            jitter: JitterSettings::default(),
            log_level: "info".to_string(),
            log_format: "console".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();
        Self::load(None)
    }

    /// Load configuration from an explicit variable map instead of the
    /// process environment (keys include the `CALLCORE_` prefix)
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("relay_servers")
            .source(vars);

        let loaded: AppConfig = config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err(ConfigError::Invalid(
                    "proxy requires a host and a non-zero port".to_string(),
                ));
            }
        }

        if ![10, 20, 40, 60].contains(&self.audio.frame_ms) {
            return Err(ConfigError::Invalid(format!(
                "unsupported frame duration {} ms",
                self.audio.frame_ms
            )));
        }

        if ![8_000, 16_000, 24_000, 48_000].contains(&self.audio.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "unsupported sample rate {}",
                self.audio.sample_rate
            )));
        }

        let jitter = &self.jitter;
        if jitter.min_latency_ms > jitter.initial_latency_ms
            || jitter.initial_latency_ms > jitter.max_latency_ms
        {
            return Err(ConfigError::Invalid(
                "jitter latencies must satisfy min <= initial <= max".to_string(),
            ));
        }

        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}
