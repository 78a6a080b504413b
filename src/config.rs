//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimiterConfig, DEFAULT_CAPACITY, DEFAULT_RATE};

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__RATE_LIMITING__RATE=5`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Take the client address from `X-Real-IP` / `X-Forwarded-For`.
    ///
    /// Off by default: any client can set these headers, so only enable it
    /// behind a reverse proxy that overwrites them.
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout(),
            trust_proxy_headers: default_trust_proxy_headers(),
        }
    }
}

impl ServerConfig {
    /// The request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    60
}

fn default_trust_proxy_headers() -> bool {
    false
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Tokens replenished per second per client
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum burst size per client
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Seconds between idle bucket sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds of inactivity before a client's bucket is dropped
    #[serde(default = "default_idle_horizon")]
    pub idle_horizon_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            idle_horizon_secs: default_idle_horizon(),
        }
    }
}

fn default_rate() -> f64 {
    DEFAULT_RATE
}

fn default_capacity() -> u32 {
    DEFAULT_CAPACITY
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_horizon() -> u64 {
    600
}

impl RateLimitingConfig {
    /// Build the limiter configuration, checking its invariants.
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        let config = LimiterConfig::new(self.rate, self.capacity)
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
            .with_idle_horizon(Duration::from_secs(self.idle_horizon_secs));
        config.validate()?;
        Ok(config)
    }
}

impl AppConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::with_name(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
