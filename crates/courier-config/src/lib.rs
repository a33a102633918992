//! Courier configuration system.
//!
//! TOML-based configuration with environment variable overrides. This is
//! the single source of truth for every tunable in the delivery engine;
//! components receive values from here instead of carrying their own
//! constants.

use courier_common::Channel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub dispatcher: DispatcherConfig,
    pub channels: ChannelsConfig,
    pub metrics: MetricsConfig,

    /// Enable development mode (embedded in-memory store, verbose checks)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            dispatcher: DispatcherConfig::default(),
            channels: ChannelsConfig::default(),
            metrics: MetricsConfig::default(),
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Load configuration using the default search paths.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, ch) in [
            ("sms", &self.channels.sms),
            ("email", &self.channels.email),
            ("ai_response", &self.channels.ai_response),
        ] {
            if ch.max_per_window == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channels.{}.max_per_window must be > 0",
                    name
                )));
            }
            if ch.tenant_max_per_window == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "channels.{}.tenant_max_per_window must be > 0 when set",
                    name
                )));
            }
            if ch.window_length_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channels.{}.window_length_ms must be > 0",
                    name
                )));
            }
            if ch.max_batch_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channels.{}.max_batch_size must be > 0",
                    name
                )));
            }
            if ch.worker_concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channels.{}.worker_concurrency must be > 0",
                    name
                )));
            }
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP health/report surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Drain loop and claim configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Interval between due-job polls
    pub poll_interval_ms: u64,
    /// Maximum jobs claimed per poll
    pub claim_batch_size: usize,
    /// Visibility timeout for claimed-but-unacknowledged jobs
    pub visibility_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            claim_batch_size: 100,
            visibility_timeout_ms: 30_000,
        }
    }
}

/// Per-channel delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum dispatches per rate-limit key within the sliding window.
    /// The key is the tenant id, except for AI replies where it is
    /// tenant:contact.
    pub max_per_window: u32,
    /// Sliding window length in milliseconds
    pub window_length_ms: u64,
    /// Additional tenant-wide ceiling over the same window, for channels
    /// whose primary key is narrower than the tenant (AI replies)
    pub tenant_max_per_window: Option<u32>,
    /// Maximum same-tenant jobs grouped into one batch
    pub max_batch_size: usize,
    /// Concurrent workers for this channel
    pub worker_concurrency: u32,
    /// Dispatch attempts before a job goes dead
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_backoff_ms: u64,
    /// Ceiling on a single backoff delay
    pub backoff_cap_ms: u64,
    /// Downstream sender endpoint
    pub endpoint: String,
    /// Per-call sender timeout
    pub send_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_per_window: 50,
            window_length_ms: 1_000,
            tenant_max_per_window: None,
            max_batch_size: 50,
            worker_concurrency: 5,
            max_attempts: 3,
            base_backoff_ms: 1_000,
            backoff_cap_ms: 60_000,
            endpoint: "http://localhost:9000/send-sms".to_string(),
            send_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub sms: ChannelConfig,
    pub email: ChannelConfig,
    pub ai_response: ChannelConfig,
}

impl ChannelsConfig {
    pub fn for_channel(&self, channel: Channel) -> &ChannelConfig {
        match channel {
            Channel::Sms => &self.sms,
            Channel::Email => &self.email,
            Channel::AiResponse => &self.ai_response,
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            // SMS providers throttle hardest: 50 per second per tenant
            sms: ChannelConfig::default(),
            // Email tolerates larger windows and batches
            email: ChannelConfig {
                max_per_window: 100,
                max_batch_size: 100,
                endpoint: "http://localhost:9000/send-email".to_string(),
                ..ChannelConfig::default()
            },
            // AI replies are limited per contact over a minute, with a
            // wider tenant-level ceiling on top
            ai_response: ChannelConfig {
                max_per_window: 5,
                window_length_ms: 60_000,
                tenant_max_per_window: Some(100),
                max_batch_size: 10,
                worker_concurrency: 10,
                endpoint: "http://localhost:9000/ai-response".to_string(),
                send_timeout_ms: 30_000,
                ..ChannelConfig::default()
            },
        }
    }
}

/// Metrics registry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Capacity of the per-tenant exceedance detail ring
    pub detail_capacity: usize,
    /// Evict tenants inactive beyond this horizon
    pub tenant_retention_ms: u64,
    /// Interval for the retention sweep
    pub sweep_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            detail_capacity: 50,
            tenant_retention_ms: 24 * 3600 * 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels.sms.max_per_window, 50);
        assert_eq!(config.channels.email.max_per_window, 100);
        assert_eq!(config.channels.ai_response.window_length_ms, 60_000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            dev_mode = true

            [dispatcher]
            poll_interval_ms = 100

            [channels.sms]
            max_per_window = 25
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.dispatcher.poll_interval_ms, 100);
        assert_eq!(config.channels.sms.max_per_window, 25);
        // Untouched sections keep defaults
        assert_eq!(config.channels.email.max_batch_size, 100);
    }

    #[test]
    fn test_http_host_env_override() {
        std::env::set_var("COURIER_HTTP_HOST", "127.0.0.1");
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.http.host, "127.0.0.1");
        std::env::remove_var("COURIER_HTTP_HOST");
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = AppConfig::default();
        config.channels.email.window_length_ms = 0;
        assert!(config.validate().is_err());
    }
}
