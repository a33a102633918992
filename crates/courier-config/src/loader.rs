//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "courier.toml",
    "config.toml",
    "./config/courier.toml",
    "/etc/courier/courier.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides applied on top.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("COURIER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Some(port) = env_parse::<u16>("COURIER_HTTP_PORT") {
            config.http.port = port;
        }
        if let Ok(host) = env::var("COURIER_HTTP_HOST") {
            config.http.host = host;
        }
        if let Some(v) = env_parse::<u64>("COURIER_POLL_INTERVAL_MS") {
            config.dispatcher.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("COURIER_VISIBILITY_TIMEOUT_MS") {
            config.dispatcher.visibility_timeout_ms = v;
        }
        if let Ok(endpoint) = env::var("COURIER_SMS_ENDPOINT") {
            config.channels.sms.endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("COURIER_EMAIL_ENDPOINT") {
            config.channels.email.endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("COURIER_AI_RESPONSE_ENDPOINT") {
            config.channels.ai_response.endpoint = endpoint;
        }
        if let Ok(v) = env::var("COURIER_DEV_MODE") {
            config.dev_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
