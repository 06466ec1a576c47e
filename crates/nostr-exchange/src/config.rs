//! Exchange configuration.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Environment prefix for configuration overrides (`NOSTR_EXCHANGE_DEFAULT_TIMEOUT_MS`, ...).
pub const ENV_PREFIX: &str = "NOSTR_EXCHANGE";

/// Exchange manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeConfig {
    /// Deadline applied when a request carries no explicit timeout.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Tag name replies use to reference the request id.
    #[serde(default = "default_reference_tag")]
    pub reference_tag: String,
    /// Payload field carrying the shared secret.
    #[serde(default = "default_secret_field")]
    pub secret_field: String,
    /// Maximum events drained from a subscription as one delivery batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Relay advertised in pairing URIs.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            reference_tag: default_reference_tag(),
            secret_field: default_secret_field(),
            max_batch: default_max_batch(),
            relay_url: default_relay_url(),
        }
    }
}

impl ExchangeConfig {
    /// Load settings from `NOSTR_EXCHANGE_*` environment variables over the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(source: Environment) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(source.try_parsing(true))
            .build()?;
        let settings: ExchangeConfig = config.try_deserialize()?;
        if settings.max_batch == 0 {
            return Err(ConfigError::Message("max_batch must be at least 1".to_string()));
        }
        Ok(settings)
    }

    /// Default deadline as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_reference_tag() -> String {
    "e".to_string()
}

fn default_secret_field() -> String {
    "result".to_string()
}

fn default_max_batch() -> usize {
    64
}

fn default_relay_url() -> String {
    "ws://localhost:3002".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = ExchangeConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.reference_tag, "e");
        assert_eq!(config.secret_field, "result");
        assert_eq!(config.max_batch, 64);
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = ExchangeConfig::from_environment(env(&[])).unwrap();
        assert_eq!(config, ExchangeConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = ExchangeConfig::from_environment(env(&[
            ("NOSTR_EXCHANGE_DEFAULT_TIMEOUT_MS", "1500"),
            ("NOSTR_EXCHANGE_RELAY_URL", "wss://relay.example.com"),
        ]))
        .unwrap();
        assert_eq!(config.default_timeout_ms, 1500);
        assert_eq!(config.relay_url, "wss://relay.example.com");
        assert_eq!(config.reference_tag, "e");
    }

    #[test]
    fn test_zero_batch_rejected() {
        assert!(ExchangeConfig::from_environment(env(&[("NOSTR_EXCHANGE_MAX_BATCH", "0")])).is_err());
    }
}
