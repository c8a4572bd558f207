//! Static configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid value
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Could not parse
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Collection holding session records
    pub sessions_collection: String,
    /// Attempts for idempotent store operations (subscribe, delete)
    pub retry_attempts: u32,
    /// Base delay between attempts; grows linearly per attempt
    pub retry_backoff_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            sessions_collection: "calls".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl SignalingConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt.min(10))))
    }
}

/// Call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// ICE server URIs handed to the transport
    pub ice_servers: Vec<String>,
    /// Signaling channel settings
    pub signaling: SignalingConfig,
    /// Capacity of the presentation event channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            signaling: SignalingConfig::default(),
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Parse from JSON; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the result is invalid
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error when no STUN server is configured or a capacity is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one ICE server is required".to_string(),
            ));
        }
        if !self
            .ice_servers
            .iter()
            .any(|url| url.starts_with("stun:") || url.starts_with("stuns:"))
        {
            return Err(ConfigError::Invalid(
                "at least one STUN server is required".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be non-zero".to_string(),
            ));
        }
        if self.signaling.sessions_collection.is_empty() {
            return Err(ConfigError::Invalid(
                "sessions_collection must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.sessions_collection, "calls");
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            CallConfig::from_json_str(r#"{"ice_servers":["stun:example.org:3478"]}"#).unwrap();
        assert_eq!(config.ice_servers, vec!["stun:example.org:3478"]);
        assert_eq!(config.signaling.retry_attempts, 3);
        assert_eq!(config.event_capacity, 100);
    }

    #[test]
    fn test_rejects_missing_stun() {
        let res = CallConfig::from_json_str(r#"{"ice_servers":["turn:relay.example.org"]}"#);
        assert!(matches!(res, Err(ConfigError::Invalid(ref msg)) if msg.contains("STUN")));

        let res = CallConfig::from_json_str(r#"{"ice_servers":[]}"#);
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            CallConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = SignalingConfig::default();
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(3), Duration::from_millis(300));
        assert_eq!(cfg.backoff(50), Duration::from_millis(1000));
    }
}
