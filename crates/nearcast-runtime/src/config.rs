//! Node and logging configuration

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use nearcast_core::{NearcastError, NearcastResult, ServiceId};
use nearcast_transport::DEFAULT_MAX_PAYLOAD_BYTES;

/// Nearcast node configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Service advertised and browsed for
    pub service_id: ServiceId,
    /// How long an invite may stay unanswered
    #[serde(deserialize_with = "human_duration")]
    pub invite_timeout: Duration,
    /// Clock tick interval used by the driver
    #[serde(deserialize_with = "human_duration")]
    pub tick_interval: Duration,
    /// Maximum undrained notifications
    pub max_notifications: usize,
    /// Maximum encoded payload size
    pub max_payload_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            service_id: ServiceId::default(),
            invite_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(100),
            max_notifications: 1024,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(text: &str) -> NearcastResult<Self> {
        let config: NodeConfig =
            serde_json::from_str(text).map_err(|e| NearcastError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> NearcastResult<()> {
        if self.tick_interval.is_zero() {
            return Err(NearcastError::InvalidConfig(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        if self.max_notifications == 0 {
            return Err(NearcastError::InvalidConfig(
                "max_notifications must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = service_id;
        self
    }

    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_notifications(mut self, max: usize) -> Self {
        self.max_notifications = max;
        self
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.invite_timeout, Duration::from_secs(10));
        assert_eq!(config.service_id.as_str(), "nearcast-tracker");
    }

    #[test]
    fn test_from_json_with_humantime() {
        let config = NodeConfig::from_json(
            r#"{"service_id": "field-kit", "invite_timeout": "2s 500ms", "tick_interval": "20ms"}"#,
        )
        .unwrap();

        assert_eq!(config.service_id.as_str(), "field-kit");
        assert_eq!(config.invite_timeout, Duration::from_millis(2500));
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert_eq!(config.max_notifications, 1024);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            NodeConfig::from_json(r#"{"service_id": "Bad Id"}"#),
            Err(NearcastError::InvalidConfig(_))
        ));
        assert!(NodeConfig::from_json(r#"{"invite_timeout": "soon"}"#).is_err());
        assert!(NodeConfig::from_json(r#"{"unknown": 1}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(matches!(
            NodeConfig::from_json(r#"{"tick_interval": "0s"}"#),
            Err(NearcastError::InvalidConfig(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{"max_notifications": 0}"#),
            Err(NearcastError::InvalidConfig(_))
        ));
        assert!(NodeConfig::default()
            .with_tick_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_log_config_json() {
        let config: LogConfig =
            serde_json::from_str(r#"{"filter": "nearcast=debug", "format": "json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter, "nearcast=debug");
    }
}
