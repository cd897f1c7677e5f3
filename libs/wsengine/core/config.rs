//! Session and client configuration
//!
//! Both structs deserialize from YAML with every field optional, and a few
//! fields can be overridden from the environment:
//!
//! ```yaml
//! session:
//!   idle_timeout_ms: 10000
//!   close_timeout_ms: 5000
//!   max_text_message_size: 2097152
//!   stream_queue_capacity: 16
//! dispatch_queue_capacity: 64
//! ```

use crate::traits::{Result, WsError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Env var overriding `SessionConfig::idle_timeout` (milliseconds, 0 disables)
pub const IDLE_TIMEOUT_ENV: &str = "WSENGINE_IDLE_TIMEOUT_MS";

/// Env var overriding `SessionConfig::close_timeout` (milliseconds)
pub const CLOSE_TIMEOUT_ENV: &str = "WSENGINE_CLOSE_TIMEOUT_MS";

/// Per-session policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close abnormally when no frame arrives for this long
    #[serde(rename = "idle_timeout_ms", with = "opt_duration_ms")]
    pub idle_timeout: Option<Duration>,

    /// How long to wait for the peer's close echo after sending ours
    #[serde(rename = "close_timeout_ms", with = "duration_ms")]
    pub close_timeout: Duration,

    /// Tick of the watchdog that enforces both deadlines
    #[serde(rename = "timer_resolution_ms", with = "duration_ms")]
    pub timer_resolution: Duration,

    /// Answer pings automatically
    pub auto_pong: bool,

    pub max_text_message_size: usize,

    pub max_binary_message_size: usize,

    /// Chunks buffered per streamed message before the producer blocks
    pub stream_queue_capacity: usize,

    /// Let text decoders read binary messages (and the reverse)
    pub allow_cross_type_coercion: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(300)),
            close_timeout: Duration::from_secs(5),
            timer_resolution: Duration::from_millis(50),
            auto_pong: true,
            max_text_message_size: 64 * 1024,
            max_binary_message_size: 64 * 1024,
            stream_queue_capacity: 16,
            allow_cross_type_coercion: false,
        }
    }
}

impl SessionConfig {
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }

    pub fn with_auto_pong(mut self, enabled: bool) -> Self {
        self.auto_pong = enabled;
        self
    }

    pub fn with_max_message_size(mut self, text: usize, binary: usize) -> Self {
        self.max_text_message_size = text;
        self.max_binary_message_size = binary;
        self
    }

    pub fn with_stream_queue_capacity(mut self, capacity: usize) -> Self {
        self.stream_queue_capacity = capacity;
        self
    }

    pub fn with_cross_type_coercion(mut self, allowed: bool) -> Self {
        self.allow_cross_type_coercion = allowed;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream_queue_capacity == 0 {
            return Err(WsError::Configuration(
                "stream_queue_capacity must be at least 1".into(),
            ));
        }
        if self.timer_resolution.is_zero() {
            return Err(WsError::Configuration(
                "timer_resolution must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply `WSENGINE_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(ms) = read_env_ms(IDLE_TIMEOUT_ENV)? {
            self.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = read_env_ms(CLOSE_TIMEOUT_ENV)? {
            self.close_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }
}

/// Configuration for `WebSocketClient`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Defaults for every session the client creates
    pub session: SessionConfig,

    /// Inbound frames buffered between the socket reader and the dispatch thread
    pub dispatch_queue_capacity: usize,

    /// Sub-protocols offered in the upgrade request
    pub sub_protocols: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            dispatch_queue_capacity: 64,
            sub_protocols: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file, then apply env overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            WsError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&yaml)?;
        config.session.apply_env_overrides()?;
        config.validate()?;
        info!("Loaded client configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WsError::Configuration(format!("failed to parse YAML: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch_queue_capacity == 0 {
            return Err(WsError::Configuration(
                "dispatch_queue_capacity must be at least 1".into(),
            ));
        }
        self.session.validate()
    }
}

fn read_env_ms(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| {
                WsError::Configuration(format!(
                    "{} must be milliseconds, got {:?}",
                    name, value
                ))
            }),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        // 0 and null both disable the timeout
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.session.auto_pong);
        assert_eq!(config.session.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
session:
  idle_timeout_ms: 10000
  max_text_message_size: 2097152
dispatch_queue_capacity: 8
sub_protocols: ["echo"]
"#;
        let config = ClientConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.session.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.session.max_text_message_size, 2 * 1024 * 1024);
        assert_eq!(config.session.close_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatch_queue_capacity, 8);
        assert_eq!(config.sub_protocols, vec!["echo".to_string()]);
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = ClientConfig::from_yaml("session:\n  idle_timeout_ms: 0\n").unwrap();
        assert_eq!(config.session.idle_timeout, None);
    }

    #[test]
    fn test_yaml_round_trip_of_durations() {
        let config = ClientConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("close_timeout_ms: 5000"));
        assert_eq!(ClientConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SessionConfig::default().with_stream_queue_capacity(0);
        assert!(matches!(config.validate(), Err(WsError::Configuration(_))));

        assert!(ClientConfig::from_yaml("dispatch_queue_capacity: [1]").is_err());
    }
}
