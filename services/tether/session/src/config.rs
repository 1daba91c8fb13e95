//! Transport configuration.
//!
//! Values come from built-in defaults, optionally overlaid by the `transport`
//! section of a YAML file and then by `TETHER_*` environment variables.

use crate::error::TransportError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Reconnect backoff parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the second attempt; doubles per attempt
    pub base_ms: u64,
    /// Upper bound of the exponential part
    pub max_ms: u64,
    /// Uniform random jitter added on top, inclusive
    pub max_jitter_ms: u64,
    /// Consecutive failed attempts before the session is abandoned
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 150,
            max_ms: 32_000,
            max_jitter_ms: 200,
            max_attempts: 5,
        }
    }
}

/// Replay buffer bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum number of unacknowledged messages kept
    pub max_messages: usize,
    /// Maximum total payload bytes kept, unbounded when absent
    pub max_bytes: Option<usize>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_messages: 1024,
            max_bytes: None,
        }
    }
}

/// Session and transport timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Window for a handshake to complete on a new connection
    pub handshake_timeout_ms: u64,
    /// Interval between heartbeats while connected
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat intervals before the link is declared dead
    pub heartbeats_until_dead: u32,
    /// How long a disconnected session waits for a reconnect before it is destroyed
    pub session_disconnect_grace_ms: u64,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// Replay buffer bounds
    pub replay: ReplayConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            heartbeats_until_dead: 2,
            session_disconnect_grace_ms: 5_000,
            backoff: BackoffConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    transport: Option<TransportConfig>,
}

impl TransportConfig {
    /// Handshake window
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a connected link is declared dead
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeats_until_dead
    }

    /// Grace period of a disconnected session
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.session_disconnect_grace_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.handshake_timeout_ms == 0 {
            return Err(TransportError::Config(
                "handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(TransportError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.heartbeats_until_dead == 0 {
            return Err(TransportError::Config(
                "heartbeats_until_dead must be at least 1".to_string(),
            ));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(TransportError::Config(format!(
                "backoff.base_ms ({}) exceeds backoff.max_ms ({})",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }
        if self.backoff.max_attempts == 0 {
            return Err(TransportError::Config(
                "backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.replay.max_messages == 0 {
            return Err(TransportError::Config(
                "replay.max_messages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(transport) = root.transport {
                        config = transport;
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Final transport configuration: handshake_timeout={}ms, heartbeat={}ms x{}, grace={}ms, replay={}",
            config.handshake_timeout_ms,
            config.heartbeat_interval_ms,
            config.heartbeats_until_dead,
            config.session_disconnect_grace_ms,
            config.replay.max_messages
        );

        Ok(config)
    }

    /// Apply `TETHER_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a valid number", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "TETHER_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_HEARTBEATS_UNTIL_DEAD") {
            self.heartbeats_until_dead = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_DISCONNECT_GRACE_MS") {
            self.session_disconnect_grace_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_BACKOFF_MAX_ATTEMPTS") {
            self.backoff.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_REPLAY_MAX_MESSAGES") {
            self.replay.max_messages = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_REPLAY_MAX_BYTES") {
            self.replay.max_bytes = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.liveness_timeout(), Duration::from_millis(2_000));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "transport:\n  handshake_timeout_ms: 250\n  heartbeat_interval_ms: 50\n  replay:\n    max_messages: 8\n    max_bytes: 4096"
        )
        .unwrap();

        let config = TransportConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.handshake_timeout_ms, 250);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert_eq!(config.replay.max_messages, 8);
        assert_eq!(config.replay.max_bytes, Some(4096));
        // untouched fields keep their defaults
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.session_disconnect_grace_ms, 5_000);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TETHER_HEARTBEAT_INTERVAL_MS", "20"),
            ("TETHER_REPLAY_MAX_BYTES", "1024"),
            ("TETHER_HEARTBEATS_UNTIL_DEAD", "many"),
        ]);
        let mut config = TransportConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.heartbeat_interval_ms, 20);
        assert_eq!(config.replay.max_bytes, Some(1024));
        assert_eq!(config.heartbeats_until_dead, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TransportConfig::default();
        config.heartbeats_until_dead = 0;
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));

        let mut config = TransportConfig::default();
        config.backoff.base_ms = 10_000;
        config.backoff.max_ms = 100;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.backoff.max_attempts = 0;
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }
}
