//! Configuration management for dcnet.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/dcnet/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{IceServer, WebRtcConfig};
use crate::signaling::SignalerConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ice server url must start with stun:, stuns:, turn: or turns:, got {0}")]
    InvalidIceServerUrl(String),

    #[error("turn server {0} needs both a username and a credential")]
    MissingTurnCredentials(String),

    #[error("{name} must be between 1 and {max} seconds, got {value}")]
    InvalidTimeout {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("channel_label must not be empty")]
    EmptyChannelLabel,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid ICE server URL schemes.
const ICE_URL_SCHEMES: &[&str] = &["stun:", "stuns:", "turn:", "turns:"];

/// Upper bound for every timeout setting, in seconds.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Main configuration structure for dcnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Peer connection settings.
    pub webrtc: WebRtcSection,

    /// Handshake settings.
    pub signaling: SignalingSection,

    /// Logging settings.
    pub log: LogSection,
}

/// Peer connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcSection {
    /// STUN server URLs for NAT traversal.
    pub stun_servers: Vec<String>,

    /// TURN relays.
    pub turn_servers: Vec<TurnServer>,

    /// Seconds to wait for ICE candidate gathering.
    pub gather_timeout_secs: u64,
}

/// A TURN relay with its credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Signaling handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingSection {
    /// Seconds a handshake may take before it fails.
    pub handshake_timeout_secs: u64,

    /// Seconds a negotiated data channel gets to open.
    pub open_timeout_secs: u64,

    /// Label of the data channel opened by the dialing side.
    pub channel_label: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for WebRtcSection {
    fn default() -> Self {
        let defaults = WebRtcConfig::default();
        Self {
            stun_servers: defaults
                .ice_servers
                .into_iter()
                .flat_map(|server| server.urls)
                .collect(),
            turn_servers: Vec::new(),
            gather_timeout_secs: defaults.gather_timeout.as_secs(),
        }
    }
}

impl Default for SignalingSection {
    fn default() -> Self {
        let defaults = SignalerConfig::default();
        Self {
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            open_timeout_secs: crate::listener::DEFAULT_OPEN_TIMEOUT.as_secs(),
            channel_label: defaults.channel_label,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dcnet")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DCNET_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DCNET_STUN_SERVERS: Comma-separated STUN server URLs replacing the
    ///   configured list
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("DCNET_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(servers) = std::env::var("DCNET_STUN_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                tracing::info!("Overriding stun_servers from environment: {:?}", servers);
                self.webrtc.stun_servers = servers;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for url in &self.webrtc.stun_servers {
            if !ICE_URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ConfigError::InvalidIceServerUrl(url.clone()));
            }
        }

        for turn in &self.webrtc.turn_servers {
            if !ICE_URL_SCHEMES.iter().any(|scheme| turn.url.starts_with(scheme)) {
                return Err(ConfigError::InvalidIceServerUrl(turn.url.clone()));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(ConfigError::MissingTurnCredentials(turn.url.clone()));
            }
        }

        check_timeout("gather_timeout_secs", self.webrtc.gather_timeout_secs)?;
        check_timeout("handshake_timeout_secs", self.signaling.handshake_timeout_secs)?;
        check_timeout("open_timeout_secs", self.signaling.open_timeout_secs)?;

        if self.signaling.channel_label.is_empty() {
            return Err(ConfigError::EmptyChannelLabel);
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Peer connection configuration for [`crate::network::WebRtcEndpointFactory`].
    pub fn webrtc_config(&self) -> WebRtcConfig {
        let mut ice_servers = Vec::new();
        if !self.webrtc.stun_servers.is_empty() {
            ice_servers.push(IceServer {
                urls: self.webrtc.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }
        ice_servers.extend(self.webrtc.turn_servers.iter().map(|turn| {
            IceServer::turn(turn.url.clone(), turn.username.clone(), turn.credential.clone())
        }));

        WebRtcConfig::with_ice_servers(ice_servers)
            .with_gather_timeout(Duration::from_secs(self.webrtc.gather_timeout_secs))
    }

    /// Handshake configuration for [`crate::signaling::RwSignaler`].
    pub fn signaler_config(&self) -> SignalerConfig {
        SignalerConfig {
            handshake_timeout: Duration::from_secs(self.signaling.handshake_timeout_secs),
            channel_label: self.signaling.channel_label.clone(),
        }
    }

    /// How long a negotiated data channel gets to open.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling.open_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn check_timeout(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_TIMEOUT_SECS {
        return Err(ConfigError::InvalidTimeout {
            name,
            value,
            max: MAX_TIMEOUT_SECS,
        });
    }
    Ok(())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.webrtc.stun_servers.len(), 2);
        assert!(config.webrtc.turn_servers.is_empty());
        assert_eq!(config.webrtc.gather_timeout_secs, 10);
        assert_eq!(config.signaling.handshake_timeout_secs, 30);
        assert_eq!(config.signaling.open_timeout_secs, 10);
        assert_eq!(config.signaling.channel_label, "data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("dcnet/config.toml"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [signaling]
            handshake_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling.handshake_timeout_secs, 5);
        assert_eq!(config.signaling.channel_label, "data");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.webrtc.stun_servers.len(), 2);
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml(
            r#"
            [webrtc]
            stun_servers = ["stun:stun.example.com:3478"]
            gather_timeout_secs = 3

            [[webrtc.turn_servers]]
            url = "turn:turn.example.com:3478"
            username = "user"
            credential = "secret"

            [signaling]
            handshake_timeout_secs = 20
            open_timeout_secs = 4
            channel_label = "pipe"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.webrtc.turn_servers[0].username, "user");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.open_timeout(), Duration::from_secs(4));

        let webrtc = config.webrtc_config();
        assert_eq!(webrtc.ice_servers.len(), 2);
        assert_eq!(webrtc.ice_servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(webrtc.ice_servers[1].username.as_deref(), Some("user"));
        assert_eq!(webrtc.gather_timeout, Duration::from_secs(3));

        let signaler = config.signaler_config();
        assert_eq!(signaler.handshake_timeout, Duration::from_secs(20));
        assert_eq!(signaler.channel_label, "pipe");
    }

    #[test]
    fn test_no_stun_servers_means_no_ice_servers() {
        let mut config = Config::default();
        config.webrtc.stun_servers.clear();
        assert!(config.webrtc_config().ice_servers.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml("[signaling\nhandshake_timeout_secs = ").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.webrtc.stun_servers = vec!["http://stun.example.com".into()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidIceServerUrl("http://stun.example.com".into()))
        );

        let mut config = Config::default();
        config.webrtc.turn_servers.push(TurnServer {
            url: "turn:turn.example.com".into(),
            username: String::new(),
            credential: String::new(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTurnCredentials(_))
        ));

        let mut config = Config::default();
        config.signaling.handshake_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                name: "handshake_timeout_secs",
                ..
            })
        ));

        let mut config = Config::default();
        config.signaling.open_timeout_secs = MAX_TIMEOUT_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signaling.channel_label.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyChannelLabel));

        let mut config = Config::default();
        config.log.level = "loud".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".into()))
        );
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = Config::default();
        config.log.level = "DEBUG".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.signaling.channel_label = "saved".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file_mentions_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DCNET_LOG_LEVEL", "trace");
        std::env::set_var("DCNET_STUN_SERVERS", "stun:a.example.com, stun:b.example.com,");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("DCNET_LOG_LEVEL");
        std::env::remove_var("DCNET_STUN_SERVERS");

        assert_eq!(config.log.level, "trace");
        assert_eq!(
            config.webrtc.stun_servers,
            vec!["stun:a.example.com", "stun:b.example.com"]
        );
    }

    #[test]
    #[serial]
    fn test_empty_env_values_ignored() {
        std::env::set_var("DCNET_LOG_LEVEL", "");
        std::env::set_var("DCNET_STUN_SERVERS", " , ");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("DCNET_LOG_LEVEL");
        std::env::remove_var("DCNET_STUN_SERVERS");

        assert_eq!(config, Config::default());
    }
}
