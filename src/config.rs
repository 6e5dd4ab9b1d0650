//! Network and server configuration.
//!
//! The configuration file is JSON (the same shape the redundancy SDK
//! consumes). `load` reads and parses it, `apply_env_overrides` lets
//! `DCF_HOST` / `DCF_PORT` supersede the file, and `validate` rejects
//! anything the transports cannot work with. A validation failure at startup
//! is fatal.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Topology role in the redundancy graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Client,
    Server,
    P2p,
}

/// Log verbosity, mapped onto `tracing` levels in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_tracing_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above ERROR; fatal conditions are error
            // events followed by process exit.
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PluginConfig {
    /// Dynamic library providing the primary transport factory.
    pub transport: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Metrics emission cadence in milliseconds.
    pub metrics_interval: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            metrics_interval: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Maximum datagram size handed to the transport.
    pub mtu: usize,
    /// Seconds before a reconnect attempt is abandoned.
    pub reconnect_timeout: u64,
    /// Artificial loss for testing: drop one in N outbound sends (0 = off).
    pub network_loss_factor: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            mtu: 1_400,
            reconnect_timeout: 15,
            network_loss_factor: 0,
        }
    }
}

/// Server-loop tuning, recognized from the same file. Every field has a
/// working default so a minimal config only needs the network keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerTuning {
    /// Milliseconds to sleep per server tick.
    pub sleep_time_ms: u64,
    /// 1: use average player load, 2: use highest load.
    pub speed_control: u8,
    pub allow_spec_join: bool,
    pub whitelist_additional_players: bool,
    pub game_pausable: bool,
    pub can_reconnect: bool,
    pub min_user_speed: f32,
    pub max_user_speed: f32,
    pub autohost_ip: String,
    /// 0 disables the autohost side channel.
    pub autohost_port: u16,
    pub log_info_messages: bool,
    pub log_debug_messages: bool,
}

impl Default for ServerTuning {
    fn default() -> Self {
        Self {
            sleep_time_ms: 5,
            speed_control: 1,
            allow_spec_join: true,
            whitelist_additional_players: true,
            game_pausable: true,
            can_reconnect: false,
            min_user_speed: 0.1,
            max_user_speed: 2.0,
            autohost_ip: "127.0.0.1".into(),
            autohost_port: 0,
            log_info_messages: false,
            log_debug_messages: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Primary transport selector ("udp" is built in; anything else must come
    /// from `plugins.transport`).
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub mode: Mode,
    /// Identity in the redundancy graph. Required.
    pub node_id: String,
    pub peers: Vec<String>,
    /// RTT cutoff in milliseconds for the low-latency group.
    pub group_rtt_threshold: u64,
    pub plugins: PluginConfig,
    pub logging: LoggingConfig,
    pub fallback_transport: String,
    /// Hard cap on accepted players.
    pub max_players: usize,
    pub network_settings: NetworkSettings,
    pub server: ServerTuning,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: "gRPC".into(),
            host: "0.0.0.0".into(),
            port: 8452,
            mode: Mode::Auto,
            node_id: String::new(),
            peers: Vec::new(),
            group_rtt_threshold: 50,
            plugins: PluginConfig::default(),
            logging: LoggingConfig::default(),
            fallback_transport: "udp".into(),
            max_players: 160,
            network_settings: NetworkSettings::default(),
            server: ServerTuning::default(),
        }
    }
}

impl NetworkConfig {
    /// Read and parse the config file, then apply environment overrides and
    /// validate. This is the one entry point `main` uses.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: NetworkConfig = serde_json::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `DCF_HOST` and `DCF_PORT` supersede the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("DCF_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = std::env::var("DCF_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => self.port = parsed,
                _ => tracing::warn!("invalid DCF_PORT '{}', keeping {}", port, self.port),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id is required".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }
        if self.max_players == 0 || self.max_players > crate::server::participant::MAX_PLAYERS {
            return Err(ConfigError::Invalid(format!(
                "max_players must be in 1..={}",
                crate::server::participant::MAX_PLAYERS
            )));
        }
        if self.network_settings.mtu == 0 {
            return Err(ConfigError::Invalid("mtu must be positive".into()));
        }
        if !(1..=2).contains(&self.server.speed_control) {
            return Err(ConfigError::Invalid(
                "server.speed_control must be 1 or 2".into(),
            ));
        }
        if self.server.min_user_speed <= 0.0
            || self.server.max_user_speed < self.server.min_user_speed
        {
            return Err(ConfigError::Invalid(
                "user speed bounds must satisfy 0 < min <= max".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> NetworkConfig {
        NetworkConfig {
            node_id: "node-a".into(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.transport, "gRPC");
        assert_eq!(config.port, 8452);
        assert_eq!(config.group_rtt_threshold, 50);
        assert_eq!(config.fallback_transport, "udp");
        assert_eq!(config.max_players, 160);
        assert_eq!(config.network_settings.mtu, 1400);
        assert_eq!(config.network_settings.reconnect_timeout, 15);
        assert_eq!(config.logging.metrics_interval, 5000);
    }

    #[test]
    fn test_parse_full_file() {
        let json = r#"{
            "transport": "udp",
            "host": "127.0.0.1",
            "port": 9000,
            "mode": "server",
            "node_id": "host-1",
            "peers": ["10.0.0.2:8452", "10.0.0.3:8452"],
            "group_rtt_threshold": 40,
            "plugins": { "transport": "/opt/plugins/libdcf_grpc.so" },
            "logging": { "level": "debug", "metrics_interval": 2000 },
            "network_settings": { "mtu": 1200, "network_loss_factor": 10 },
            "server": { "allow_spec_join": false, "autohost_port": 8453 }
        }"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.plugins.transport.is_some());
        assert_eq!(config.network_settings.network_loss_factor, 10);
        assert!(!config.server.allow_spec_join);
        assert_eq!(config.server.autohost_port, 8453);
    }

    #[test]
    fn test_missing_node_id_is_invalid() {
        let config = NetworkConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_port_is_invalid() {
        let config = NetworkConfig {
            port: 0,
            ..minimal()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_players_bounds() {
        let mut config = minimal();
        config.max_players = 0;
        assert!(config.validate().is_err());
        config.max_players = 251;
        assert!(config.validate().is_err());
        config.max_players = 160;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let result: Result<NetworkConfig, _> = serde_json::from_str("{ not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_speed_bounds_validated() {
        let mut config = minimal();
        config.server.min_user_speed = 0.5;
        config.server.max_user_speed = 0.1;
        assert!(config.validate().is_err());
    }
}
