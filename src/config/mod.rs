//! Configuration module
//!
//! Handles loading and saving tictacnet configuration, and turning it into the
//! runtime settings used by [`crate::network::Network`] and
//! [`crate::network::Server`].

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ClientConfig, ServerConfig, MAX_PEERS};
use crate::protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Game connection settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// LAN discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name shown to the other player
    #[serde(default = "local_hostname")]
    pub player_name: String,
    /// Session name announced when hosting
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_session_name() -> String {
    format!("{}'s game", local_hostname())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            player_name: local_hostname(),
            session_name: default_session_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server host clients connect to when none is given
    #[serde(default = "default_host")]
    pub host: String,
    /// Game port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface the server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Connect and handshake timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in ms (0 disables heartbeats)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Peers a server admits at once
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_max_peers() -> usize {
    MAX_PEERS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_peers: default_max_peers(),
        }
    }
}

/// LAN discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Whether a server answers discovery requests
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP port servers listen on for requests
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Address requests are sent to
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,
    /// Length of one discovery round in ms
    #[serde(default = "default_window")]
    pub window_ms: u64,
    /// Interval between request retransmissions in ms
    #[serde(default = "default_retransmit_interval")]
    pub retransmit_interval_ms: u64,
    /// Host announced to clients; filled from the reply's source address when unset
    #[serde(default)]
    pub advertise_host: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_window() -> u64 {
    3000
}

fn default_retransmit_interval() -> u64 {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
            window_ms: default_window(),
            retransmit_interval_ms: default_retransmit_interval(),
            advertise_host: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// Where discovery requests are sent
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.port)
    }

    /// Where a responder listens
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tictacnet/config.toml")),
            Some(PathBuf::from("./tictacnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.network.max_peers == 0 {
            return Err(ConfigError::Invalid {
                field: "network.max_peers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.discovery.window_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery.window_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.discovery.retransmit_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery.retransmit_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Runtime settings for a client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.network.host.clone(),
            port: self.network.port,
            player_name: self.general.player_name.clone(),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.network.heartbeat_interval_ms),
            discovery: self.discovery.clone(),
        }
    }

    /// Runtime settings for a server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            session_name: self.general.session_name.clone(),
            bind_address: self.network.bind_address,
            port: self.network.port,
            max_peers: self.network.max_peers,
            handshake_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            discovery: self.discovery.clone(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            player_name: "alice".to_string(),
            session_name: "MyServer".to_string(),
            verbose: false,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
