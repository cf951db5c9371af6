//! Network module - Handles the game connection between peers
//!
//! Provides:
//! - Server for hosting a session and relaying between its two players
//! - Network, the client facade combining discovery and one connection
//! - Connection management and message routing

mod server;
mod client;
mod connection;
mod manager;

pub use server::*;
pub use client::*;
pub use connection::*;
pub use manager::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};

use crate::config::DiscoveryConfig;
use crate::protocol::DEFAULT_PORT;

/// Players per session
pub const MAX_PEERS: usize = 2;

/// Outbound queue depth per connection
pub(crate) const SEND_QUEUE_SIZE: usize = 256;

/// Bound on the goodbye frame when a session ends
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for the client side
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host used by [`Network::connect_default`]
    pub host: String,
    /// Port used by [`Network::connect_default`]
    pub port: u16,
    /// Name sent in the handshake
    pub player_name: String,
    /// Bound on resolving, connecting and the handshake
    pub connect_timeout: Duration,
    /// Zero disables heartbeats
    pub heartbeat_interval: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            player_name: "player".to_string(),
            connect_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(1000),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_player_name(mut self, player_name: impl Into<String>) -> Self {
        self.player_name = player_name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }
}

/// Settings for hosting a session
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name announced through discovery and in the handshake
    pub session_name: String,
    pub bind_address: IpAddr,
    /// Zero picks a free port
    pub port: u16,
    pub max_peers: usize,
    /// Bound on receiving a peer's Hello
    pub handshake_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_name: "tictacnet".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_peers: MAX_PEERS,
            handshake_timeout: Duration::from_millis(5000),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(session_name: impl Into<String>, port: u16) -> Self {
        Self {
            session_name: session_name.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.discovery.enabled = false;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Resolve a hostname and open a TCP stream to the first address that accepts
pub async fn connect_host(host: &str, port: u16) -> std::io::Result<(TcpStream, SocketAddr)> {
    let mut last_error = None;

    for addr in lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok((stream, addr));
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    }))
}

/// Microseconds since the Unix epoch, for heartbeat timestamps
pub(crate) fn timestamp_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
