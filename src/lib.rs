//! tictacnet - LAN transport for two-player turn-based games
//!
//! - [`protocol`]: message types and the framed wire codec
//! - [`events`]: typed listener registry messages are dispatched to
//! - [`discovery`]: UDP broadcast discovery of sessions on the LAN
//! - [`network`]: the client facade ([`Network`]) and the session host ([`Server`])
//! - [`config`]: TOML configuration for the binary
//!
//! A client finds a session, connects and registers listeners:
//!
//! ```no_run
//! use tictacnet::{ClientConfig, MessageType, Network, Payload};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let network = Network::new(ClientConfig::default().with_player_name("alice"));
//! network.add_listener(MessageType::Chat, |message| {
//!     println!("{}: {:?}", message.sender, message.payload);
//!     Ok(())
//! });
//!
//! let servers = network.start_discover().await?.wait().await?;
//! if let Some(server) = servers.first() {
//!     network.connect_to(server).await?;
//!     network.send_data(Payload::Chat("hi".to_string())).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod events;
pub mod network;
pub mod protocol;

pub use discovery::{DiscoveryService, DiscoverySession, ServerInfo};
pub use events::{EventManager, ListenerHandle};
pub use network::{ClientConfig, ConnectionState, Network, Server, ServerConfig};
pub use protocol::{ConnectionId, Message, MessageType, Payload};
