//! tictacnet client
//!
//! [`Network`] is what a game front end talks to: it finds sessions on the
//! LAN, holds the one connection to the chosen server and hands every
//! received message to the registered listeners.

use std::sync::Arc;

use super::connection::{ConnectionHandle, ConnectionResult, ConnectionState, SessionInfo};
use super::manager::ConnectionManager;
use super::ClientConfig;
use crate::discovery::{DiscoveryResult, DiscoveryService, DiscoverySession, ServerInfo};
use crate::events::{EventManager, ListenerHandle, ListenerResult};
use crate::protocol::{ConnectionId, Message, MessageType, Payload};

/// Client facade combining discovery and the server connection
pub struct Network {
    config: ClientConfig,
    events: Arc<EventManager>,
    connection: ConnectionManager,
    discovery: DiscoveryService,
}

impl Network {
    pub fn new(config: ClientConfig) -> Self {
        let events = Arc::new(EventManager::new());
        let connection = ConnectionManager::new(events.clone(), &config);
        let discovery = DiscoveryService::new(config.discovery.clone());

        Self {
            config,
            events,
            connection,
            discovery,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Listener registry for messages from the server
    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// Shorthand for `event_manager().add_listener(..)`
    pub fn add_listener<F>(&self, message_type: MessageType, callback: F) -> ListenerHandle
    where
        F: Fn(&Message) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.add_listener(message_type, callback)
    }

    pub async fn connect(&self, host: &str, port: u16) -> ConnectionResult<SessionInfo> {
        self.connection.connect(host, port).await
    }

    /// Connect to the host and port from the configuration
    pub async fn connect_default(&self) -> ConnectionResult<SessionInfo> {
        self.connection
            .connect(&self.config.host, self.config.port)
            .await
    }

    /// Connect to a server found through discovery
    pub async fn connect_to(&self, server: &ServerInfo) -> ConnectionResult<SessionInfo> {
        self.connection
            .connect(&server.session_host, server.session_port)
            .await
    }

    pub async fn send_data(&self, payload: Payload) -> ConnectionResult<()> {
        self.connection.send_data(payload).await
    }

    /// Handle listeners can clone to reply without going through `Network`
    pub async fn sender(&self) -> Option<ConnectionHandle> {
        self.connection.sender().await
    }

    pub async fn disconnect(&self) -> ConnectionResult<()> {
        self.connection.disconnect().await
    }

    /// Start a discovery round, replacing any previous results
    pub async fn start_discover(&self) -> DiscoveryResult<DiscoverySession> {
        self.discovery.start_discover().await
    }

    pub fn potential_servers(&self) -> Vec<ServerInfo> {
        self.discovery.potential_servers()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_discovering()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.connection_id().await
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        self.connection.session().await
    }
}
