//! tictacnet server
//!
//! The server hosts one session: it accepts up to `max_peers` players,
//! answers discovery requests, dispatches what players send to its own
//! listeners and relays game messages between them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionResult};
use super::{timestamp_micros, ServerConfig, CLOSE_TIMEOUT, SEND_QUEUE_SIZE};
use crate::discovery::{Announcement, DiscoveryError, DiscoveryResponder, ServerInfo};
use crate::events::{EventManager, ListenerHandle, ListenerResult};
use crate::protocol::{ConnectionId, Message, MessageType, Payload, PROTOCOL_VERSION};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Port {0} is already in use")]
    AddrInUse(u16),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No peer with id {0}")]
    UnknownPeer(ConnectionId),
}

pub type ServerResult<T> = Result<T, ServerError>;

const SESSION_FULL: &str = "session full: exceeded connections";
const NO_PEER: &str = "no peer available";
const SHUTDOWN_REASON: &str = "Server shutting down";

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Information about a connected player
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    /// Name sent in the player's Hello
    pub player_name: String,
    /// Handle for sending messages to this player
    pub handle: ConnectionHandle,
}

/// State shared by the accept loop and every peer task
struct PeerContext {
    session_name: String,
    max_peers: usize,
    handshake_timeout: Duration,
    events: Arc<EventManager>,
    peers: RwLock<HashMap<ConnectionId, PeerInfo>>,
    next_id: AtomicU64,
    announcement: Announcement,
}

impl PeerContext {
    /// Queue a message for every peer except `from`. Returns how many took it.
    async fn relay(&self, from: ConnectionId, payload: &Payload) -> usize {
        let targets: Vec<ConnectionHandle> = self
            .peers
            .read()
            .await
            .values()
            .filter(|peer| peer.id != from)
            .map(|peer| peer.handle.clone())
            .collect();

        let mut delivered = 0;
        for target in targets {
            // A full queue drops the message rather than stalling this peer
            match target.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    "Could not relay {} from {} to {}: {}",
                    payload.message_type(),
                    from,
                    target.id(),
                    e
                ),
            }
        }
        delivered
    }

    async fn remove_peer(&self, id: ConnectionId) -> usize {
        let mut peers = self.peers.write().await;
        peers.remove(&id);
        let remaining = peers.len();
        self.announcement.set_player_count(remaining as u32);
        remaining
    }
}

/// tictacnet server
pub struct Server {
    /// Server configuration
    config: ServerConfig,
    /// Shared with peer tasks
    context: Arc<PeerContext>,
    /// Discovery responder, while running
    responder: Option<DiscoveryResponder>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Accept loop; it owns the peer tasks, so aborting it ends them too
    accept_task: Option<JoinHandle<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig) -> Self {
        let announcement = Announcement::new(ServerInfo::new(
            config.session_name.clone(),
            config.discovery.advertise_host.clone().unwrap_or_default(),
            config.port,
            0,
        ));

        let context = Arc::new(PeerContext {
            session_name: config.session_name.clone(),
            max_peers: config.max_peers,
            handshake_timeout: config.handshake_timeout,
            events: Arc::new(EventManager::new()),
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            announcement,
        });

        Self {
            config,
            context,
            responder: None,
            shutdown_tx: None,
            accept_task: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Listener registry for messages from players
    ///
    /// Besides the game messages, a `Hello` event fires when a player joins
    /// and a `Disconnect` event when one leaves.
    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.context.events
    }

    pub fn add_listener<F>(&self, message_type: MessageType, callback: F) -> ListenerHandle
    where
        F: Fn(&Message) -> ListenerResult + Send + Sync + 'static,
    {
        self.context.events.add_listener(message_type, callback)
    }

    /// Bind the game port, start answering discovery and accept players
    ///
    /// Returns the address actually bound.
    pub async fn start_server(&mut self) -> ServerResult<SocketAddr> {
        if *self.running.read().await {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ServerError::AddrInUse(bind_addr.port())
            } else {
                ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
            }
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Session '{}' listening on {}",
            self.context.session_name,
            local_addr
        );

        self.context.announcement.set_session_port(local_addr.port());
        if self.config.discovery.enabled {
            let responder = DiscoveryResponder::spawn(
                self.config.discovery.bind_addr(),
                self.context.announcement.clone(),
            )
            .await?;
            self.responder = Some(responder);
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        *self.running.write().await = true;

        // Spawn the accept loop
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            shutdown_rx,
            self.running.clone(),
        )));

        Ok(local_addr)
    }

    /// Stop the server
    ///
    /// Every player is sent a `Disconnect` and given `CLOSE_TIMEOUT` to
    /// finish; accepting and discovery stop.
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !*self.running.read().await {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }
        if let Some(responder) = self.responder.take() {
            responder.stop();
        }

        *self.running.write().await = false;
        self.local_addr = None;
        tracing::info!("Session '{}' stopped", self.context.session_name);
        Ok(())
    }

    /// Address the game port is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address the discovery responder is bound to, while running
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(|r| r.local_addr())
    }

    /// What discovery currently announces
    pub fn announcement(&self) -> ServerInfo {
        self.context.announcement.get()
    }

    /// Get a list of connected players
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.context.peers.read().await;
        let mut list: Vec<PeerInfo> = peers.values().cloned().collect();
        list.sort_by_key(|peer| peer.id);
        list
    }

    pub async fn peer_count(&self) -> usize {
        self.context.peers.read().await.len()
    }

    /// Send a message to a specific player
    pub async fn send_to(&self, id: ConnectionId, payload: Payload) -> ServerResult<()> {
        let handle = self
            .context
            .peers
            .read()
            .await
            .get(&id)
            .map(|peer| peer.handle.clone())
            .ok_or(ServerError::UnknownPeer(id))?;

        handle.send(payload).await?;
        Ok(())
    }

    /// Send a message to all connected players. Returns how many took it.
    pub async fn broadcast(&self, payload: Payload) -> usize {
        let mut delivered = 0;
        for peer in self.peers().await {
            if peer.handle.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<PeerContext>,
    mut shutdown_rx: mpsc::Receiver<()>,
    running: Arc<RwLock<bool>>,
) {
    let mut peer_tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("New connection from {}", addr);

                        let context = context.clone();
                        peer_tasks.spawn(async move {
                            if let Err(e) = handle_peer(stream, addr, context).await {
                                tracing::warn!("Peer {} handler error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => accept_backoff(&e).await,
                }
            }
            Some(result) = peer_tasks.join_next(), if !peer_tasks.is_empty() => {
                if let Err(e) = result {
                    tracing::error!("Peer task failed: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Server shutdown requested");
                break;
            }
        }
    }
    drop(listener);

    let peers: Vec<ConnectionHandle> = context
        .peers
        .read()
        .await
        .values()
        .map(|peer| peer.handle.clone())
        .collect();
    for handle in peers {
        let _ = handle
            .send(Payload::Disconnect {
                reason: SHUTDOWN_REASON.to_string(),
            })
            .await;
    }

    let drained = tokio::time::timeout(CLOSE_TIMEOUT * 2, async {
        while peer_tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("{} peer task(s) did not finish, aborting", peer_tasks.len());
        peer_tasks.abort_all();
    }

    *running.write().await = false;
}

async fn accept_backoff(e: &std::io::Error) {
    tracing::error!("Accept error: {}", e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Handle one player from handshake to goodbye
async fn handle_peer(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<PeerContext>,
) -> ConnectionResult<()> {
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream, addr);

    let player_name =
        match tokio::time::timeout(context.handshake_timeout, conn.await_hello()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

    // Reserve a slot and register the peer in one step
    let (msg_tx, mut msg_rx) = mpsc::channel::<Payload>(SEND_QUEUE_SIZE);
    let admitted = {
        let mut peers = context.peers.write().await;
        if peers.len() >= context.max_peers {
            None
        } else {
            let id = ConnectionId::new(context.next_id.fetch_add(1, Ordering::SeqCst));
            let handle = ConnectionHandle::new(id, msg_tx);
            peers.insert(
                id,
                PeerInfo {
                    id,
                    addr,
                    player_name: player_name.clone(),
                    handle: handle.clone(),
                },
            );
            context.announcement.set_player_count(peers.len() as u32);
            Some(handle)
        }
    };

    let Some(handle) = admitted else {
        tracing::warn!("Session full, turning away {} ({})", player_name, addr);
        conn.reject(SESSION_FULL).await?;
        return Ok(());
    };
    let id = handle.id();

    if let Err(e) = conn.accept(id, &context.session_name).await {
        handle.mark_disconnected();
        context.remove_peer(id).await;
        return Err(e);
    }

    context
        .relay(id, &Payload::Info(format!("{} joined", player_name)))
        .await;
    context.events.trigger(&Message::new(
        id,
        Payload::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_name: player_name.clone(),
        },
    ));

    // Main message loop
    let (reason, remote_closed) = loop {
        tokio::select! {
            // Receive messages from the player
            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => match frame.payload {
                        Payload::Disconnect { reason } => break (reason, true),
                        Payload::Heartbeat { timestamp } => {
                            if let Err(e) = conn.send(&Payload::HeartbeatAck { timestamp }).await {
                                break (format!("Send error: {}", e), true);
                            }
                        }
                        Payload::HeartbeatAck { timestamp } => {
                            handle.update_rtt(timestamp_micros().saturating_sub(timestamp));
                        }
                        Payload::Hello { .. } | Payload::Welcome { .. } => {
                            tracing::debug!("Ignoring handshake message from {}", id);
                        }
                        payload if payload.is_relayable() => {
                            let message = Message::new(id, payload);
                            context.events.trigger(&message);

                            if context.relay(id, &message.payload).await == 0 {
                                tracing::debug!("{} from {} had nobody to go to", message.message_type(), id);
                                if let Err(e) = conn.send(&Payload::Warning(NO_PEER.to_string())).await {
                                    break (format!("Send error: {}", e), true);
                                }
                            }
                        }
                        payload => {
                            context.events.trigger(&Message::new(id, payload));
                        }
                    },
                    Ok(None) => break ("Connection closed".to_string(), true),
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!("Dropped bad frame from {}: {}", id, e);
                    }
                    Err(e) => break (format!("Error: {}", e), true),
                }
            }

            // Send messages to the player
            Some(payload) = msg_rx.recv() => match payload {
                Payload::Disconnect { reason } => break (reason, false),
                payload => match conn.send(&payload).await {
                    Ok(()) => {}
                    Err(ConnectionError::Encode(e)) => {
                        tracing::warn!("Dropped {} for {}: {}", payload.message_type(), id, e);
                    }
                    Err(e) => break (format!("Send error: {}", e), true),
                },
            },
        }
    };

    // Clean up
    handle.mark_disconnected();
    context.remove_peer(id).await;

    if !remote_closed {
        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close(&reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Close for {} failed: {}", id, e),
            Err(_) => tracing::debug!("Close for {} timed out", id),
        }
    }

    context
        .relay(id, &Payload::Info(format!("{} left", player_name)))
        .await;

    tracing::info!("{} ({}) left: {}", player_name, id, reason);
    context
        .events
        .trigger(&Message::new(id, Payload::Disconnect { reason }));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::network::{ClientConfig, ConnectionState, Network};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(3);

    fn server_config() -> ServerConfig {
        ServerConfig::new("MyServer", 0)
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .without_discovery()
    }

    fn client(name: &str) -> Network {
        Network::new(
            ClientConfig::default()
                .with_player_name(name)
                .with_connect_timeout(Duration::from_secs(2))
                .with_heartbeat_interval(Duration::ZERO),
        )
    }

    async fn started(config: ServerConfig) -> (Server, u16) {
        let mut server = Server::new(config);
        let addr = server.start_server().await.unwrap();
        (server, addr.port())
    }

    fn collect(
        events: &EventManager,
        message_type: MessageType,
    ) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        events.add_listener(message_type, move |message| {
            let _ = tx.send(message.clone());
            Ok(())
        });
        rx
    }

    async fn next(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn unused_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(server_config());
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
        assert_eq!(server.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_chat_reaches_server_listener_once() {
        let (server, port) = started(server_config()).await;
        let mut chats = collect(server.event_manager(), MessageType::Chat);

        let alice = client("alice");
        let session = alice.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(session.session_name, "MyServer");
        assert_eq!(alice.state().await, ConnectionState::Connected);

        alice.send_data(Payload::Chat("hi".to_string())).await.unwrap();

        let message = next(&mut chats).await;
        assert_eq!(message.payload, Payload::Chat("hi".to_string()));
        assert_eq!(Some(message.sender), alice.connection_id().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(chats.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_fires_hello_event() {
        let (server, port) = started(server_config()).await;
        let mut joins = collect(server.event_manager(), MessageType::Hello);

        let alice = client("alice");
        alice.connect("127.0.0.1", port).await.unwrap();

        let message = next(&mut joins).await;
        assert!(matches!(message.payload, Payload::Hello { ref player_name, .. } if player_name == "alice"));
        assert_eq!(server.peers().await[0].player_name, "alice");
    }

    #[tokio::test]
    async fn test_third_peer_is_rejected() {
        let (server, port) = started(server_config()).await;

        let alice = client("alice");
        let bob = client("bob");
        let carol = client("carol");
        alice.connect("127.0.0.1", port).await.unwrap();
        bob.connect("127.0.0.1", port).await.unwrap();

        let result = carol.connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(ConnectionError::Rejected(reason)) if reason == SESSION_FULL));
        assert_eq!(carol.state().await, ConnectionState::Disconnected);
        assert_eq!(server.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_relay_between_peers() {
        let (_server, port) = started(server_config()).await;

        let alice = client("alice");
        let bob = client("bob");
        let mut bob_chats = collect(bob.event_manager(), MessageType::Chat);
        let mut alice_info = collect(alice.event_manager(), MessageType::Info);

        alice.connect("127.0.0.1", port).await.unwrap();
        bob.connect("127.0.0.1", port).await.unwrap();

        let notice = next(&mut alice_info).await;
        assert_eq!(notice.payload, Payload::Info("bob joined".to_string()));

        alice
            .send_data(Payload::Chat("your turn".to_string()))
            .await
            .unwrap();

        let message = next(&mut bob_chats).await;
        assert_eq!(message.payload, Payload::Chat("your turn".to_string()));
    }

    #[tokio::test]
    async fn test_lone_peer_gets_warning() {
        let (_server, port) = started(server_config()).await;

        let alice = client("alice");
        let mut warnings = collect(alice.event_manager(), MessageType::Warning);
        alice.connect("127.0.0.1", port).await.unwrap();

        alice
            .send_data(Payload::Turn(crate::protocol::Mark::X))
            .await
            .unwrap();

        let message = next(&mut warnings).await;
        assert_eq!(message.payload, Payload::Warning(NO_PEER.to_string()));
    }

    #[tokio::test]
    async fn test_leaving_peer_is_reported() {
        let (server, port) = started(server_config()).await;
        let mut leaves = collect(server.event_manager(), MessageType::Disconnect);

        let alice = client("alice");
        let bob = client("bob");
        let mut alice_info = collect(alice.event_manager(), MessageType::Info);
        alice.connect("127.0.0.1", port).await.unwrap();
        bob.connect("127.0.0.1", port).await.unwrap();
        let bob_id = bob.connection_id().await.unwrap();

        assert_eq!(next(&mut alice_info).await.payload, Payload::Info("bob joined".to_string()));

        bob.disconnect().await.unwrap();

        let message = next(&mut leaves).await;
        assert_eq!(message.sender, bob_id);
        assert_eq!(next(&mut alice_info).await.payload, Payload::Info("bob left".to_string()));
        assert_eq!(server.peer_count().await, 1);
        assert_eq!(server.announcement().player_count, 1);
    }

    #[tokio::test]
    async fn test_stop_disconnects_peers() {
        let (mut server, port) = started(server_config()).await;

        let alice = client("alice");
        let mut goodbyes = collect(alice.event_manager(), MessageType::Disconnect);
        alice.connect("127.0.0.1", port).await.unwrap();

        server.stop().await.unwrap();
        assert!(!server.is_running().await);

        let message = next(&mut goodbyes).await;
        assert_eq!(message.payload, Payload::Disconnect { reason: SHUTDOWN_REASON.to_string() });
        assert_eq!(alice.state().await, ConnectionState::Disconnected);

        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = Server::new(ServerConfig {
            port,
            ..server_config()
        });
        let result = server.start_server().await;
        assert!(matches!(result, Err(ServerError::AddrInUse(p)) if p == port));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_send_to_and_broadcast() {
        let (server, port) = started(server_config()).await;

        let alice = client("alice");
        let mut alice_turns = collect(alice.event_manager(), MessageType::Turn);
        alice.connect("127.0.0.1", port).await.unwrap();
        let alice_id = alice.connection_id().await.unwrap();

        server
            .send_to(alice_id, Payload::Turn(crate::protocol::Mark::O))
            .await
            .unwrap();
        assert_eq!(next(&mut alice_turns).await.payload, Payload::Turn(crate::protocol::Mark::O));

        assert_eq!(server.broadcast(Payload::Turn(crate::protocol::Mark::X)).await, 1);
        assert_eq!(next(&mut alice_turns).await.payload, Payload::Turn(crate::protocol::Mark::X));

        let missing = server.send_to(ConnectionId::new(99), Payload::Info("?".to_string())).await;
        assert!(matches!(missing, Err(ServerError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_discovery_announces_session() {
        let discovery_port = unused_udp_port();

        let discovery = DiscoveryConfig {
            port: discovery_port,
            broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            window_ms: 300,
            retransmit_interval_ms: 50,
            ..Default::default()
        };

        let (server, port) = started(server_config().with_discovery(discovery.clone())).await;
        assert!(server.discovery_addr().is_some());

        let alice = Network::new(
            ClientConfig::default()
                .with_heartbeat_interval(Duration::ZERO)
                .with_discovery(discovery),
        );
        alice.connect("127.0.0.1", port).await.unwrap();

        let found = alice.start_discover().await.unwrap().wait().await.unwrap();
        assert_eq!(
            found,
            vec![ServerInfo::new("MyServer", "127.0.0.1", port, 1)]
        );
        assert!(!alice.is_discovering());
    }

    #[tokio::test]
    async fn test_dropped_server_disconnects_peers() {
        let (server, port) = started(server_config()).await;

        let alice = client("alice");
        let mut goodbyes = collect(alice.event_manager(), MessageType::Disconnect);
        alice.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(server.peer_count().await, 1);

        drop(server);

        let message = next(&mut goodbyes).await;
        assert!(matches!(message.payload, Payload::Disconnect { .. }));
        assert_eq!(alice.state().await, ConnectionState::Disconnected);
        assert!(alice.send_data(Payload::Chat("anyone?".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = tokio::time::Instant::now();
        accept_backoff(&std::io::Error::from(std::io::ErrorKind::Other)).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_two_sessions_share_discovery_port() {
        let discovery = DiscoveryConfig {
            port: unused_udp_port(),
            // Loopback broadcast reaches every responder bound to the port
            broadcast_address: IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255)),
            window_ms: 300,
            retransmit_interval_ms: 50,
            ..Default::default()
        };

        let (first, first_port) =
            started(ServerConfig::new("Alpha", 0).with_discovery(discovery.clone())).await;
        let (second, second_port) =
            started(ServerConfig::new("Beta", 0).with_discovery(discovery.clone())).await;
        assert!(first.discovery_addr().is_some());
        assert!(second.discovery_addr().is_some());

        let alice = Network::new(ClientConfig::default().with_discovery(discovery));
        let mut found = alice.start_discover().await.unwrap().wait().await.unwrap();
        found.sort_by_key(|info| info.session_port);

        let mut expected = vec![("Alpha", first_port), ("Beta", second_port)];
        expected.sort_by_key(|(_, port)| *port);
        let found: Vec<(&str, u16)> = found
            .iter()
            .map(|info| (info.session_name.as_str(), info.session_port))
            .collect();
        assert_eq!(found, expected);
    }
}
