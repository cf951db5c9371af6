//! Service discovery module
//!
//! Finds game servers on the local network with a UDP request/response
//! exchange. A client broadcasts a request packet; every server's responder
//! answers with a unicast [`ServerInfo`]. Each discovery round collects
//! answers for a fixed window and then completes on its own.
//!
//! Packet layout: magic `"TTTD"`, version byte, tag byte, and for responses a
//! bincode body.

use bincode::Options;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DiscoveryConfig;

/// Magic bytes identifying discovery packets
pub const DISCOVERY_MAGIC: [u8; 4] = *b"TTTD";

/// Discovery packet format version
pub const DISCOVERY_VERSION: u8 = 1;

const TAG_REQUEST: u8 = 0x01;
const TAG_RESPONSE: u8 = 0x02;
const DISCOVERY_HEADER_SIZE: usize = 6;
const DISCOVERY_BUFFER_SIZE: usize = 1024;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid discovery packet: {0}")]
    InvalidPacket(String),

    #[error("Discovery round was replaced by a newer one")]
    Superseded,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// A server found through discovery
///
/// Two entries describe the same server when host and port match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerInfo {
    pub session_name: String,
    pub session_host: String,
    pub session_port: u16,
    pub player_count: u32,
}

impl ServerInfo {
    pub fn new(
        session_name: impl Into<String>,
        session_host: impl Into<String>,
        session_port: u16,
        player_count: u32,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            session_host: session_host.into(),
            session_port,
            player_count,
        }
    }

    pub fn same_endpoint(&self, other: &ServerInfo) -> bool {
        self.session_host == other.session_host && self.session_port == other.session_port
    }

    /// Whether the announced host is missing or a wildcard address
    fn host_is_unspecified(&self) -> bool {
        match self.session_host.parse::<IpAddr>() {
            Ok(ip) => ip.is_unspecified(),
            Err(_) => self.session_host.is_empty(),
        }
    }
}

/// Packets exchanged on the discovery port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPacket {
    Request,
    Response(ServerInfo),
}

fn packet_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(DISCOVERY_BUFFER_SIZE as u64)
}

impl DiscoveryPacket {
    pub fn encode(&self) -> DiscoveryResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&DISCOVERY_MAGIC);
        bytes.push(DISCOVERY_VERSION);

        match self {
            DiscoveryPacket::Request => bytes.push(TAG_REQUEST),
            DiscoveryPacket::Response(info) => {
                bytes.push(TAG_RESPONSE);
                bytes.extend(packet_options().serialize(info)?);
            }
        }

        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> DiscoveryResult<Self> {
        if bytes.len() < DISCOVERY_HEADER_SIZE || bytes[0..4] != DISCOVERY_MAGIC {
            return Err(DiscoveryError::InvalidPacket("not a discovery packet".to_string()));
        }
        if bytes[4] != DISCOVERY_VERSION {
            return Err(DiscoveryError::InvalidPacket(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }

        match bytes[5] {
            TAG_REQUEST => Ok(DiscoveryPacket::Request),
            TAG_RESPONSE => {
                let info = packet_options().deserialize(&bytes[DISCOVERY_HEADER_SIZE..])?;
                Ok(DiscoveryPacket::Response(info))
            }
            tag => Err(DiscoveryError::InvalidPacket(format!("unknown tag {:#04x}", tag))),
        }
    }
}

/// Result of merging one response into a [`ServerSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    Updated,
}

/// Servers found in one round, unique by (host, port), in order of first reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSet {
    entries: Vec<ServerInfo>,
}

impl ServerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a server, replacing the details of a known endpoint
    pub fn merge(&mut self, info: ServerInfo) -> MergeOutcome {
        match self.entries.iter_mut().find(|known| known.same_endpoint(&info)) {
            Some(known) => {
                *known = info;
                MergeOutcome::Updated
            }
            None => {
                self.entries.push(info);
                MergeOutcome::Added
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ServerInfo> {
        self.entries.clone()
    }
}

type RoundResult = watch::Sender<Option<Vec<ServerInfo>>>;

/// The round a service is currently running
#[derive(Debug)]
struct RoundTask {
    round: u64,
    handle: JoinHandle<()>,
    done: Arc<RoundResult>,
}

/// State of the requester, shared with the running round
#[derive(Debug, Default)]
struct DiscoveryState {
    discovering: AtomicBool,
    round: AtomicU64,
    servers: Mutex<ServerSet>,
}

impl DiscoveryState {
    fn servers(&self) -> MutexGuard<'_, ServerSet> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset for a new round and return its id
    fn begin_round(&self) -> u64 {
        let mut servers = self.servers();
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        servers.clear();
        self.discovering.store(true, Ordering::SeqCst);
        round
    }

    fn merge(&self, round: u64, info: ServerInfo) -> Option<MergeOutcome> {
        let mut servers = self.servers();
        if self.round.load(Ordering::SeqCst) != round {
            return None;
        }
        Some(servers.merge(info))
    }

    fn finish_round(&self, round: u64) -> Vec<ServerInfo> {
        let servers = self.servers();
        if self.round.load(Ordering::SeqCst) == round {
            self.discovering.store(false, Ordering::SeqCst);
        }
        servers.to_vec()
    }
}

/// Client side of discovery
///
/// Only one round runs at a time; starting a new round cancels the previous
/// one and replaces its results.
#[derive(Debug)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    state: Arc<DiscoveryState>,
    task: Mutex<Option<RoundTask>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            state: Arc::new(DiscoveryState::default()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Start a discovery round
    ///
    /// The returned session completes once the configured window elapses.
    pub async fn start_discover(&self) -> DiscoveryResult<DiscoverySession> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        socket.set_broadcast(true)?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.handle.abort();
        }

        let round = self.state.begin_round();
        let (done_tx, done_rx) = watch::channel(None);
        let done_tx = Arc::new(done_tx);

        let target = self.config.target();
        let window = self.config.window();
        let retransmit = self.config.retransmit_interval().max(Duration::from_millis(1));

        tracing::info!(
            "Discovery round {} started: querying {} for {:?}",
            round,
            target,
            window
        );

        let handle = tokio::spawn(run_round(
            socket,
            target,
            window,
            retransmit,
            self.state.clone(),
            round,
            done_tx.clone(),
        ));
        *task = Some(RoundTask {
            round,
            handle,
            done: done_tx,
        });

        Ok(DiscoverySession {
            round,
            state: self.state.clone(),
            done: done_rx,
        })
    }

    /// Whether a round is in progress
    pub fn is_discovering(&self) -> bool {
        self.state.discovering.load(Ordering::SeqCst)
    }

    /// Servers found by the latest round so far
    pub fn potential_servers(&self) -> Vec<ServerInfo> {
        self.state.servers().to_vec()
    }

    /// Abort the running round, keeping what was found
    ///
    /// A pending [`DiscoverySession::wait`] completes with the servers found
    /// before the cancel.
    pub fn cancel(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = task.take() {
            running.handle.abort();
            let servers = running
                .done
                .borrow()
                .as_ref()
                .cloned()
                .unwrap_or_else(|| self.state.finish_round(running.round));
            tracing::info!(
                "Discovery round {} cancelled: {} server(s) found",
                running.round,
                servers.len()
            );
            running.done.send_replace(Some(servers));
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = task.take() {
            running.handle.abort();
        }
    }
}

/// Handle to one discovery round
#[derive(Debug)]
pub struct DiscoverySession {
    round: u64,
    state: Arc<DiscoveryState>,
    done: watch::Receiver<Option<Vec<ServerInfo>>>,
}

impl DiscoverySession {
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_complete(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Servers found so far, or the final result once complete
    pub fn snapshot(&self) -> Vec<ServerInfo> {
        if let Some(servers) = self.done.borrow().as_ref() {
            return servers.clone();
        }
        if self.state.round.load(Ordering::SeqCst) == self.round {
            self.state.servers().to_vec()
        } else {
            Vec::new()
        }
    }

    /// Wait for the round to finish and return what it found
    pub async fn wait(mut self) -> DiscoveryResult<Vec<ServerInfo>> {
        let result = match self.done.wait_for(Option::is_some).await {
            Ok(servers) => Ok(servers.clone().unwrap_or_default()),
            Err(_) => Err(DiscoveryError::Superseded),
        };
        result
    }
}

async fn run_round(
    socket: UdpSocket,
    target: SocketAddr,
    window: Duration,
    retransmit: Duration,
    state: Arc<DiscoveryState>,
    round: u64,
    done: Arc<RoundResult>,
) {
    let request = match DiscoveryPacket::Request.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode discovery request: {}", e);
            let _ = done.send(Some(state.finish_round(round)));
            return;
        }
    };

    let window_elapsed = tokio::time::sleep(window);
    tokio::pin!(window_elapsed);
    let mut retransmit_timer = tokio::time::interval(retransmit);
    let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = &mut window_elapsed => break,
            _ = retransmit_timer.tick() => {
                if let Err(e) = socket.send_to(&request, target).await {
                    tracing::warn!("Discovery request to {} failed: {}", target, e);
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => handle_response(&buf[..len], source, &state, round),
                    Err(e) => tracing::warn!("Discovery receive error: {}", e),
                }
            }
        }
    }

    let servers = state.finish_round(round);
    tracing::info!("Discovery round {} finished: {} server(s) found", round, servers.len());
    let _ = done.send(Some(servers));
}

fn handle_response(bytes: &[u8], source: SocketAddr, state: &DiscoveryState, round: u64) {
    let mut info = match DiscoveryPacket::decode(bytes) {
        Ok(DiscoveryPacket::Response(info)) => info,
        Ok(DiscoveryPacket::Request) => return,
        Err(e) => {
            tracing::debug!("Ignoring datagram from {}: {}", source, e);
            return;
        }
    };

    if info.host_is_unspecified() {
        info.session_host = source.ip().to_string();
    }

    match state.merge(round, info.clone()) {
        Some(MergeOutcome::Added) => tracing::info!(
            "Found server '{}' at {}:{} ({} players)",
            info.session_name,
            info.session_host,
            info.session_port,
            info.player_count
        ),
        Some(MergeOutcome::Updated) => tracing::debug!(
            "Duplicate response from {}:{}",
            info.session_host,
            info.session_port
        ),
        None => {}
    }
}

/// Server details a responder hands out, shared with the server so player
/// counts stay current
#[derive(Debug, Clone)]
pub struct Announcement {
    info: Arc<RwLock<ServerInfo>>,
}

impl Announcement {
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info: Arc::new(RwLock::new(info)),
        }
    }

    pub fn get(&self) -> ServerInfo {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_player_count(&self, player_count: u32) {
        self.info.write().unwrap_or_else(PoisonError::into_inner).player_count = player_count;
    }

    pub fn set_session_name(&self, session_name: impl Into<String>) {
        self.info.write().unwrap_or_else(PoisonError::into_inner).session_name = session_name.into();
    }

    /// Used once the game port is known, e.g. after binding port 0
    pub fn set_session_port(&self, session_port: u16) {
        self.info.write().unwrap_or_else(PoisonError::into_inner).session_port = session_port;
    }
}

/// Server side of discovery: answers every request with the announcement
#[derive(Debug)]
pub struct DiscoveryResponder {
    local_addr: SocketAddr,
    announcement: Announcement,
    handle: JoinHandle<()>,
}

impl DiscoveryResponder {
    /// Bind the discovery port and start answering requests
    ///
    /// The port is bound shared, so several sessions on one host can each
    /// run a responder; all of them receive a broadcast request.
    pub async fn spawn(bind_addr: SocketAddr, announcement: Announcement) -> DiscoveryResult<Self> {
        let socket = bind_shared(bind_addr)?;
        let local_addr = socket.local_addr()?;

        tracing::info!("Discovery responder listening on {}", local_addr);

        let shared = announcement.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        if let Err(e) = answer_request(&socket, &buf[..len], source, &shared).await {
                            tracing::debug!("Discovery request from {} not answered: {}", source, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Discovery responder receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            announcement,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn stop(self) {
        self.handle.abort();
        tracing::info!("Discovery responder on {} stopped", self.local_addr);
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn bind_shared(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn answer_request(
    socket: &UdpSocket,
    bytes: &[u8],
    source: SocketAddr,
    announcement: &Announcement,
) -> DiscoveryResult<()> {
    match DiscoveryPacket::decode(bytes)? {
        DiscoveryPacket::Request => {
            let reply = DiscoveryPacket::Response(announcement.get()).encode()?;
            socket.send_to(&reply, source).await?;
            tracing::debug!("Answered discovery request from {}", source);
            Ok(())
        }
        DiscoveryPacket::Response(_) => Ok(()),
    }
}
