//! Client-side connection lifecycle
//!
//! [`ConnectionManager`] owns at most one connection to a server. Once the
//! handshake completes a session task owns the stream: it dispatches inbound
//! messages to the [`EventManager`], writes queued outbound messages in order
//! and keeps the heartbeat going. When the session ends for any reason the
//! task moves the state back to `Disconnected` and fires a single
//! `Disconnect` event.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

use super::connection::{
    Connection, ConnectionError, ConnectionHandle, ConnectionResult, ConnectionState, SessionInfo,
};
use super::{connect_host, timestamp_micros, ClientConfig, CLOSE_TIMEOUT, SEND_QUEUE_SIZE};
use crate::events::EventManager;
use crate::protocol::{ConnectionId, Message, Payload};

// Never held across an await
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct SessionTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Shared with the session task
#[derive(Clone)]
struct SessionContext {
    events: Arc<EventManager>,
    state: Arc<RwLock<ConnectionState>>,
    link: Arc<RwLock<Option<ConnectionHandle>>>,
    session: Arc<RwLock<Option<SessionInfo>>>,
}

/// A connect attempt in progress
///
/// Dropping it before [`PendingConnect::complete`] puts the manager back in
/// `Disconnected`, whether the attempt failed or its future was cancelled.
struct PendingConnect<'a> {
    state: &'a RwLock<ConnectionState>,
    completed: bool,
}

impl PendingConnect<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = write(self.state);
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }
}

/// Owns the single client connection and its state machine
pub struct ConnectionManager {
    events: Arc<EventManager>,
    state: Arc<RwLock<ConnectionState>>,
    link: Arc<RwLock<Option<ConnectionHandle>>>,
    session: Arc<RwLock<Option<SessionInfo>>>,
    task: Mutex<Option<SessionTask>>,
    player_name: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
}

impl ConnectionManager {
    pub fn new(events: Arc<EventManager>, config: &ClientConfig) -> Self {
        Self {
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            link: Arc::new(RwLock::new(None)),
            session: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
            player_name: config.player_name.clone(),
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    /// Connect to a server and complete the handshake
    ///
    /// Opening the stream and the handshake are each bounded by
    /// `connect_timeout`. Any failure leaves the manager `Disconnected`, and
    /// so does dropping the returned future before it finishes.
    pub async fn connect(&self, host: &str, port: u16) -> ConnectionResult<SessionInfo> {
        let attempt = self.begin_connect()?;

        tracing::info!("Connecting to {}:{}", host, port);

        let (stream, addr) =
            match tokio::time::timeout(self.connect_timeout, connect_host(host, port)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(ConnectionError::Io(e)),
                Err(_) => return Err(ConnectionError::Timeout),
            };

        self.establish(attempt, stream, addr).await
    }

    /// Run the same lifecycle over an already open stream
    pub async fn attach<S>(&self, stream: S, remote_addr: SocketAddr) -> ConnectionResult<SessionInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let attempt = self.begin_connect()?;
        self.establish(attempt, stream, remote_addr).await
    }

    fn begin_connect(&self) -> ConnectionResult<PendingConnect<'_>> {
        {
            let mut state = write(&self.state);
            if *state != ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        // A session that ended on its own leaves its finished task behind
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take();

        Ok(PendingConnect {
            state: &self.state,
            completed: false,
        })
    }

    /// Handshake, then hand the stream to a session task
    ///
    /// The handshake is the only await point, so a cancelled attempt never
    /// leaves a half-installed session behind.
    async fn establish<S>(
        &self,
        attempt: PendingConnect<'_>,
        stream: S,
        remote_addr: SocketAddr,
    ) -> ConnectionResult<SessionInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Connection::new(stream, remote_addr);

        let info = match tokio::time::timeout(
            self.connect_timeout,
            conn.handshake_client(&self.player_name),
        )
        .await
        {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::warn!("Handshake with {} failed: {}", remote_addr, e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("Handshake with {} timed out", remote_addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let (msg_tx, msg_rx) = mpsc::channel::<Payload>(SEND_QUEUE_SIZE);
        let handle = ConnectionHandle::new(info.connection_id, msg_tx);

        *write(&self.link) = Some(handle.clone());
        *write(&self.session) = Some(info.clone());
        *write(&self.state) = ConnectionState::Connected;
        attempt.complete();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let context = SessionContext {
            events: self.events.clone(),
            state: self.state.clone(),
            link: self.link.clone(),
            session: self.session.clone(),
        };
        let task = tokio::spawn(run_session(
            conn,
            handle,
            context,
            msg_rx,
            shutdown_rx,
            self.heartbeat_interval,
        ));

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(SessionTask {
            shutdown_tx,
            handle: task,
        });

        Ok(info)
    }

    /// Queue a message for the server
    ///
    /// Fails with `NotConnected` outside the `Connected` state; nothing is
    /// written in that case.
    pub async fn send_data(&self, payload: Payload) -> ConnectionResult<()> {
        if *read(&self.state) != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }

        let link = read(&self.link).clone();
        match link {
            Some(handle) => handle.send(payload).await,
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// End the session and wait until it is fully torn down
    pub async fn disconnect(&self) -> ConnectionResult<()> {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();

        let Some(task) = task else {
            return Ok(());
        };

        // The task may already be gone if the server hung up first
        let _ = task.shutdown_tx.send(()).await;

        if let Err(e) = task.handle.await {
            tracing::error!("Session task failed: {}", e);
        }

        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        *read(&self.state)
    }

    pub async fn is_connected(&self) -> bool {
        *read(&self.state) == ConnectionState::Connected
    }

    /// Id assigned by the server, while connected
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        read(&self.session).as_ref().map(|s| s.connection_id)
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        read(&self.session).clone()
    }

    /// Cloneable sender for the current connection
    pub async fn sender(&self) -> Option<ConnectionHandle> {
        read(&self.link).clone()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }
}

async fn next_heartbeat(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_session<S>(
    mut conn: Connection<S>,
    handle: ConnectionHandle,
    context: SessionContext,
    mut msg_rx: mpsc::Receiver<Payload>,
    mut shutdown_rx: mpsc::Receiver<()>,
    heartbeat_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = handle.id();
    let mut heartbeat = (!heartbeat_interval.is_zero())
        .then(|| tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval));

    let (reason, remote_closed) = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => match frame.payload {
                        Payload::Disconnect { reason } => {
                            tracing::info!("Server closed the session: {}", reason);
                            break (reason, true);
                        }
                        Payload::Heartbeat { timestamp } => {
                            if let Err(e) = conn.send(&Payload::HeartbeatAck { timestamp }).await {
                                break (format!("Send error: {}", e), true);
                            }
                        }
                        Payload::HeartbeatAck { timestamp } => {
                            handle.update_rtt(timestamp_micros().saturating_sub(timestamp));
                        }
                        Payload::Hello { .. } | Payload::Welcome { .. } => {
                            tracing::debug!("Ignoring handshake message after handshake");
                        }
                        payload => {
                            match &payload {
                                Payload::Info(text) => tracing::info!("Server: {}", text),
                                Payload::Warning(text) => tracing::warn!("Server: {}", text),
                                _ => tracing::debug!("Received {} (seq {})", payload.message_type(), frame.sequence),
                            }
                            context.events.trigger(&Message::new(id, payload));
                        }
                    },
                    Ok(None) => break ("Connection closed".to_string(), true),
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!("Dropped bad frame: {}", e);
                    }
                    Err(e) => {
                        tracing::warn!("Read error: {}", e);
                        break (format!("Error: {}", e), true);
                    }
                }
            }

            Some(payload) = msg_rx.recv() => match conn.send(&payload).await {
                Ok(()) => {}
                // Nothing was written, the stream is still in sync
                Err(ConnectionError::Encode(e)) => {
                    tracing::warn!("Dropped {} that could not be encoded: {}", payload.message_type(), e);
                }
                Err(e) => {
                    tracing::warn!("Send error: {}", e);
                    break (format!("Send error: {}", e), true);
                }
            },

            _ = next_heartbeat(&mut heartbeat) => {
                if let Err(e) = conn.send(&Payload::Heartbeat { timestamp: timestamp_micros() }).await {
                    break (format!("Heartbeat error: {}", e), true);
                }
            }

            _ = shutdown_rx.recv() => {
                break ("Client disconnecting".to_string(), false);
            }
        }
    };

    *write(&context.state) = ConnectionState::Closing;
    handle.mark_disconnected();
    *write(&context.link) = None;

    if !remote_closed {
        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close(&reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Close failed: {}", e),
            Err(_) => tracing::debug!("Close timed out"),
        }
    }

    *write(&context.session) = None;
    *write(&context.state) = ConnectionState::Disconnected;

    tracing::info!("Disconnected from {}: {}", conn.remote_addr(), reason);
    context
        .events
        .trigger(&Message::new(id, Payload::Disconnect { reason }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn manager(heartbeat: Duration) -> ConnectionManager {
        let config = ClientConfig::default()
            .with_player_name("alice")
            .with_connect_timeout(Duration::from_millis(500))
            .with_heartbeat_interval(heartbeat);
        ConnectionManager::new(Arc::new(EventManager::new()), &config)
    }

    /// Server side of a duplex pair, handshake already done
    async fn attached(manager: &ConnectionManager, id: u64) -> Connection<DuplexStream> {
        let (client_io, server_io) = duplex(8192);
        let server = tokio::spawn(async move {
            let mut server = Connection::new(server_io, addr());
            server.await_hello().await.unwrap();
            server.accept(ConnectionId::new(id), "MyServer").await.unwrap();
            server
        });

        let info = manager.attach(client_io, addr()).await.unwrap();
        assert_eq!(info.connection_id, ConnectionId::new(id));
        server.await.unwrap()
    }

    fn disconnect_counter(manager: &ConnectionManager) -> (Arc<AtomicUsize>, mpsc::UnboundedReceiver<String>) {
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = count.clone();
        manager.events().add_listener(MessageType::Disconnect, move |message| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Payload::Disconnect { reason } = &message.payload {
                let _ = tx.send(reason.clone());
            }
            Ok(())
        });
        (count, rx)
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let manager = manager(Duration::ZERO);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        let result = manager.send_data(Payload::Chat("hi".to_string())).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert!(manager.sender().await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_listeners() {
        let manager = manager(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.events().add_listener(MessageType::Chat, move |message| {
            let _ = tx.send(message.clone());
            Ok(())
        });

        let mut server = attached(&manager, 4).await;
        assert!(manager.is_connected().await);
        assert_eq!(manager.connection_id().await, Some(ConnectionId::new(4)));

        server.send(&Payload::Chat("hello".to_string())).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, Payload::Chat("hello".to_string()));
        assert_eq!(message.sender, ConnectionId::new(4));
    }

    #[tokio::test]
    async fn test_outbound_messages_keep_order() {
        let manager = manager(Duration::ZERO);
        let mut server = attached(&manager, 1).await;

        for cell in 0..3u8 {
            manager
                .send_data(Payload::Move(crate::protocol::Move {
                    cell,
                    mark: crate::protocol::Mark::X,
                }))
                .await
                .unwrap();
        }

        for expected in 0..3u8 {
            let frame = server.recv().await.unwrap().unwrap();
            match frame.payload {
                Payload::Move(m) => assert_eq!(m.cell, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped() {
        let manager = manager(Duration::ZERO);
        let mut server = attached(&manager, 1).await;

        let huge = "x".repeat(crate::protocol::MAX_MESSAGE_SIZE + 1);
        manager.send_data(Payload::Chat(huge)).await.unwrap();
        manager.send_data(Payload::Chat("after".to_string())).await.unwrap();

        let frame = server.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(frame.payload, Payload::Chat("after".to_string()));
        // Hello took sequence 0 and the dropped message took none
        assert_eq!(frame.sequence, 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_second_connect_is_refused() {
        let manager = manager(Duration::ZERO);
        let _server = attached(&manager, 1).await;

        let (other, _keep) = duplex(64);
        let result = manager.attach(other, addr()).await;
        assert!(matches!(result, Err(ConnectionError::AlreadyConnected)));
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_peer_drop_disconnects_once() {
        let manager = manager(Duration::ZERO);
        let (count, mut reasons) = disconnect_counter(&manager);

        let server = attached(&manager, 2).await;
        drop(server);

        let reason = tokio::time::timeout(Duration::from_secs(2), reasons.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "Connection closed");
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        manager.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.connection_id().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_disconnects_once() {
        let manager = manager(Duration::ZERO);
        let (count, mut reasons) = disconnect_counter(&manager);

        let (client_io, mut server_io) = duplex(8192);
        let server = tokio::spawn(async move {
            {
                let mut server = Connection::new(&mut server_io, addr());
                server.await_hello().await.unwrap();
                server.accept(ConnectionId::new(6), "MyServer").await.unwrap();
            }
            server_io
        });
        manager.attach(client_io, addr()).await.unwrap();
        let mut server_io = server.await.unwrap();

        // Half a frame, then hang up
        let frame = crate::protocol::encode(&Payload::Chat("cut".to_string())).unwrap();
        server_io.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(server_io);

        let reason = tokio::time::timeout(Duration::from_secs(2), reasons.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "Error: Connection closed");
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        manager.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.sender().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_sends_goodbye_and_is_idempotent() {
        let manager = manager(Duration::ZERO);
        let (count, _reasons) = disconnect_counter(&manager);
        let mut server = attached(&manager, 3).await;

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        let frame = server.recv().await.unwrap().unwrap();
        assert!(matches!(frame.payload, Payload::Disconnect { .. }));

        manager.disconnect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let result = manager.send_data(Payload::Chat("late".to_string())).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_heartbeat_is_sent() {
        let manager = manager(Duration::from_millis(20));
        let mut server = attached(&manager, 5).await;

        let frame = server
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let Payload::Heartbeat { timestamp } = frame.payload else {
            panic!("expected heartbeat, got {:?}", frame.payload);
        };
        server.send(&Payload::HeartbeatAck { timestamp }).await.unwrap();
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout_resets_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer the Hello
        let _silent = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let manager = manager(Duration::ZERO);
        let result = manager.connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connect_resets_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = manager(Duration::ZERO);
        let result = manager.connect("127.0.0.1", port).await;
        assert!(result.is_err());
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_connect_can_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer the Hello
        let _silent = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let manager = manager(Duration::ZERO);
        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), manager.connect("127.0.0.1", port)).await;
        assert!(cancelled.is_err());
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.session().await.is_none());

        let _server = attached(&manager, 7).await;
        assert!(manager.is_connected().await);
        assert_eq!(manager.connection_id().await, Some(ConnectionId::new(7)));
    }
}
