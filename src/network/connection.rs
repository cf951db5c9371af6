//! Connection handling
//!
//! Manages individual peer connections, including:
//! - Message encoding/decoding
//! - The Hello/Welcome handshake
//! - Connection state and statistics
//!
//! A [`Connection`] works over any `AsyncRead + AsyncWrite` stream; TCP is
//! what the client and server use.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{
    ConnectionId, DecodeError, Decoder, EncodeError, Encoder, Frame, Payload, PROTOCOL_VERSION,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Connection timeout")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Send channel closed")]
    SendChannelClosed,
}

impl ConnectionError {
    /// A bad frame is dropped; the connection itself is still usable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::Decode(_))
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel
    Disconnected,
    /// Channel being opened, handshake in progress
    Connecting,
    /// Handshake complete, ready for communication
    Connected,
    /// Channel being torn down
    Closing,
}

/// What the client learns from the server's Welcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub session_name: String,
    pub remote_addr: SocketAddr,
}

/// Represents a connection to a remote peer
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    /// Protocol encoder
    encoder: Encoder,
    /// Protocol decoder
    decoder: Decoder,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Id assigned during the handshake
    id: ConnectionId,
    /// Player name of the remote side (server side only)
    remote_name: Option<String>,
    /// Connection state
    state: ConnectionState,
    /// Last activity timestamp
    last_activity: Instant,
    /// Statistics
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames dropped because they failed to decode
    pub decode_failures: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            id: ConnectionId::UNASSIGNED,
            remote_name: None,
            state: ConnectionState::Connecting,
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Player name the remote side sent in its Hello
    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Wait for the client's Hello and check its protocol version
    ///
    /// Returns the player name. A version mismatch is answered with a
    /// rejection before the error is returned.
    pub async fn await_hello(&mut self) -> ConnectionResult<String> {
        let frame = self.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        let (remote_version, player_name) = match frame.payload {
            Payload::Hello {
                protocol_version,
                player_name,
            } => (protocol_version, player_name),
            other => {
                return Err(ConnectionError::HandshakeFailed(format!(
                    "Expected HELLO, got {}",
                    other.message_type()
                )));
            }
        };

        if remote_version != PROTOCOL_VERSION {
            self.reject(&format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, remote_version
            ))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version,
            });
        }

        self.remote_name = Some(player_name.clone());
        Ok(player_name)
    }

    /// Admit the peer under the given id
    pub async fn accept(&mut self, id: ConnectionId, session_name: &str) -> ConnectionResult<()> {
        self.send(&Payload::Welcome {
            connection_id: id,
            accepted: true,
            reason: None,
            session_name: session_name.to_string(),
        })
        .await?;

        self.id = id;
        self.state = ConnectionState::Connected;

        tracing::info!(
            "Handshake complete with {} ({}) as {}",
            self.remote_name.as_deref().unwrap_or("unnamed player"),
            self.remote_addr,
            id
        );

        Ok(())
    }

    /// Refuse the peer and close the stream
    pub async fn reject(&mut self, reason: &str) -> ConnectionResult<()> {
        self.state = ConnectionState::Closing;

        self.send(&Payload::Welcome {
            connection_id: ConnectionId::UNASSIGNED,
            accepted: false,
            reason: Some(reason.to_string()),
            session_name: String::new(),
        })
        .await?;

        self.stream.shutdown().await?;
        self.state = ConnectionState::Disconnected;

        tracing::info!("Rejected {}: {}", self.remote_addr, reason);
        Ok(())
    }

    /// Perform the client-side handshake
    pub async fn handshake_client(&mut self, player_name: &str) -> ConnectionResult<SessionInfo> {
        self.send(&Payload::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_name: player_name.to_string(),
        })
        .await?;

        let frame = self.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        match frame.payload {
            Payload::Welcome {
                connection_id,
                accepted,
                reason,
                session_name,
            } => {
                if !accepted {
                    self.state = ConnectionState::Disconnected;
                    return Err(ConnectionError::Rejected(
                        reason.unwrap_or_else(|| "Connection rejected".to_string()),
                    ));
                }

                self.id = connection_id;
                self.state = ConnectionState::Connected;

                tracing::info!(
                    "Joined session '{}' at {} as {}",
                    session_name,
                    self.remote_addr,
                    connection_id
                );

                Ok(SessionInfo {
                    connection_id,
                    session_name,
                    remote_addr: self.remote_addr,
                })
            }
            other => Err(ConnectionError::HandshakeFailed(format!(
                "Expected WELCOME, got {}",
                other.message_type()
            ))),
        }
    }

    /// Send a message
    pub async fn send(&mut self, payload: &Payload) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(payload, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.last_activity = Instant::now();

        Ok(())
    }

    /// Receive a message (returns None on a clean close)
    ///
    /// A [`ConnectionError::Decode`] means one frame was dropped; calling
    /// `recv` again continues with the next frame.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            // Try to decode a message from the buffer
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.stats.messages_received += 1;
                    self.last_activity = Instant::now();
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.decode_failures += 1;
                    return Err(e.into());
                }
            }

            // Read more data
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Try to receive a message with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection gracefully
    ///
    /// The Disconnect frame is best effort; the stream is shut down either way.
    pub async fn close(&mut self, reason: &str) -> ConnectionResult<()> {
        self.state = ConnectionState::Closing;

        let sent = self
            .send(&Payload::Disconnect {
                reason: reason.to_string(),
            })
            .await;
        let shutdown = self.stream.shutdown().await;

        self.state = ConnectionState::Disconnected;

        sent?;
        shutdown?;
        Ok(())
    }

    /// Check if the connection is still active
    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }

    /// Get time since last activity
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// A handle for sending messages to a connection
///
/// Messages are queued to the task that owns the connection, so they leave in
/// the order they were handed over.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Payload>,
    connected: Arc<AtomicBool>,
    rtt_us: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Payload>) -> Self {
        Self {
            id,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            rtt_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a message through this connection
    pub async fn send(&self, payload: Payload) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }

        self.sender
            .send(payload)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Queue a message without waiting, for use inside listeners
    pub fn try_send(&self, payload: Payload) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }

        self.sender.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "send queue full",
            )),
            mpsc::error::TrySendError::Closed(_) => ConnectionError::SendChannelClosed,
        })
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the last measured round-trip time in microseconds
    pub fn rtt_us(&self) -> u64 {
        self.rtt_us.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Update the RTT value
    pub fn update_rtt(&self, rtt_us: u64) {
        self.rtt_us.store(rtt_us, Ordering::SeqCst);
    }
}
