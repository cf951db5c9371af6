//! Protocol message definitions
//!
//! The set of message types is closed: every [`MessageType`] has exactly one
//! [`Payload`] variant, and the variant's inner data is that type's schema.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one connection to the server.
///
/// The server hands out ids starting at 1; `0` means "not assigned yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const UNASSIGNED: ConnectionId = ConnectionId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Type tag carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Chat = 0x01,
    GameState = 0x02,
    Turn = 0x03,
    Move = 0x04,
    Coin = 0x05,
    Ack = 0x06,
    Join = 0x07,
    Leave = 0x08,
    Hello = 0xE0,
    Welcome = 0xE1,
    Heartbeat = 0xF0,
    HeartbeatAck = 0xF1,
    Info = 0xF2,
    Warning = 0xF3,
    /// Graceful close on the wire, and the event fired locally when a
    /// connection is lost
    Disconnect = 0xFE,
}

impl MessageType {
    /// Number of message types
    pub const COUNT: usize = 15;

    /// Every message type, in tag order
    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Chat,
        MessageType::GameState,
        MessageType::Turn,
        MessageType::Move,
        MessageType::Coin,
        MessageType::Ack,
        MessageType::Join,
        MessageType::Leave,
        MessageType::Hello,
        MessageType::Welcome,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::Info,
        MessageType::Warning,
        MessageType::Disconnect,
    ];

    /// Wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a type by its wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    /// Dense index in `0..COUNT`, used for dispatch tables
    pub fn index(self) -> usize {
        match self {
            MessageType::Chat => 0,
            MessageType::GameState => 1,
            MessageType::Turn => 2,
            MessageType::Move => 3,
            MessageType::Coin => 4,
            MessageType::Ack => 5,
            MessageType::Join => 6,
            MessageType::Leave => 7,
            MessageType::Hello => 8,
            MessageType::Welcome => 9,
            MessageType::Heartbeat => 10,
            MessageType::HeartbeatAck => 11,
            MessageType::Info => 12,
            MessageType::Warning => 13,
            MessageType::Disconnect => 14,
        }
    }

    /// Game messages are forwarded between peers; everything else is
    /// handled by the transport itself
    pub fn is_relayable(self) -> bool {
        matches!(
            self,
            MessageType::Chat
                | MessageType::GameState
                | MessageType::Turn
                | MessageType::Move
                | MessageType::Coin
                | MessageType::Ack
                | MessageType::Join
                | MessageType::Leave
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Chat => "CHAT",
            MessageType::GameState => "GAME_STATE",
            MessageType::Turn => "TURN",
            MessageType::Move => "MOVE",
            MessageType::Coin => "COIN",
            MessageType::Ack => "ACK",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::Info => "INFO",
            MessageType::Warning => "WARNING",
            MessageType::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Player mark on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn other(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }
}

/// Coin-flip choice used to decide who starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoinSide {
    Heads,
    Tails,
}

/// Number of cells on the board
pub const BOARD_CELLS: usize = 9;

/// Board positions, row-major
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub cells: [Option<Mark>; BOARD_CELLS],
    /// Mark that moves next
    pub next: Mark,
}

impl Board {
    pub fn new() -> Self {
        Self {
            cells: [None; BOARD_CELLS],
            next: Mark::X,
        }
    }

    pub fn cell(&self, index: usize) -> Option<Mark> {
        self.cells.get(index).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

/// A single placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Cell index in `0..BOARD_CELLS`
    pub cell: u8,
    pub mark: Mark,
}

/// Payload of a message; the variant determines the [`MessageType`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Free text chat
    Chat(String),
    /// Full board representation
    GameState(Board),
    /// Whose turn it is
    Turn(Mark),
    /// A player's move
    Move(Move),
    /// Coin-flip choice
    Coin(CoinSide),
    /// Acknowledges a received message
    Ack(String),
    Join {
        player_name: String,
    },
    Leave {
        reason: String,
    },

    /// Handshake request from a client
    Hello {
        protocol_version: u32,
        player_name: String,
    },
    /// Handshake answer from the server
    Welcome {
        connection_id: ConnectionId,
        accepted: bool,
        reason: Option<String>,
        session_name: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    /// Session notice (peer joined, peer left)
    Info(String),
    /// Something the peer should know went wrong
    Warning(String),
    Disconnect {
        reason: String,
    },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Chat(_) => MessageType::Chat,
            Payload::GameState(_) => MessageType::GameState,
            Payload::Turn(_) => MessageType::Turn,
            Payload::Move(_) => MessageType::Move,
            Payload::Coin(_) => MessageType::Coin,
            Payload::Ack(_) => MessageType::Ack,
            Payload::Join { .. } => MessageType::Join,
            Payload::Leave { .. } => MessageType::Leave,
            Payload::Hello { .. } => MessageType::Hello,
            Payload::Welcome { .. } => MessageType::Welcome,
            Payload::Heartbeat { .. } => MessageType::Heartbeat,
            Payload::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Payload::Info(_) => MessageType::Info,
            Payload::Warning(_) => MessageType::Warning,
            Payload::Disconnect { .. } => MessageType::Disconnect,
        }
    }

    pub fn is_relayable(&self) -> bool {
        self.message_type().is_relayable()
    }
}

/// A decoded message together with the connection it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    pub sender: ConnectionId,
}

impl Message {
    pub fn new(sender: ConnectionId, payload: Payload) -> Self {
        Self { payload, sender }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}
