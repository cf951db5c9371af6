//! Protocol module - Defines the wire protocol for game messages
//!
//! Every application message travels in a frame:
//! - 4 bytes magic ("TTTN")
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length payload, whose schema is selected by the type byte

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version exchanged during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for game sessions
pub const DEFAULT_PORT: u16 = 50000;

/// Default UDP port for server discovery
pub const DEFAULT_DISCOVERY_PORT: u16 = 50020;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x54, 0x54, 0x54, 0x4E]; // "TTTN"
