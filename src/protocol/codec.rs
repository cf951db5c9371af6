//! Protocol codec for encoding/decoding messages
//!
//! Handles framing and the per-type payload schemas. The type byte in the
//! header selects which schema the payload is read with.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::{Board, CoinSide, ConnectionId, Mark, Message, MessageType, Move, Payload, MAGIC_BYTES};

/// Maximum payload size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
pub const HEADER_SIZE: usize = 13;

/// Errors produced while reading a frame
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message type tag: {0:#04x}")]
    UnknownType(u8),

    #[error("Message too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
}

/// Errors produced while writing a frame
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
}

/// Decoded frame with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number assigned by the sending encoder
    pub sequence: u32,
    pub payload: Payload,
}

impl Frame {
    pub fn new(sequence: u32, payload: Payload) -> Self {
        Self { sequence, payload }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Attach the connection the frame arrived on
    pub fn into_message(self, sender: ConnectionId) -> Message {
        Message::new(sender, self.payload)
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .reject_trailing_bytes()
}

fn write_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(wire_options().serialize(value)?)
}

fn read_body<T: DeserializeOwned>(ty: MessageType, body: &[u8]) -> Result<T, DecodeError> {
    wire_options()
        .deserialize(body)
        .map_err(|e| DecodeError::Malformed(format!("invalid {} payload: {}", ty, e)))
}

/// Serialize the schema belonging to the payload's type
fn encode_body(payload: &Payload) -> Result<Vec<u8>, EncodeError> {
    match payload {
        Payload::Chat(text) | Payload::Ack(text) | Payload::Info(text) | Payload::Warning(text) => {
            write_body(text)
        }
        Payload::GameState(board) => write_body(board),
        Payload::Turn(mark) => write_body(mark),
        Payload::Move(mv) => write_body(mv),
        Payload::Coin(side) => write_body(side),
        Payload::Join { player_name } => write_body(player_name),
        Payload::Leave { reason } | Payload::Disconnect { reason } => write_body(reason),
        Payload::Hello {
            protocol_version,
            player_name,
        } => write_body(&(protocol_version, player_name)),
        Payload::Welcome {
            connection_id,
            accepted,
            reason,
            session_name,
        } => write_body(&(connection_id, accepted, reason, session_name)),
        Payload::Heartbeat { timestamp } | Payload::HeartbeatAck { timestamp } => write_body(timestamp),
    }
}

/// Read the schema selected by the type tag
fn decode_body(ty: MessageType, body: &[u8]) -> Result<Payload, DecodeError> {
    let payload = match ty {
        MessageType::Chat => Payload::Chat(read_body(ty, body)?),
        MessageType::GameState => Payload::GameState(read_body::<Board>(ty, body)?),
        MessageType::Turn => Payload::Turn(read_body::<Mark>(ty, body)?),
        MessageType::Move => Payload::Move(read_body::<Move>(ty, body)?),
        MessageType::Coin => Payload::Coin(read_body::<CoinSide>(ty, body)?),
        MessageType::Ack => Payload::Ack(read_body(ty, body)?),
        MessageType::Join => Payload::Join {
            player_name: read_body(ty, body)?,
        },
        MessageType::Leave => Payload::Leave {
            reason: read_body(ty, body)?,
        },
        MessageType::Hello => {
            let (protocol_version, player_name) = read_body::<(u32, String)>(ty, body)?;
            Payload::Hello {
                protocol_version,
                player_name,
            }
        }
        MessageType::Welcome => {
            let (connection_id, accepted, reason, session_name) =
                read_body::<(ConnectionId, bool, Option<String>, String)>(ty, body)?;
            Payload::Welcome {
                connection_id,
                accepted,
                reason,
                session_name,
            }
        }
        MessageType::Heartbeat => Payload::Heartbeat {
            timestamp: read_body(ty, body)?,
        },
        MessageType::HeartbeatAck => Payload::HeartbeatAck {
            timestamp: read_body(ty, body)?,
        },
        MessageType::Info => Payload::Info(read_body(ty, body)?),
        MessageType::Warning => Payload::Warning(read_body(ty, body)?),
        MessageType::Disconnect => Payload::Disconnect {
            reason: read_body(ty, body)?,
        },
    };

    if let Payload::Move(mv) = &payload {
        if mv.cell as usize >= super::BOARD_CELLS {
            return Err(DecodeError::Malformed(format!("move to cell {} is off the board", mv.cell)));
        }
    }

    Ok(payload)
}

struct Header {
    tag: u8,
    length: usize,
    sequence: u32,
}

fn parse_header(bytes: &[u8]) -> Result<Header, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    if bytes[0..4] != MAGIC_BYTES {
        return Err(DecodeError::Malformed("invalid magic bytes".to_string()));
    }

    let tag = bytes[4];
    let length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    let sequence = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);

    if length > MAX_MESSAGE_SIZE {
        return Err(DecodeError::TooLarge(length, MAX_MESSAGE_SIZE));
    }

    Ok(Header { tag, length, sequence })
}

fn decode_tagged(tag: u8, body: &[u8]) -> Result<Payload, DecodeError> {
    let ty = MessageType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
    decode_body(ty, body)
}

/// Encode a single payload as a standalone frame with sequence 0
pub fn encode(payload: &Payload) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one complete frame
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let header = parse_header(bytes)?;
    let body = &bytes[HEADER_SIZE..];

    if body.len() != header.length {
        return Err(DecodeError::Malformed(format!(
            "frame declares {} payload bytes but {} are present",
            header.length,
            body.len()
        )));
    }

    let payload = decode_tagged(header.tag, body)?;
    Ok(Frame::new(header.sequence, payload))
}

/// Encodes messages into the wire format
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Encode a payload into a buffer
    pub fn encode(&mut self, payload: &Payload, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let body = encode_body(payload)?;

        if body.len() > MAX_MESSAGE_SIZE {
            return Err(EncodeError::TooLarge(body.len(), MAX_MESSAGE_SIZE));
        }

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(payload.message_type().tag());
        buf.put_u32(body.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&body);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Sequence number the next frame will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes messages from a byte stream
///
/// A frame that fails to decode is consumed before the error is returned,
/// so the caller can keep reading. Invalid magic bytes leave no way to find
/// the next frame boundary; the buffered bytes are discarded instead.
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        tag: u8,
        length: usize,
        sequence: u32,
    },
    /// Dropping the body of an oversized frame
    Skip { remaining: usize },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    match parse_header(&buf[..HEADER_SIZE]) {
                        Ok(header) => {
                            buf.advance(HEADER_SIZE);
                            self.state = DecodeState::Payload {
                                tag: header.tag,
                                length: header.length,
                                sequence: header.sequence,
                            };
                        }
                        Err(DecodeError::TooLarge(length, max)) => {
                            buf.advance(HEADER_SIZE);
                            self.state = DecodeState::Skip { remaining: length };
                            return Err(DecodeError::TooLarge(length, max));
                        }
                        Err(e) => {
                            buf.clear();
                            return Err(e);
                        }
                    }
                }
                DecodeState::Payload { tag, length, sequence } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let body = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let payload = decode_tagged(tag, &body)?;
                    return Ok(Some(Frame::new(sequence, payload)));
                }
                DecodeState::Skip { remaining } => {
                    let n = remaining.min(buf.len());
                    buf.advance(n);
                    if n == remaining {
                        self.state = DecodeState::Header;
                    } else {
                        self.state = DecodeState::Skip {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
