//! Binary frame protocol shared by the client and the relay server.
//!
//! Every frame is one WebSocket binary message holding a bincode-encoded
//! [`Frame`]:
//! ```text
//! ┌─────────┬─────────────────────────────────────────────┐
//! │ variant │ fields (varint lengths, bytes, strings)     │
//! │ varint  │ crdt kind + room id first for room frames   │
//! └─────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Room-scoped frames always carry the room's [`CrdtType`] next to its id.
//! Payloads larger than the fragmentation threshold never travel as a
//! single [`Frame::Update`]; see [`crate::fragment`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Hard limit on an encoded frame.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Longest accepted room id, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Kind of CRDT document a room synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtType {
    Loro,
    LoroEphemeralStore,
    Yjs,
    YjsAwareness,
}

impl CrdtType {
    /// Ephemeral kinds are relayed but never persisted.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::LoroEphemeralStore | Self::YjsAwareness)
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loro => "loro",
            Self::LoroEphemeralStore => "loro-ephemeral",
            Self::Yjs => "yjs",
            Self::YjsAwareness => "yjs-awareness",
        };
        f.write_str(name)
    }
}

/// Access level granted by the server's auth policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
}

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinErrorCode {
    AuthFailed,
    UnsupportedCrdt,
    InvalidRoom,
    Unknown,
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → server: subscribe to a room.
    Join {
        crdt: CrdtType,
        room_id: String,
        auth: Vec<u8>,
        /// Encoded local document version, so the server sends only what is missing.
        version: Vec<u8>,
    },
    JoinAck {
        crdt: CrdtType,
        room_id: String,
        permission: Permission,
        server_version: Vec<u8>,
    },
    JoinError {
        crdt: CrdtType,
        room_id: String,
        code: JoinErrorCode,
        reason: String,
    },
    Update {
        crdt: CrdtType,
        room_id: String,
        payload: Vec<u8>,
    },
    /// Announces a fragmented payload; its parts follow in order.
    FragmentHeader {
        crdt: CrdtType,
        room_id: String,
        batch_id: u64,
        expected_parts: u32,
        total_bytes: u64,
    },
    Fragment {
        crdt: CrdtType,
        room_id: String,
        batch_id: u64,
        index: u32,
        bytes: Vec<u8>,
    },
    /// `sent_at` is milliseconds on the sender's monotonic clock.
    Ping { sent_at: u64 },
    Pong { echo_of: u64 },
    Leave {
        crdt: CrdtType,
        room_id: String,
    },
    LeaveAck {
        crdt: CrdtType,
        room_id: String,
    },
}

impl Frame {
    /// Room this frame addresses, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Join { room_id, .. }
            | Self::JoinAck { room_id, .. }
            | Self::JoinError { room_id, .. }
            | Self::Update { room_id, .. }
            | Self::FragmentHeader { room_id, .. }
            | Self::Fragment { room_id, .. }
            | Self::Leave { room_id, .. }
            | Self::LeaveAck { room_id, .. } => Some(room_id),
            Self::Ping { .. } | Self::Pong { .. } => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::JoinAck { .. } => "join-ack",
            Self::JoinError { .. } => "join-error",
            Self::Update { .. } => "update",
            Self::FragmentHeader { .. } => "fragment-header",
            Self::Fragment { .. } => "fragment",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Leave { .. } => "leave",
            Self::LeaveAck { .. } => "leave-ack",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Check a room id against the protocol limits.
pub fn validate_room_id(room_id: &str) -> Result<(), ProtocolError> {
    if room_id.is_empty() {
        return Err(ProtocolError::InvalidRoomId("room id is empty".into()));
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(ProtocolError::InvalidRoomId(format!(
            "room id is {} bytes, limit is {MAX_ROOM_ID_LEN}",
            room_id.len()
        )));
    }
    Ok(())
}
