//! Error types.
//!
//! Connection-level failures are recovered internally by the connection
//! task and are only observable through status/latency subscriptions.
//! Room-level failures surface through the future returned by the
//! operation that caused them.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::CrdtType;

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
}

/// Errors raised by a document adaptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdaptorError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed version: {0}")]
    MalformedVersion(String),
    #[error("adaptor handles {expected} documents, room is {actual}")]
    CrdtMismatch { expected: CrdtType, actual: CrdtType },
}

/// Socket-level errors reported by a [`Connector`](crate::transport::Connector).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket closed: {0}")]
    Closed(String),
}

/// Errors surfaced by the public client API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The server's auth policy refused the join. The room has been removed.
    #[error("authentication denied for room {room_id}: {reason}")]
    AuthenticationDenied { room_id: String, reason: String },

    /// The server refused the join for a reason other than auth.
    #[error("join rejected for room {room_id}: {reason}")]
    JoinRejected { room_id: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("ping timed out after {0:?}")]
    PingTimeout(Duration),

    /// Consecutive periodic pings went unanswered; the socket is torn down.
    #[error("peer unresponsive after {missed} missed pings")]
    LivenessFailure { missed: u32 },

    #[error("client destroyed")]
    ClientDestroyed,

    /// A frame addressed a room this client does not hold. Logged, never returned.
    #[error("frame for unknown room {room_id}")]
    UnknownRoomFrame { room_id: String },

    #[error("room {room_id} has been left")]
    RoomLeft { room_id: String },

    #[error("room {room_id} is already joined")]
    RoomAlreadyJoined { room_id: String },

    #[error("invalid room id {room_id:?}: {reason}")]
    InvalidRoomId { room_id: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Adaptor(#[from] AdaptorError),
}

impl LinkError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Connection-level failures are transient; policy decisions, local
    /// misuse and a destroyed client are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionLost(_)
            | Self::PingTimeout(_)
            | Self::LivenessFailure { .. }
            | Self::NotConnected
            | Self::Transport(_) => true,

            Self::AuthenticationDenied { .. }
            | Self::JoinRejected { .. }
            | Self::ClientDestroyed
            | Self::UnknownRoomFrame { .. }
            | Self::RoomLeft { .. }
            | Self::RoomAlreadyJoined { .. }
            | Self::InvalidRoomId { .. }
            | Self::InvalidConfig(_)
            | Self::Protocol(_)
            | Self::Adaptor(_) => false,
        }
    }
}
