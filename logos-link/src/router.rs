//! Inbound frame classification.
//!
//! The router turns raw socket bytes into [`Routed`] events. Fragment
//! frames are absorbed by the [`Reassembler`] and re-enter classification
//! as a single update once their batch completes.

use crate::fragment::Reassembler;
use crate::protocol::{CrdtType, Frame, JoinErrorCode, Permission};

/// A classified inbound event, addressed to one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Pong {
        echo_of: u64,
    },
    /// Server-originated ping, answered with a pong.
    PingRequest {
        sent_at: u64,
    },
    JoinAck {
        room_id: String,
        permission: Permission,
        server_version: Vec<u8>,
    },
    JoinError {
        room_id: String,
        code: JoinErrorCode,
        reason: String,
    },
    Update {
        crdt: CrdtType,
        room_id: String,
        payload: Vec<u8>,
    },
    LeaveAck {
        room_id: String,
    },
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    reassembler: Reassembler,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and classify one socket message.
    pub fn route_bytes(&mut self, bytes: &[u8]) -> Option<Routed> {
        match Frame::decode(bytes) {
            Ok(frame) => self.route(frame),
            Err(e) => {
                log::warn!("Dropping undecodable frame ({} bytes): {}", bytes.len(), e);
                None
            }
        }
    }

    pub fn route(&mut self, frame: Frame) -> Option<Routed> {
        log::trace!("Inbound {} frame", frame.name());
        match frame {
            Frame::Pong { echo_of } => Some(Routed::Pong { echo_of }),
            Frame::Ping { sent_at } => Some(Routed::PingRequest { sent_at }),
            Frame::JoinAck {
                room_id,
                permission,
                server_version,
                ..
            } => Some(Routed::JoinAck {
                room_id,
                permission,
                server_version,
            }),
            Frame::JoinError {
                room_id,
                code,
                reason,
                ..
            } => Some(Routed::JoinError {
                room_id,
                code,
                reason,
            }),
            Frame::Update {
                crdt,
                room_id,
                payload,
            } => Some(Routed::Update {
                crdt,
                room_id,
                payload,
            }),
            frame @ (Frame::FragmentHeader { .. } | Frame::Fragment { .. }) => {
                let done = self.reassembler.accept(frame)?;
                self.route(Frame::Update {
                    crdt: done.crdt,
                    room_id: done.room_id,
                    payload: done.payload,
                })
            }
            Frame::LeaveAck { room_id, .. } => Some(Routed::LeaveAck { room_id }),
            frame @ (Frame::Join { .. } | Frame::Leave { .. }) => {
                log::warn!("Unexpected {} frame from server", frame.name());
                None
            }
        }
    }

    /// Forget partial batches for a room that is gone.
    pub fn discard_room(&mut self, room_id: &str) {
        self.reassembler.discard_room(room_id);
    }

    /// Partial batches never survive a socket.
    pub fn reset(&mut self) {
        self.reassembler.clear();
    }

    pub fn pending_batches(&self) -> usize {
        self.reassembler.pending_batches()
    }
}
