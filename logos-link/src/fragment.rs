//! Splitting of oversized room payloads and reassembly of inbound batches.
//!
//! ```text
//! payload (10_000 B), threshold 4_000 B
//!   ├─► FragmentHeader { batch_id: 7, expected_parts: 3, total_bytes: 10_000 }
//!   ├─► Fragment { index: 0, 4_000 B }
//!   ├─► Fragment { index: 1, 4_000 B }
//!   └─► Fragment { index: 2, 2_000 B }
//! ```
//!
//! Batches are keyed by `(room_id, batch_id)` so one room never sees
//! another room's parts. Parts may arrive in any order.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{CrdtType, Frame, MAX_FRAME_SIZE};

/// Default payload size above which updates are fragmented.
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 240 * 1024;

/// Framing overhead reserved inside [`crate::protocol::MAX_FRAME_SIZE`].
pub const FRAME_HEADROOM: usize = 1024;

/// Outbound splitter. Owns the batch id counter for one sender.
#[derive(Debug)]
pub struct Fragmenter {
    threshold: usize,
    next_batch_id: u64,
}

impl Fragmenter {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            next_batch_id: 0,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Turn one payload into the frames that carry it.
    ///
    /// Small payloads become a single [`Frame::Update`]. Larger ones become
    /// a header followed by `ceil(len / threshold)` parts in index order.
    pub fn fragment(&mut self, crdt: CrdtType, room_id: &str, payload: Vec<u8>) -> Vec<Frame> {
        if payload.len() <= self.threshold {
            return vec![Frame::Update {
                crdt,
                room_id: room_id.to_string(),
                payload,
            }];
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1);

        let parts = payload.len().div_ceil(self.threshold);
        let mut frames = Vec::with_capacity(parts + 1);
        frames.push(Frame::FragmentHeader {
            crdt,
            room_id: room_id.to_string(),
            batch_id,
            expected_parts: parts as u32,
            total_bytes: payload.len() as u64,
        });
        for (index, chunk) in payload.chunks(self.threshold).enumerate() {
            frames.push(Frame::Fragment {
                crdt,
                room_id: room_id.to_string(),
                batch_id,
                index: index as u32,
                bytes: chunk.to_vec(),
            });
        }
        log::debug!(
            "Fragmented {} bytes for room {} into {} parts (batch {})",
            payload.len(),
            room_id,
            parts,
            batch_id
        );
        frames
    }
}

/// A reassembled payload, ready to be routed as a regular update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub crdt: CrdtType,
    pub room_id: String,
    pub payload: Vec<u8>,
}

/// Largest payload a fragment header may declare.
pub const MAX_REASSEMBLED_SIZE: u64 = 64 * 1024 * 1024;

/// Incomplete batches kept per room. A further header evicts the oldest.
pub const MAX_OPEN_BATCHES_PER_ROOM: usize = 4;

/// Incomplete batches kept across all rooms.
pub const MAX_OPEN_BATCHES: usize = 64;

#[derive(Debug)]
struct FragmentBatch {
    crdt: CrdtType,
    expected_parts: u32,
    total_bytes: u64,
    received_bytes: u64,
    received: BTreeMap<u32, Vec<u8>>,
    opened: u64,
}

/// Inbound accumulator for multi-part payloads.
///
/// Memory is bounded by the declared sizes: a header must be consistent
/// with its part count, parts may never add up to more than the header
/// declared, and only a few batches stay open per room.
#[derive(Debug, Default)]
pub struct Reassembler {
    batches: HashMap<(String, u64), FragmentBatch>,
    next_opened: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a batch. Any incomplete batch under the same key is discarded.
    pub fn on_header(
        &mut self,
        crdt: CrdtType,
        room_id: &str,
        batch_id: u64,
        expected_parts: u32,
        total_bytes: u64,
    ) -> Option<Reassembled> {
        // Every part carries at least one byte and fits in one frame.
        let parts = u64::from(expected_parts);
        if parts == 0
            || total_bytes > MAX_REASSEMBLED_SIZE
            || parts > total_bytes
            || total_bytes > parts * MAX_FRAME_SIZE as u64
        {
            log::warn!(
                "Ignoring fragment batch {} for room {}: {} parts declaring {} bytes",
                batch_id,
                room_id,
                expected_parts,
                total_bytes
            );
            return None;
        }

        let key = (room_id.to_string(), batch_id);
        if self.batches.remove(&key).is_some() {
            log::warn!(
                "Fragment batch {} for room {} superseded before completion",
                batch_id,
                room_id
            );
        }
        let open_in_room = self.batches.keys().filter(|(room, _)| room == room_id).count();
        if open_in_room >= MAX_OPEN_BATCHES_PER_ROOM {
            self.evict_oldest(|room| room == room_id);
        }
        if self.batches.len() >= MAX_OPEN_BATCHES {
            self.evict_oldest(|_| true);
        }

        let opened = self.next_opened;
        self.next_opened += 1;
        self.batches.insert(
            key,
            FragmentBatch {
                crdt,
                expected_parts,
                total_bytes,
                received_bytes: 0,
                received: BTreeMap::new(),
                opened,
            },
        );
        None
    }

    fn evict_oldest(&mut self, in_scope: impl Fn(&str) -> bool) {
        let oldest = self
            .batches
            .iter()
            .filter(|((room, _), _)| in_scope(room))
            .min_by_key(|(_, batch)| batch.opened)
            .map(|(key, _)| key.clone());
        if let Some((room_id, batch_id)) = oldest {
            self.batches.remove(&(room_id.clone(), batch_id));
            log::warn!("Evicted incomplete fragment batch {} for room {}", batch_id, room_id);
        }
    }

    /// Record one part. Returns the full payload once every part is present.
    pub fn on_part(
        &mut self,
        room_id: &str,
        batch_id: u64,
        index: u32,
        bytes: Vec<u8>,
    ) -> Option<Reassembled> {
        let key = (room_id.to_string(), batch_id);
        let Some(batch) = self.batches.get_mut(&key) else {
            log::warn!("Dropping part {} of unknown batch {} for room {}", index, batch_id, room_id);
            return None;
        };
        if index >= batch.expected_parts {
            log::warn!(
                "Dropping part {} of batch {} for room {}: only {} parts expected",
                index,
                batch_id,
                room_id,
                batch.expected_parts
            );
            return None;
        }
        let added = bytes.len() as u64;
        let replaced = batch
            .received
            .insert(index, bytes)
            .map_or(0, |old| old.len() as u64);
        batch.received_bytes = batch.received_bytes - replaced + added;
        if batch.received_bytes > batch.total_bytes {
            log::warn!(
                "Dropping batch {} for room {}: {} bytes received, header declared {}",
                batch_id,
                room_id,
                batch.received_bytes,
                batch.total_bytes
            );
            self.batches.remove(&key);
            return None;
        }
        if batch.received.len() < batch.expected_parts as usize {
            return None;
        }

        let batch = self.batches.remove(&key)?;
        if batch.received_bytes != batch.total_bytes {
            log::warn!(
                "Batch {} for room {} reassembled to {} bytes, header declared {}",
                batch_id,
                room_id,
                batch.received_bytes,
                batch.total_bytes
            );
            return None;
        }
        let mut payload = Vec::with_capacity(batch.received_bytes as usize);
        for part in batch.received.into_values() {
            payload.extend_from_slice(&part);
        }
        Some(Reassembled {
            crdt: batch.crdt,
            room_id: room_id.to_string(),
            payload,
        })
    }

    /// Feed any fragment frame. Non-fragment frames are ignored.
    pub fn accept(&mut self, frame: Frame) -> Option<Reassembled> {
        match frame {
            Frame::FragmentHeader {
                crdt,
                room_id,
                batch_id,
                expected_parts,
                total_bytes,
            } => self.on_header(crdt, &room_id, batch_id, expected_parts, total_bytes),
            Frame::Fragment {
                room_id,
                batch_id,
                index,
                bytes,
                ..
            } => self.on_part(&room_id, batch_id, index, bytes),
            _ => None,
        }
    }

    /// Drop every incomplete batch for a room.
    pub fn discard_room(&mut self, room_id: &str) {
        self.batches.retain(|(room, _), _| room != room_id);
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    pub fn pending_batches(&self) -> usize {
        self.batches.len()
    }
}
