//! Room registry and join choreography.
//!
//! ```text
//!  join() ──► Pending ──JoinAck──► Active ──socket lost──► Pending (rejoin)
//!               │                    │
//!           JoinError            leave()/cleanup()
//!               ▼                    ▼
//!            removed              removed
//! ```
//!
//! The registry is plain state. Every method returns the frames the
//! connection task must write, in wire order; nothing here touches the
//! socket. Updates produced while a room cannot send are kept in a per-room
//! buffer and flushed in program order once it can.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::adaptor::CrdtDocAdaptor;
use crate::error::{AdaptorError, LinkError};
use crate::protocol::{CrdtType, Frame, JoinErrorCode, Permission};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Pending,
    Active,
}

/// State shared between a room entry and the handles pointing at it.
#[derive(Debug, Default)]
pub struct RoomShared {
    left: AtomicBool,
}

impl RoomShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_left(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    fn mark_left(&self) {
        self.left.store(true, Ordering::Release);
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccepted {
    pub permission: Permission,
    pub server_version: Vec<u8>,
}

pub type JoinReply = oneshot::Sender<Result<JoinAccepted, LinkError>>;
pub type VersionReply = oneshot::Sender<Result<(), LinkError>>;

struct RoomEntry {
    crdt: CrdtType,
    auth: Vec<u8>,
    adaptor: Arc<dyn CrdtDocAdaptor>,
    state: RoomState,
    buffer: VecDeque<Vec<u8>>,
    join_reply: Option<JoinReply>,
    server_version: Option<Vec<u8>>,
    permission: Option<Permission>,
    version_waiters: Vec<VersionReply>,
    shared: Arc<RoomShared>,
}

impl RoomEntry {
    fn join_frame(&self, room_id: &str) -> Frame {
        Frame::Join {
            crdt: self.crdt,
            room_id: room_id.to_string(),
            auth: self.auth.clone(),
            version: self.adaptor.version(),
        }
    }

    fn update_frame(&self, room_id: &str, payload: Vec<u8>) -> Frame {
        Frame::Update {
            crdt: self.crdt,
            room_id: room_id.to_string(),
            payload,
        }
    }

    fn check_version_waiters(&mut self) {
        let Some(server_version) = &self.server_version else {
            return;
        };
        if self.version_waiters.is_empty() || !self.adaptor.has_reached(server_version) {
            return;
        }
        for reply in self.version_waiters.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    /// Settle every waiter and detach the handles.
    fn close(mut self, err: LinkError) {
        self.shared.mark_left();
        if let Some(reply) = self.join_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        for reply in self.version_waiters.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

/// All rooms of one client, keyed by room id.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, RoomEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room in `Pending` state. The caller sends the returned
    /// join frame only when the socket is open. A room id that is already
    /// registered fails the join through `reply` and yields no frame.
    pub fn register(
        &mut self,
        room_id: &str,
        adaptor: Arc<dyn CrdtDocAdaptor>,
        auth: Vec<u8>,
        shared: Arc<RoomShared>,
        reply: JoinReply,
    ) -> Option<Frame> {
        if self.rooms.contains_key(room_id) {
            let _ = reply.send(Err(LinkError::RoomAlreadyJoined {
                room_id: room_id.to_string(),
            }));
            return None;
        }
        let entry = RoomEntry {
            crdt: adaptor.crdt_type(),
            auth,
            adaptor,
            state: RoomState::Pending,
            buffer: VecDeque::new(),
            join_reply: Some(reply),
            server_version: None,
            permission: None,
            version_waiters: Vec::new(),
            shared,
        };
        let frame = entry.join_frame(room_id);
        self.rooms.insert(room_id.to_string(), entry);
        log::debug!("Registered room {} ({} rooms)", room_id, self.rooms.len());
        Some(frame)
    }

    /// Frames to write right after a socket opens: one join per room,
    /// followed directly by the buffered updates of rooms that were active.
    /// Every room goes back to `Pending`.
    pub fn rejoin_all(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        for (room_id, entry) in self.rooms.iter_mut() {
            frames.push(entry.join_frame(room_id));
            if entry.state == RoomState::Active {
                let buffered: Vec<_> = entry.buffer.drain(..).collect();
                for payload in buffered {
                    frames.push(entry.update_frame(room_id, payload));
                }
            }
            entry.state = RoomState::Pending;
        }
        if !frames.is_empty() {
            log::info!("Rejoining {} rooms", self.rooms.len());
        }
        frames
    }

    /// Route a local update. Returns the frame when it can go out now.
    pub fn queue_update(
        &mut self,
        room_id: &str,
        payload: Vec<u8>,
        connected: bool,
    ) -> Result<Option<Frame>, LinkError> {
        let entry = self.rooms.get_mut(room_id).ok_or_else(|| LinkError::RoomLeft {
            room_id: room_id.to_string(),
        })?;
        if connected && entry.state == RoomState::Active {
            return Ok(Some(entry.update_frame(room_id, payload)));
        }
        entry.buffer.push_back(payload);
        log::trace!("Buffered update for room {} ({} queued)", room_id, entry.buffer.len());
        Ok(None)
    }

    /// Activate a pending room. Returns the adaptor's catch-up updates
    /// followed by the flushed buffer.
    pub fn on_join_ack(
        &mut self,
        room_id: &str,
        permission: Permission,
        server_version: Vec<u8>,
    ) -> Vec<Frame> {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            log::warn!("Dropping join ack: {}", unknown_room(room_id));
            return Vec::new();
        };
        if entry.state != RoomState::Pending {
            log::warn!("Dropping join ack for room {} which is already active", room_id);
            return Vec::new();
        }

        entry.state = RoomState::Active;
        entry.permission = Some(permission);

        let mut frames = Vec::new();
        match entry.adaptor.on_join_ok(&server_version) {
            Ok(updates) => {
                for payload in updates {
                    frames.push(entry.update_frame(room_id, payload));
                }
            }
            Err(e) => log::warn!("Adaptor rejected server version for room {}: {}", room_id, e),
        }
        let buffered: Vec<_> = entry.buffer.drain(..).collect();
        for payload in buffered {
            frames.push(entry.update_frame(room_id, payload));
        }

        entry.server_version = Some(server_version.clone());
        if let Some(reply) = entry.join_reply.take() {
            let _ = reply.send(Ok(JoinAccepted {
                permission,
                server_version,
            }));
        }
        entry.check_version_waiters();
        log::info!("Joined room {} ({:?})", room_id, permission);
        frames
    }

    /// A join was refused: the room is removed.
    pub fn on_join_error(&mut self, room_id: &str, code: JoinErrorCode, reason: &str) {
        let Some(entry) = self.rooms.remove(room_id) else {
            log::warn!("Dropping join error: {}", unknown_room(room_id));
            return;
        };
        log::warn!("Join of room {} refused ({:?}): {}", room_id, code, reason);
        entry.adaptor.on_join_failed(reason);
        let err = match code {
            JoinErrorCode::AuthFailed => LinkError::AuthenticationDenied {
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            },
            _ => LinkError::JoinRejected {
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            },
        };
        entry.close(err);
    }

    /// Hand an inbound update to the room's adaptor.
    ///
    /// Updates for rooms that are gone are expected after a local leave and
    /// are dropped quietly.
    pub fn apply_update(&mut self, crdt: CrdtType, room_id: &str, payload: &[u8]) {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            log::debug!("Dropping update: {}", unknown_room(room_id));
            return;
        };
        if entry.crdt != crdt {
            let err = AdaptorError::CrdtMismatch {
                expected: entry.crdt,
                actual: crdt,
            };
            log::warn!("Dropping update for room {}: {}", room_id, err);
            return;
        }
        if let Err(e) = entry.adaptor.apply_update(payload) {
            log::warn!("Failed to apply update for room {}: {}", room_id, e);
            return;
        }
        entry.check_version_waiters();
    }

    /// Remove a room on request of its handle. Returns the leave frame.
    /// With `cleanup` the adaptor is told to release its resources too.
    pub fn leave(&mut self, room_id: &str, cleanup: bool) -> Option<Frame> {
        let entry = self.rooms.remove(room_id)?;
        let frame = Frame::Leave {
            crdt: entry.crdt,
            room_id: room_id.to_string(),
        };
        if cleanup {
            entry.adaptor.on_cleanup();
        }
        entry.close(LinkError::RoomLeft {
            room_id: room_id.to_string(),
        });
        log::info!("Left room {}", room_id);
        Some(frame)
    }

    /// Local teardown with no network traffic. The adaptor is notified.
    pub fn cleanup(&mut self, room_id: &str, crdt: CrdtType) -> bool {
        let Entry::Occupied(slot) = self.rooms.entry(room_id.to_string()) else {
            return false;
        };
        if slot.get().crdt != crdt {
            log::warn!(
                "Cleanup of room {} asked for {}, room is {}",
                room_id,
                crdt,
                slot.get().crdt
            );
            return false;
        }
        let entry = slot.remove();
        entry.adaptor.on_cleanup();
        entry.close(LinkError::RoomLeft {
            room_id: room_id.to_string(),
        });
        log::debug!("Cleaned up room {}", room_id);
        true
    }

    /// Resolve once the adaptor reaches the latest server version seen.
    pub fn wait_server_version(&mut self, room_id: &str, reply: VersionReply) {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            let _ = reply.send(Err(LinkError::RoomLeft {
                room_id: room_id.to_string(),
            }));
            return;
        };
        entry.version_waiters.push(reply);
        entry.check_version_waiters();
    }

    /// Destroy path: settle everything with `err` and forget all rooms.
    pub fn reject_all(&mut self, err: LinkError) {
        for (_, entry) in std::mem::take(&mut self.rooms) {
            entry.close(err.clone());
        }
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn state(&self, room_id: &str) -> Option<RoomState> {
        self.rooms.get(room_id).map(|entry| entry.state)
    }

    pub fn crdt_type(&self, room_id: &str) -> Option<CrdtType> {
        self.rooms.get(room_id).map(|entry| entry.crdt)
    }

    pub fn permission(&self, room_id: &str) -> Option<Permission> {
        self.rooms.get(room_id).and_then(|entry| entry.permission)
    }

    pub fn buffered(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |entry| entry.buffer.len())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

fn unknown_room(room_id: &str) -> LinkError {
    LinkError::UnknownRoomFrame {
        room_id: room_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Adaptor whose version is a single counter byte.
    #[derive(Default)]
    struct CounterAdaptor {
        applied: Mutex<Vec<Vec<u8>>>,
        catch_up: Mutex<Vec<Vec<u8>>>,
        cleanups: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    impl CounterAdaptor {
        fn clock(&self) -> u8 {
            self.applied.lock().unwrap().len() as u8
        }
    }

    impl CrdtDocAdaptor for CounterAdaptor {
        fn crdt_type(&self) -> CrdtType {
            CrdtType::Yjs
        }
        fn version(&self) -> Vec<u8> {
            vec![self.clock()]
        }
        fn apply_update(&self, update: &[u8]) -> Result<(), AdaptorError> {
            if update.is_empty() {
                return Err(AdaptorError::MalformedUpdate("empty".into()));
            }
            self.applied.lock().unwrap().push(update.to_vec());
            Ok(())
        }
        fn on_join_ok(&self, _server_version: &[u8]) -> Result<Vec<Vec<u8>>, AdaptorError> {
            Ok(self.catch_up.lock().unwrap().clone())
        }
        fn has_reached(&self, server_version: &[u8]) -> bool {
            server_version.first().is_some_and(|v| self.clock() >= *v)
        }
        fn on_join_failed(&self, reason: &str) {
            self.failures.lock().unwrap().push(reason.to_string());
        }
        fn on_cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(
        registry: &mut RoomRegistry,
        room_id: &str,
    ) -> (
        Arc<CounterAdaptor>,
        Arc<RoomShared>,
        oneshot::Receiver<Result<JoinAccepted, LinkError>>,
    ) {
        let adaptor = Arc::new(CounterAdaptor::default());
        let shared = RoomShared::new();
        let (tx, rx) = oneshot::channel();
        registry
            .register(room_id, adaptor.clone(), b"write".to_vec(), shared.clone(), tx)
            .unwrap();
        (adaptor, shared, rx)
    }

    fn payloads(frames: &[Frame]) -> Vec<Vec<u8>> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Update { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_register_builds_join_frame() {
        let mut registry = RoomRegistry::new();
        let adaptor = Arc::new(CounterAdaptor::default());
        let (tx, _rx) = oneshot::channel();
        let frame = registry
            .register("doc1", adaptor, b"write".to_vec(), RoomShared::new(), tx)
            .expect("join frame");
        assert_eq!(
            frame,
            Frame::Join {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                auth: b"write".to_vec(),
                version: vec![0],
            }
        );
        assert_eq!(registry.state("doc1"), Some(RoomState::Pending));
    }

    #[test]
    fn test_duplicate_register_fails_through_reply() {
        let mut registry = RoomRegistry::new();
        let (_adaptor, _shared, mut first_rx) = register(&mut registry, "doc1");
        let (tx, mut rx) = oneshot::channel();
        let frame =
            registry.register("doc1", Arc::new(CounterAdaptor::default()), vec![], RoomShared::new(), tx);
        assert!(frame.is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::RoomAlreadyJoined { room_id: "doc1".into() })
        );

        // The original registration is untouched.
        assert_eq!(registry.len(), 1);
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_pending_updates_flush_in_order_after_ack() {
        let mut registry = RoomRegistry::new();
        let (adaptor, _shared, mut rx) = register(&mut registry, "doc1");
        adaptor.catch_up.lock().unwrap().push(vec![0xCA]);

        assert_eq!(registry.queue_update("doc1", vec![1], true).unwrap(), None);
        assert_eq!(registry.queue_update("doc1", vec![2], true).unwrap(), None);
        assert_eq!(registry.buffered("doc1"), 2);

        let frames = registry.on_join_ack("doc1", Permission::Write, vec![0]);
        assert_eq!(payloads(&frames), vec![vec![0xCA], vec![1], vec![2]]);
        assert_eq!(registry.buffered("doc1"), 0);
        assert_eq!(registry.state("doc1"), Some(RoomState::Active));

        let accepted = rx.try_recv().unwrap().unwrap();
        assert_eq!(accepted.permission, Permission::Write);

        // Active and connected: updates go straight out.
        assert!(registry.queue_update("doc1", vec![3], true).unwrap().is_some());
    }

    #[test]
    fn test_disconnected_updates_follow_rejoin() {
        let mut registry = RoomRegistry::new();
        let _room = register(&mut registry, "doc1");
        registry.on_join_ack("doc1", Permission::Write, vec![0]);

        assert_eq!(registry.queue_update("doc1", vec![7], false).unwrap(), None);
        let frames = registry.rejoin_all();
        assert!(matches!(frames[0], Frame::Join { .. }));
        assert_eq!(payloads(&frames), vec![vec![7]]);
        assert_eq!(registry.state("doc1"), Some(RoomState::Pending));
    }

    #[test]
    fn test_rejoin_sends_one_join_per_room() {
        let mut registry = RoomRegistry::new();
        let _a = register(&mut registry, "a");
        let _b = register(&mut registry, "b");
        registry.on_join_ack("a", Permission::Write, vec![0]);

        let joins = registry
            .rejoin_all()
            .iter()
            .filter(|f| matches!(f, Frame::Join { .. }))
            .count();
        assert_eq!(joins, 2);
    }

    #[test]
    fn test_join_error_removes_room() {
        let mut registry = RoomRegistry::new();
        let (adaptor, shared, mut rx) = register(&mut registry, "doc1");

        registry.on_join_error("doc1", JoinErrorCode::AuthFailed, "denied");
        assert!(!registry.contains("doc1"));
        assert!(shared.is_left());
        assert_eq!(*adaptor.failures.lock().unwrap(), vec!["denied".to_string()]);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::AuthenticationDenied {
                room_id: "doc1".into(),
                reason: "denied".into(),
            })
        );
    }

    #[test]
    fn test_non_auth_join_error_is_rejection() {
        let mut registry = RoomRegistry::new();
        let (_adaptor, _shared, mut rx) = register(&mut registry, "doc1");
        registry.on_join_error("doc1", JoinErrorCode::UnsupportedCrdt, "no loro");
        assert!(matches!(rx.try_recv().unwrap(), Err(LinkError::JoinRejected { .. })));
    }

    #[test]
    fn test_unmatched_acks_are_dropped() {
        let mut registry = RoomRegistry::new();
        assert!(registry.on_join_ack("ghost", Permission::Read, vec![]).is_empty());
        registry.on_join_error("ghost", JoinErrorCode::Unknown, "late");

        let _room = register(&mut registry, "doc1");
        registry.on_join_ack("doc1", Permission::Write, vec![0]);
        assert!(registry.on_join_ack("doc1", Permission::Write, vec![0]).is_empty());
    }

    #[test]
    fn test_apply_update_and_version_waiters() {
        let mut registry = RoomRegistry::new();
        let (adaptor, _shared, _rx) = register(&mut registry, "doc1");
        registry.on_join_ack("doc1", Permission::Write, vec![2]);

        let (tx, mut rx) = oneshot::channel();
        registry.wait_server_version("doc1", tx);
        assert!(rx.try_recv().is_err());

        registry.apply_update(CrdtType::Yjs, "doc1", &[1]);
        assert!(rx.try_recv().is_err());
        registry.apply_update(CrdtType::Yjs, "doc1", &[]);
        registry.apply_update(CrdtType::Yjs, "doc1", &[2]);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(adaptor.clock(), 2);

        // Already reached: resolves on registration.
        let (tx, mut rx) = oneshot::channel();
        registry.wait_server_version("doc1", tx);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_update_for_unknown_room_is_ignored() {
        let mut registry = RoomRegistry::new();
        registry.apply_update(CrdtType::Yjs, "ghost", &[1]);
        assert!(matches!(
            registry.queue_update("ghost", vec![1], true),
            Err(LinkError::RoomLeft { .. })
        ));
    }

    #[test]
    fn test_update_of_other_crdt_kind_is_dropped() {
        let mut registry = RoomRegistry::new();
        let (adaptor, _shared, _rx) = register(&mut registry, "doc1");
        registry.on_join_ack("doc1", Permission::Write, vec![0]);

        registry.apply_update(CrdtType::YjsAwareness, "doc1", &[1]);
        assert_eq!(adaptor.clock(), 0);
        registry.apply_update(CrdtType::Yjs, "doc1", &[1]);
        assert_eq!(adaptor.clock(), 1);
    }

    #[test]
    fn test_leave_rejects_waiters() {
        let mut registry = RoomRegistry::new();
        let (_adaptor, shared, mut join_rx) = register(&mut registry, "doc1");
        let (tx, mut version_rx) = oneshot::channel();
        registry.wait_server_version("doc1", tx);

        let frame = registry.leave("doc1", false).unwrap();
        assert_eq!(frame, Frame::Leave { crdt: CrdtType::Yjs, room_id: "doc1".into() });
        assert!(shared.is_left());
        assert!(matches!(join_rx.try_recv().unwrap(), Err(LinkError::RoomLeft { .. })));
        assert!(matches!(version_rx.try_recv().unwrap(), Err(LinkError::RoomLeft { .. })));
        assert!(registry.leave("doc1", false).is_none());
    }

    #[test]
    fn test_cleanup_checks_crdt_and_notifies_adaptor() {
        let mut registry = RoomRegistry::new();
        let (adaptor, shared, _rx) = register(&mut registry, "doc1");

        assert!(!registry.cleanup("doc1", CrdtType::Loro));
        assert!(registry.contains("doc1"));

        assert!(registry.cleanup("doc1", CrdtType::Yjs));
        assert!(!registry.contains("doc1"));
        assert!(shared.is_left());
        assert_eq!(adaptor.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reject_all_on_destroy() {
        let mut registry = RoomRegistry::new();
        let (_a, _sa, mut rx_a) = register(&mut registry, "a");
        let (_b, _sb, mut rx_b) = register(&mut registry, "b");

        registry.reject_all(LinkError::ClientDestroyed);
        assert!(registry.is_empty());
        assert_eq!(rx_a.try_recv().unwrap(), Err(LinkError::ClientDestroyed));
        assert_eq!(rx_b.try_recv().unwrap(), Err(LinkError::ClientDestroyed));
    }
}
