//! Reference relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── authenticate
//!             ├── Room (crdt, room_id) ── hooks ──┼── load_document
//! Client B ──┘        │                          └── save_document
//!                     ├── Yrs Doc (Yjs rooms only)
//!                     └── BroadcastGroup
//!                             │
//!                  ┌──────────┼───────────┐
//!                  ▼          ▼           ▼
//!               Client A   Client B    Client C
//! ```
//!
//! One socket may join any number of rooms. Each room keeps:
//! - A Yrs `Doc` for authoritative state (`Yjs` rooms); ephemeral kinds are
//!   relayed without state
//! - A `BroadcastGroup` for fan-out to the other peers
//! - A dirty flag, flushed through [`ServerHooks::save_document`] every
//!   `save_interval`, when the last peer leaves and on stop
//!
//! The server is a test and development companion for the client, not a
//! production storage engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, PeerSender};
use crate::config::ServerConfig;
use crate::fragment::{Fragmenter, Reassembler};
use crate::protocol::{validate_room_id, CrdtType, Frame, JoinErrorCode, Permission};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Application callbacks consulted by the server.
pub trait ServerHooks: Send + Sync + 'static {
    /// `None` denies the join.
    fn authenticate(
        &self,
        room_id: &str,
        crdt: CrdtType,
        auth: &[u8],
    ) -> BoxFuture<'static, Option<Permission>>;

    /// Initial document bytes for a room that is not loaded yet.
    fn load_document(&self, room_id: &str, crdt: CrdtType) -> BoxFuture<'static, Option<Vec<u8>>>;

    fn save_document(&self, room_id: &str, crdt: CrdtType, data: Vec<u8>) -> BoxFuture<'static, ()>;
}

/// Grants write access to everyone and persists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllHooks;

impl ServerHooks for AllowAllHooks {
    fn authenticate(&self, _: &str, _: CrdtType, _: &[u8]) -> BoxFuture<'static, Option<Permission>> {
        Box::pin(async { Some(Permission::Write) })
    }

    fn load_document(&self, _: &str, _: CrdtType) -> BoxFuture<'static, Option<Vec<u8>>> {
        Box::pin(async { None })
    }

    fn save_document(&self, _: &str, _: CrdtType, _: Vec<u8>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub saved_documents: u64,
}

type RoomKey = (CrdtType, String);

/// Document room: optional Yrs Doc + broadcast group.
struct ServerRoom {
    doc: Option<yrs::Doc>,
    broadcast: Arc<BroadcastGroup>,
    fragmenter: Fragmenter,
    dirty: bool,
}

impl ServerRoom {
    fn new(crdt: CrdtType, fragment_threshold: usize) -> Self {
        Self {
            doc: (crdt == CrdtType::Yjs).then(yrs::Doc::new),
            broadcast: Arc::new(BroadcastGroup::new()),
            fragmenter: Fragmenter::new(fragment_threshold),
            dirty: false,
        }
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        let doc = self.doc.as_ref()?;
        let txn = doc.transact();
        Some(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Snapshot if there are unsaved changes, marking the room clean.
    fn take_dirty_snapshot(&mut self) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.snapshot()
    }
}

struct Shared {
    config: ServerConfig,
    hooks: Arc<dyn ServerHooks>,
    rooms: RwLock<HashMap<RoomKey, ServerRoom>>,
    stats: RwLock<ServerStats>,
}

impl Shared {
    /// Hand every dirty room to `save_document`.
    async fn save_dirty(&self) {
        let snapshots: Vec<(RoomKey, Vec<u8>)> = {
            let mut rooms = self.rooms.write().await;
            rooms
                .iter_mut()
                .filter_map(|(key, room)| room.take_dirty_snapshot().map(|s| (key.clone(), s)))
                .collect()
        };
        for ((crdt, room_id), data) in snapshots {
            self.save(&room_id, crdt, data).await;
        }
    }

    async fn save(&self, room_id: &str, crdt: CrdtType, data: Vec<u8>) {
        log::debug!("Saving room {} ({} bytes)", room_id, data.len());
        self.hooks.save_document(room_id, crdt, data).await;
        self.stats.write().await.saved_documents += 1;
    }

    /// Make sure the room exists, loading its document on first use.
    async fn ensure_room(&self, crdt: CrdtType, room_id: &str) {
        let key = (crdt, room_id.to_string());
        if self.rooms.read().await.contains_key(&key) {
            return;
        }
        let loaded = if crdt.is_ephemeral() {
            None
        } else {
            self.hooks.load_document(room_id, crdt).await
        };

        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&key) {
            return;
        }
        let room = ServerRoom::new(crdt, self.config.fragment_threshold);
        if let (Some(doc), Some(data)) = (&room.doc, loaded) {
            match Update::decode_v1(&data) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("Failed to apply stored document for room {}: {}", room_id, e);
                    }
                    log::info!("Loaded stored document for room {}", room_id);
                }
                Err(e) => log::warn!("Stored document for room {} is corrupt: {}", room_id, e),
            }
        }
        rooms.insert(key, room);
        let count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = count;
        log::info!("Room {} ({}) created", room_id, crdt);
    }

    /// Remove a peer from a room; empty rooms are saved and dropped.
    async fn leave_room(&self, peer_id: &Uuid, key: &RoomKey) {
        let snapshot = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get(key) else {
                return;
            };
            room.broadcast.remove_peer(peer_id).await;
            if room.broadcast.peer_count().await > 0 {
                return;
            }
            let Some(mut room) = rooms.remove(key) else {
                return;
            };
            let count = rooms.len();
            self.stats.write().await.active_rooms = count;
            log::info!("Room {} removed (empty)", key.1);
            room.take_dirty_snapshot()
        };
        if let Some(data) = snapshot {
            self.save(&key.1, key.0, data).await;
        }
    }
}

/// Per-socket state on the server side.
struct PeerConnection {
    id: Uuid,
    addr: SocketAddr,
    shared: Arc<Shared>,
    outgoing: PeerSender,
    joined: HashMap<RoomKey, Permission>,
    reassembler: Reassembler,
    fragmenter: Fragmenter,
}

impl PeerConnection {
    /// Handle one frame; returns the direct replies in order.
    async fn on_frame(&mut self, frame: Frame) -> Vec<Frame> {
        match frame {
            Frame::Join {
                crdt,
                room_id,
                auth,
                version,
            } => self.on_join(crdt, room_id, auth, version).await,
            Frame::Update {
                crdt,
                room_id,
                payload,
            } => {
                self.on_update(crdt, &room_id, payload).await;
                Vec::new()
            }
            frame @ (Frame::FragmentHeader { .. } | Frame::Fragment { .. }) => {
                if let Frame::FragmentHeader { crdt, room_id, .. } = &frame {
                    if !self.joined.contains_key(&(*crdt, room_id.clone())) {
                        log::warn!("Dropping fragments from {} for unjoined room {}", self.addr, room_id);
                        return Vec::new();
                    }
                }
                if let Some(done) = self.reassembler.accept(frame) {
                    self.on_update(done.crdt, &done.room_id, done.payload).await;
                }
                Vec::new()
            }
            Frame::Ping { sent_at } => vec![Frame::Pong { echo_of: sent_at }],
            Frame::Leave { crdt, room_id } => {
                let key = (crdt, room_id.clone());
                if self.joined.remove(&key).is_some() {
                    self.shared.leave_room(&self.id, &key).await;
                }
                self.reassembler.discard_room(&room_id);
                log::info!("Peer {} left room {}", self.addr, room_id);
                vec![Frame::LeaveAck { crdt, room_id }]
            }
            other => {
                log::warn!("Unexpected {} frame from {}", other.name(), self.addr);
                Vec::new()
            }
        }
    }

    async fn on_join(
        &mut self,
        crdt: CrdtType,
        room_id: String,
        auth: Vec<u8>,
        version: Vec<u8>,
    ) -> Vec<Frame> {
        if let Err(e) = validate_room_id(&room_id) {
            return vec![join_error(crdt, room_id, JoinErrorCode::InvalidRoom, e.to_string())];
        }
        if crdt == CrdtType::Loro {
            return vec![join_error(
                crdt,
                room_id,
                JoinErrorCode::UnsupportedCrdt,
                "loro documents are not supported by this server".into(),
            )];
        }
        let Some(permission) = self.shared.hooks.authenticate(&room_id, crdt, &auth).await else {
            log::info!("Peer {} denied access to room {}", self.addr, room_id);
            return vec![join_error(
                crdt,
                room_id,
                JoinErrorCode::AuthFailed,
                "authentication failed".into(),
            )];
        };

        self.shared.ensure_room(crdt, &room_id).await;
        let key = (crdt, room_id.clone());
        let (server_version, diff) = {
            let rooms = self.shared.rooms.read().await;
            let Some(room) = rooms.get(&key) else {
                return vec![join_error(crdt, room_id, JoinErrorCode::Unknown, "room vanished".into())];
            };
            room.broadcast
                .add_peer(self.id, permission, self.outgoing.clone())
                .await;
            match &room.doc {
                Some(doc) => {
                    let txn = doc.transact();
                    let remote = StateVector::decode_v1(&version).unwrap_or_default();
                    (txn.state_vector().encode_v1(), txn.encode_diff_v1(&remote))
                }
                None => (Vec::new(), Vec::new()),
            }
        };
        self.joined.insert(key, permission);
        log::info!("Peer {} joined room {} ({:?})", self.addr, room_id, permission);

        let mut replies = vec![Frame::JoinAck {
            crdt,
            room_id: room_id.clone(),
            permission,
            server_version,
        }];
        // An empty yrs update encodes to two zero bytes.
        if diff.len() > 2 {
            replies.extend(self.fragmenter.fragment(crdt, &room_id, diff));
        }
        replies
    }

    async fn on_update(&mut self, crdt: CrdtType, room_id: &str, payload: Vec<u8>) {
        let key = (crdt, room_id.to_string());
        match self.joined.get(&key) {
            Some(Permission::Write) => {}
            Some(Permission::Read) => {
                log::warn!("Dropping update from read-only peer {} in room {}", self.addr, room_id);
                return;
            }
            None => {
                log::warn!("Dropping update from {} for unjoined room {}", self.addr, room_id);
                return;
            }
        }

        let (broadcast, frames) = {
            let mut rooms = self.shared.rooms.write().await;
            let Some(room) = rooms.get_mut(&key) else {
                return;
            };
            if let Some(doc) = &room.doc {
                let update = match Update::decode_v1(&payload) {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Malformed update from {} for room {}: {}", self.addr, room_id, e);
                        return;
                    }
                };
                let mut txn = doc.transact_mut();
                if let Err(e) = txn.apply_update(update) {
                    log::warn!("Failed to apply update for room {}: {}", room_id, e);
                    return;
                }
                room.dirty = true;
            }
            let frames = room.fragmenter.fragment(crdt, room_id, payload);
            (room.broadcast.clone(), frames)
        };

        for frame in frames {
            match frame.encode() {
                Ok(bytes) => {
                    broadcast.broadcast_except(&self.id, Arc::new(bytes)).await;
                }
                Err(e) => log::error!("Failed to encode {} frame: {}", frame.name(), e),
            }
        }
    }

    /// Leave every room this socket joined.
    async fn disconnect(&mut self) {
        for (key, _) in self.joined.drain() {
            self.shared.leave_room(&self.id, &key).await;
        }
    }
}

fn join_error(crdt: CrdtType, room_id: String, code: JoinErrorCode, reason: String) -> Frame {
    Frame::JoinError {
        crdt,
        room_id,
        code,
        reason,
    }
}

/// The reference relay server.
pub struct SimpleServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl SimpleServer {
    /// Bind the listening socket. Use port 0 for an ephemeral port.
    pub async fn bind(config: ServerConfig, hooks: impl ServerHooks) -> Result<Self, BoxError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Link server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                hooks: Arc::new(hooks),
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process ends.
    pub async fn run(self) -> Result<(), BoxError> {
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.serve(stop_rx).await
    }

    /// Serve on a background task.
    pub fn spawn(self) -> Result<ServerHandle, BoxError> {
        let addr = self.local_addr()?;
        let shared = self.shared.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = self.serve(stop_rx).await {
                log::error!("Link server stopped with error: {}", e);
            }
        });
        Ok(ServerHandle {
            addr,
            shared,
            stop: stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn serve(self, mut stop: watch::Receiver<bool>) -> Result<(), BoxError> {
        let mut save_timer = tokio::time::interval(self.shared.config.save_interval);
        save_timer.tick().await;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared, stop).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = save_timer.tick() => self.shared.save_dirty().await,
                _ = stop.changed() => break,
            }
        }

        self.shared.save_dirty().await;
        log::info!("Link server stopped");
        Ok(())
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(shared.config.broadcast_capacity);
    let mut peer = PeerConnection {
        id: Uuid::new_v4(),
        addr,
        shared: shared.clone(),
        outgoing: out_tx,
        joined: HashMap::new(),
        reassembler: Reassembler::new(),
        fragmenter: Fragmenter::new(shared.config.fragment_threshold),
    };

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        match Frame::decode(&bytes) {
                            Ok(frame) => {
                                for reply in peer.on_frame(frame).await {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                Some(data) = out_rx.recv() => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                }
                _ = stop.changed() => {
                    // Frames already queued for this peer still go out.
                    while let Ok(data) = out_rx.try_recv() {
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    peer.disconnect().await;
    shared.stats.write().await.active_connections -= 1;
    result
}

/// Handle to a server started with [`SimpleServer::spawn`].
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Number of peers in a room, zero when the room is not loaded.
    pub async fn room_peer_count(&self, crdt: CrdtType, room_id: &str) -> usize {
        let broadcast = {
            let rooms = self.shared.rooms.read().await;
            match rooms.get(&(crdt, room_id.to_string())) {
                Some(room) => room.broadcast.clone(),
                None => return 0,
            }
        };
        broadcast.peer_count().await
    }

    /// Full state of a loaded `Yjs` room.
    pub async fn snapshot(&self, room_id: &str) -> Option<Vec<u8>> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(&(CrdtType::Yjs, room_id.to_string()))?.snapshot()
    }

    /// Stop accepting, close every socket and flush dirty rooms.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use yrs::{GetString, Text, WriteTxn};

    /// Hooks recording saves, with a fixed stored document.
    #[derive(Default)]
    struct RecordingHooks {
        stored: Option<Vec<u8>>,
        saved: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
    }

    impl ServerHooks for RecordingHooks {
        fn authenticate(&self, _: &str, _: CrdtType, auth: &[u8]) -> BoxFuture<'static, Option<Permission>> {
            let permission = match auth {
                b"deny" => None,
                b"readonly" => Some(Permission::Read),
                _ => Some(Permission::Write),
            };
            Box::pin(async move { permission })
        }

        fn load_document(&self, _: &str, _: CrdtType) -> BoxFuture<'static, Option<Vec<u8>>> {
            let stored = self.stored.clone();
            Box::pin(async move { stored })
        }

        fn save_document(&self, room_id: &str, _: CrdtType, data: Vec<u8>) -> BoxFuture<'static, ()> {
            let saved = self.saved.clone();
            let room_id = room_id.to_string();
            Box::pin(async move {
                saved.lock().unwrap().push((room_id, data));
            })
        }
    }

    fn shared(hooks: RecordingHooks) -> Arc<Shared> {
        Arc::new(Shared {
            config: ServerConfig::default(),
            hooks: Arc::new(hooks),
            rooms: RwLock::new(HashMap::new()),
            stats: RwLock::new(ServerStats::default()),
        })
    }

    fn peer(shared: &Arc<Shared>) -> (PeerConnection, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(shared.config.broadcast_capacity);
        let peer = PeerConnection {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
            shared: shared.clone(),
            outgoing: tx,
            joined: HashMap::new(),
            reassembler: Reassembler::new(),
            fragmenter: Fragmenter::new(shared.config.fragment_threshold),
        };
        (peer, rx)
    }

    fn join(auth: &[u8]) -> Frame {
        Frame::Join {
            crdt: CrdtType::Yjs,
            room_id: "doc1".into(),
            auth: auth.to_vec(),
            version: StateVector::default().encode_v1(),
        }
    }

    fn text_update(text: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        let mut txn = doc.transact_mut();
        let field = txn.get_or_insert_text("content");
        field.insert(&mut txn, 0, text);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[tokio::test]
    async fn test_join_acks_and_sends_missing_state() {
        let shared = shared(RecordingHooks {
            stored: Some(text_update("stored")),
            ..Default::default()
        });
        let (mut alice, _rx) = peer(&shared);

        let replies = alice.on_frame(join(b"write")).await;
        assert!(matches!(
            replies[0],
            Frame::JoinAck { permission: Permission::Write, .. }
        ));
        let Frame::Update { payload, .. } = &replies[1] else {
            panic!("expected catch-up update, got {:?}", replies[1]);
        };

        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(payload).unwrap()).unwrap();
        }
        let mut txn = doc.transact_mut();
        assert_eq!(txn.get_or_insert_text("content").get_string(&txn), "stored");
    }

    #[tokio::test]
    async fn test_join_denied_and_loro_rejected() {
        let shared = shared(RecordingHooks::default());
        let (mut alice, _rx) = peer(&shared);

        let replies = alice.on_frame(join(b"deny")).await;
        assert!(matches!(
            replies[0],
            Frame::JoinError { code: JoinErrorCode::AuthFailed, .. }
        ));

        let replies = alice
            .on_frame(Frame::Join {
                crdt: CrdtType::Loro,
                room_id: "doc1".into(),
                auth: vec![],
                version: vec![],
            })
            .await;
        assert!(matches!(
            replies[0],
            Frame::JoinError { code: JoinErrorCode::UnsupportedCrdt, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_fans_out_to_others() {
        let shared = shared(RecordingHooks::default());
        let (mut alice, mut alice_rx) = peer(&shared);
        let (mut bob, mut bob_rx) = peer(&shared);
        alice.on_frame(join(b"write")).await;
        bob.on_frame(join(b"write")).await;

        let payload = text_update("hi");
        alice
            .on_frame(Frame::Update {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                payload: payload.clone(),
            })
            .await;

        let frame = Frame::decode(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            Frame::Update {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                payload,
            }
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_only_updates_dropped() {
        let shared = shared(RecordingHooks::default());
        let (mut reader, _reader_rx) = peer(&shared);
        let (mut writer, mut writer_rx) = peer(&shared);
        reader.on_frame(join(b"readonly")).await;
        writer.on_frame(join(b"write")).await;

        reader
            .on_frame(Frame::Update {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                payload: text_update("nope"),
            })
            .await;
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_leave_saves_dirty_room() {
        let hooks = RecordingHooks::default();
        let saved = hooks.saved.clone();
        let shared = shared(hooks);
        let (mut alice, _rx) = peer(&shared);
        alice.on_frame(join(b"write")).await;
        alice
            .on_frame(Frame::Update {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                payload: text_update("keep me"),
            })
            .await;

        let replies = alice
            .on_frame(Frame::Leave { crdt: CrdtType::Yjs, room_id: "doc1".into() })
            .await;
        assert_eq!(replies, vec![Frame::LeaveAck { crdt: CrdtType::Yjs, room_id: "doc1".into() }]);
        assert_eq!(saved.lock().unwrap().len(), 1);
        assert_eq!(saved.lock().unwrap()[0].0, "doc1");
        assert!(shared.rooms.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let shared = shared(RecordingHooks::default());
        let (mut alice, _rx) = peer(&shared);
        assert_eq!(
            alice.on_frame(Frame::Ping { sent_at: 77 }).await,
            vec![Frame::Pong { echo_of: 77 }]
        );
    }

    #[tokio::test]
    async fn test_fragments_for_unjoined_room_ignored() {
        let shared = shared(RecordingHooks::default());
        let (mut alice, _rx) = peer(&shared);

        let replies = alice
            .on_frame(Frame::FragmentHeader {
                crdt: CrdtType::Yjs,
                room_id: "elsewhere".into(),
                batch_id: 1,
                expected_parts: 1,
                total_bytes: 1,
            })
            .await;
        assert!(replies.is_empty());
        assert_eq!(alice.reassembler.pending_batches(), 0);
    }

    #[tokio::test]
    async fn test_oversized_fragment_header_is_harmless() {
        let shared = shared(RecordingHooks::default());
        let (mut alice, _rx) = peer(&shared);
        alice.on_frame(join(b"write")).await;

        alice
            .on_frame(Frame::FragmentHeader {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                batch_id: 1,
                expected_parts: 1,
                total_bytes: u64::MAX,
            })
            .await;
        let replies = alice
            .on_frame(Frame::Fragment {
                crdt: CrdtType::Yjs,
                room_id: "doc1".into(),
                batch_id: 1,
                index: 0,
                bytes: vec![1, 2, 3],
            })
            .await;
        assert!(replies.is_empty());
        assert_eq!(alice.reassembler.pending_batches(), 0);

        // The connection keeps serving.
        assert_eq!(
            alice.on_frame(Frame::Ping { sent_at: 1 }).await,
            vec![Frame::Pong { echo_of: 1 }]
        );
    }
}
