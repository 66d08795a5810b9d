//! Connection manager: one background task per client.
//!
//! The task exclusively owns the socket, the room registry, the ping
//! monitor and every timer. Handles talk to it through [`Command`]s and
//! get answers back on oneshot channels; status and latency are published
//! on watch channels.
//!
//! ```text
//!              ┌──────────── Connect / online ────────────┐
//!              ▼                                          │
//!        ┌────────────┐   socket open    ┌───────────┐    │
//!  new ─►│ Connecting │ ───────────────► │ Connected │    │
//!        └────────────┘                  └───────────┘    │
//!              │ attempt failed               │ closed, liveness
//!              ▼                              ▼ failure, offline
//!        ┌──────────────────────────────────────────┐     │
//!        │ Disconnected (backoff timer if retrying) │ ────┘
//!        └──────────────────────────────────────────┘
//! ```
//!
//! Every timer is a deadline recomputed on each loop turn, so nothing can
//! be scheduled twice. A socket or connection attempt that is replaced is
//! simply dropped; its channels go with it.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::adaptor::CrdtDocAdaptor;
use crate::backoff::ReconnectPolicy;
use crate::config::{ClientConfig, WsCloseHook};
use crate::error::{LinkError, TransportError};
use crate::fragment::Fragmenter;
use crate::listeners::Listeners;
use crate::network::NetworkEvent;
use crate::ping::{PingMonitor, PingWaiters, TickAction};
use crate::protocol::{CrdtType, Frame};
use crate::rooms::{JoinReply, RoomRegistry, RoomShared, VersionReply};
use crate::router::{MessageRouter, Routed};
use crate::transport::{Connector, Socket, SocketEvent};

/// Client connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Requests from client and room handles to the connection task.
pub(crate) enum Command {
    Connect,
    Close,
    Destroy,
    Ping {
        timeout: Duration,
        reply: oneshot::Sender<Result<Duration, LinkError>>,
    },
    Join {
        room_id: String,
        adaptor: Arc<dyn CrdtDocAdaptor>,
        auth: Vec<u8>,
        shared: Arc<RoomShared>,
        reply: JoinReply,
    },
    SendUpdate {
        room_id: String,
        payload: Vec<u8>,
    },
    Leave {
        room_id: String,
        cleanup: bool,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Cleanup {
        room_id: String,
        crdt: CrdtType,
    },
    WaitServerVersion {
        room_id: String,
        reply: VersionReply,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

type ConnectAttempt = BoxFuture<'static, Result<Socket, TransportError>>;

pub(crate) struct ConnectionTask {
    url: String,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    status: watch::Sender<ConnectionStatus>,
    latency: watch::Sender<Option<Duration>>,
    status_listeners: Listeners<ConnectionStatus>,
    latency_listeners: Listeners<Duration>,
    on_ws_close: Option<WsCloseHook>,

    socket: Option<Socket>,
    connecting: Option<ConnectAttempt>,
    should_reconnect: bool,
    attempts: u32,
    reconnect_at: Option<Instant>,
    policy: ReconnectPolicy,
    rng: StdRng,

    ping: PingMonitor,
    ping_waiters: PingWaiters,
    rooms: RoomRegistry,
    router: MessageRouter,
    fragmenter: Fragmenter,
}

/// Shared ends of the channels a task publishes on.
pub(crate) struct TaskChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    pub status: watch::Sender<ConnectionStatus>,
    pub latency: watch::Sender<Option<Duration>>,
    pub status_listeners: Listeners<ConnectionStatus>,
    pub latency_listeners: Listeners<Duration>,
}

impl ConnectionTask {
    pub(crate) fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        channels: TaskChannels,
    ) -> Self {
        Self {
            url: config.url.clone(),
            connector,
            commands: channels.commands,
            network: channels.network,
            status: channels.status,
            latency: channels.latency,
            status_listeners: channels.status_listeners,
            latency_listeners: channels.latency_listeners,
            on_ws_close: config.on_ws_close.clone(),
            socket: None,
            connecting: None,
            should_reconnect: true,
            attempts: 0,
            reconnect_at: None,
            policy: config.reconnect_policy(),
            rng: StdRng::from_entropy(),
            ping: PingMonitor::new(config.ping_interval, !config.disable_ping),
            ping_waiters: PingWaiters::new(),
            rooms: RoomRegistry::new(),
            router: MessageRouter::new(),
            fragmenter: Fragmenter::new(config.fragment_threshold),
        }
    }

    /// Drive the client until it is destroyed or every handle is dropped.
    pub(crate) async fn run(mut self) {
        self.start_connect();
        loop {
            let ping_at = self.ping.next_deadline();
            let ping_expiry = self.ping_waiters.next_deadline();
            let reconnect_at = self.reconnect_at;

            let flow = tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        log::debug!("All client handles dropped, shutting down");
                        self.destroy();
                        Flow::Exit
                    }
                },
                event = next_socket_event(&mut self.socket) => {
                    self.on_socket_event(event);
                    Flow::Continue
                }
                result = next_attempt_result(&mut self.connecting) => {
                    self.on_attempt_finished(result);
                    Flow::Continue
                }
                event = next_network_event(&mut self.network) => {
                    self.on_network_event(event);
                    Flow::Continue
                }
                _ = sleep_until_opt(ping_expiry) => {
                    self.ping_waiters.expire(Instant::now());
                    Flow::Continue
                }
                _ = sleep_until_opt(ping_at) => {
                    self.on_ping_tick();
                    Flow::Continue
                }
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                    Flow::Continue
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }
        log::info!("Client for {} stopped", self.url);
    }

    fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect => {
                self.should_reconnect = true;
                if self.socket.is_none() && self.connecting.is_none() {
                    self.start_connect();
                }
            }
            Command::Close => self.close(),
            Command::Destroy => {
                self.destroy();
                return Flow::Exit;
            }
            Command::Ping { timeout, reply } => {
                if self.socket.is_none() {
                    let _ = reply.send(Err(LinkError::NotConnected));
                    return Flow::Continue;
                }
                let now = Instant::now();
                let sent_at = self.ping.stamp(now);
                self.send_frame(&Frame::Ping { sent_at });
                self.ping_waiters.add(now, timeout, reply);
            }
            Command::Join {
                room_id,
                adaptor,
                auth,
                shared,
                reply,
            } => {
                let Some(join) = self.rooms.register(&room_id, adaptor, auth, shared, reply) else {
                    return Flow::Continue;
                };
                if self.socket.is_some() {
                    self.send_frame(&join);
                } else {
                    log::debug!("Deferring join of room {} until connected", room_id);
                }
            }
            Command::SendUpdate { room_id, payload } => {
                let connected = self.socket.is_some();
                match self.rooms.queue_update(&room_id, payload, connected) {
                    Ok(Some(frame)) => self.send_frames(vec![frame]),
                    Ok(None) => {}
                    Err(e) => log::debug!("Dropping update: {}", e),
                }
            }
            Command::Leave {
                room_id,
                cleanup,
                reply,
            } => {
                self.router.discard_room(&room_id);
                match self.rooms.leave(&room_id, cleanup) {
                    Some(frame) => {
                        if self.socket.is_some() {
                            self.send_frame(&frame);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    None => {
                        let _ = reply.send(Err(LinkError::RoomLeft { room_id }));
                    }
                }
            }
            Command::Cleanup { room_id, crdt } => {
                self.router.discard_room(&room_id);
                self.rooms.cleanup(&room_id, crdt);
            }
            Command::WaitServerVersion { room_id, reply } => {
                self.rooms.wait_server_version(&room_id, reply);
            }
        }
        Flow::Continue
    }

    fn start_connect(&mut self) {
        self.reconnect_at = None;
        log::info!("Connecting to {} (attempt {})", self.url, self.attempts + 1);
        self.connecting = Some(self.connector.connect());
        self.set_status(ConnectionStatus::Connecting);
    }

    fn on_attempt_finished(&mut self, result: Result<Socket, TransportError>) {
        self.connecting = None;
        match result {
            Ok(socket) => self.on_open(socket),
            Err(e) => {
                log::warn!("Connection attempt to {} failed: {}", self.url, e);
                self.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn on_open(&mut self, socket: Socket) {
        self.socket = Some(socket);
        self.attempts = 0;
        self.router.reset();
        self.ping.start(Instant::now());
        self.set_status(ConnectionStatus::Connected);
        log::info!("Connected to {}", self.url);

        let frames = self.rooms.rejoin_all();
        self.send_frames(frames);
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message(bytes) => {
                if let Some(routed) = self.router.route_bytes(&bytes) {
                    self.on_routed(routed);
                }
            }
            SocketEvent::Closed(reason) => self.on_connection_lost(TransportError::Closed(reason).into()),
        }
    }

    fn on_routed(&mut self, routed: Routed) {
        match routed {
            Routed::Pong { echo_of } => {
                let latency = self.ping.on_pong(echo_of, Instant::now());
                self.ping_waiters.resolve_all(latency);
                self.latency.send_replace(Some(latency));
                self.latency_listeners.emit(latency);
            }
            Routed::PingRequest { sent_at } => self.send_frame(&Frame::Pong { echo_of: sent_at }),
            Routed::JoinAck {
                room_id,
                permission,
                server_version,
            } => {
                let frames = self.rooms.on_join_ack(&room_id, permission, server_version);
                self.send_frames(frames);
            }
            Routed::JoinError {
                room_id,
                code,
                reason,
            } => {
                self.router.discard_room(&room_id);
                self.rooms.on_join_error(&room_id, code, &reason);
            }
            Routed::Update {
                crdt,
                room_id,
                payload,
            } => self.rooms.apply_update(crdt, &room_id, &payload),
            Routed::LeaveAck { room_id } => log::debug!("Server confirmed leave of room {}", room_id),
        }
    }

    fn on_network_event(&mut self, event: Option<NetworkEvent>) {
        match event {
            Some(NetworkEvent::Online) => {
                if self.should_reconnect && self.socket.is_none() && self.connecting.is_none() {
                    log::info!("Network online, reconnecting now");
                    self.start_connect();
                }
            }
            Some(NetworkEvent::Offline) => {
                if self.socket.is_some() || self.connecting.is_some() {
                    log::info!("Network offline, dropping connection");
                    self.connecting = None;
                    self.on_connection_lost(LinkError::ConnectionLost("network offline".into()));
                }
            }
            None => {
                log::debug!("Network signal source gone");
                self.network = None;
            }
        }
    }

    fn on_ping_tick(&mut self) {
        match self.ping.on_tick(Instant::now()) {
            Some(TickAction::SendPing(sent_at)) => self.send_frame(&Frame::Ping { sent_at }),
            Some(TickAction::LivenessFailure { missed }) => {
                self.on_connection_lost(LinkError::LivenessFailure { missed });
            }
            None => {}
        }
    }

    fn on_connection_lost(&mut self, err: LinkError) {
        log::warn!("Connection to {} lost: {}", self.url, err);
        let had_socket = self.teardown_socket(LinkError::ConnectionLost(err.to_string()));
        if had_socket {
            if let Some(hook) = &self.on_ws_close {
                hook.call();
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect {
            return;
        }
        let delay = self.policy.delay(self.attempts, &mut self.rng);
        self.attempts = self.attempts.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        log::info!("Reconnecting to {} in {:?} (attempt {})", self.url, delay, self.attempts);
    }

    /// Drop the socket and everything tied to it. Rooms stay registered.
    /// Returns whether a socket was open.
    fn teardown_socket(&mut self, waiter_err: LinkError) -> bool {
        let had_socket = self.socket.take().is_some();
        if had_socket {
            log::debug!("Socket to {} detached", self.url);
        }
        self.ping.stop();
        self.ping_waiters.reject_all(waiter_err);
        self.router.reset();
        had_socket
    }

    fn close(&mut self) {
        log::info!("Closing connection to {}", self.url);
        self.should_reconnect = false;
        self.reconnect_at = None;
        self.connecting = None;
        self.teardown_socket(LinkError::ConnectionLost("closed by client".into()));
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn destroy(&mut self) {
        log::info!("Destroying client for {}", self.url);
        self.should_reconnect = false;
        self.reconnect_at = None;
        self.connecting = None;
        self.teardown_socket(LinkError::ClientDestroyed);
        self.rooms.reject_all(LinkError::ClientDestroyed);
        self.network = None;
        self.status_listeners.clear();
        self.latency_listeners.clear();
        self.set_status(ConnectionStatus::Disconnected);
        self.commands.close();
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if *self.status.borrow() == status {
            return;
        }
        log::debug!("Status {:?} -> {:?}", *self.status.borrow(), status);
        self.status.send_replace(status);
        self.status_listeners.emit(status);
    }

    /// Write frames in order, splitting oversized updates.
    fn send_frames(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Update {
                    crdt,
                    room_id,
                    payload,
                } => {
                    for part in self.fragmenter.fragment(crdt, &room_id, payload) {
                        self.send_frame(&part);
                    }
                }
                other => self.send_frame(&other),
            }
        }
    }

    fn send_frame(&self, frame: &Frame) {
        let Some(socket) = &self.socket else {
            log::trace!("No socket, dropping {} frame", frame.name());
            return;
        };
        match frame.encode() {
            Ok(bytes) => {
                log::trace!("Outbound {} frame ({} bytes)", frame.name(), bytes.len());
                if !socket.send(bytes) {
                    log::debug!("Socket writer gone, {} frame not sent", frame.name());
                }
            }
            Err(e) => log::error!("Failed to encode {} frame: {}", frame.name(), e),
        }
    }
}

async fn next_socket_event(socket: &mut Option<Socket>) -> SocketEvent {
    match socket {
        Some(socket) => socket.recv().await,
        None => pending().await,
    }
}

async fn next_attempt_result(connecting: &mut Option<ConnectAttempt>) -> Result<Socket, TransportError> {
    match connecting {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn next_network_event(
    network: &mut Option<mpsc::UnboundedReceiver<NetworkEvent>>,
) -> Option<NetworkEvent> {
    match network {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
