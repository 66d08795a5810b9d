//! Public client facade.
//!
//! A [`CollabClient`] owns one background connection task and multiplexes
//! any number of rooms over its socket. Joining a room yields a
//! [`RoomHandle`], which only holds a weak reference back to the task: a
//! handle never keeps a destroyed client alive.
//!
//! ```text
//! CollabClient ──commands──► ConnectionTask ◄──weak── RoomHandle
//!      ▲                          │
//!      └──── status / latency ────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::adaptor::CrdtDocAdaptor;
use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionStatus, ConnectionTask, TaskChannels};
use crate::error::LinkError;
use crate::listeners::{Listeners, Subscription};
use crate::network::NetworkEvent;
use crate::protocol::{validate_room_id, CrdtType, Permission};
use crate::rooms::RoomShared;
use crate::transport::{Connector, WsConnector};

/// Parameters of [`CollabClient::join`].
pub struct JoinOptions {
    pub room_id: String,
    pub adaptor: Arc<dyn CrdtDocAdaptor>,
    /// Opaque token handed to the server's auth policy
    pub auth: Vec<u8>,
}

impl JoinOptions {
    pub fn new(room_id: impl Into<String>, adaptor: Arc<dyn CrdtDocAdaptor>) -> Self {
        Self {
            room_id: room_id.into(),
            adaptor,
            auth: Vec::new(),
        }
    }

    pub fn with_auth(mut self, auth: impl Into<Vec<u8>>) -> Self {
        self.auth = auth.into();
        self
    }
}

/// Multiplexed collaboration client.
///
/// Construction starts connecting right away and must happen inside a
/// tokio runtime. Dropping the client destroys it.
pub struct CollabClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    latency: watch::Receiver<Option<Duration>>,
    status_listeners: Listeners<ConnectionStatus>,
    latency_listeners: Listeners<Duration>,
    ping_timeout: Duration,
}

impl CollabClient {
    /// Client over a real WebSocket to `config.url`.
    pub fn new(config: ClientConfig) -> Result<Self, LinkError> {
        let connector = WsConnector::new(config.url.clone());
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClientConfig, connector: impl Connector) -> Result<Self, LinkError> {
        Self::spawn(config, Arc::new(connector), None)
    }

    /// Like [`with_connector`](Self::with_connector), also observing host
    /// network online/offline events.
    pub fn with_network(
        config: ClientConfig,
        connector: impl Connector,
        network: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Result<Self, LinkError> {
        Self::spawn(config, Arc::new(connector), Some(network))
    }

    fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    ) -> Result<Self, LinkError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (latency_tx, latency_rx) = watch::channel(None);
        let status_listeners = Listeners::new();
        let latency_listeners = Listeners::new();

        let task = ConnectionTask::new(
            &config,
            connector,
            TaskChannels {
                commands: cmd_rx,
                network,
                status: status_tx,
                latency: latency_tx,
                status_listeners: status_listeners.clone(),
                latency_listeners: latency_listeners.clone(),
            },
        );
        tokio::spawn(task.run());

        Ok(Self {
            commands: cmd_tx,
            status: status_rx,
            latency: latency_rx,
            status_listeners,
            latency_listeners,
            ping_timeout: config.ping_timeout,
        })
    }

    fn send(&self, cmd: Command) -> Result<(), LinkError> {
        self.commands.send(cmd).map_err(|_| LinkError::ClientDestroyed)
    }

    /// Connect (re-enabling automatic reconnects) and wait until open.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.send(Command::Connect)?;
        self.wait_connected().await
    }

    /// Stop reconnecting and close the socket. Rooms stay registered and
    /// rejoin on the next [`connect`](Self::connect).
    pub fn close(&self) {
        let _ = self.send(Command::Close);
    }

    /// Tear everything down. Outstanding operations fail with
    /// [`LinkError::ClientDestroyed`]. Idempotent.
    pub fn destroy(&self) {
        let _ = self.send(Command::Destroy);
    }

    pub async fn wait_connected(&self) -> Result<(), LinkError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::ClientDestroyed)
    }

    /// Round trip to the server. Fails fast when not connected.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Ping {
            timeout: timeout.unwrap_or(self.ping_timeout),
            reply: tx,
        })?;
        rx.await.map_err(|_| LinkError::ClientDestroyed)?
    }

    /// Join a room. Resolves once the server acknowledges the join; if the
    /// client is offline the join is sent on the next connection.
    pub async fn join(&self, options: JoinOptions) -> Result<RoomHandle, LinkError> {
        let JoinOptions {
            room_id,
            adaptor,
            auth,
        } = options;
        if let Err(e) = validate_room_id(&room_id) {
            return Err(LinkError::InvalidRoomId {
                room_id,
                reason: e.to_string(),
            });
        }

        let crdt = adaptor.crdt_type();
        let shared = RoomShared::new();
        let (tx, rx) = oneshot::channel();
        self.send(Command::Join {
            room_id: room_id.clone(),
            adaptor,
            auth,
            shared: shared.clone(),
            reply: tx,
        })?;
        let accepted = rx.await.map_err(|_| LinkError::ClientDestroyed)??;

        Ok(RoomHandle {
            room_id,
            crdt,
            permission: accepted.permission,
            commands: self.commands.downgrade(),
            shared,
        })
    }

    /// Forget a room locally without telling the server.
    pub fn cleanup_room(&self, room_id: &str, crdt: CrdtType) {
        let _ = self.send(Command::Cleanup {
            room_id: room_id.to_string(),
            crdt,
        });
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Latest measured round trip, if any pong arrived yet.
    pub fn get_latency(&self) -> Option<Duration> {
        *self.latency.borrow()
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.status_listeners.subscribe(callback)
    }

    pub fn on_latency<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.latency_listeners.subscribe(callback)
    }
}

/// A joined room.
#[derive(Debug)]
pub struct RoomHandle {
    room_id: String,
    crdt: CrdtType,
    permission: Permission,
    commands: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<RoomShared>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn crdt_type(&self) -> CrdtType {
        self.crdt
    }

    /// Permission granted at the first join.
    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_left(&self) -> bool {
        self.shared.is_left()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Command>, LinkError> {
        if self.shared.is_left() {
            return Err(LinkError::RoomLeft {
                room_id: self.room_id.clone(),
            });
        }
        self.commands.upgrade().ok_or(LinkError::ClientDestroyed)
    }

    /// Send a local update. Buffered while the room cannot send and
    /// flushed in order once it can.
    pub fn send_update(&self, payload: Vec<u8>) -> Result<(), LinkError> {
        self.sender()?
            .send(Command::SendUpdate {
                room_id: self.room_id.clone(),
                payload,
            })
            .map_err(|_| LinkError::ClientDestroyed)
    }

    pub async fn leave(&self) -> Result<(), LinkError> {
        self.leave_inner(false).await
    }

    /// Leave and let the adaptor release its resources.
    pub async fn destroy(&self) -> Result<(), LinkError> {
        self.leave_inner(true).await
    }

    async fn leave_inner(&self, cleanup: bool) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(Command::Leave {
                room_id: self.room_id.clone(),
                cleanup,
                reply: tx,
            })
            .map_err(|_| LinkError::ClientDestroyed)?;
        rx.await.map_err(|_| LinkError::ClientDestroyed)?
    }

    /// Resolve once the local document has caught up with the latest
    /// server version seen for this room.
    pub async fn wait_for_reaching_server_version(&self) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(Command::WaitServerVersion {
                room_id: self.room_id.clone(),
                reply: tx,
            })
            .map_err(|_| LinkError::ClientDestroyed)?;
        rx.await.map_err(|_| LinkError::ClientDestroyed)?
    }
}
