//! # logos-link: Multiplexed collaboration rooms over one WebSocket
//!
//! A single client connection carries any number of document rooms. The
//! client keeps the socket alive with application-level pings, reconnects
//! with jittered exponential backoff and rejoins every room on reconnect.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands  ┌────────────────┐   frames   ┌──────────────┐
//! │ CollabClient │ ─────────► │ ConnectionTask │ ◄────────► │ SimpleServer │
//! │  RoomHandle  │ ◄───────── │  (one socket)  │  WebSocket │  (relay)     │
//! └──────────────┘   status   └───────┬────────┘            └──────┬───────┘
//!                                     │                            │
//!                    ┌────────────────┼───────────────┐            ▼
//!                    ▼                ▼               ▼     ┌───────────────┐
//!             ┌─────────────┐ ┌──────────────┐ ┌───────────┐│ BroadcastGroup│
//!             │RoomRegistry │ │MessageRouter │ │PingMonitor││ (fan-out)     │
//!             │ + adaptors  │ │+ Reassembler │ │ + backoff │└───────────────┘
//!             └─────────────┘ └──────────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Frame`)
//! - [`fragment`]: Splitting and reassembly of oversized updates
//! - [`connection`]: The socket-owning state machine
//! - [`client`]: Public client facade and room handles
//! - [`rooms`]: Per-room join lifecycle and update buffering
//! - [`adaptor`]: Document adaptor seam, with a Yrs implementation
//! - [`server`]: Reference relay server
//! - [`broadcast`]: Room-based fan-out on the server

pub mod adaptor;
pub mod backoff;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod listeners;
pub mod network;
pub mod ping;
pub mod protocol;
pub mod rooms;
pub mod router;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use adaptor::{CrdtDocAdaptor, YrsDocAdaptor};
pub use backoff::ReconnectPolicy;
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{CollabClient, JoinOptions, RoomHandle};
pub use config::{ClientConfig, ServerConfig, WsCloseHook};
pub use connection::ConnectionStatus;
pub use error::{AdaptorError, LinkError, ProtocolError, TransportError};
pub use fragment::{Fragmenter, Reassembler};
pub use listeners::Subscription;
pub use network::{NetworkEvent, NetworkEvents};
pub use protocol::{CrdtType, Frame, JoinErrorCode, Permission};
pub use server::{AllowAllHooks, ServerHandle, ServerHooks, ServerStats, SimpleServer};
pub use transport::{Connector, Socket, SocketEvent, WsConnector};
