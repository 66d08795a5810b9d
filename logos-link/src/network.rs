//! Optional host network signal.
//!
//! Platforms that know when the network goes up or down can feed those
//! edges into the client through a [`NetworkEvents`] handle. Without one
//! the client relies on socket errors alone.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Reconnect now instead of waiting for the backoff timer.
    Online,
    /// The socket is known dead; drop it.
    Offline,
}

/// Sending side of the network signal.
#[derive(Debug, Clone)]
pub struct NetworkEvents {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl NetworkEvents {
    /// Create a signal source and the receiver the client consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn online(&self) -> bool {
        self.emit(NetworkEvent::Online)
    }

    pub fn offline(&self) -> bool {
        self.emit(NetworkEvent::Offline)
    }

    /// Returns false once the client stopped observing.
    pub fn emit(&self, event: NetworkEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
