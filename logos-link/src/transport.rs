//! Socket seam between the connection task and the network.
//!
//! A [`Connector`] opens a [`Socket`], which is nothing more than a pair of
//! channels:
//! ```text
//!            outgoing (Vec<u8>)             ┌──────────────┐
//! connection ──────────────────► writer ──► │              │
//!    task                                   │  WebSocket   │
//!            ◄────────────────── reader ◄── │              │
//!            incoming (SocketEvent)         └──────────────┘
//! ```
//! Dropping the `Socket` detaches it: the writer closes the sink once the
//! outgoing channel is gone and the reader stops once nobody listens.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(Vec<u8>),
    /// The socket is gone. No further events follow.
    Closed(String),
}

/// An open, message-oriented socket.
#[derive(Debug)]
pub struct Socket {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Socket {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// Queue one binary message. Returns false when the writer is gone.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.outgoing.send(bytes).is_ok()
    }

    /// Next event; a vanished reader counts as a close.
    pub async fn recv(&mut self) -> SocketEvent {
        self.incoming
            .recv()
            .await
            .unwrap_or_else(|| SocketEvent::Closed("transport dropped".into()))
    }
}

/// Opens sockets for the connection task.
///
/// Each call is one connection attempt. The returned future may be
/// dropped at any point, which abandons the attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Socket, TransportError>>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Socket, TransportError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                        log::debug!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward WebSocket messages until either side goes away
            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        _ = in_tx.closed() => break None,
                        msg = ws_reader.next() => match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let _ = in_tx.send(SocketEvent::Message(data.into()));
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break Some(frame.map_or_else(
                                    || "closed by peer".to_string(),
                                    |f| format!("closed by peer: {}", f.reason.as_str()),
                                ));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break Some("stream ended".to_string()),
                        },
                    }
                };
                if let Some(reason) = reason {
                    let _ = in_tx.send(SocketEvent::Closed(reason));
                }
            });

            log::info!("WebSocket connected to {}", url);
            Ok(Socket::new(out_tx, in_rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_channels() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let mut socket = Socket::new(out_tx, in_rx);

        assert!(socket.send(vec![1, 2]));
        assert_eq!(out_rx.recv().await, Some(vec![1, 2]));

        in_tx.send(SocketEvent::Message(vec![3])).unwrap();
        assert_eq!(socket.recv().await, SocketEvent::Message(vec![3]));

        drop(in_tx);
        assert!(matches!(socket.recv().await, SocketEvent::Closed(_)));

        drop(out_rx);
        assert!(!socket.send(vec![4]));
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        // Port 1 is never listening in the test environment.
        let connector = WsConnector::new("ws://127.0.0.1:1");
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
