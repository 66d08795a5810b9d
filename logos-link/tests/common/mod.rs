//! In-memory socket pair for driving the client without a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use logos_link::{Connector, Frame, Socket, SocketEvent, TransportError};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

/// Connector half, handed to the client.
pub struct MockConnector {
    reachable: Arc<AtomicBool>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Test half: controls reachability and accepts sockets.
pub struct MockServer {
    reachable: Arc<AtomicBool>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

pub fn mock_network(reachable: bool) -> (MockConnector, MockServer) {
    let reachable = Arc::new(AtomicBool::new(reachable));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            reachable: reachable.clone(),
            attempts: attempts.clone(),
            peers: tx,
        },
        MockServer {
            reachable,
            attempts,
            peers: rx,
        },
    )
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Socket, TransportError>> {
        self.attempts.lock().unwrap().push(Instant::now());
        if !self.reachable.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::Connect("unreachable".into())) });
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(MockPeer {
            written: out_rx,
            events: in_tx,
        });
        Box::pin(async move { Ok(Socket::new(out_tx, in_rx)) })
    }
}

impl MockServer {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Times at which the client started a connection attempt.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    /// Next socket the client opened.
    pub async fn accept(&mut self) -> MockPeer {
        timeout(Duration::from_secs(60), self.peers.recv())
            .await
            .expect("client never connected")
            .expect("connector dropped")
    }
}

/// Server end of one client socket.
pub struct MockPeer {
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MockPeer {
    /// Next frame written by the client.
    pub async fn next_frame(&mut self) -> Frame {
        let bytes = timeout(Duration::from_secs(5), self.written.recv())
            .await
            .expect("no frame written")
            .expect("socket dropped by client");
        Frame::decode(&bytes).unwrap()
    }

    /// Next frame that is not a periodic ping.
    pub async fn next_non_ping(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if !matches!(frame, Frame::Ping { .. }) {
                return frame;
            }
        }
    }

    /// Frames already written, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(bytes) = self.written.try_recv() {
            frames.push(Frame::decode(&bytes).unwrap());
        }
        frames
    }

    pub fn send(&self, frame: &Frame) {
        let _ = self.events.send(SocketEvent::Message(frame.encode().unwrap()));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.events.send(SocketEvent::Closed(reason.into()));
    }
}

/// Let spawned tasks run without advancing the clock much.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
