//! Per-room fan-out to N-1 peers.
//!
//! Each peer registers a bounded queue of pre-encoded frames; the
//! connection task of that peer drains it into its socket. Frames are
//! encoded once and shared as `Arc<Vec<u8>>` across all receivers.
//! A peer whose queue is full is lagging and misses the frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Permission;

/// Queue feeding one peer's socket.
pub type PeerSender = mpsc::Sender<Arc<Vec<u8>>>;

/// Default number of frames buffered per peer.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Peer {
    permission: Permission,
    sender: PeerSender,
}

/// The peers of one room.
#[derive(Default)]
pub struct BroadcastGroup {
    peers: RwLock<HashMap<Uuid, Peer>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer.
    pub async fn add_peer(&self, peer_id: Uuid, permission: Permission, sender: PeerSender) {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, Peer { permission, sender });
    }

    /// Remove a peer. Returns whether it was present.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id).is_some()
    }

    pub async fn permission_of(&self, peer_id: &Uuid) -> Option<Permission> {
        self.peers.read().await.get(peer_id).map(|p| p.permission)
    }

    /// Queue `encoded` for every peer except `sender`.
    ///
    /// Returns the number of peers that received it. Full queues and queues
    /// that are gone are counted as drops; a closed peer is removed by its
    /// connection task.
    pub async fn broadcast_except(&self, sender: &Uuid, encoded: Arc<Vec<u8>>) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for (id, peer) in peers.iter() {
            if id == sender {
                continue;
            }
            match peer.sender.try_send(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Peer {} is lagging, frame dropped", id);
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Get broadcast statistics (lock-free counters plus peer count).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new();
        let peer_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);

        group.add_peer(peer_id, Permission::Write, tx).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);
        assert_eq!(group.permission_of(&peer_id).await, Some(Permission::Write));

        assert!(group.remove_peer(&peer_id).await);
        assert!(!group.remove_peer(&peer_id).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let group = BroadcastGroup::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        let (carol_tx, mut carol_rx) = mpsc::channel(8);
        group.add_peer(alice, Permission::Write, alice_tx).await;
        group.add_peer(bob, Permission::Read, bob_tx).await;
        group.add_peer(carol, Permission::Write, carol_tx).await;

        let delivered = group.broadcast_except(&alice, Arc::new(vec![1, 2, 3])).await;
        assert_eq!(delivered, 2);

        assert_eq!(*bob_rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*carol_rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_stats_count_drops() {
        let group = BroadcastGroup::new();
        let sender = Uuid::new_v4();
        let (gone_tx, gone_rx) = mpsc::channel(8);
        group.add_peer(Uuid::new_v4(), Permission::Write, gone_tx).await;
        drop(gone_rx);

        assert_eq!(group.broadcast_except(&sender, Arc::new(vec![0])).await, 0);
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_lagging_peer_drops_instead_of_buffering() {
        let group = BroadcastGroup::new();
        let sender = Uuid::new_v4();
        let (slow_tx, mut slow_rx) = mpsc::channel(2);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        group.add_peer(Uuid::new_v4(), Permission::Write, slow_tx).await;
        group.add_peer(Uuid::new_v4(), Permission::Write, fast_tx).await;

        let mut delivered = 0;
        for i in 0..4u8 {
            delivered += group.broadcast_except(&sender, Arc::new(vec![i])).await;
        }
        assert_eq!(delivered, 6);
        assert_eq!(group.stats().await.messages_dropped, 2);

        // The slow peer kept the oldest frames, the fast one got all of them.
        assert_eq!(*slow_rx.recv().await.unwrap(), vec![0]);
        assert_eq!(*slow_rx.recv().await.unwrap(), vec![1]);
        assert!(slow_rx.try_recv().is_err());
        for i in 0..4u8 {
            assert_eq!(*fast_rx.recv().await.unwrap(), vec![i]);
        }
    }
}
