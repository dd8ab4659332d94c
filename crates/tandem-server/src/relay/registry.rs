//! Connection registry for the signaling relay.
//!
//! Stores connected peers keyed by a monotonically increasing identifier.
//! Identifiers are never reused, so iteration order of the map is the order
//! in which peers connected.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Process-lifetime-unique peer identifier.
pub type PeerId = u64;

/// A connected peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Identifier assigned at registration.
    pub id: PeerId,
    /// Remote socket address, for logging.
    pub remote: SocketAddr,
    /// When the peer registered.
    pub registered_at: Instant,
    /// Outbound queue drained by the connection's writer task.
    tx: mpsc::Sender<Message>,
}

impl Peer {
    /// Whether the peer's writer task is still draining its queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame for the peer without waiting.
    ///
    /// Returns `false` if the queue is full or the connection is gone.
    pub fn try_send(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// Registry of currently connected peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    next_id: PeerId,
}

impl PeerRegistry {
    /// Create a new empty registry. The first peer gets id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its new id with the resulting registry size.
    pub fn register(
        &mut self,
        remote: SocketAddr,
        tx: mpsc::Sender<Message>,
    ) -> (PeerId, usize) {
        let id = self.next_id;
        self.next_id += 1;

        self.peers.insert(
            id,
            Peer {
                id,
                remote,
                registered_at: Instant::now(),
                tx,
            },
        );

        debug!(peer = id, remote = %remote, total = self.peers.len(), "peer registered");
        (id, self.peers.len())
    }

    /// Remove a peer. Returns `false` if it was not registered.
    pub fn unregister(&mut self, id: PeerId) -> bool {
        match self.peers.remove(&id) {
            Some(peer) => {
                debug!(
                    peer = id,
                    remote = %peer.remote,
                    connected_secs = peer.registered_at.elapsed().as_secs(),
                    total = self.peers.len(),
                    "peer unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// The earliest-registered peer other than `id`.
    pub fn find_other(&self, id: PeerId) -> Option<&Peer> {
        self.peers.values().find(|p| p.id != id)
    }

    /// The peer with the smallest id.
    pub fn earliest(&self) -> Option<&Peer> {
        self.peers.values().next()
    }

    #[cfg(test)]
    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Registered ids in connection order.
    #[cfg(test)]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(8)
    }

    #[test]
    fn ids_are_monotonic_and_start_at_zero() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = channel();
        assert_eq!(reg.register(addr(), tx.clone()), (0, 1));
        assert_eq!(reg.register(addr(), tx.clone()), (1, 2));
        assert!(reg.unregister(0));
        assert!(reg.unregister(1));
        // Freed ids are not handed out again.
        assert_eq!(reg.register(addr(), tx), (2, 1));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = channel();
        let (id, _) = reg.register(addr(), tx);
        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        assert!(!reg.unregister(42));
        assert!(reg.is_empty());
    }

    #[test]
    fn size_tracks_connects_minus_disconnects() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = channel();
        let mut live = Vec::new();
        let mut expected = 0usize;

        // connect, connect, disconnect, connect, disconnect, disconnect, disconnect (extra)
        for step in [true, true, false, true, false, false, false] {
            if step {
                let (id, size) = reg.register(addr(), tx.clone());
                live.push(id);
                expected += 1;
                assert_eq!(size, expected);
            } else if let Some(id) = live.pop() {
                assert!(reg.unregister(id));
                expected -= 1;
            } else {
                assert!(!reg.unregister(999));
            }
            assert_eq!(reg.len(), expected);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn find_other_needs_two_peers() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = channel();
        let (a, _) = reg.register(addr(), tx.clone());
        assert!(reg.find_other(a).is_none());

        let (b, _) = reg.register(addr(), tx);
        assert_eq!(reg.find_other(a).map(|p| p.id), Some(b));
        assert_eq!(reg.find_other(b).map(|p| p.id), Some(a));

        reg.unregister(a);
        assert!(reg.find_other(b).is_none());
    }

    #[test]
    fn earliest_follows_registration_order() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = channel();
        assert!(reg.earliest().is_none());

        let (a, _) = reg.register(addr(), tx.clone());
        let (b, _) = reg.register(addr(), tx.clone());
        assert_eq!(reg.earliest().map(|p| p.id), Some(a));

        reg.unregister(a);
        assert_eq!(reg.earliest().map(|p| p.id), Some(b));

        let (c, _) = reg.register(addr(), tx);
        assert_eq!(reg.earliest().map(|p| p.id), Some(b));
        assert_eq!(reg.ids(), vec![b, c]);
        assert!(reg.contains(c));
        assert!(!reg.contains(a));
    }

    #[test]
    fn liveness_follows_receiver() {
        let mut reg = PeerRegistry::new();
        let (tx, rx) = channel();
        let (id, _) = reg.register(addr(), tx);

        let peer = reg.earliest().unwrap();
        assert_eq!(peer.id, id);
        assert!(peer.is_open());
        assert!(peer.try_send(Message::Text("x".into())));

        drop(rx);
        let peer = reg.earliest().unwrap();
        assert!(!peer.is_open());
        assert!(!peer.try_send(Message::Text("y".into())));
    }
}
