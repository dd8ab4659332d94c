//! Relay hub: pairs peers and forwards signaling between them.
//!
//! All registry access goes through one mutex. The pairing trigger is queued
//! while the lock is held, so two connections arriving together cannot both
//! see a registry of size one.

use super::registry::{PeerId, PeerRegistry};
use serde::Deserialize;
use std::net::SocketAddr;
use tandem_core::{
    decode_frame, encode_message, Inbound, RelayError, RelayResult, ServerMessage, SignalKind,
};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Number of peers that form a pair.
pub const PAIR_SIZE: usize = 2;

/// Bytes of a rejected frame echoed into the log.
const LOGGED_FRAME_PREFIX: usize = 128;

/// What to do with a connection that arrives while a pair is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Refuse the connection.
    #[default]
    Reject,
    /// Register it anyway. Relay targets among three or more peers are arbitrary.
    Admit,
}

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to the other peer.
    Forwarded { to: PeerId, kind: SignalKind },
    /// Not UTF-8 JSON.
    Malformed,
    /// JSON without a relayable `type`.
    Ignored,
    /// No other peer is registered.
    NoPeer,
    /// The other peer's connection is closing or its queue is full.
    PeerNotReady { to: PeerId },
}

/// The relay hub owns the registry and serializes every access to it.
pub struct RelayHub {
    registry: Mutex<PeerRegistry>,
    overflow: OverflowPolicy,
}

impl RelayHub {
    /// Create a hub with an empty registry.
    pub fn new(overflow: OverflowPolicy) -> Self {
        Self {
            registry: Mutex::new(PeerRegistry::new()),
            overflow,
        }
    }

    /// Register a new connection.
    ///
    /// When this makes the registry size exactly two, the earliest peer is
    /// sent `start_offer` and becomes the initiator.
    pub async fn connect(
        &self,
        remote: SocketAddr,
        tx: mpsc::Sender<Message>,
    ) -> RelayResult<PeerId> {
        let start_offer = encode_message(&ServerMessage::StartOffer)?;

        let mut registry = self.registry.lock().await;
        if registry.len() >= PAIR_SIZE && self.overflow == OverflowPolicy::Reject {
            warn!(remote = %remote, total = registry.len(), "relay full, rejecting peer");
            return Err(RelayError::RelayFull(registry.len()));
        }

        let (id, total) = registry.register(remote, tx);
        info!(peer = id, remote = %remote, total, "peer connected");

        if total == PAIR_SIZE {
            if let Some(initiator) = registry.earliest() {
                if initiator.try_send(Message::Text(start_offer)) {
                    info!(
                        initiator = initiator.id,
                        "two peers connected, signaled initiator to start offer"
                    );
                } else {
                    warn!(initiator = initiator.id, "could not deliver start_offer to initiator");
                }
            }
        }

        Ok(id)
    }

    /// Handle one inbound frame from `from`.
    pub async fn relay(&self, from: PeerId, data: &[u8]) -> RelayOutcome {
        let msg = match decode_frame(data) {
            Ok(Inbound::Signal(msg)) => msg,
            Ok(Inbound::Unrecognized { type_tag }) => {
                debug!(peer = from, type_tag = ?type_tag, "ignoring non-relay message");
                return RelayOutcome::Ignored;
            }
            Err(e) => {
                warn!(
                    peer = from,
                    error = %e,
                    len = data.len(),
                    frame = %frame_preview(data),
                    "received non-JSON message"
                );
                return RelayOutcome::Malformed;
            }
        };

        let frame = match msg.to_json() {
            Ok(f) => f,
            Err(e) => {
                warn!(peer = from, error = %e, "could not re-encode message");
                return RelayOutcome::Malformed;
            }
        };

        let registry = self.registry.lock().await;
        let Some(target) = registry.find_other(from) else {
            debug!(peer = from, kind = %msg.kind(), "no peer to relay to");
            return RelayOutcome::NoPeer;
        };

        if !target.is_open() || !target.try_send(Message::Text(frame)) {
            debug!(
                peer = from,
                target = target.id,
                kind = %msg.kind(),
                "peer not ready, dropping message"
            );
            return RelayOutcome::PeerNotReady { to: target.id };
        }

        info!(
            peer = from,
            sender = msg.sender().unwrap_or("-"),
            target = target.id,
            kind = %msg.kind(),
            "relayed message"
        );
        RelayOutcome::Forwarded {
            to: target.id,
            kind: msg.kind(),
        }
    }

    /// Remove a peer after its connection closed or failed. No-op if already gone.
    pub async fn disconnect(&self, id: PeerId) -> bool {
        let mut registry = self.registry.lock().await;
        let removed = registry.unregister(id);
        if removed {
            info!(peer = id, total = registry.len(), "peer disconnected");
        }
        removed
    }

    /// Number of registered peers.
    pub async fn peer_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Registered peer ids in connection order.
    #[cfg(test)]
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.registry.lock().await.ids()
    }
}

/// Lossy UTF-8 rendering of at most the first [`LOGGED_FRAME_PREFIX`] bytes.
fn frame_preview(data: &[u8]) -> String {
    if data.len() <= LOGGED_FRAME_PREFIX {
        return String::from_utf8_lossy(data).into_owned();
    }
    format!("{}…", String::from_utf8_lossy(&data[..LOGGED_FRAME_PREFIX]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc::error::TryRecvError;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn join(hub: &RelayHub) -> (PeerId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let id = hub.connect(addr(), tx).await.unwrap();
        (id, rx)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_offer_goes_to_earliest_once() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);

        let (b, mut rx_b) = join(&hub).await;
        assert!(a < b);
        assert_eq!(text(rx_a.try_recv().unwrap()), r#"{"type":"start_offer"}"#);
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn relays_recognized_types_verbatim() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;
        let _ = rx_a.try_recv();

        let offer = r#"{"type":"offer","sender":"A","sdp":"v=0"}"#;
        assert_eq!(
            hub.relay(a, offer.as_bytes()).await,
            RelayOutcome::Forwarded { to: b, kind: SignalKind::Offer }
        );
        assert_eq!(text(rx_b.try_recv().unwrap()), offer);

        let answer = r#"{"type":"answer","sender":"B","sdp":"v=0","extra":{"n":[1,2]}}"#;
        assert_eq!(
            hub.relay(b, answer.as_bytes()).await,
            RelayOutcome::Forwarded { to: a, kind: SignalKind::Answer }
        );
        let got: Value = serde_json::from_str(&text(rx_a.try_recv().unwrap())).unwrap();
        let sent: Value = serde_json::from_str(answer).unwrap();
        assert_eq!(got, sent);

        let rest = [
            r#"{"type":"candidate","candidate":null}"#,
            r#"{"type":"register","sender":"A"}"#,
        ];
        for raw in rest {
            assert!(matches!(
                hub.relay(a, raw.as_bytes()).await,
                RelayOutcome::Forwarded { .. }
            ));
            assert_eq!(text(rx_b.try_recv().unwrap()), raw);
        }
    }

    #[tokio::test]
    async fn never_relays_unrecognized_or_malformed() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        let (_b, mut rx_b) = join(&hub).await;
        let _ = rx_a.try_recv();

        assert_eq!(hub.relay(a, b"not json").await, RelayOutcome::Malformed);
        assert_eq!(hub.relay(a, br#"{"sdp":"v=0"}"#).await, RelayOutcome::Ignored);
        assert_eq!(hub.relay(a, br#"{"type":"start_offer"}"#).await, RelayOutcome::Ignored);
        assert_eq!(hub.relay(a, br#"{"type":["offer"]}"#).await, RelayOutcome::Ignored);
        assert_eq!(hub.relay(a, b"42").await, RelayOutcome::Ignored);

        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn malformed_frame_preview_is_bounded() {
        assert_eq!(frame_preview(b"not json"), "not json");

        let big = vec![b'x'; 1_048_576];
        let preview = frame_preview(&big);
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().filter(|c| *c == 'x').count(), LOGGED_FRAME_PREFIX);
    }

    #[tokio::test]
    async fn lone_peer_messages_are_dropped() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        assert_eq!(hub.relay(a, br#"{"type":"offer"}"#).await, RelayOutcome::NoPeer);
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn closed_peer_is_not_ready() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, rx_a) = join(&hub).await;
        let (b, _rx_b) = join(&hub).await;
        drop(rx_a);

        assert_eq!(
            hub.relay(b, br#"{"type":"answer"}"#).await,
            RelayOutcome::PeerNotReady { to: a }
        );
    }

    #[tokio::test]
    async fn departed_peer_is_never_targeted() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;
        let _ = rx_a.try_recv();

        assert!(hub.disconnect(a).await);
        assert!(!hub.disconnect(a).await);
        assert_eq!(hub.peer_count().await, 1);

        assert_eq!(hub.relay(b, br#"{"type":"candidate"}"#).await, RelayOutcome::NoPeer);
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Disconnected);
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn freed_slot_pairs_again() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;
        let _ = rx_a.try_recv();

        hub.disconnect(a).await;
        let (c, mut rx_c) = join(&hub).await;
        assert!(c > b);
        assert_eq!(hub.peer_ids().await, vec![b, c]);

        // b is now the earliest and initiates the new handshake.
        assert_eq!(text(rx_b.try_recv().unwrap()), r#"{"type":"start_offer"}"#);
        assert_eq!(rx_c.try_recv().unwrap_err(), TryRecvError::Empty);

        assert_eq!(
            hub.relay(c, br#"{"type":"answer"}"#).await,
            RelayOutcome::Forwarded { to: b, kind: SignalKind::Answer }
        );
    }

    #[tokio::test]
    async fn third_peer_rejected_by_default() {
        let hub = RelayHub::new(OverflowPolicy::Reject);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;
        let _ = rx_a.try_recv();

        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(hub.connect(addr(), tx).await, Err(RelayError::RelayFull(2))));
        assert_eq!(hub.peer_ids().await, vec![a, b]);

        assert!(matches!(
            hub.relay(a, br#"{"type":"offer"}"#).await,
            RelayOutcome::Forwarded { to, .. } if to == b
        ));
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn third_peer_admitted_without_new_trigger() {
        let hub = RelayHub::new(OverflowPolicy::Admit);
        let (_a, mut rx_a) = join(&hub).await;
        let (_b, mut rx_b) = join(&hub).await;
        let (_c, mut rx_c) = join(&hub).await;

        assert!(rx_a.try_recv().is_ok());
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx_c.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(hub.peer_count().await, 3);
    }

    #[tokio::test]
    async fn concurrent_connects_trigger_exactly_once() {
        let hub = std::sync::Arc::new(RelayHub::new(OverflowPolicy::Reject));
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let h1 = hub.clone();
        let h2 = hub.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { h1.connect(addr(), tx1).await }),
            tokio::spawn(async move { h2.connect(addr(), tx2).await }),
        );
        let id1 = r1.unwrap().unwrap();
        let id2 = r2.unwrap().unwrap();

        let got1 = rx1.try_recv().is_ok();
        let got2 = rx2.try_recv().is_ok();
        assert!(got1 ^ got2, "exactly one start_offer expected");
        assert_eq!(got1, id1 < id2);
    }
}
