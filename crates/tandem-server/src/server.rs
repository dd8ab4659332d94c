//! Core server: accepts WebSocket connections and runs each one against the relay hub.
//!
//! Every connection gets a writer task that drains the peer's outbound queue
//! and a reader loop that feeds inbound frames to the hub. The peer is
//! unregistered as soon as the reader loop ends, for whatever reason.

use crate::config::ServerConfig;
use crate::relay::{PeerId, RelayHub};
use crate::transport::websocket::{self, WebSocketConnection};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{RelayError, RelayResult};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How long shutdown waits for connections to send their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The tandem server instance.
pub struct SignalServer {
    /// Server configuration.
    config: ServerConfig,
    /// Registry + relay logic shared by all connections.
    hub: Arc<RelayHub>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl SignalServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(config.overflow));
        Self {
            config,
            hub,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// The relay hub.
    #[cfg(test)]
    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener_stop = self.shutdown_tx.subscribe();
        let (local_addr, ws_rx) =
            websocket::start_listener(self.config.listen_addr(), listener_stop).await?;
        info!(
            addr = %local_addr,
            overflow = ?self.config.overflow,
            "tandem-server ready"
        );
        self.serve(ws_rx, shutdown).await
    }

    /// Serve connections from an already started listener until `shutdown` resolves.
    pub async fn serve<F>(
        self,
        mut ws_rx: mpsc::Receiver<WebSocketConnection>,
        shutdown: F,
    ) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(ws_conn) = ws_rx.recv() => {
                    let srv = server.clone();
                    // Subscribe before spawning so a shutdown sent before the
                    // task first runs is still observed.
                    let shutdown_rx = server.shutdown_tx.subscribe();
                    connections.spawn(async move {
                        let remote = ws_conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(ws_conn, shutdown_rx).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                // Reap finished connection tasks so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Broadcast shutdown to all connected peers
        let peers = server.hub.peer_count().await;
        info!(peers, "closing connected peers");
        let _ = server.shutdown_tx.send(());

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("connections did not close in time, aborting");
            connections.abort_all();
        }

        Ok(())
    }

    async fn handle_websocket(
        &self,
        conn: WebSocketConnection,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> RelayResult<()> {
        let remote = conn.remote_addr;
        let mut ws = conn.ws_stream;

        let (peer_tx, peer_rx) = mpsc::channel::<Message>(self.config.peer_queue);
        let peer_id = match self.hub.connect(remote, peer_tx.clone()).await {
            Ok(id) => id,
            Err(RelayError::RelayFull(_)) => {
                return websocket::ws_close(&mut ws, CloseCode::Policy, "relay full").await;
            }
            Err(e) => {
                let _ = websocket::ws_close(&mut ws, CloseCode::Error, "internal error").await;
                return Err(e);
            }
        };

        let (sink, mut stream) = ws.split();
        let writer = tokio::spawn(websocket::ws_write_loop(sink, peer_rx));

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(peer = peer_id, "shutdown signal received, closing connection");
                    let bye = websocket::close_message(CloseCode::Away, "server shutdown");
                    let _ = peer_tx.try_send(bye);
                    break Ok(());
                }

                frame = websocket::ws_recv_frame(&mut stream, self.config.max_frame_bytes) => {
                    match frame {
                        Ok(Some(data)) => {
                            let outcome = self.hub.relay(peer_id, &data).await;
                            debug!(peer = peer_id, outcome = ?outcome, "frame handled");
                        }
                        Ok(None) => {
                            debug!(peer = peer_id, "WebSocket session ended (peer closed)");
                            break Ok(());
                        }
                        Err(RelayError::InvalidMessage(reason)) => {
                            warn!(peer = peer_id, reason = %reason, "dropping frame");
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.release(peer_id, peer_tx, writer).await;
        result
    }

    /// Unregister a peer and wait for its writer to flush.
    async fn release(
        &self,
        peer_id: PeerId,
        peer_tx: mpsc::Sender<Message>,
        writer: tokio::task::JoinHandle<()>,
    ) {
        self.hub.disconnect(peer_id).await;
        // The writer stops once the registry's sender and ours are both gone.
        drop(peer_tx);
        if let Err(e) = writer.await {
            debug!(peer = peer_id, error = %e, "writer task failed");
        }
    }
}
