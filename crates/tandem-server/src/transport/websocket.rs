//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the WebSocket upgrade, and hands each
//! established connection to the server over a channel.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tandem_core::{RelayError, RelayResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    /// The WebSocket stream (split into sink + stream in usage).
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// Upper bound for the HTTP upgrade of a freshly accepted socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the WebSocket listener.
///
/// Returns the bound local address (useful when binding port 0) and a
/// receiver that yields accepted connections. The accept loop stops when
/// `shutdown` fires; the receiver then yields `None` once pending
/// handshakes are done.
pub async fn start_listener(
    bind_addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = tcp_listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                let upgrade = tokio_tungstenite::accept_async(stream);
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade).await {
                    Ok(Ok(ws_stream)) => {
                        debug!(remote = %addr, "WebSocket connection accepted");
                        let conn = WebSocketConnection {
                            ws_stream,
                            remote_addr: addr,
                        };
                        if tx.send(conn).await.is_err() {
                            debug!(remote = %addr, "server stopped, dropping connection");
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                    }
                    Err(_) => {
                        warn!(remote = %addr, "WebSocket handshake timed out");
                    }
                }
            });
        }
        info!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

/// Receive the next data frame from a WebSocket.
///
/// Text and binary frames are both returned as bytes. Returns `None` when the
/// connection is closed. Frames over `max_frame` bytes yield
/// [`RelayError::InvalidMessage`]; the connection is still usable afterwards.
pub async fn ws_recv_frame<S>(ws: &mut S, max_frame: usize) -> RelayResult<Option<Vec<u8>>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) => return Ok(None),
            // Pongs are queued by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        };

        if data.len() > max_frame {
            return Err(RelayError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {max_frame})",
                data.len()
            )));
        }
        return Ok(Some(data));
    }
}

/// Drain `rx` into the WebSocket sink until the queue closes or a send fails.
///
/// A close frame ends the writer after it is sent.
pub async fn ws_write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Message>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let closing = msg.is_close();
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "WS send failed, stopping writer");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Build a close frame with the given code and reason.
pub fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

/// Send a close frame and shut the connection down.
pub async fn ws_close(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    code: CloseCode,
    reason: &'static str,
) -> RelayResult<()> {
    ws.send(close_message(code, reason))
        .await
        .map_err(|e| RelayError::Transport(format!("WS close failed: {e}")))
}
