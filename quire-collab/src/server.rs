//! WebSocket transport hosting the [`CollaborationHub`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── writer A ◄── mpsc ◄──┐
//!             ├── reader loop ── hub ───┤                        │
//! Client B ──┘   (one per conn)         └── writer B ◄── mpsc ◄──┴── broadcast
//! ```
//!
//! Handshake target: `/ws/{page_id}?token=...` (or `/{page_id}?token=...`).
//!
//! Each connection gets one reader loop, which is the only place it awaits
//! inbound frames, and one writer task draining its outbound channel. Every
//! socket write is bounded by `send_timeout`; a writer that times out or
//! fails exits, which closes the channel so later broadcasts drop the
//! connection from its page.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, Outbound};
use crate::error::{CollabError, TransportError};
use crate::hub::CollaborationHub;

/// Pause before accepting again after `accept()` fails (e.g. out of file
/// descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Page and token extracted from the handshake request target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectTarget {
    pub page_id: String,
    pub token: String,
}

impl ConnectTarget {
    /// Parse a request target such as `/ws/page-1?token=abc`.
    ///
    /// Anything unparseable yields empty fields, which the hub rejects.
    pub fn from_request_target(target: &str) -> Self {
        let Ok(url) = Url::parse("ws://localhost/").and_then(|base| base.join(target)) else {
            return Self::default();
        };

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let page_id = match segments.as_slice() {
            ["ws", page] | [page] if *page != "ws" => page.to_string(),
            _ => String::new(),
        };
        let token = url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        Self { page_id, token }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollaborationHub>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, hub: Arc<CollaborationHub>) -> Self {
        Self { config, hub }
    }

    pub fn hub(&self) -> &Arc<CollaborationHub> {
        &self.hub
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever. Only binding can
    /// fail; accept errors are retried after a short pause.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(TransportError::from)?;
        let local = listener.local_addr().map_err(TransportError::from)?;
        log::info!("Collaboration server listening on {local}");
        self.serve(listener).await;
        Ok(())
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                log::info!("Shutdown requested, no longer accepting connections");
                Ok(())
            }
        }
    }

    /// Accept connections on an already bound listener. Never returns.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    accept_backoff(&e).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn accept_backoff(e: &std::io::Error) {
    log::error!(
        "Failed to accept connection: {e}; retrying in {} ms",
        ACCEPT_RETRY_DELAY.as_millis()
    );
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

/// Drive one WebSocket connection from handshake to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<CollaborationHub>,
    config: ServerConfig,
) -> Result<(), TransportError> {
    let mut request_target = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        request_target = request.uri().to_string();
        Ok(response)
    };
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_frame_bytes))
        .max_frame_size(Some(config.max_frame_bytes));
    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let target = ConnectTarget::from_request_target(&request_target);
    log::debug!("WebSocket handshake from {addr} for page {:?}", target.page_id);

    let (handle, outbound_rx) = ConnectionHandle::channel();
    let mut writer = tokio::spawn(write_loop(ws_sender, outbound_rx, config.send_timeout()));

    let mut session = match hub.connect(handle, &target.page_id, &target.token).await {
        Ok(session) => session,
        Err(_) => {
            // The hub queued a close frame and dropped the handle; the
            // writer flushes it and stops.
            let _ = writer.await;
            return Ok(());
        }
    };

    let mut writer_done = false;
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        hub.handle_frame(&session, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        hub.reject_binary(&session);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    // tungstenite answers pings itself
                    _ => {}
                }
            }

            result = &mut writer => {
                writer_done = true;
                match result {
                    Ok(Err(e)) => log::warn!("Writer for {addr} stopped: {e}"),
                    Err(e) => log::error!("Writer task for {addr} failed: {e}"),
                    Ok(Ok(())) => {}
                }
                break;
            }
        }
    }

    hub.disconnect(&mut session).await;

    if !writer_done {
        let _ = session.handle().send(Outbound::Close {
            code: u16::from(CloseCode::Normal),
            reason: String::new(),
        });
        drop(session);
        let _ = writer.await;
    }
    Ok(())
}

/// Drain a connection's outbound channel into its socket.
///
/// Ends when the channel closes, after sending a close frame, or on the
/// first failed or timed-out write.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    send_timeout: Duration,
) -> Result<(), TransportError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let (message, closing) = match item {
            Outbound::Frame(text) => (Message::text(text.to_string()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
                true,
            ),
        };

        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::SendTimeout(send_timeout.as_millis() as u64)),
        }
        if closing {
            break;
        }
    }
    Ok(())
}
