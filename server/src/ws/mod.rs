//! WebSocket broadcast relay.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws`. When origin checking is enabled the
//!    `Origin` header must be on the allow-list, otherwise the upgrade is
//!    refused with `403 Forbidden`.
//! 2. After the upgrade the connection joins the [`Gateway`] and every text or
//!    binary message it sends is rebroadcast, unchanged, to all members,
//!    the sender included.
//! 3. On close frame, end of stream, or receive error the connection leaves
//!    the gateway (via its [`crate::gateway::Membership`] guard). Its writer
//!    task then flushes whatever is still queued and shuts the socket, given
//!    at most [`WRITER_DRAIN_TIMEOUT`] before it is aborted.
//!
//! Ping/pong is answered by the protocol layer and never rebroadcast.

use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ServerConfig, WebSocketConfig};
use crate::gateway::{Gateway, Payload};
use crate::AppState;

/// How long a departing client's writer may spend flushing its queue.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Which browser origins may open a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Accept any upgrade, with or without an `Origin` header.
    Open,
    /// Accept only these exact origins.
    AllowList(HashSet<String>),
}

impl OriginPolicy {
    /// Build the policy from configuration.
    ///
    /// The allow-list holds the host machine origin (`HOST_MACHINE_IP`, or
    /// `127.0.0.1`), `localhost` and `[::1]` on the primary listen port, plus
    /// anything in `websocket.allowed_origins`.
    pub fn from_config(server: &ServerConfig, websocket: &WebSocketConfig) -> Self {
        if !websocket.check_origin {
            return Self::Open;
        }
        let port = server.primary_port();
        let host = websocket.host_machine_ip.as_deref().unwrap_or("127.0.0.1");
        let mut origins: HashSet<String> = [
            format!("http://{host}:{port}"),
            format!("http://localhost:{port}"),
            format!("http://[::1]:{port}"),
        ]
        .into_iter()
        .collect();
        origins.extend(
            websocket
                .allowed_origins
                .iter()
                .map(|o| o.trim_end_matches('/').to_string()),
        );
        Self::AllowList(origins)
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        match self {
            Self::Open => true,
            Self::AllowList(origins) => origin.is_some_and(|o| origins.contains(o)),
        }
    }
}

/// `GET /ws` — WebSocket upgrade handler.
///
/// Checks the origin before upgrading. Returns `403 Forbidden` when the
/// origin is not allowed.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !state.origin_policy.allows(origin) {
        warn!(origin = origin.unwrap_or("<none>"), "WebSocket origin rejected");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let gateway = state.gateway.clone();
    let queue_size = state.config.websocket.client_queue_size;

    ws.max_message_size(state.config.websocket.max_message_size)
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| handle_client(socket, gateway, queue_size))
}

/// Per-connection loop: join the gateway, relay every inbound message to all
/// members, leave on close or error.
///
/// Outgoing messages go through a bounded mpsc queue drained by a writer task,
/// so broadcasts never hold a reference to the socket.
pub async fn handle_client(socket: WebSocket, gateway: Gateway, queue_size: usize) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Payload>(queue_size);

    let membership = gateway.join(tx);
    let client_id = membership.id();
    let span = info_span!("ws_client", client_id = %client_id);

    async move {
        info!(clients = gateway.client_count(), "Client connected");

        // Task: forward queued payloads to the socket. Ends when the gateway
        // drops our sender or the socket stops accepting writes.
        let mut send_task = tokio::spawn(
            async move {
                while let Some(payload) = rx.recv().await {
                    if ws_sink.send(Message::from(payload)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(msg) = ws_stream.next().await {
            let payload = match msg {
                Ok(Message::Text(text)) => Payload::Text(text),
                Ok(Message::Binary(data)) => Payload::Binary(data),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Close frame received");
                    break;
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => {
                    debug!("Receive error: {e}");
                    break;
                }
            };

            let size = payload.len();
            let report = gateway.broadcast(payload).await;
            debug!(
                size,
                delivered = report.delivered,
                dropped = report.dropped,
                evicted = report.evicted,
                "Relayed message"
            );
        }

        // Leaving the gateway drops the last sender, so the writer ends once
        // the queue is empty.
        drop(membership);
        if !finish_writer(&mut send_task, WRITER_DRAIN_TIMEOUT).await {
            debug!("Writer did not drain in time, aborted");
        }
        info!(clients = gateway.client_count(), "Client disconnected");
    }
    .instrument(span)
    .await;
}

/// Wait up to `limit` for the writer task to finish on its own, aborting it
/// otherwise. Returns whether it finished in time.
async fn finish_writer(task: &mut JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut *task).await.is_ok() {
        true
    } else {
        task.abort();
        false
    }
}
