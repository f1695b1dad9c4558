//! Live-reload channel
//!
//! Browser tabs open a websocket to [`RELOAD_PATH`]. Each connection is served
//! by its own task that owns the socket; the [`ConnectionRegistry`] only keeps
//! the sending half of a small signal channel per connection, so a broadcast
//! never blocks on network I/O while holding the registry lock.
//!
//! ```text
//! ReloadLoop --broadcast()--> ConnectionRegistry --signal--> connection task --> browser
//!                                    ^                              |
//!                                    +------- deregister on close --+
//! ```

use crate::error::{error_response, ProxyErrorCode};
use crate::pool::{empty, ProxyBody};
use futures::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Path of the websocket upgrade endpoint
pub const RELOAD_PATH: &str = "/internal/reload";

/// Pending signals per connection; one queued reload is as good as many
const SIGNAL_BUFFER: usize = 1;

/// Identifier of one registered browser connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// "Reload now". Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal;

/// Set of live browser connections.
///
/// All membership reads and writes go through one mutex.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, mpsc::Sender<ReloadSignal>>>,
    broadcasts: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, identified by the sender its task listens on
    pub fn register(&self, tx: mpsc::Sender<ReloadSignal>) -> ConnectionId {
        let id = ConnectionId(Uuid::new_v4());
        let total = {
            let mut connections = self.connections.lock();
            connections.insert(id, tx);
            connections.len()
        };
        debug!(connection = %id, total, "Live-reload client connected");
        id
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            debug!(connection = %id, total, "Live-reload client disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Number of broadcasts issued so far
    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Signal every registered connection to reload.
    ///
    /// Connections whose task has gone away are pruned on the spot; a failure
    /// on one connection never affects the others. Returns how many
    /// connections were signalled.
    pub fn broadcast(&self) -> usize {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut connections = self.connections.lock();
        let mut signalled = 0;
        connections.retain(|id, tx| match tx.try_send(ReloadSignal) {
            // A full buffer means a reload is already queued for this tab
            Ok(()) | Err(TrySendError::Full(_)) => {
                signalled += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "Pruning closed live-reload client");
                false
            }
        });
        signalled
    }
}

/// Whether a request asks for a websocket upgrade
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let upgrades_to_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && upgrades_to_websocket
}

/// Accept a live-reload websocket upgrade.
///
/// Answers 101 immediately and finishes the upgrade in a background task,
/// which registers the connection once the socket is live. Anything that is
/// not a valid websocket handshake gets a 500.
pub fn handle_upgrade(
    req: Request<ProxyBody>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) -> Response<ProxyBody> {
    if !is_websocket_upgrade(&req) {
        warn!(uri = %req.uri(), "Live-reload request is not a websocket upgrade");
        return error_response(ProxyErrorCode::UpgradeFailed);
    }

    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        warn!("Live-reload upgrade without Sec-WebSocket-Key");
        return error_response(ProxyErrorCode::UpgradeFailed);
    };
    let accept = match HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "Failed to build Sec-WebSocket-Accept");
            return error_response(ProxyErrorCode::UpgradeFailed);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                serve_connection(ws, registry, shutdown).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to upgrade live-reload connection");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty())
        .expect("valid response builder")
}

/// Drive one registered connection until it closes, errors or shutdown.
///
/// Incoming messages are read only to notice closure and are otherwise
/// ignored. The connection is deregistered exactly once on the way out.
pub async fn serve_connection<S>(
    mut ws: WebSocketStream<S>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel(SIGNAL_BUFFER);
    let id = registry.register(tx);

    loop {
        tokio::select! {
            signal = rx.recv() => {
                if signal.is_none() {
                    break;
                }
                if let Err(e) = ws.send(Message::Binary(Vec::new())).await {
                    debug!(connection = %id, error = %e, "Failed to send reload signal");
                    break;
                }
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %id, error = %e, "Live-reload connection error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
        }
    }

    registry.deregister(id);
}

/// Broadcast and log the outcome, as the orchestration loop does after a restart
pub fn announce_reload(registry: &ConnectionRegistry) -> usize {
    let signalled = registry.broadcast();
    info!(clients = signalled, "Reload signal sent");
    signalled
}
