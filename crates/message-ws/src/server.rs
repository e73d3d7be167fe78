//! A WebSocket server that gives every accepted socket its own message
//! connection.

use std::fmt::{self, Debug};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use parking_lot::Mutex;
use tether_message::{
    ConnectionConfig, HandlerError, HandlerResponse, MessageConnection, MessageHandler, Payload,
};
use tether_transport::{CloseEvent, FrameEncoding, TransportError};
use tether_transport_ws::ServerWebSocketTransport;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;

/// Identifies one accepted socket.
pub type ConnectionId = Uuid;

/// How long a rejected socket is given to acknowledge the close.
const REJECT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request details of an accepted socket.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
    /// Request URI of the upgrade.
    pub uri: Uri,
    /// Request headers of the upgrade.
    pub headers: HeaderMap,
}

/// Configuration for [`WebSocketMessageServer`].
#[derive(Clone, Debug)]
pub struct MessageServerConfig {
    /// Path sockets must connect to, matched literally against the request
    /// path and query. Anything else is closed with 1008.
    pub path: String,

    /// Frame encoding used on every socket.
    pub encoding: FrameEncoding,

    /// Response timeout for requests the server pushes to clients.
    pub response_timeout: Duration,
}

impl Default for MessageServerConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            encoding: FrameEncoding::Cbor,
            response_timeout: ConnectionConfig::default().response_timeout,
        }
    }
}

impl MessageServerConfig {
    /// Set the accepted path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the frame encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: FrameEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub const fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}

/// Application side of a [`WebSocketMessageServer`].
///
/// Closures of the form `Fn(ConnectionId, T) -> impl Future<Output = Result<HandlerResponse<T>, HandlerError>>`
/// implement this trait directly.
#[async_trait]
pub trait ServerHandler<T: Payload>: Send + Sync + 'static {
    /// Handle one request received on `connection_id`.
    async fn handle(
        &self,
        connection_id: ConnectionId,
        payload: T,
    ) -> Result<HandlerResponse<T>, HandlerError>;

    /// Called once a socket is accepted, before its first request is read.
    async fn on_connect(&self, _connection_id: ConnectionId, _info: ConnectInfo) {}

    /// Called after a socket has closed.
    async fn on_disconnect(&self, _connection_id: ConnectionId) {}
}

#[async_trait]
impl<T, F, Fut> ServerHandler<T> for F
where
    T: Payload,
    F: Fn(ConnectionId, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResponse<T>, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        connection_id: ConnectionId,
        payload: T,
    ) -> Result<HandlerResponse<T>, HandlerError> {
        (self)(connection_id, payload).await
    }
}

/// Binds a [`ServerHandler`] to one connection id.
struct BoundHandler<T: Payload> {
    connection_id: ConnectionId,
    handler: Arc<dyn ServerHandler<T>>,
}

#[async_trait]
impl<T: Payload> MessageHandler<T> for BoundHandler<T> {
    async fn handle(&self, payload: T) -> Result<HandlerResponse<T>, HandlerError> {
        self.handler.handle(self.connection_id, payload).await
    }
}

struct ServerState<T: Payload> {
    config: MessageServerConfig,
    handler: Arc<dyn ServerHandler<T>>,
    connections: DashMap<ConnectionId, MessageConnection<T>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<T: Payload> ServerState<T> {
    async fn serve_socket(self: Arc<Self>, socket: WebSocket, info: ConnectInfo) {
        let connection_id = Uuid::new_v4();
        let transport = ServerWebSocketTransport::with_encoding(socket, self.config.encoding);
        let connection = MessageConnection::<T>::with_config(
            transport.clone(),
            ConnectionConfig::default().with_response_timeout(self.config.response_timeout),
        );
        connection.on_receive(BoundHandler {
            connection_id,
            handler: Arc::clone(&self.handler),
        });

        let closed = Arc::new(Notify::new());
        let notify = Arc::clone(&closed);
        transport.on_close(Arc::new(move |event: &CloseEvent| {
            debug!(
                "Connection {} closed (code {:?}, reason {:?})",
                connection_id, event.code, event.reason
            );
            notify.notify_one();
        }));

        self.connections.insert(connection_id, connection.clone());
        debug!("Accepted connection {} ({})", connection_id, info.uri);

        self.handler.on_connect(connection_id, info).await;
        transport.start();

        tokio::select! {
            () = closed.notified() => {}
            () = self.shutdown.cancelled() => {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close connection {}: {}", connection_id, e);
                }
            }
        }

        connection.abort_pending(|| TransportError::ConnectionClosed);
        self.connections.remove(&connection_id);
        self.handler.on_disconnect(connection_id).await;
        debug!("Removed connection {}", connection_id);
    }
}

/// Routes every request. Only an exact match of path and query on the
/// configured path reaches the message server, so a path such as
/// `/rooms/{id}` is literal rather than an axum capture.
async fn dispatch<T: Payload>(
    State(state): State<Arc<ServerState<T>>>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let requested = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    if requested != state.config.path {
        return reject(upgrade, requested);
    }

    match upgrade {
        Ok(ws) => accept(state, ConnectInfo { uri, headers }, ws),
        Err(rejection) => rejection.into_response(),
    }
}

fn accept<T: Payload>(
    state: Arc<ServerState<T>>,
    info: ConnectInfo,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        let tracker = state.tracker.clone();
        tracker.track_future(state.serve_socket(socket, info))
    })
}

fn reject(upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>, path: String) -> Response {
    let Ok(ws) = upgrade else {
        return StatusCode::NOT_FOUND.into_response();
    };

    ws.on_upgrade(move |mut socket| async move {
        warn!("Rejecting socket on unsupported path {}", path);
        let close = Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: format!("unsupported path: {path}").into(),
        }));
        if socket.send(close).await.is_err() {
            return;
        }
        // Wait for the peer's close reply so the reason is delivered.
        let _ = timeout(REJECT_CLOSE_TIMEOUT, async {
            while let Some(Ok(_)) = socket.recv().await {}
        })
        .await;
    })
}

/// WebSocket server multiplexing one [`MessageConnection`] per socket.
///
/// Only upgrades whose path and query equal the configured path are
/// accepted. Any other upgrade is closed with code 1008 and the reason
/// `unsupported path: <path>`; plain HTTP requests elsewhere get 404.
pub struct WebSocketMessageServer<T: Payload> {
    state: Arc<ServerState<T>>,
    local_addr: SocketAddr,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Payload> WebSocketMessageServer<T> {
    /// Serve `listener`, dispatching every request to `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured path is not absolute or the
    /// listener address cannot be read.
    pub fn bind<H>(
        listener: TcpListener,
        config: MessageServerConfig,
        handler: H,
    ) -> Result<Self, Error>
    where
        H: ServerHandler<T>,
    {
        if !config.path.starts_with('/') {
            return Err(Error::InvalidPath(config.path));
        }
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            config,
            handler: Arc::new(handler),
            connections: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let router = Router::new()
            .fallback(dispatch::<T>)
            .with_state(Arc::clone(&state));

        let shutdown = state.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("WebSocket message server exited: {}", e);
            }
        });

        info!(
            "WebSocket message server listening on {} (path {})",
            local_addr, state.config.path
        );

        Ok(Self {
            state,
            local_addr,
            server: Mutex::new(Some(server)),
        })
    }

    /// Address the server is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The message connection of a live socket, for pushing requests to
    /// that client.
    #[must_use]
    pub fn connection(&self, connection_id: ConnectionId) -> Option<MessageConnection<T>> {
        self.state
            .connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Ids of all live sockets.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of live sockets.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Stop accepting, close every live socket and wait for both to finish.
    pub async fn close(&self) {
        info!("WebSocket message server on {} shutting down", self.local_addr);
        self.state.shutdown.cancel();

        let server = self.server.lock().take();
        if let Some(server) = server {
            if let Err(e) = server.await {
                error!("WebSocket message server task failed: {}", e);
            }
        }

        self.state.tracker.close();
        self.state.tracker.wait().await;
        info!("WebSocket message server on {} shut down", self.local_addr);
    }
}

impl<T: Payload> Debug for WebSocketMessageServer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketMessageServer")
            .field("local_addr", &self.local_addr)
            .field("path", &self.state.config.path)
            .field("connections", &self.state.connections.len())
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Drop for WebSocketMessageServer<T> {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}
