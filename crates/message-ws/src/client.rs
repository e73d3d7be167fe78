//! Process-wide cached WebSocket message clients.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_message::{ConnectionConfig, MessageConnection, Payload, ResponseStream, Result};
use tether_transport::{CloseEvent, TransportError};
use tether_transport_ws::{ClientConfig, ClientWebSocketTransport};
use tracing::debug;
use url::Url;

use crate::error::Error;

type CacheKey = (String, TypeId);
type CachedClient = Arc<dyn Any + Send + Sync>;

static CLIENTS: LazyLock<DashMap<CacheKey, CachedClient>> = LazyLock::new(DashMap::new);

/// Number of clients currently cached.
#[must_use]
pub fn cached_client_count() -> usize {
    CLIENTS.len()
}

/// A message connection to a WebSocket server, shared per URL.
///
/// The socket opens lazily on the first request and re-opens after it has
/// closed. Requests waiting when the socket closes fail straight away with
/// the close reason.
pub struct WebSocketMessageClient<T: Payload> {
    key: CacheKey,
    transport: Arc<ClientWebSocketTransport>,
    connection: MessageConnection<T>,
}

impl<T: Payload> WebSocketMessageClient<T> {
    /// The cached client for `url`, created on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid `ws://` or `wss://` URL.
    pub fn create(url: &str) -> std::result::Result<Arc<Self>, Error> {
        Self::create_with_config(url, ClientConfig::default(), ConnectionConfig::default())
    }

    /// Like [`Self::create`], with explicit socket and connection settings.
    ///
    /// The settings only apply when no client is cached for `url` yet.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid `ws://` or `wss://` URL.
    pub fn create_with_config(
        url: &str,
        client_config: ClientConfig,
        connection_config: ConnectionConfig,
    ) -> std::result::Result<Arc<Self>, Error> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        let key = (url.as_str().to_string(), TypeId::of::<T>());

        let entry = CLIENTS.entry(key.clone());
        if let Entry::Occupied(cached) = &entry {
            if let Ok(client) = Arc::clone(cached.get()).downcast::<Self>() {
                return Ok(client);
            }
        }

        let transport = Arc::new(ClientWebSocketTransport::with_config(url, client_config)?);
        let client = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            transport.on_close(Arc::new(move |event: &CloseEvent| {
                if let Some(client) = weak.upgrade() {
                    client.socket_closed(event);
                }
            }));

            Self {
                key,
                connection: MessageConnection::with_config(transport.clone(), connection_config),
                transport,
            }
        });

        debug!("Created message client for {}", client.transport.url());
        entry.insert(Arc::clone(&client) as CachedClient);
        Ok(client)
    }

    fn socket_closed(&self, event: &CloseEvent) {
        if event.initiated_locally {
            self.connection
                .abort_pending(|| TransportError::ConnectionClosed);
        } else {
            self.connection
                .abort_pending(|| TransportError::ClosedByServer {
                    reason: event.reason.clone(),
                });
        }
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        self.transport.url()
    }

    /// Whether the socket is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// The underlying message connection.
    #[must_use]
    pub const fn connection(&self) -> &MessageConnection<T> {
        &self.connection
    }

    /// Fire-and-forget send.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened or written.
    pub async fn send(&self, payload: T) -> Result<()> {
        self.connection.send(payload).await
    }

    /// Send `payload` and return exactly one value.
    ///
    /// # Errors
    ///
    /// See [`MessageConnection::request_one`].
    pub async fn request_one(&self, payload: T) -> Result<T> {
        self.connection.request_one(payload).await
    }

    /// Send `payload` and stream the response values.
    ///
    /// # Errors
    ///
    /// See [`MessageConnection::request_multi`].
    pub async fn request_multi(&self, payload: T) -> Result<ResponseStream<T>> {
        self.connection.request_multi(payload).await
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// See [`MessageConnection::ping`].
    pub async fn ping(&self) -> Result<bool> {
        self.connection.ping().await
    }

    /// Close the socket and drop this client from the cache.
    ///
    /// The instance stays usable: the next request opens a new socket.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error.
    pub async fn close(&self) -> Result<()> {
        let this: *const Self = self;
        CLIENTS.remove_if(&self.key, |_, cached| {
            std::ptr::addr_eq(Arc::as_ptr(cached), this)
        });
        self.connection.close().await
    }
}

impl<T: Payload> Debug for WebSocketMessageClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketMessageClient")
            .field("url", &self.transport.url().as_str())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
