//! Client side of the WebSocket transport.
//!
//! The client owns connection establishment: the socket is opened lazily on
//! the first send, shared by concurrent senders while it is being opened, and
//! replaced by a fresh one once it starts closing.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tether_transport::{
    CloseEvent, CloseObserver, CloseObservers, Frame, FrameEncoding, ReceiveHandler, ReceiverId,
    Receivers, Transport, TransportError,
};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the client transport.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the socket to open.
    pub connect_timeout: Duration,
    /// How long to wait for the close handshake.
    pub close_timeout: Duration,
    /// Wire encoding of frames.
    pub encoding: FrameEncoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            encoding: FrameEncoding::Cbor,
        }
    }
}

impl ClientConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the close timeout.
    #[must_use]
    pub const fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Set the frame encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: FrameEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// One physical socket. Replaced wholesale when it closes.
struct Socket {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    closing: AtomicBool,
    initiated_locally: AtomicBool,
    finished: AtomicBool,
    closed: watch::Sender<Option<CloseEvent>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Socket {
    fn new(sink: SplitSink<WsStream, Message>) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            sink: tokio::sync::Mutex::new(sink),
            closing: AtomicBool::new(false),
            initiated_locally: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            closed,
            reader: Mutex::new(None),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) -> Option<CloseEvent> {
        let mut rx = self.closed.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|event| (*event).clone())
    }

    /// Error to report to a sender whose frame could not go out because the
    /// socket closed.
    async fn closed_error(&self, wait: Duration) -> Option<TransportError> {
        let event = timeout(wait, self.wait_closed()).await.ok().flatten()?;
        Some(if event.initiated_locally {
            TransportError::ConnectionClosed
        } else {
            TransportError::ClosedByServer {
                reason: event.reason,
            }
        })
    }

    async fn write(&self, message: Message, close_timeout: Duration) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(self
                .closed_error(close_timeout)
                .await
                .unwrap_or(TransportError::ConnectionClosed));
        }

        let result = self.sink.lock().await.send(message).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("WebSocket write failed: {}", e);
                match self.closed_error(close_timeout).await {
                    Some(err) => Err(err),
                    None => Err(TransportError::Io(std::io::Error::other(e))),
                }
            }
        }
    }
}

struct Shared {
    url: Url,
    config: ClientConfig,
    receivers: Receivers,
    close_observers: CloseObservers,
    current: RwLock<Option<Arc<Socket>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Shared {
    /// Tear down bookkeeping for a socket that is gone. Runs once per socket.
    fn finish(&self, socket: &Arc<Socket>, code: Option<u16>, reason: String) {
        if socket.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        socket.closing.store(true, Ordering::SeqCst);

        let was_current = {
            let mut current = self.current.write();
            let was_current = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, socket));
            if was_current {
                *current = None;
            }
            was_current
        };

        let event = CloseEvent {
            code,
            reason,
            initiated_locally: socket.initiated_locally.load(Ordering::SeqCst),
        };
        debug!(
            "WebSocket to {} closed (code {:?}, reason {:?}, local {})",
            self.url, event.code, event.reason, event.initiated_locally
        );

        socket.closed.send_replace(Some(event.clone()));

        // Frames in flight belong to the replacement socket by now.
        if was_current {
            self.close_observers.notify(&event);
        } else {
            debug!("Replaced WebSocket to {} finished closing", self.url);
        }
    }
}

/// Client variant of the WebSocket transport.
pub struct ClientWebSocketTransport {
    shared: Arc<Shared>,
}

impl ClientWebSocketTransport {
    /// Create a transport for `url` with the default configuration. No socket
    /// is opened until the first send.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a `ws` or `wss` URL.
    pub fn new(url: Url) -> Result<Self, TransportError> {
        Self::with_config(url, ClientConfig::default())
    }

    /// Create a transport for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a `ws` or `wss` URL.
    pub fn with_config(url: Url, config: ClientConfig) -> Result<Self, TransportError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidAddress(format!(
                "Unsupported scheme for WebSocket URL: {url}"
            )));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                config,
                receivers: Receivers::new(),
                close_observers: CloseObservers::new(),
                current: RwLock::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Whether a socket is currently open and not closing.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open_socket().is_some()
    }

    /// Register an observer notified each time the current socket closes.
    ///
    /// A socket that was already replaced by a newer one closes silently.
    pub fn on_close(&self, observer: CloseObserver) {
        self.shared.close_observers.register(observer);
    }

    fn open_socket(&self) -> Option<Arc<Socket>> {
        self.shared
            .current
            .read()
            .as_ref()
            .filter(|socket| !socket.is_closing())
            .cloned()
    }

    async fn connect(&self) -> Result<Arc<Socket>, TransportError> {
        if let Some(socket) = self.open_socket() {
            return Ok(socket);
        }

        // Callers arriving while a socket is being opened wait here and reuse it.
        let _connecting = self.shared.connecting.lock().await;
        if let Some(socket) = self.open_socket() {
            return Ok(socket);
        }

        let url = &self.shared.url;
        debug!("Connecting to WebSocket at {}", url);

        let (ws_stream, _) = timeout(self.shared.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!("Timed out connecting to {url}"))
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}")))?;

        let (sink, stream) = ws_stream.split();
        let socket = Arc::new(Socket::new(sink));
        *self.shared.current.write() = Some(Arc::clone(&socket));

        let handle = tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            Arc::clone(&socket),
            stream,
            self.shared.receivers.clone(),
            self.shared.config.encoding,
        ));
        *socket.reader.lock() = Some(handle);

        Ok(socket)
    }

    fn to_message(&self, data: Bytes) -> Result<Message, TransportError> {
        if self.shared.config.encoding.is_binary() {
            return Ok(Message::Binary(data));
        }
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::Other(format!("Encoded frame is not UTF-8: {e}")))?;
        Ok(Message::Text(text.into()))
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    socket: Arc<Socket>,
    mut stream: SplitStream<WsStream>,
    receivers: Receivers,
    encoding: FrameEncoding,
) {
    let mut code = None;
    let mut reason = String::new();

    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            Ok(Message::Close(frame)) => {
                socket.closing.store(true, Ordering::SeqCst);
                if let Some(frame) = frame {
                    code = Some(u16::from(frame.code));
                    reason = frame.reason.to_string();
                }
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket read ended: {}", e);
                break;
            }
        };

        match encoding.decode_frame(&data) {
            Ok(frame) => {
                trace!("Received frame {} ({:?})", frame.correlation_id, frame.frame_type);
                receivers.dispatch(&frame);
            }
            Err(e) => warn!("Dropping undecodable WebSocket message: {}", e),
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.finish(&socket, code, reason);
    }
}

impl Debug for ClientWebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientWebSocketTransport")
            .field("url", &self.shared.url.as_str())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for ClientWebSocketTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let data = self.shared.config.encoding.encode_frame(&frame)?;
        let message = self.to_message(data)?;
        let socket = self.connect().await?;

        trace!("Sending frame {} ({:?})", frame.correlation_id, frame.frame_type);
        socket.write(message, self.shared.config.close_timeout).await
    }

    fn on_receive(&self, handler: ReceiveHandler) -> ReceiverId {
        self.shared.receivers.register(handler)
    }

    fn remove_receiver(&self, id: ReceiverId) {
        self.shared.receivers.unregister(id);
    }

    async fn close(&self) -> Result<(), TransportError> {
        let socket = self.shared.current.read().clone();
        let Some(socket) = socket else {
            return Ok(());
        };

        socket.initiated_locally.store(true, Ordering::SeqCst);
        socket.closing.store(true, Ordering::SeqCst);

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if let Err(e) = socket.sink.lock().await.send(close).await {
            debug!("Failed to send close frame: {}", e);
        }

        if timeout(self.shared.config.close_timeout, socket.wait_closed())
            .await
            .is_err()
        {
            warn!(
                "WebSocket to {} did not finish closing in {:?}",
                self.shared.url, self.shared.config.close_timeout
            );
            if let Some(reader) = socket.reader.lock().take() {
                reader.abort();
            }
            self.shared.finish(&socket, None, String::new());
        }

        Ok(())
    }
}

impl Drop for ClientWebSocketTransport {
    fn drop(&mut self) {
        let socket = self.shared.current.write().take();
        if let Some(reader) = socket.and_then(|socket| socket.reader.lock().take()) {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_url() {
        let url = Url::parse("http://localhost:1234/").unwrap();
        assert!(matches!(
            ClientWebSocketTransport::new(url),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_starts_closed() {
        let url = Url::parse("ws://localhost:1234/path").unwrap();
        let transport = ClientWebSocketTransport::new(url).unwrap();
        assert!(!transport.is_open());
        assert_eq!(transport.url().path(), "/path");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let _ = tracing_subscriber::fmt::try_init();

        // Nothing listens on port 9 (discard) in the test environment.
        let url = Url::parse("ws://127.0.0.1:9/").unwrap();
        let config = ClientConfig::default().with_connect_timeout(Duration::from_secs(2));
        let transport = ClientWebSocketTransport::with_config(url, config).unwrap();

        let result = transport
            .send(Frame::end(1, uuid::Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_open());
    }
}
