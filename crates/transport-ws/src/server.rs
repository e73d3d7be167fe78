//! Server side of the WebSocket transport, wrapping a socket accepted by axum.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tether_transport::{
    CloseEvent, CloseObserver, CloseObservers, Frame, FrameEncoding, ReceiveHandler, ReceiverId,
    Receivers, Transport, TransportError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server variant of the WebSocket transport.
///
/// Frames are only read once [`ServerWebSocketTransport::start`] has been
/// called, so the owner can register its receive handler first.
pub struct ServerWebSocketTransport {
    id: Uuid,
    encoding: FrameEncoding,
    sink: tokio::sync::Mutex<Option<SplitSink<WebSocket, Message>>>,
    stream: Mutex<Option<SplitStream<WebSocket>>>,
    receivers: Receivers,
    close_observers: CloseObservers,
    closing: AtomicBool,
    initiated_locally: AtomicBool,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ServerWebSocketTransport {
    /// Wrap an accepted socket using the binary frame encoding.
    #[must_use]
    pub fn new(socket: WebSocket) -> Arc<Self> {
        Self::with_encoding(socket, FrameEncoding::Cbor)
    }

    /// Wrap an accepted socket.
    #[must_use]
    pub fn with_encoding(socket: WebSocket, encoding: FrameEncoding) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            encoding,
            sink: tokio::sync::Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            receivers: Receivers::new(),
            close_observers: CloseObservers::new(),
            closing: AtomicBool::new(false),
            initiated_locally: AtomicBool::new(false),
            closed,
            reader: Mutex::new(None),
        })
    }

    /// Identifier of this socket, for logging.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the socket is open and not closing.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !*self.closed.borrow()
    }

    /// Register an observer notified once when the socket closes.
    pub fn on_close(&self, observer: CloseObserver) {
        self.close_observers.register(observer);
    }

    /// Start reading frames. Subsequent calls do nothing.
    pub fn start(self: &Arc<Self>) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            transport.read_loop(stream).await;
        });
        *self.reader.lock() = Some(handle);
    }

    async fn read_loop(&self, mut stream: SplitStream<WebSocket>) {
        let mut code = None;
        let mut reason = String::new();

        while let Some(message) = stream.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(Message::Close(frame)) => {
                    self.closing.store(true, Ordering::SeqCst);
                    if let Some(frame) = frame {
                        code = Some(frame.code);
                        reason = frame.reason.to_string();
                    }
                    // Keep polling so the close reply is flushed.
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket {} read ended: {}", self.id, e);
                    break;
                }
            };

            match self.encoding.decode_frame(&data) {
                Ok(frame) => {
                    trace!(
                        "WebSocket {} received frame {} ({:?})",
                        self.id, frame.correlation_id, frame.frame_type
                    );
                    self.receivers.dispatch(&frame);
                }
                Err(e) => warn!("WebSocket {} dropping undecodable message: {}", self.id, e),
            }
        }

        drop(stream);
        self.shutdown().await;
        self.finish(code, reason);
    }

    /// Close and drop the write half. With the read half gone this drops the
    /// socket, so the peer sees the TCP stream end even while this transport
    /// is still referenced.
    async fn shutdown(&self) {
        drop(self.stream.lock().take());
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            match timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("WebSocket {} sink close failed: {}", self.id, e),
                Err(_) => debug!("WebSocket {} sink close timed out", self.id),
            }
        }
    }

    fn finish(&self, code: Option<u16>, reason: String) {
        if self.closed.send_replace(true) {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);

        let event = CloseEvent {
            code,
            reason,
            initiated_locally: self.initiated_locally.load(Ordering::SeqCst),
        };
        debug!(
            "WebSocket {} closed (code {:?}, local {})",
            self.id, event.code, event.initiated_locally
        );
        self.close_observers.notify(&event);
    }

    fn to_message(&self, data: Bytes) -> Result<Message, TransportError> {
        if self.encoding.is_binary() {
            return Ok(Message::Binary(data));
        }
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::Other(format!("Encoded frame is not UTF-8: {e}")))?;
        Ok(Message::Text(text.into()))
    }
}

impl Debug for ServerWebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerWebSocketTransport")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for ServerWebSocketTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let data = self.encoding.encode_frame(&frame)?;
        let message = self.to_message(data)?;

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(TransportError::ConnectionClosed);
        };
        sink.send(message)
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }

    fn on_receive(&self, handler: ReceiveHandler) -> ReceiverId {
        self.receivers.register(handler)
    }

    fn remove_receiver(&self, id: ReceiverId) {
        self.receivers.unregister(id);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Ok(());
        }

        self.initiated_locally.store(true, Ordering::SeqCst);
        self.closing.store(true, Ordering::SeqCst);

        let close = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        }));
        {
            let mut sink = self.sink.lock().await;
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.send(close).await {
                    debug!("WebSocket {} failed to send close frame: {}", self.id, e);
                }
            }
        }

        let reading = self.reader.lock().is_some();
        if reading {
            let mut closed = self.closed.subscribe();
            if timeout(CLOSE_TIMEOUT, closed.wait_for(|closed| *closed))
                .await
                .is_err()
            {
                warn!("WebSocket {} did not finish closing in {:?}", self.id, CLOSE_TIMEOUT);
                if let Some(reader) = self.reader.lock().take() {
                    reader.abort();
                }
            }
        }

        self.shutdown().await;
        self.finish(None, String::new());
        Ok(())
    }
}
