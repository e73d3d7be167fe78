//! Correlated request/response and streaming over a transport.

use crate::conversation::{ConversationObserver, ConversationRecorder, ConversationSummary, Perspective};
use crate::error::{Anomaly, Error, HandlerError, Result};
use crate::handler::{HandlerResponse, MessageHandler};
use crate::{Payload, from_value, to_value};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Deserialize;
use tether_transport::{
    Frame, FrameType, ReceiverId, SourceId, Transport, TransportError, Value,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

/// Payload of a liveness probe.
pub const PING: &str = "__ping__";

/// Reply to a liveness probe.
pub const PONG: &str = "__pong__";

const NO_HANDLER: &str = "No receive handler set.";

// Shared by every connection in the process, so ids never collide on a shared transport.
static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

fn next_correlation_id() -> u64 {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

type ResponseSender = mpsc::UnboundedSender<Result<Frame>>;

/// Configuration for a message connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for each response frame.
    pub response_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(5000),
        }
    }
}

impl ConnectionConfig {
    /// Set the response timeout.
    #[must_use]
    pub const fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}

/// The raw shape of a reply: one value, or a stream of values.
pub enum Reply<T> {
    /// The responder answered with a single response frame.
    Single(T),
    /// The responder answered with multi frames.
    Stream(ResponseStream<T>),
}

impl<T: fmt::Debug> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(value) => f.debug_tuple("Single").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Lazy, single-pass sequence of response values.
///
/// Dropping the stream cancels the request: its correlation entry is removed
/// and later frames for it are ignored.
pub struct ResponseStream<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T: Payload> ResponseStream<T> {
    fn once(value: T) -> Self {
        Self {
            inner: futures::stream::iter([Ok(value)]).boxed(),
        }
    }

    fn from_exchange(mut exchange: Exchange, first: Option<T>) -> Self {
        let inner = async_stream::stream! {
            if let Some(first) = first {
                yield Ok(first);

                loop {
                    match exchange.next_frame().await {
                        Ok(frame) => match frame.frame_type {
                            FrameType::Multi => match from_value(&frame.payload) {
                                Ok(value) => yield Ok(value),
                                Err(e) => {
                                    yield Err(e);
                                    break;
                                }
                            },
                            FrameType::Response => {
                                yield from_value(&frame.payload);
                                break;
                            }
                            FrameType::End => break,
                            _ => {
                                yield Err(into_failure(frame));
                                break;
                            }
                        },
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }
            }
        };

        Self {
            inner: inner.boxed(),
        }
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

/// Removes a correlation entry when the request that owns it goes away.
struct PendingGuard {
    pending: Arc<DashMap<u64, ResponseSender>>,
    correlation_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.remove(&self.correlation_id).is_some() {
            trace!("Removed pending request {}", self.correlation_id);
        }
    }
}

/// Requester-side state of one outstanding request.
struct Exchange {
    correlation_id: u64,
    responses: mpsc::UnboundedReceiver<Result<Frame>>,
    response_timeout: Duration,
    committed_source: Option<SourceId>,
    recorder: ConversationRecorder,
    _guard: PendingGuard,
}

impl Exchange {
    /// Wait for the next frame from the responder this request committed to.
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let frame = match timeout(self.response_timeout, self.responses.recv()).await {
                Err(_) => {
                    debug!(
                        "Request {} timed out after {:?}",
                        self.correlation_id, self.response_timeout
                    );
                    return Err(Error::Timeout(self.response_timeout));
                }
                Ok(None) => return Err(Error::ChannelClosed),
                Ok(Some(result)) => result?,
            };

            match self.committed_source {
                None => self.committed_source = Some(frame.source),
                Some(source) if source != frame.source => {
                    warn!(
                        "Received responses from multiple sources for request {}; keeping the first, ignoring the rest",
                        self.correlation_id
                    );
                    continue;
                }
                Some(_) => {}
            }

            self.recorder.record(&frame);
            return Ok(frame);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FailurePayload {
    #[serde(default)]
    message: String,
    #[serde(default)]
    info: Option<Value>,
}

/// Turn an anomaly or error frame into the error it carries.
fn into_failure(frame: Frame) -> Error {
    let payload: FailurePayload = frame.payload.deserialized().unwrap_or_default();
    match frame.frame_type {
        FrameType::Anomaly => Error::Anomaly(Anomaly {
            message: payload.message,
            info: payload
                .info
                .and_then(|info| info.deserialized().ok())
                .unwrap_or(serde_json::Value::Null),
        }),
        FrameType::Error => Error::Remote {
            message: payload.message,
        },
        other => Error::Codec(format!(
            "Unexpected {other:?} frame for request {}",
            frame.correlation_id
        )),
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn failure_payload(err: &HandlerError, request_payload: &Value) -> (FrameType, Value) {
    match err {
        HandlerError::Anomaly(anomaly) => (
            FrameType::Anomaly,
            Value::Map(vec![
                (text("message"), text(&anomaly.message)),
                (
                    text("info"),
                    Value::serialized(&anomaly.info).unwrap_or(Value::Null),
                ),
                (text("requestPayload"), request_payload.clone()),
            ]),
        ),
        HandlerError::Failure(message) => (
            FrameType::Error,
            Value::Map(vec![
                (text("message"), text(message)),
                (text("requestPayload"), request_payload.clone()),
            ]),
        ),
    }
}

fn contract_violation(panic: &(dyn Any + Send)) -> ! {
    let message = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!("Receive handler panicked ({message}); handlers must fail with HandlerError. Aborting.");
    std::process::abort()
}

struct Inner<T: Payload> {
    id: SourceId,
    transport: Arc<dyn Transport>,
    response_timeout: RwLock<Duration>,
    pending: Arc<DashMap<u64, ResponseSender>>,
    handler: RwLock<Option<Arc<dyn MessageHandler<T>>>>,
    conversation_observer: RwLock<Option<ConversationObserver>>,
    receiver: OnceLock<ReceiverId>,
}

impl<T: Payload> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(id) = self.receiver.get() {
            self.transport.remove_receiver(*id);
            trace!("Connection {} unregistered from its transport", self.id);
        }
    }
}

impl<T: Payload> Inner<T> {
    fn route(self: &Arc<Self>, frame: Frame) {
        if frame.source == self.id {
            trace!(
                "Connection {} ignoring its own frame {}",
                self.id, frame.correlation_id
            );
            return;
        }

        if frame.frame_type == FrameType::Send {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.handle_request(frame).await;
            });
            return;
        }

        // Other sharers of the transport see our frames and we see theirs.
        let sender = self
            .pending
            .get(&frame.correlation_id)
            .map(|entry| entry.value().clone());

        match sender {
            Some(sender) => {
                if sender.send(Ok(frame)).is_err() {
                    trace!("Pending request already gone");
                }
            }
            None => trace!(
                "Connection {} ignoring {:?} frame {}: no pending request",
                self.id, frame.frame_type, frame.correlation_id
            ),
        }
    }

    async fn begin(&self, payload: Value) -> Result<Exchange> {
        let correlation_id = next_correlation_id();
        let frame = Frame::send(correlation_id, payload, self.id);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(correlation_id, tx);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            correlation_id,
        };

        let observer = self.conversation_observer.read().clone();
        let recorder = ConversationRecorder::new(Perspective::Requester, &frame, observer);
        let response_timeout = *self.response_timeout.read();

        trace!("Connection {} sending request {}", self.id, correlation_id);
        self.transport.send(frame).await?;

        Ok(Exchange {
            correlation_id,
            responses: rx,
            response_timeout,
            committed_source: None,
            recorder,
            _guard: guard,
        })
    }

    async fn handle_request(self: Arc<Self>, request: Frame) {
        let observer = self.conversation_observer.read().clone();
        let mut recorder = ConversationRecorder::new(Perspective::Responder, &request, observer);
        let correlation_id = request.correlation_id;

        if matches!(&request.payload, Value::Text(payload) if payload == PING) {
            let pong = Frame::response(correlation_id, text(PONG), self.id);
            self.respond(&mut recorder, pong).await;
            return;
        }

        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            warn!(
                "Connection {} received request {} with no receive handler",
                self.id, correlation_id
            );
            let err = HandlerError::Failure(NO_HANDLER.to_string());
            self.respond_failure(&mut recorder, &request, &err).await;
            return;
        };

        let payload = match from_value::<T>(&request.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not decode request {}: {}", correlation_id, e);
                let err = HandlerError::failure(e);
                self.respond_failure(&mut recorder, &request, &err).await;
                return;
            }
        };

        let outcome = match AssertUnwindSafe(handler.handle(payload))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => contract_violation(panic.as_ref()),
        };

        match outcome {
            Ok(HandlerResponse::Single(value)) => match to_value(&value) {
                Ok(value) => {
                    let frame = Frame::response(correlation_id, value, self.id);
                    self.respond(&mut recorder, frame).await;
                }
                Err(e) => {
                    let err = HandlerError::failure(e);
                    self.respond_failure(&mut recorder, &request, &err).await;
                }
            },
            Ok(HandlerResponse::Stream(stream)) => {
                self.stream_back(&mut recorder, &request, stream).await;
            }
            Ok(HandlerResponse::None) => {
                debug!("Handler produced no response for request {}", correlation_id);
            }
            Err(err) => self.respond_failure(&mut recorder, &request, &err).await,
        }
    }

    async fn stream_back(
        &self,
        recorder: &mut ConversationRecorder,
        request: &Frame,
        stream: BoxStream<'static, std::result::Result<T, HandlerError>>,
    ) {
        let correlation_id = request.correlation_id;
        let mut stream = AssertUnwindSafe(stream).catch_unwind();

        while let Some(item) = stream.next().await {
            let value = match item {
                Ok(Ok(value)) => value,
                Ok(Err(err)) => {
                    self.respond_failure(recorder, request, &err).await;
                    return;
                }
                Err(panic) => contract_violation(panic.as_ref()),
            };

            let frame = match to_value(&value) {
                Ok(value) => Frame::multi(correlation_id, value, self.id),
                Err(e) => {
                    let err = HandlerError::failure(e);
                    self.respond_failure(recorder, request, &err).await;
                    return;
                }
            };

            if !self.respond(recorder, frame).await {
                return;
            }
        }

        self.respond(recorder, Frame::end(correlation_id, self.id))
            .await;
    }

    async fn respond_failure(
        &self,
        recorder: &mut ConversationRecorder,
        request: &Frame,
        err: &HandlerError,
    ) {
        let (frame_type, payload) = failure_payload(err, &request.payload);
        let frame = Frame::new(frame_type, request.correlation_id, payload, self.id);
        self.respond(recorder, frame).await;
    }

    async fn respond(&self, recorder: &mut ConversationRecorder, frame: Frame) -> bool {
        let correlation_id = frame.correlation_id;
        recorder.record(&frame);
        match self.transport.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send response for request {}: {}", correlation_id, e);
                false
            }
        }
    }
}

/// A connection that correlates requests and responses over a transport.
///
/// Cloning is cheap; clones share the same identity, handler, and pending
/// requests.
pub struct MessageConnection<T: Payload> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for MessageConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> fmt::Debug for MessageConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConnection")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl<T: Payload> MessageConnection<T> {
    /// Create a connection over `transport` with the default configuration.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    /// Create a connection over `transport`.
    #[must_use]
    pub fn with_config(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            transport,
            response_timeout: RwLock::new(config.response_timeout),
            pending: Arc::new(DashMap::new()),
            handler: RwLock::new(None),
            conversation_observer: RwLock::new(None),
            receiver: OnceLock::new(),
        });

        let weak = Arc::downgrade(&inner);
        let receiver = inner.transport.on_receive(Arc::new(move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.route(frame);
            }
        }));
        let _ = inner.receiver.set(receiver);

        debug!("Created message connection {}", inner.id);

        Self { inner }
    }

    /// Source id stamped on every frame this connection emits.
    #[must_use]
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Current per-frame response timeout.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        *self.inner.response_timeout.read()
    }

    /// Change the per-frame response timeout for subsequent requests.
    pub fn set_response_timeout(&self, response_timeout: Duration) {
        *self.inner.response_timeout.write() = response_timeout;
    }

    /// Number of requests still waiting for frames.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register the handler for inbound requests, replacing any previous one.
    pub fn on_receive<H>(&self, handler: H)
    where
        H: MessageHandler<T>,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Register an observer for completed exchanges, replacing any previous one.
    pub fn on_conversation<F>(&self, observer: F)
    where
        F: Fn(&ConversationSummary) + Send + Sync + 'static,
    {
        *self.inner.conversation_observer.write() = Some(Arc::new(observer));
    }

    /// Fire-and-forget: send `payload` without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the transport
    /// rejects the frame.
    pub async fn send(&self, payload: T) -> Result<()> {
        let frame = Frame::send(next_correlation_id(), to_value(&payload)?, self.inner.id);
        self.inner.transport.send(frame).await?;
        Ok(())
    }

    /// Send `payload` and return the reply in its raw shape.
    ///
    /// # Errors
    ///
    /// Returns the anomaly or error raised by the responder, a timeout if no
    /// frame arrives in time, or the transport failure.
    #[instrument(skip_all, fields(connection = %self.inner.id))]
    pub async fn request(&self, payload: T) -> Result<Reply<T>> {
        let value = to_value(&payload)?;
        let mut exchange = self.inner.begin(value).await?;
        let first = exchange.next_frame().await?;

        match first.frame_type {
            FrameType::Response => Ok(Reply::Single(from_value(&first.payload)?)),
            FrameType::Multi => {
                let value = from_value(&first.payload)?;
                Ok(Reply::Stream(ResponseStream::from_exchange(
                    exchange,
                    Some(value),
                )))
            }
            FrameType::End => Ok(Reply::Stream(ResponseStream::from_exchange(exchange, None))),
            _ => Err(into_failure(first)),
        }
    }

    /// Send `payload` and return exactly one value.
    ///
    /// If the responder streams several values, the first is returned and the
    /// rest are drained and discarded.
    ///
    /// # Errors
    ///
    /// Same as [`Self::request`], plus [`Error::EmptyResponse`] when the
    /// responder streams no value at all.
    #[instrument(skip_all, fields(connection = %self.inner.id))]
    pub async fn request_one(&self, payload: T) -> Result<T> {
        match self.request(payload).await? {
            Reply::Single(value) => Ok(value),
            Reply::Stream(mut stream) => {
                let first = stream.next().await.ok_or(Error::EmptyResponse)??;

                let mut discarded = 0usize;
                while let Some(item) = stream.next().await {
                    item?;
                    discarded += 1;
                }
                if discarded > 0 {
                    warn!(
                        "request_one: multiple responses were returned; all but the first were discarded ({discarded})"
                    );
                }

                Ok(first)
            }
        }
    }

    /// Send `payload` and return the response values as a stream.
    ///
    /// A single response yields a one-element stream.
    ///
    /// # Errors
    ///
    /// Same as [`Self::request`] for the first frame; later failures are
    /// yielded as stream items.
    #[instrument(skip_all, fields(connection = %self.inner.id))]
    pub async fn request_multi(&self, payload: T) -> Result<ResponseStream<T>> {
        Ok(match self.request(payload).await? {
            Reply::Single(value) => ResponseStream::once(value),
            Reply::Stream(stream) => stream,
        })
    }

    /// Liveness probe. Returns whether the peer answered with the pong
    /// sentinel.
    ///
    /// # Errors
    ///
    /// Returns a timeout or transport error if the peer does not answer.
    pub async fn ping(&self) -> Result<bool> {
        let mut exchange = self.inner.begin(text(PING)).await?;
        let frame = exchange.next_frame().await?;
        match frame.frame_type {
            FrameType::Response => Ok(frame.payload == text(PONG)),
            _ => Err(into_failure(frame)),
        }
    }

    /// Fail every outstanding request with a transport error.
    ///
    /// Used when the underlying medium goes away so callers do not wait for
    /// the response timeout.
    pub fn abort_pending<F>(&self, make_error: F)
    where
        F: Fn() -> TransportError,
    {
        let ids: Vec<u64> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }

        debug!(
            "Connection {} aborting {} pending requests",
            self.inner.id,
            ids.len()
        );
        for id in ids {
            if let Some((_, sender)) = self.inner.pending.remove(&id) {
                let _ = sender.send(Err(Error::Transport(make_error())));
            }
        }
    }

    /// Close the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error.
    pub async fn close(&self) -> Result<()> {
        self.inner.transport.close().await?;
        Ok(())
    }
}
