//! [`Transport`] over a pub/sub broker connection.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tether_transport::{
    Frame, FrameEncoding, FrameType, ReceiveHandler, ReceiverId, Receivers, Transport,
    TransportError,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache;
use crate::chunk::{self, ChunkAssembler};
use crate::client::PubSubClient;

/// Computes the publish subject for an outbound frame.
pub type SubjectResolver = Arc<dyn Fn(&Frame) -> Option<String> + Send + Sync>;

/// Where outbound frames are published.
#[derive(Clone)]
pub enum PublishSubject {
    /// Every frame goes to the same subject.
    Fixed(String),

    /// The subject is computed per frame.
    Resolver(SubjectResolver),
}

impl PublishSubject {
    /// Build a resolver-based subject.
    pub fn resolver<F>(resolve: F) -> Self
    where
        F: Fn(&Frame) -> Option<String> + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(resolve))
    }
}

impl Debug for PublishSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(subject) => f.debug_tuple("Fixed").field(subject).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<&str> for PublishSubject {
    fn from(subject: &str) -> Self {
        Self::Fixed(subject.to_string())
    }
}

impl From<String> for PublishSubject {
    fn from(subject: String) -> Self {
        Self::Fixed(subject)
    }
}

/// Options for a [`PubSubTransport`].
#[derive(Clone, Debug)]
pub struct PubSubTransportOptions {
    /// Subjects to receive frames from.
    pub subscriptions: Vec<String>,

    /// Where outbound frames are published.
    pub publish_subject: PublishSubject,

    /// Frame encoding. Oversized frames are only chunked when binary.
    pub encoding: FrameEncoding,

    /// How long an incomplete chunk group is kept.
    pub chunk_ttl: Duration,
}

impl PubSubTransportOptions {
    /// Options publishing to `publish_subject` with no subscriptions.
    pub fn new(publish_subject: impl Into<PublishSubject>) -> Self {
        Self {
            subscriptions: Vec::new(),
            publish_subject: publish_subject.into(),
            encoding: FrameEncoding::Cbor,
            chunk_ttl: Duration::from_secs(60),
        }
    }

    /// Add a subject to receive frames from.
    #[must_use]
    pub fn with_subscription(mut self, subject: impl Into<String>) -> Self {
        self.subscriptions.push(subject.into());
        self
    }

    /// Set the frame encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: FrameEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the chunk group TTL.
    #[must_use]
    pub const fn with_chunk_ttl(mut self, chunk_ttl: Duration) -> Self {
        self.chunk_ttl = chunk_ttl;
        self
    }
}

/// Transport over a pub/sub broker.
///
/// Frames are published to a fixed or per-frame subject and received from
/// any number of subscriptions. Binary frames larger than the broker's max
/// payload are split into chunks and reassembled on arrival.
pub struct PubSubTransport<C: PubSubClient> {
    config: C::Config,
    client: Arc<C>,
    publish_subject: PublishSubject,
    encoding: FrameEncoding,
    receivers: Receivers,
    subject_by_id: DashMap<u64, String>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C: PubSubClient> PubSubTransport<C> {
    /// Connect, reusing a cached physical connection for an equal config,
    /// and start reading every subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a subscription fails.
    pub async fn connect(
        config: C::Config,
        options: PubSubTransportOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let client = cache::connect_shared::<C>(&config).await?;

        let transport = Arc::new(Self {
            config,
            client,
            publish_subject: options.publish_subject,
            encoding: options.encoding,
            receivers: Receivers::new(),
            subject_by_id: DashMap::new(),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let assembler = Arc::new(Mutex::new(ChunkAssembler::new(options.chunk_ttl)));
        for subject in options.subscriptions {
            let stream = transport.client.subscribe(&subject).await?;
            debug!("Subscribed to {}", subject);

            let handle = tokio::spawn(read_loop(
                subject,
                stream,
                transport.encoding,
                transport.receivers.clone(),
                Arc::clone(&assembler),
            ));
            transport.readers.lock().push(handle);
        }

        Ok(transport)
    }

    /// The shared physical connection.
    #[must_use]
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Whether [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn resolve(&self, frame: &Frame) -> Result<String, TransportError> {
        match &self.publish_subject {
            PublishSubject::Fixed(subject) => Ok(subject.clone()),
            PublishSubject::Resolver(resolve) => {
                resolve(frame).ok_or(TransportError::NoSubject(frame.correlation_id))
            }
        }
    }

    /// Subject for `frame`. A stream keeps the subject of its first part until
    /// the frame that terminates it, whichever type that is.
    fn subject_for(&self, frame: &Frame) -> Result<String, TransportError> {
        if frame.frame_type == FrameType::Multi {
            if let Some(subject) = self.subject_by_id.get(&frame.correlation_id) {
                return Ok(subject.value().clone());
            }
            let subject = self.resolve(frame)?;
            self.subject_by_id
                .insert(frame.correlation_id, subject.clone());
            return Ok(subject);
        }

        if frame.is_terminal() {
            if let Some((_, subject)) = self.subject_by_id.remove(&frame.correlation_id) {
                return Ok(subject);
            }
        }
        self.resolve(frame)
    }

    /// Number of streams whose subject is currently remembered.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.subject_by_id.len()
    }
}

async fn read_loop(
    subject: String,
    mut stream: BoxStream<'static, Bytes>,
    encoding: FrameEncoding,
    receivers: Receivers,
    assembler: Arc<Mutex<ChunkAssembler>>,
) {
    while let Some(data) = stream.next().await {
        let data = if encoding.is_binary() && chunk::is_chunk(&data) {
            let accepted = assembler.lock().accept(&data);
            match accepted {
                Ok(Some(full)) => full,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Dropping chunk received on {}: {}", subject, e);
                    continue;
                }
            }
        } else {
            data
        };

        match encoding.decode_frame(&data) {
            Ok(frame) => {
                trace!(
                    "Received frame {} ({:?}) on {}",
                    frame.correlation_id, frame.frame_type, subject
                );
                receivers.dispatch(&frame);
            }
            Err(e) => warn!("Dropping undecodable message on {}: {}", subject, e),
        }
    }
    debug!("Subscription to {} ended", subject);
}

impl<C: PubSubClient> Debug for PubSubTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubTransport")
            .field("config", &self.config)
            .field("publish_subject", &self.publish_subject)
            .field("encoding", &self.encoding)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: PubSubClient> Transport for PubSubTransport<C> {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let subject = self.subject_for(&frame)?;
        let data = self.encoding.encode_frame(&frame)?;
        let max_payload = self.client.max_payload();

        if data.len() <= max_payload {
            trace!(
                "Publishing frame {} ({:?}) to {}",
                frame.correlation_id, frame.frame_type, subject
            );
            return self.client.publish(&subject, data).await;
        }

        if !self.encoding.is_binary() {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: max_payload,
            });
        }

        let chunks = chunk::split(&data, max_payload)?;
        debug!(
            "Publishing frame {} to {} as {} chunks ({} bytes)",
            frame.correlation_id,
            subject,
            chunks.len(),
            data.len()
        );
        for chunk in chunks {
            self.client.publish(&subject, chunk).await?;
        }
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) -> ReceiverId {
        self.receivers.register(handler)
    }

    fn remove_receiver(&self, id: ReceiverId) {
        self.receivers.unregister(id);
    }

    /// Stop reading, drop the cached connection and close it.
    ///
    /// Other transports sharing the same connection are closed with it.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        if cache::release::<C>(&self.config, &self.client).await {
            self.client.close().await
        } else {
            debug!("Connection for {:?} already closed by another transport", self.config);
            Ok(())
        }
    }
}

impl<C: PubSubClient> Drop for PubSubTransport<C> {
    fn drop(&mut self) {
        for reader in self.readers.get_mut().drain(..) {
            reader.abort();
        }
    }
}
