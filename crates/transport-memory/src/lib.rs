//! In-memory transport implementation for testing
//!
//! This transport connects two endpoints within the same process, which is
//! handy for exercising message connections without a network.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tether_transport::{
    CloseEvent, CloseObserver, CloseObservers, Frame, FrameEncoding, ReceiveHandler, ReceiverId,
    Receivers, Transport, TransportError,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One end of an in-memory duplex channel.
pub struct MemoryTransport {
    id: Uuid,
    encoding: FrameEncoding,
    outgoing: Mutex<Option<flume::Sender<Bytes>>>,
    receivers: Receivers,
    close_observers: CloseObservers,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    /// Create two connected transports using the default frame encoding.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_encoding(FrameEncoding::default())
    }

    /// Create two connected transports using the given frame encoding.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn pair_with_encoding(encoding: FrameEncoding) -> (Arc<Self>, Arc<Self>) {
        let (a_to_b_tx, a_to_b_rx) = flume::unbounded();
        let (b_to_a_tx, b_to_a_rx) = flume::unbounded();

        let a = Arc::new(Self::new(encoding, a_to_b_tx));
        let b = Arc::new(Self::new(encoding, b_to_a_tx));

        a.start(b_to_a_rx);
        b.start(a_to_b_rx);

        debug!("Memory transport pair created: {} <-> {}", a.id, b.id);

        (a, b)
    }

    fn new(encoding: FrameEncoding, outgoing: flume::Sender<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            encoding,
            outgoing: Mutex::new(Some(outgoing)),
            receivers: Receivers::new(),
            close_observers: CloseObservers::new(),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    /// Identifier of this end.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this end is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Number of receive handlers currently registered on this end.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Register an observer notified once when this end closes.
    pub fn on_close(&self, observer: CloseObserver) {
        self.close_observers.register(observer);
    }

    fn start(self: &Arc<Self>, incoming: flume::Receiver<Bytes>) {
        let weak = Arc::downgrade(self);
        let encoding = self.encoding;
        let handle = tokio::spawn(async move {
            Self::pump(weak, incoming, encoding).await;
        });
        *self.pump.lock() = Some(handle);
    }

    async fn pump(weak: Weak<Self>, incoming: flume::Receiver<Bytes>, encoding: FrameEncoding) {
        while let Ok(data) = incoming.recv_async().await {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            match encoding.decode_frame(&data) {
                Ok(frame) => transport.receivers.dispatch(&frame),
                Err(e) => warn!("Memory transport {} dropped undecodable frame: {}", transport.id, e),
            }
        }

        // Peer hung up.
        if let Some(transport) = weak.upgrade() {
            transport.shutdown(false);
        }
    }

    fn shutdown(&self, initiated_locally: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing memory transport {}", self.id);

        // Dropping the sender disconnects the peer's pump.
        self.outgoing.lock().take();

        self.close_observers.notify(&CloseEvent {
            code: None,
            reason: String::new(),
            initiated_locally,
        });
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sender = self
            .outgoing
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;

        let data = self.encoding.encode_frame(&frame)?;

        debug!(
            "Memory transport {} sending frame {} ({:?}, {} bytes)",
            self.id,
            frame.correlation_id,
            frame.frame_type,
            data.len()
        );

        sender
            .send_async(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn on_receive(&self, handler: ReceiveHandler) -> ReceiverId {
        self.receivers.register(handler)
    }

    fn remove_receiver(&self, id: ReceiverId) {
        self.receivers.unregister(id);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown(true);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
