//! Physical pub/sub connections.
//!
//! A [`PubSubClient`] is one connection to a broker. Transports share clients
//! through the connection cache, so a client must tolerate concurrent
//! publishers and several subscriptions at once.

mod memory;
mod nats;

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tether_transport::TransportError;

pub use memory::{MemoryBrokerConfig, MemoryClient};
pub use nats::{NatsClient, NatsConfig};

/// A connection to a pub/sub broker.
#[async_trait]
pub trait PubSubClient: Debug + Send + Sync + Sized + 'static {
    /// Connection settings. Equal configurations share one connection.
    type Config: Clone + Debug + Hash + Send + Sync + 'static;

    /// Open a new connection.
    async fn connect(config: &Self::Config) -> Result<Self, TransportError>;

    /// Publish `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to `subject`, yielding raw payloads in arrival order.
    async fn subscribe(&self, subject: &str)
    -> Result<BoxStream<'static, Bytes>, TransportError>;

    /// Largest payload the broker accepts in one message.
    fn max_payload(&self) -> usize;

    /// Flush and close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
