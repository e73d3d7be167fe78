//! Pub/sub transport with subject routing and payload chunking.
//!
//! A [`PubSubTransport`] publishes frames to a fixed subject or one computed
//! per frame, and receives frames from its subscriptions. Binary frames that
//! exceed the broker's max payload are split into chunks (see [`chunk`]) and
//! reassembled by the receiving side regardless of arrival order.
//!
//! Physical connections are shared: connecting twice with an equal
//! configuration reuses one [`PubSubClient`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cache;
pub mod chunk;
pub mod client;
mod error;
mod transport;

pub use cache::cached_connection_count;
pub use client::{MemoryBrokerConfig, MemoryClient, NatsClient, NatsConfig, PubSubClient};
pub use error::ChunkError;
pub use transport::{PubSubTransport, PubSubTransportOptions, PublishSubject, SubjectResolver};
