//! Correlated request/response and streaming messages over any transport.
//!
//! A [`MessageConnection`] wraps a [`tether_transport::Transport`] and adds:
//!
//! - **Correlation**: every request gets a process-unique id and responses are
//!   routed back to the request that is waiting for them
//! - **Streaming**: handlers can answer with a lazy sequence of values
//! - **Failures**: handler anomalies and errors travel back as frames and are
//!   re-raised on the requesting side
//! - **Timeouts**: a request fails if the responder goes quiet
//!
//! # Example
//!
//! ```no_run
//! use tether_message::{HandlerError, HandlerResponse, MessageConnection};
//! use tether_transport_memory::MemoryTransport;
//!
//! # async fn example() -> Result<(), tether_message::Error> {
//! let (a, b) = MemoryTransport::pair();
//! let client = MessageConnection::<String>::new(a);
//! let server = MessageConnection::<String>::new(b);
//!
//! server.on_receive(|name: String| async move {
//!     Ok::<_, HandlerError>(HandlerResponse::Single(format!("Hello, {name}")))
//! });
//!
//! assert_eq!(client.request_one("World".to_string()).await?, "Hello, World");
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod connection;
pub mod conversation;
pub mod error;
pub mod handler;

pub use connection::{ConnectionConfig, MessageConnection, PING, PONG, Reply, ResponseStream};
pub use conversation::{ConversationObserver, ConversationSummary, Perspective, TimedFrame};
pub use error::{Anomaly, Error, HandlerError, Result};
pub use handler::{HandlerResponse, MessageHandler};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_transport::Value;

/// Application payloads carried by a [`MessageConnection`].
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub(crate) fn to_value<T: Serialize>(payload: &T) -> Result<Value> {
    Value::serialized(payload).map_err(Into::into)
}

pub(crate) fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    value.deserialized().map_err(Into::into)
}
