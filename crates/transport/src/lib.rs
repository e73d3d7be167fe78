//! Generic transport abstraction for correlated message exchange.
//!
//! This crate provides the medium-agnostic pieces shared by every transport:
//! the [`Frame`] that travels between peers, the frame codec, and the
//! [`Transport`] trait itself. Specific media (in-memory, WebSocket, pub/sub)
//! are provided in separate crates.
//!
//! Transports handle:
//! - Frame serialization for the medium
//! - Connection establishment and teardown
//! - Fan-out of inbound frames to every registered receiver
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod observers;

use async_trait::async_trait;

pub use codec::FrameEncoding;
pub use error::{CodecError, TransportError};
pub use frame::{Frame, FrameType, SourceId, Value};
pub use observers::{
    CloseEvent, CloseObserver, CloseObservers, ReceiveHandler, ReceiverId, Receivers,
};

/// Transport trait for sending and receiving frames.
///
/// A transport may be shared by several message connections. Every handler
/// registered through [`Transport::on_receive`] sees every inbound frame;
/// filtering by correlation id and source is the connection's job.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the peer.
    ///
    /// May suspend until the medium accepts the frame, e.g. while a socket is
    /// still being established.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Register a handler for inbound frames.
    fn on_receive(&self, handler: ReceiveHandler) -> ReceiverId;

    /// Remove a handler registered with [`Transport::on_receive`].
    fn remove_receiver(&self, id: ReceiverId);

    /// Close the transport.
    async fn close(&self) -> Result<(), TransportError>;
}
