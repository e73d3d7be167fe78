//! Message connections over WebSockets.
//!
//! - [`WebSocketMessageServer`] accepts sockets on one path and gives each its
//!   own [`tether_message::MessageConnection`], addressed by [`ConnectionId`]
//! - [`WebSocketMessageClient`] is a lazily connecting client, shared by every
//!   caller that asks for the same URL
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod error;
mod server;

pub use client::{WebSocketMessageClient, cached_client_count};
pub use error::Error;
pub use server::{
    ConnectInfo, ConnectionId, MessageServerConfig, ServerHandler, WebSocketMessageServer,
};
