//! WebSocket transport.
//!
//! Two variants share the frame codec:
//! - [`ClientWebSocketTransport`] connects with `tokio-tungstenite`, opening
//!   the socket lazily and re-opening it after it closes
//! - [`ServerWebSocketTransport`] wraps a socket accepted by an axum handler
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod server;

pub use client::{ClientConfig, ClientWebSocketTransport};
pub use server::ServerWebSocketTransport;
