//! Error types for the WebSocket message server and client.

use std::io;

use tether_transport::TransportError;
use thiserror::Error;

/// Errors raised while setting up a server or client.
#[derive(Debug, Error)]
pub enum Error {
    /// The accepted path is not absolute.
    #[error("Invalid path: {0} (must start with '/')")]
    InvalidPath(String),

    /// Reading the listener address failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
