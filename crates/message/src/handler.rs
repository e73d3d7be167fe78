//! Receive handler contract.

use crate::Payload;
use crate::error::HandlerError;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

/// What a receive handler produces for one inbound request.
pub enum HandlerResponse<T> {
    /// One value, sent back as a single response frame.
    Single(T),
    /// A lazy sequence of values, streamed back as multi frames followed by
    /// an end frame. An item error stops the stream and is sent back as an
    /// anomaly or error frame instead of the end frame.
    Stream(BoxStream<'static, Result<T, HandlerError>>),
    /// Nothing. No frame is sent back.
    None,
}

impl<T: Payload> HandlerResponse<T> {
    /// Stream back the items of `stream`.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, HandlerError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Stream back a fixed sequence of values.
    pub fn iter<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(futures::stream::iter(values.into_iter().map(Ok)).boxed())
    }
}

impl<T> fmt::Debug for HandlerResponse<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(value) => f.debug_tuple("Single").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::None => f.write_str("None"),
        }
    }
}

impl<T> From<T> for HandlerResponse<T> {
    fn from(value: T) -> Self {
        Self::Single(value)
    }
}

/// Handles inbound requests on a message connection.
///
/// Closures of the form `Fn(T) -> impl Future<Output = Result<HandlerResponse<T>, HandlerError>>`
/// implement this trait directly.
#[async_trait]
pub trait MessageHandler<T: Payload>: Send + Sync + 'static {
    /// Handle one request payload.
    async fn handle(&self, payload: T) -> Result<HandlerResponse<T>, HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Payload,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResponse<T>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: T) -> Result<HandlerResponse<T>, HandlerError> {
        (self)(payload).await
    }
}
