//! NATS-backed [`PubSubClient`].

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tether_transport::TransportError;
use tracing::debug;

use super::PubSubClient;

/// Settings for a NATS connection.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NatsConfig {
    /// Server URLs, e.g. `nats://localhost:4222`.
    pub servers: Vec<String>,

    /// Client name reported to the server.
    pub name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: None,
        }
    }
}

impl NatsConfig {
    /// Config for a single server.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            servers: vec![server.into()],
            name: None,
        }
    }

    /// Set the client name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// [`PubSubClient`] backed by `async-nats`.
#[derive(Clone, Debug)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// The underlying `async-nats` client.
    #[must_use]
    pub const fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl PubSubClient for NatsClient {
    type Config = NatsConfig;

    async fn connect(config: &NatsConfig) -> Result<Self, TransportError> {
        if config.servers.is_empty() {
            return Err(TransportError::InvalidAddress(
                "no NATS servers configured".to_string(),
            ));
        }

        let mut options = ConnectOptions::new();
        if let Some(name) = &config.name {
            options = options.name(name);
        }

        let client = options
            .connect(config.servers.join(","))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!(
            "Connected to NATS at {:?} (max payload {})",
            config.servers,
            client.server_info().max_payload
        );
        Ok(Self { client })
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to publish: {:?}", e.kind())))
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Bytes>, TransportError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Other(format!("Failed to subscribe: {e}")))?;

        Ok(subscriber.map(|message| message.payload).boxed())
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to flush: {e}")))?;
        // Drain ends every subscription and then closes the connection.
        self.client
            .drain()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to drain: {e}")))
    }
}
