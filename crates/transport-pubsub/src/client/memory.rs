//! In-process broker, for tests and single-process deployments.

use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tether_transport::TransportError;
use tracing::{debug, trace};
use uuid::Uuid;

use super::PubSubClient;

/// Default max payload, matching the NATS server default of 1 MiB.
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Subscribers per subject, per named broker.
type Broker = DashMap<String, Vec<flume::Sender<Bytes>>>;

static BROKERS: LazyLock<DashMap<String, Arc<Broker>>> = LazyLock::new(DashMap::new);

fn broker(name: &str) -> Arc<Broker> {
    BROKERS.entry(name.to_string()).or_default().value().clone()
}

/// Settings for an in-process broker connection.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MemoryBrokerConfig {
    /// Broker name. Clients on the same name see each other's messages.
    pub broker: String,

    /// Largest payload accepted per message.
    pub max_payload: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            broker: "default".to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl MemoryBrokerConfig {
    /// Config for the named broker.
    #[must_use]
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Self::default()
        }
    }

    /// Set the max payload.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// [`PubSubClient`] over an in-process broker with exact subject matching.
#[derive(Debug)]
pub struct MemoryClient {
    id: Uuid,
    broker: Arc<Broker>,
    max_payload: usize,
    subscriptions: Mutex<Vec<(String, flume::Sender<Bytes>)>>,
    closed: AtomicBool,
}

impl MemoryClient {
    /// Identifier of this connection.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl PubSubClient for MemoryClient {
    type Config = MemoryBrokerConfig;

    async fn connect(config: &MemoryBrokerConfig) -> Result<Self, TransportError> {
        Ok(Self {
            id: Uuid::new_v4(),
            broker: broker(&config.broker),
            max_payload: config.max_payload,
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        if let Some(mut subscribers) = self.broker.get_mut(subject) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
            trace!(
                "Published {} bytes to {} ({} subscribers)",
                payload.len(),
                subject,
                subscribers.len()
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Bytes>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let (tx, rx) = flume::unbounded();
        self.broker
            .entry(subject.to_string())
            .or_default()
            .push(tx.clone());
        self.subscriptions.lock().push((subject.to_string(), tx));
        Ok(rx.into_stream().boxed())
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Stop publishing and end every subscription made through this client.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (subject, tx) in &subscriptions {
            if let Some(mut subscribers) = self.broker.get_mut(subject) {
                subscribers.retain(|other| !other.same_channel(tx));
            }
        }
        debug!(
            "Memory client {} closed ({} subscriptions ended)",
            self.id,
            subscriptions.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let _ = tracing_subscriber::fmt::try_init();

        let config = MemoryBrokerConfig::new("memory-close-ends-subscriptions");
        let publisher = MemoryClient::connect(&config).await.unwrap();
        let subscriber = MemoryClient::connect(&config).await.unwrap();
        let mut stream = subscriber.subscribe("updates").await.unwrap();

        publisher
            .publish("updates", Bytes::from_static(b"one"))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));

        subscriber.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            subscriber.publish("updates", Bytes::from_static(b"two")).await,
            Err(TransportError::ConnectionClosed)
        ));

        // Nobody is left listening on the subject.
        publisher
            .publish("updates", Bytes::from_static(b"three"))
            .await
            .unwrap();
        assert!(publisher.broker.get("updates").unwrap().is_empty());
    }
}
