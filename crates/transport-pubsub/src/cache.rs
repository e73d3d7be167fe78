//! Process-wide cache of physical pub/sub connections.
//!
//! Connecting twice with an equal configuration yields the same client. The
//! key is the client type plus a hash of its configuration.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, LazyLock};

use tether_transport::TransportError;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::PubSubClient;

type CacheKey = (TypeId, u64);
type CachedClient = Arc<dyn Any + Send + Sync>;

static CONNECTIONS: LazyLock<Mutex<HashMap<CacheKey, CachedClient>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn cache_key<C: PubSubClient>(config: &C::Config) -> CacheKey {
    let mut hasher = DefaultHasher::new();
    config.hash(&mut hasher);
    (TypeId::of::<C>(), hasher.finish())
}

/// Return the cached client for `config`, connecting on first use.
///
/// The cache lock is held while connecting, so concurrent callers with the
/// same configuration end up sharing a single connection.
pub(crate) async fn connect_shared<C: PubSubClient>(
    config: &C::Config,
) -> Result<Arc<C>, TransportError> {
    let key = cache_key::<C>(config);
    let mut connections = CONNECTIONS.lock().await;

    if let Some(cached) = connections.get(&key) {
        if let Ok(client) = Arc::clone(cached).downcast::<C>() {
            debug!("Reusing pub/sub connection for {:?}", config);
            return Ok(client);
        }
    }

    let client = Arc::new(C::connect(config).await?);
    debug!("Opened pub/sub connection for {:?}", config);
    connections.insert(key, Arc::clone(&client) as CachedClient);
    Ok(client)
}

/// Forget the cached client for `config` if it is still `client`.
///
/// Returns whether the entry was removed. `false` means another holder
/// already released, and closed, that connection.
pub(crate) async fn release<C: PubSubClient>(config: &C::Config, client: &Arc<C>) -> bool {
    let key = cache_key::<C>(config);
    let mut connections = CONNECTIONS.lock().await;

    let same = connections
        .get(&key)
        .is_some_and(|cached| std::ptr::addr_eq(Arc::as_ptr(cached), Arc::as_ptr(client)));
    if same {
        connections.remove(&key);
        debug!("Released pub/sub connection for {:?}", config);
    }
    same
}

/// Number of physical connections currently cached.
pub async fn cached_connection_count() -> usize {
    CONNECTIONS.lock().await.len()
}
