use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    BackendConfig, BackendError, CachedRepresentation, ClientFactory, ClientHandle,
    ConnectionProvider, DistributedMutex, MemcachedClientFactory, Result,
};

/// Facade over a memcached-compatible store.
///
/// Every operation runs on the calling thread's own client handle. Cloning is
/// cheap and clones share the configuration and the per-thread handles.
pub struct CacheBackend<F: ClientFactory> {
    inner: Arc<Inner<F>>,
}

struct Inner<F: ClientFactory> {
    config: BackendConfig,
    connections: Arc<ConnectionProvider<F::Handle>>,
}

pub type MemcachedBackend = CacheBackend<MemcachedClientFactory>;

impl MemcachedBackend {
    pub fn memcached(config: BackendConfig) -> Self {
        Self::new(config, MemcachedClientFactory::new())
    }
}

impl<F: ClientFactory> CacheBackend<F> {
    /// No connection is opened here; each thread connects on its first
    /// operation.
    pub fn new(config: BackendConfig, factory: F) -> Self {
        let settings = config.connection_settings().clone();
        let connections = ConnectionProvider::new(move || factory.connect(&settings));

        Self {
            inner: Arc::new(Inner {
                config,
                connections: Arc::new(connections),
            }),
        }
    }

    pub fn from_arguments(arguments: serde_json::Value, factory: F) -> Result<Self> {
        Ok(Self::new(BackendConfig::from_arguments(arguments)?, factory))
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionProvider<F::Handle> {
        &self.inner.connections
    }

    /// `Ok(None)` means the key is not in the store. A stored empty value
    /// comes back as `Some` of an empty buffer.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.connections.with_handle(|client| client.get(key))
    }

    /// Returns the found entries in request order, skipping missing keys.
    pub fn get_many(&self, keys: &[&str]) -> Result<Vec<(String, Bytes)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.inner
            .connections
            .with_handle(|client| client.get_multi(keys))
    }

    /// Overwrites any existing entry, applying the configured remote TTL and
    /// compression threshold.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let options = self.inner.config.set_options();
        self.inner
            .connections
            .with_handle(|client| client.set(key, value, &options))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.inner
            .connections
            .with_handle(|client| client.delete(key))
    }

    /// The regeneration lock for `key`.
    ///
    /// `None` unless the backend was configured with `distributed_lock`; the
    /// caller then coordinates with an in-process mutex of its own.
    pub fn acquire_mutex(&self, key: &str) -> Option<DistributedMutex<F::Handle>> {
        self.inner
            .config
            .distributed_lock()
            .then(|| DistributedMutex::new(Arc::clone(&self.inner.connections), key))
    }

    pub fn get_value<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: for<'de> serde::Deserialize<'de>,
    {
        self.get(key)?
            .map(|bytes| deserialize_repr(&bytes, self.inner.config.representation()))
            .transpose()
    }

    pub fn set_value<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: serde::Serialize + ?Sized,
    {
        let bytes = serialize_repr(value, self.inner.config.representation())?;
        self.set(key, &bytes)
    }
}

fn serialize_repr<V: serde::Serialize + ?Sized>(
    value: &V,
    cached_representation: CachedRepresentation,
) -> Result<Vec<u8>> {
    match cached_representation {
        CachedRepresentation::Binary => postcard::to_allocvec(value)
            .map_err(|e| BackendError::Serialization(format!("postcard: {e}"))),
        CachedRepresentation::Json => serde_json::to_vec(value)
            .map_err(|e| BackendError::Serialization(format!("serde_json: {e}"))),
    }
}

fn deserialize_repr<'de, V: serde::Deserialize<'de>>(
    bytes: &'de [u8],
    cached_representation: CachedRepresentation,
) -> Result<V> {
    match cached_representation {
        CachedRepresentation::Binary => postcard::from_bytes(bytes)
            .map_err(|e| BackendError::Serialization(format!("postcard: {e}"))),
        CachedRepresentation::Json => serde_json::from_slice(bytes)
            .map_err(|e| BackendError::Serialization(format!("serde_json: {e}"))),
    }
}

impl<F: ClientFactory> Clone for CacheBackend<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ClientFactory> fmt::Debug for CacheBackend<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBackend")
            .field("config", &self.inner.config)
            .field("connections", &self.inner.connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{InMemoryClientFactory, SetOptions};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        value: String,
    }

    fn backend(arguments: serde_json::Value) -> (CacheBackend<InMemoryClientFactory>, InMemoryClientFactory) {
        let factory = InMemoryClientFactory::recording();
        let backend = CacheBackend::from_arguments(arguments, factory.clone()).unwrap();
        (backend, factory)
    }

    #[test]
    fn test_set_and_get() {
        let (backend, _) = backend(json!({"url": "foo"}));

        backend.set("key", b"value").unwrap();
        assert_eq!(backend.get("key").unwrap().as_deref(), Some(&b"value"[..]));

        backend.set("key", b"other").unwrap();
        assert_eq!(backend.get("key").unwrap().as_deref(), Some(&b"other"[..]));
    }

    #[test]
    fn test_get_missing_key() {
        let (backend, _) = backend(json!({"url": "foo"}));
        assert_eq!(backend.get("never-set").unwrap(), None);
    }

    #[test]
    fn test_empty_value_is_not_missing() {
        let (backend, _) = backend(json!({"url": "foo"}));

        backend.set("empty", b"").unwrap();
        assert_eq!(backend.get("empty").unwrap(), Some(Bytes::new()));
    }

    #[test]
    fn test_delete() {
        let (backend, _) = backend(json!({"url": "foo"}));

        backend.set("key", b"value").unwrap();
        backend.delete("key").unwrap();
        assert_eq!(backend.get("key").unwrap(), None);

        backend.delete("key").unwrap();
        backend.delete("never-set").unwrap();
        assert_eq!(backend.get("key").unwrap(), None);
    }

    #[test]
    fn test_set_time() {
        let (backend, factory) = backend(json!({"url": "foo", "memcached_expire_time": 20}));

        backend.set("foo", b"bar").unwrap();
        assert_eq!(
            factory.set_log(),
            [SetOptions {
                ttl_seconds: Some(20),
                compress_threshold: None,
            }]
        );
    }

    #[test]
    fn test_set_min_compress_len() {
        let (backend, factory) = backend(json!({"url": "foo", "min_compress_len": 20}));

        backend.set("foo", b"bar").unwrap();
        assert_eq!(
            factory.set_log(),
            [SetOptions {
                ttl_seconds: None,
                compress_threshold: Some(20),
            }]
        );
    }

    #[test]
    fn test_no_set_args() {
        let (backend, factory) = backend(json!({"url": "foo"}));

        backend.set("foo", b"bar").unwrap();
        assert_eq!(factory.set_log(), [SetOptions::default()]);
    }

    #[test]
    fn test_handle_receives_connection_settings() {
        let (backend, _) = backend(json!({
            "url": ["a", "b", "c"],
            "binary": true,
            "behaviors": {"q": "p"},
        }));

        let handle = backend.connections().handle_for_current_thread().unwrap();
        let settings = handle.settings();
        assert_eq!(settings.endpoints.as_slice(), ["a", "b", "c"]);
        assert!(settings.binary_protocol);
        assert_eq!(settings.behaviors.get("q"), Some(&json!("p")));
    }

    #[test]
    fn test_acquire_mutex_requires_distributed_lock() {
        let (local, _) = backend(json!({"url": "foo"}));
        assert!(local.acquire_mutex("key").is_none());

        let (distributed, factory) = backend(json!({"url": "foo", "distributed_lock": true}));
        let mutex = distributed.acquire_mutex("key").unwrap();
        assert_eq!(mutex.key(), "_lockkey");

        assert!(mutex.acquire(false).unwrap());
        assert!(factory.contains("_lockkey"));
        assert!(!distributed.acquire_mutex("key").unwrap().acquire(false).unwrap());

        mutex.release().unwrap();
        assert!(!factory.contains("_lockkey"));
    }

    #[test]
    fn test_lock_does_not_touch_cached_value() {
        let (backend, _) = backend(json!({"url": "foo", "distributed_lock": true}));

        backend.set("key", b"value").unwrap();
        let mutex = backend.acquire_mutex("key").unwrap();
        assert!(mutex.acquire(false).unwrap());
        assert_eq!(backend.get("key").unwrap().as_deref(), Some(&b"value"[..]));
        mutex.release().unwrap();
        assert_eq!(backend.get("key").unwrap().as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn test_connection_failure_propagates() {
        let (backend, factory) = backend(json!({"url": "foo"}));
        factory.refuse_connections(true);

        let err = backend.get("key").unwrap_err();
        assert!(err.is_connection());

        factory.refuse_connections(false);
        assert_eq!(backend.get("key").unwrap(), None);
    }

    #[test]
    fn test_remote_failure_propagates() {
        let (backend, factory) = backend(json!({"url": "foo"}));
        backend.set("key", b"value").unwrap();

        factory.set_offline(true);
        assert!(matches!(backend.get("key"), Err(BackendError::Remote(_))));
        assert!(matches!(backend.set("key", b"v"), Err(BackendError::Remote(_))));
        assert!(matches!(backend.delete("key"), Err(BackendError::Remote(_))));
    }

    #[test]
    fn test_get_many_keeps_request_order() {
        let (backend, _) = backend(json!({"url": "foo"}));
        backend.set("k1", b"v1").unwrap();
        backend.set("k2", b"v2").unwrap();

        let found = backend.get_many(&["k2", "missing", "k1"]).unwrap();
        assert_eq!(
            found,
            [
                ("k2".to_string(), Bytes::from_static(b"v2")),
                ("k1".to_string(), Bytes::from_static(b"v1")),
            ]
        );
        assert!(backend.get_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_typed_values_in_both_representations() {
        for representation in ["binary", "json"] {
            let (backend, _) = backend(json!({"url": "foo", "representation": representation}));
            let data = TestData {
                value: format!("{representation}_test"),
            };

            backend.set_value("typed", &data).unwrap();
            assert_eq!(backend.get_value::<TestData>("typed").unwrap(), Some(data));
            assert_eq!(backend.get_value::<TestData>("missing").unwrap(), None);
        }
    }

    #[test]
    fn test_typed_value_decode_failure() {
        let (backend, _) = backend(json!({"url": "foo", "representation": "json"}));
        backend.set("raw", b"not json").unwrap();

        let err = backend.get_value::<TestData>("raw").unwrap_err();
        assert!(matches!(err, BackendError::Serialization(_)));
    }

    #[test]
    fn test_clones_share_thread_handle() {
        let (backend, factory) = backend(json!({"url": "foo"}));
        let clone = backend.clone();

        backend.set("key", b"value").unwrap();
        assert_eq!(clone.get("key").unwrap().as_deref(), Some(&b"value"[..]));
        assert_eq!(factory.handles_created(), 1);
    }
}
