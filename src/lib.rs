mod backend;
pub mod backends;
mod config;
mod connection;
mod error;
mod memory_impl;
mod mutex;

use bytes::Bytes;

pub use backend::{CacheBackend, MemcachedBackend};
pub use backends::memcached_impl::{MemcachedClient, MemcachedClientFactory};
pub use config::{BackendConfig, Behaviors, ConnectionSettings, Endpoints};
pub use connection::ConnectionProvider;
pub use error::{BackendError, Result};
pub use memory_impl::{InMemoryClient, InMemoryClientFactory};
pub use mutex::{
    Backoff, CacheMutex, DistributedMutex, DistributedMutexGuard, LOCK_KEY_PREFIX,
    MAX_BACKOFF_EXPONENT,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachedRepresentation {
    #[default]
    Binary,
    Json,
}

/// Per-call arguments forwarded to [`ClientHandle::set`].
///
/// Both fields stay `None` unless the backend was configured with them, so a
/// client can tell "not configured" apart from an explicit value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl_seconds: Option<u32>,
    pub compress_threshold: Option<usize>,
}

/// A connection to the remote store, owned by exactly one thread.
///
/// Implementations need not be `Send` or `Sync`: the [`ConnectionProvider`]
/// never lets a handle leave the thread that created it.
pub trait ClientHandle {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Fetches several keys at once. Missing keys are absent from the result.
    fn get_multi(&self, keys: &[&str]) -> Result<Vec<(String, Bytes)>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key)? {
                found.push(((*key).to_string(), value));
            }
        }
        Ok(found)
    }

    fn set(&self, key: &str, value: &[u8], options: &SetOptions) -> Result<()>;

    /// Deleting a key that does not exist is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Stores `value` only if `key` holds nothing. Must be atomic across all
    /// clients of the store; `Ok(false)` means the key already existed.
    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool>;
}

/// Builds client handles. Called at most once per thread per backend, possibly
/// from several threads at the same time.
pub trait ClientFactory: Send + Sync + 'static {
    type Handle: ClientHandle + 'static;

    fn connect(&self, settings: &ConnectionSettings) -> Result<Self::Handle>;
}
