use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;

use crate::{BackendError, ClientFactory, ClientHandle, ConnectionSettings, Result, SetOptions};

type Store = moka::sync::Cache<String, Bytes>;

/// A process-local stand-in for a memcached cluster.
///
/// Every handle produced by one factory (and its clones) sees the same store,
/// so several handles behave like several processes talking to one server.
/// The factory also keeps the bookkeeping tests need: how many handles are
/// alive and how many `set`s were issued. A factory built with
/// [`InMemoryClientFactory::recording`] also keeps the [`SetOptions`] of every
/// `set`; the plain one does not, so long-running use stays bounded.
#[derive(Debug, Clone)]
pub struct InMemoryClientFactory {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    store: Store,
    // Only present on recording factories.
    set_log: Option<Mutex<Vec<SetOptions>>>,
    sets: AtomicUsize,
    created: AtomicUsize,
    live: AtomicUsize,
    refuse_connections: AtomicBool,
    offline: AtomicBool,
}

impl Default for InMemoryClientFactory {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl InMemoryClientFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(max_entries: u64) -> Self {
        Self::build(max_entries, None)
    }

    /// A factory that also logs the options of every `set`, for tests that
    /// check what reached the store.
    #[must_use]
    pub fn recording() -> Self {
        Self::build(10_000, Some(Mutex::new(Vec::new())))
    }

    fn build(max_entries: u64, set_log: Option<Mutex<Vec<SetOptions>>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: moka::sync::Cache::new(max_entries),
                set_log,
                sets: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                refuse_connections: AtomicBool::new(false),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Handles currently alive.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Handles ever created.
    #[must_use]
    pub fn handles_created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// `set`s issued so far.
    #[must_use]
    pub fn sets(&self) -> usize {
        self.shared.sets.load(Ordering::SeqCst)
    }

    /// Options of every `set` issued so far, in order. Always empty unless the
    /// factory was built with [`InMemoryClientFactory::recording`].
    #[must_use]
    pub fn set_log(&self) -> Vec<SetOptions> {
        self.shared
            .set_log
            .as_ref()
            .map(|log| log.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.shared.store.contains_key(key)
    }

    /// Removes a key behind every handle's back, as an operator or an
    /// eviction would.
    pub fn remove(&self, key: &str) {
        self.shared.store.invalidate(key);
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes every operation on existing handles fail.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }
}

impl ClientFactory for InMemoryClientFactory {
    type Handle = InMemoryClient;

    fn connect(&self, settings: &ConnectionSettings) -> Result<InMemoryClient> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(BackendError::Connection {
                endpoints: settings.endpoints.to_vec(),
                source: "connection refused".into(),
            });
        }

        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared.live.fetch_add(1, Ordering::SeqCst);

        Ok(InMemoryClient {
            shared: Arc::clone(&self.shared),
            settings: settings.clone(),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryClient {
    shared: Arc<Shared>,
    settings: ConnectionSettings,
}

impl InMemoryClient {
    /// Settings the handle was created with.
    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn ensure_online(&self) -> Result<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(BackendError::remote("store offline"));
        }
        Ok(())
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ClientHandle for InMemoryClient {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_online()?;
        Ok(self.shared.store.get(key))
    }

    fn set(&self, key: &str, value: &[u8], options: &SetOptions) -> Result<()> {
        self.ensure_online()?;
        self.shared.sets.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.shared.set_log {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(*options);
        }
        self.shared
            .store
            .insert(key.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.ensure_online()?;
        self.shared.store.invalidate(key);
        Ok(())
    }

    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.ensure_online()?;
        let entry = self
            .shared
            .store
            .entry(key.to_string())
            .or_insert_with(|| Bytes::copy_from_slice(value));
        Ok(entry.is_fresh())
    }
}
