use std::{fmt, sync::Arc, time::Duration};

use crate::{ClientHandle, ConnectionProvider, Result};

/// Prepended to a cache key to form the key of its regeneration lock.
pub const LOCK_KEY_PREFIX: &str = "_lock";

/// Backoff stops growing once the attempt index reaches this value.
pub const MAX_BACKOFF_EXPONENT: u32 = 15;

const LOCK_MARKER: &[u8] = b"1";

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retry schedule for a contended lock.
///
/// The delay before the next attempt is `((i + 1) * jitter + 2^i) / 2.5`
/// seconds, where `i` is the number of failed attempts so far (capped at
/// [`MAX_BACKOFF_EXPONENT`]) and `jitter` is a fresh uniform draw in `[0, 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn delay(&self, jitter: f64) -> Duration {
        let i = f64::from(self.attempt);
        let jitter = jitter.clamp(0.0, 1.0);
        let exponential = f64::from(1u32 << self.attempt);

        Duration::from_secs_f64(((i + 1.0) * jitter + exponential) / 2.5)
    }

    /// Upper bound of any delay this schedule produces.
    #[must_use]
    pub fn max_delay() -> Duration {
        Backoff {
            attempt: MAX_BACKOFF_EXPONENT,
        }
        .delay(1.0)
    }

    pub fn advance(&mut self) {
        if self.attempt < MAX_BACKOFF_EXPONENT {
            self.attempt += 1;
        }
    }
}

/// Lock interface shared by the distributed mutex and whatever in-process
/// mutex a caller substitutes when the backend offers none.
pub trait CacheMutex {
    fn acquire(&self, wait: bool) -> Result<bool>;
    fn release(&self) -> Result<()>;
}

/// Cross-process mutex built on the store's atomic add and delete.
///
/// The lock is held while the lock key exists in the store. It is not
/// fenced: [`release`](Self::release) deletes the key whoever added it, and
/// the key carries no expiry, so a holder that dies without releasing leaves
/// the lock taken until the entry is removed by hand or evicted by the store.
/// Correctness relies on `add_if_absent` being atomic across every client of
/// the store.
pub struct DistributedMutex<H> {
    connections: Arc<ConnectionProvider<H>>,
    key: String,
    sleeper: Sleeper,
}

impl<H: ClientHandle + 'static> DistributedMutex<H> {
    /// Creates the mutex guarding `cache_key`. Each call to `acquire` or
    /// `release` uses the calling thread's connection.
    pub fn new(connections: Arc<ConnectionProvider<H>>, cache_key: &str) -> Self {
        Self {
            connections,
            key: format!("{LOCK_KEY_PREFIX}{cache_key}"),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Replaces the function used to wait between attempts.
    #[must_use]
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tries to take the lock.
    ///
    /// With `wait == false` a single add is attempted and `Ok(false)` reports
    /// contention. With `wait == true` the add is retried under [`Backoff`]
    /// until it succeeds. A store failure ends the attempt with an error
    /// immediately; only contention is retried.
    pub fn acquire(&self, wait: bool) -> Result<bool> {
        let client = self.connections.handle_for_current_thread()?;
        let mut backoff = Backoff::new();

        loop {
            if client.add_if_absent(&self.key, LOCK_MARKER)? {
                tracing::debug!(key = %self.key, attempts = backoff.attempt(), "lock acquired");
                return Ok(true);
            }
            if !wait {
                tracing::trace!(key = %self.key, "lock busy");
                return Ok(false);
            }

            let delay = backoff.delay(rand::random::<f64>());
            tracing::trace!(
                key = %self.key,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "lock contended, backing off"
            );
            (self.sleeper)(delay);
            backoff.advance();
        }
    }

    /// Deletes the lock key, whether or not this instance holds it.
    pub fn release(&self) -> Result<()> {
        self.connections.with_handle(|client| client.delete(&self.key))?;
        tracing::debug!(key = %self.key, "lock released");
        Ok(())
    }

    /// Blocks until the lock is held and returns a guard releasing it on drop.
    pub fn lock(&self) -> Result<DistributedMutexGuard<'_, H>> {
        self.acquire(true)?;
        Ok(DistributedMutexGuard {
            mutex: self,
            released: false,
        })
    }

    pub fn try_lock(&self) -> Result<Option<DistributedMutexGuard<'_, H>>> {
        Ok(self.acquire(false)?.then(|| DistributedMutexGuard {
            mutex: self,
            released: false,
        }))
    }
}

impl<H: ClientHandle + 'static> CacheMutex for DistributedMutex<H> {
    fn acquire(&self, wait: bool) -> Result<bool> {
        DistributedMutex::acquire(self, wait)
    }

    fn release(&self) -> Result<()> {
        DistributedMutex::release(self)
    }
}

impl<H> Clone for DistributedMutex<H> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            key: self.key.clone(),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<H> fmt::Debug for DistributedMutex<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Holds a [`DistributedMutex`] until dropped or [`unlock`](Self::unlock)ed.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct DistributedMutexGuard<'a, H: ClientHandle + 'static> {
    mutex: &'a DistributedMutex<H>,
    released: bool,
}

impl<H: ClientHandle + 'static> DistributedMutexGuard<'_, H> {
    /// Releases the lock, surfacing any store error.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.mutex.release()
    }
}

impl<H: ClientHandle + 'static> Drop for DistributedMutexGuard<'_, H> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.mutex.release() {
            tracing::warn!(key = %self.mutex.key, error = %err, "failed to release lock");
        }
    }
}
