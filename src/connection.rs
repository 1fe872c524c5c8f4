use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::Result;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // One slot per provider. The whole map, and with it every handle this
    // thread created, is dropped by the thread-exit destructor.
    static SLOTS: RefCell<HashMap<u64, Slot>> = RefCell::new(HashMap::new());
}

struct Slot {
    // Dead once the owning provider is dropped.
    owner: Weak<()>,
    handle: Box<dyn Any>,
}

/// Removes the slots of dropped providers from this thread's map.
fn sweep_dead_slots() {
    let dead: Vec<Slot> = SLOTS
        .try_with(|slots| {
            let mut slots = slots.borrow_mut();
            let ids: Vec<u64> = slots
                .iter()
                .filter(|(_, slot)| slot.owner.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| slots.remove(&id)).collect()
        })
        .unwrap_or_default();

    if !dead.is_empty() {
        tracing::debug!(
            released = dead.len(),
            thread = ?std::thread::current().id(),
            "released handles of dropped providers"
        );
    }
    // Handles are dropped here, after the map borrow has ended.
    drop(dead);
}

type Factory<H> = dyn Fn() -> Result<H> + Send + Sync;

/// Hands every calling thread its own client handle.
///
/// The first call on a thread runs the factory; later calls on that thread
/// return the same handle. Handles are given out as `Rc`, so they cannot be
/// moved to another thread. When a thread exits its handles are dropped with
/// no action from the caller.
///
/// Dropping the provider releases the dropping thread's handle at once. A
/// handle cached on another live thread is released the next time that
/// thread touches any provider, or when it exits.
pub struct ConnectionProvider<H> {
    id: u64,
    alive: Arc<()>,
    factory: Arc<Factory<H>>,
}

impl<H: 'static> ConnectionProvider<H> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<H> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            factory: Arc::new(factory),
        }
    }

    /// Returns this thread's handle, connecting on first use.
    ///
    /// A factory error is returned as is and nothing is cached, so the next
    /// call on this thread tries again.
    pub fn handle_for_current_thread(&self) -> Result<Rc<H>> {
        sweep_dead_slots();

        if let Some(handle) = self.cached() {
            return Ok(handle);
        }

        let handle = Rc::new((self.factory)()?);

        let slot = Slot {
            owner: Arc::downgrade(&self.alive),
            handle: Box::new(Rc::clone(&handle)),
        };
        match SLOTS.try_with(|slots| slots.borrow_mut().insert(self.id, slot)) {
            Ok(previous) => drop(previous),
            // Thread-local storage is already torn down; the handle lives only
            // as long as the caller keeps it.
            Err(_) => tracing::trace!(provider = self.id, "thread exiting, handle not cached"),
        }

        tracing::debug!(
            provider = self.id,
            thread = ?std::thread::current().id(),
            "created client handle"
        );

        Ok(handle)
    }

    pub fn with_handle<R>(&self, f: impl FnOnce(&H) -> Result<R>) -> Result<R> {
        let handle = self.handle_for_current_thread()?;
        f(&handle)
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        sweep_dead_slots();
        self.cached().is_some()
    }

    /// Drops this thread's handle so the next call reconnects.
    pub fn discard_current(&self) {
        let removed = SLOTS
            .try_with(|slots| slots.borrow_mut().remove(&self.id))
            .ok()
            .flatten();

        if removed.is_some() {
            tracing::debug!(
                provider = self.id,
                thread = ?std::thread::current().id(),
                "discarded client handle"
            );
        }
    }

    fn cached(&self) -> Option<Rc<H>> {
        SLOTS
            .try_with(|slots| {
                slots
                    .borrow()
                    .get(&self.id)
                    .and_then(|slot| slot.handle.downcast_ref::<Rc<H>>())
                    .cloned()
            })
            .ok()
            .flatten()
    }
}

impl<H> Drop for ConnectionProvider<H> {
    fn drop(&mut self) {
        // Slots on other threads die with `alive` and are swept there.
        let removed = SLOTS
            .try_with(|slots| slots.borrow_mut().remove(&self.id))
            .ok()
            .flatten();
        drop(removed);
    }
}

impl<H> fmt::Debug for ConnectionProvider<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
