use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use memcached_backend_rs::{
    Backoff, BackendConfig, CacheBackend, CacheMutex, InMemoryClientFactory,
};

/// Two backends over one store stand in for two processes sharing a cluster.
fn process(store: &InMemoryClientFactory) -> CacheBackend<InMemoryClientFactory> {
    let config = BackendConfig::builder()
        .endpoints("127.0.0.1")
        .distributed_lock(true)
        .build()
        .unwrap();
    CacheBackend::new(config, store.clone())
}

#[test]
fn test_second_process_is_refused_until_release() {
    let store = InMemoryClientFactory::new();
    let a = process(&store).acquire_mutex("report").unwrap();
    let b = process(&store).acquire_mutex("report").unwrap();

    assert!(a.acquire(false).unwrap());

    let contender = b.clone();
    let refused = thread::spawn(move || contender.acquire(false).unwrap())
        .join()
        .unwrap();
    assert!(!refused);

    a.release().unwrap();
    assert!(b.acquire(false).unwrap());
    b.release().unwrap();
}

#[test]
fn test_blocking_acquire_waits_for_holder() {
    let store = InMemoryClientFactory::new();
    let holder = process(&store).acquire_mutex("report").unwrap();
    let waiter = process(&store).acquire_mutex("report").unwrap();

    assert!(holder.acquire(false).unwrap());
    let released = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&released);
    let started = Instant::now();
    let waiting = thread::spawn(move || {
        let acquired = waiter.acquire(true).unwrap();
        (acquired, flag.load(Ordering::SeqCst))
    });

    thread::sleep(Duration::from_millis(100));
    released.store(true, Ordering::SeqCst);
    holder.release().unwrap();

    let (acquired, saw_release) = waiting.join().unwrap();
    assert!(acquired);
    assert!(saw_release);
    // First retry sleeps at least 2^0 / 2.5 seconds.
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(started.elapsed() < Backoff::max_delay());
}

#[test]
fn test_critical_sections_never_overlap() {
    let store = InMemoryClientFactory::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let mutex = process(&store)
                .acquire_mutex("regenerate")
                .unwrap()
                .with_sleeper(|_| thread::sleep(Duration::from_millis(1)));
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                for _ in 0..5 {
                    let guard = mutex.lock().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                    guard.unlock().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(entered.load(Ordering::SeqCst), 30);
    assert!(!store.contains("_lockregenerate"));
}

#[test]
fn test_crashed_holder_keeps_lock_until_removed() {
    let store = InMemoryClientFactory::new();
    let crashed = process(&store);

    thread::spawn(move || {
        let mutex = crashed.acquire_mutex("report").unwrap();
        assert!(mutex.acquire(false).unwrap());
        // Thread ends without releasing.
    })
    .join()
    .unwrap();

    let survivor = process(&store).acquire_mutex("report").unwrap();
    assert!(!survivor.acquire(false).unwrap());

    // An operator clears the entry by hand.
    store.remove("_lockreport");
    assert!(survivor.acquire(false).unwrap());
}

#[test]
fn test_locks_are_per_key() {
    let store = InMemoryClientFactory::new();
    let backend = process(&store);

    let first: Box<dyn CacheMutex> = Box::new(backend.acquire_mutex("a").unwrap());
    let second: Box<dyn CacheMutex> = Box::new(backend.acquire_mutex("b").unwrap());

    assert!(first.acquire(false).unwrap());
    assert!(second.acquire(false).unwrap());
    first.release().unwrap();
    second.release().unwrap();
}
