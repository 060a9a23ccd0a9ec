//! In-memory cache with per-entry expiration and single-flight creation.
//!
//! [`Cache::get_or_create`] returns a live entry if one exists. Otherwise
//! it runs the factory, but only once per key at a time: callers that
//! arrive while a factory for the same key is running wait for that run
//! and receive its result, value or error. Errors are never stored, so the
//! next caller after a failure runs the factory again.
//!
//! A factory that panics propagates the panic to the callers waiting on
//! it, and the key is free for the next caller.
//!
//! Expired entries are not purged by a timer. Whenever a lookup finds an
//! expired entry, every expired entry is swept out.
//!
//! # Example
//!
//! ```
//! use deepscan::cache::Cache;
//! use deepscan::error::ScanError;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ScanError> {
//! let cache: Cache<String> = Cache::new();
//!
//! let token = cache
//!     .get_or_create("token", || async { Ok("abc".to_string()) })
//!     .await?;
//! assert_eq!(token, "abc");
//! # Ok(())
//! # }
//! ```

use crate::error::ScanError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default lifetime of an entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expiration: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expiration > now
    }
}

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Store<V, E> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    in_flight: Mutex<HashMap<String, Flight<V, E>>>,
    item_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Clone, E> Store<V, E> {
    fn insert(&self, key: &str, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expiration: Instant::now() + ttl,
        };
        if lock(&self.entries).insert(key.to_string(), entry).is_none() {
            self.item_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn finish(&self, key: &str) {
        lock(&self.in_flight).remove(key);
    }

    /// Returns the live value for `key`, sweeping expired entries if the
    /// one found has expired.
    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let stale = {
            let entries = lock(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => true,
                None => false,
            }
        };

        if stale {
            self.sweep(now);
        }
        None
    }

    fn sweep(&self, now: Instant) {
        if self.item_count.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        self.item_count.fetch_sub(removed, Ordering::Relaxed);
        tracing::debug!(removed, remaining = entries.len(), "swept expired cache entries");
    }
}

/// A key/value cache shared by reference between its consumers.
///
/// Cloning a `Cache` yields another handle to the same store.
pub struct Cache<V, E = ScanError> {
    store: Arc<Store<V, E>>,
    ttl: Duration,
}

impl<V, E> Clone for Cache<V, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ttl: self.ttl,
        }
    }
}

impl<V, E> Cache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose entries live for [`DEFAULT_TTL`].
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Creates a cache with a custom default entry lifetime.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            store: Arc::new(Store {
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                item_count: AtomicUsize::new(0),
            }),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key`, or runs `factory` and caches
    /// its value for the default lifetime.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let ttl = self.ttl;
        self.get_or_create_with(key, move || factory().map(move |res| res.map(|v| (v, ttl))))
            .await
    }

    /// Like [`get_or_create`](Self::get_or_create), but the factory picks
    /// the lifetime of the entry it creates.
    ///
    /// `factory` is called while the in-flight table is locked; it must only
    /// build the future, not touch this cache.
    pub async fn get_or_create_with<F, Fut>(&self, key: &str, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, Duration), E>> + Send + 'static,
    {
        if let Some(value) = self.store.lookup(key) {
            return Ok(value);
        }

        let flight = {
            let mut in_flight = lock(&self.store.in_flight);
            if let Some(flight) = in_flight.get(key) {
                flight.clone()
            } else if let Some(value) = self.store.lookup(key) {
                // A flight finished between the first lookup and taking the lock.
                return Ok(value);
            } else {
                let store = Arc::clone(&self.store);
                let owned_key = key.to_string();
                let created = factory();
                let flight = async move {
                    let result = match AssertUnwindSafe(created).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => {
                            store.finish(&owned_key);
                            panic::resume_unwind(payload);
                        }
                    };
                    let result = match result {
                        Ok((value, ttl)) => {
                            store.insert(&owned_key, value.clone(), ttl);
                            Ok(value)
                        }
                        Err(err) => Err(err),
                    };
                    store.finish(&owned_key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key.to_string(), flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Drops the entry for `key`, live or not.
    pub fn invalidate(&self, key: &str) {
        if lock(&self.store.entries).remove(key).is_some() {
            self.store.item_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        lock(&self.store.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.store.entries).clear();
        self.store.item_count.store(0, Ordering::Relaxed);
    }
}

impl<V, E> Default for Cache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
