//! A registry of [RwLock]s keyed by an arbitrary key.
//!
//! Locks are created the first time a key is used and are evicted as soon as the last
//! acquisition on them has been released, so the registry only ever contains keys that are held
//! or waited on.

use crate::{release::Release, run, rwlock::RwLock, Error};
use futures::{future::BoxFuture, ready, FutureExt};
use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::Debug,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tracing::trace;

type Locks<K> = Arc<Mutex<HashMap<K, RwLock>>>;

/// Evicts `key` when dropped if it still maps to `lock` and `lock` is idle.
struct Eviction<K: Eq + Hash + Debug> {
    locks: Locks<K>,
    key: K,
    lock: RwLock,
}

impl<K: Eq + Hash + Debug> Drop for Eviction<K> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap();
        if self.lock.locked() {
            return;
        }

        // The entry may already have been replaced by a newer lock for the same key
        if locks
            .get(&self.key)
            .is_some_and(|current| current.same(&self.lock))
        {
            locks.remove(&self.key);
            trace!(key = ?self.key, remaining = locks.len(), "evicted idle lock");
        }
    }
}

/// A pending keyed acquisition.
struct Acquiring<K: Eq + Hash + Debug> {
    acquire: BoxFuture<'static, Release>,

    // Must be declared after `acquire`: if dropped while pending, the acquisition is abandoned
    // before the eviction check runs.
    eviction: Option<Eviction<K>>,
}

impl<K: Eq + Hash + Debug> Unpin for Acquiring<K> {}

impl<K: Eq + Hash + Debug + Send + 'static> Future for Acquiring<K> {
    type Output = Release;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let release = ready!(self.acquire.poll_unpin(cx));
        let eviction = self
            .eviction
            .take()
            .expect("keyed acquisition polled after completion");
        Poll::Ready(Release::new(move || {
            release.release();
            drop(eviction);
        }))
    }
}

/// A registry of [RwLock]s keyed by `K`.
///
/// Cloning a [RwLockMap] returns a handle to the same registry.
pub struct RwLockMap<K: Eq + Hash = String> {
    locks: Locks<K>,
}

impl<K: Eq + Hash> Clone for RwLockMap<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for RwLockMap<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug + Send + Sync + 'static> RwLockMap<K> {
    /// Create a new, empty [RwLockMap].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, empty [RwLockMap] with space for at least `capacity` concurrently held keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::with_capacity(capacity))),
        }
    }

    /// Acquire shared (read) access to `key`.
    ///
    /// Once the returned [Release] is released, `key` is evicted if no other acquisition holds
    /// or waits on it.
    pub fn read(&self, key: K) -> impl Future<Output = Release> + Send + 'static {
        self.acquire(key, |lock| lock.read())
    }

    /// Acquire exclusive (write) access to `key`.
    ///
    /// Once the returned [Release] is released, `key` is evicted if no other acquisition holds
    /// or waits on it.
    pub fn write(&self, key: K) -> impl Future<Output = Release> + Send + 'static {
        self.acquire(key, |lock| lock.write())
    }

    /// Acquire shared (read) access to `key` only if it can be granted without waiting.
    pub fn try_read(&self, key: K) -> Result<Release, Error> {
        self.try_acquire(key, RwLock::try_read)
    }

    /// Acquire exclusive (write) access to `key` only if it can be granted without waiting.
    pub fn try_write(&self, key: K) -> Result<Release, Error> {
        self.try_acquire(key, RwLock::try_write)
    }

    /// Acquire shared access to `key`, run `f`, and release before returning the output of `f`.
    ///
    /// The lock is released (and `key` evicted if idle) even if `f` fails, panics, or the
    /// returned future is dropped.
    pub fn with_read<F, Fut, T>(&self, key: K, f: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        run(self.read(key), f)
    }

    /// Acquire exclusive access to `key`, run `f`, and release before returning the output of
    /// `f`.
    ///
    /// The lock is released (and `key` evicted if idle) even if `f` fails, panics, or the
    /// returned future is dropped.
    pub fn with_write<F, Fut, T>(&self, key: K, f: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        run(self.write(key), f)
    }

    /// Returns the number of keys that are held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Returns whether no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().unwrap().is_empty()
    }

    /// Returns whether `key` is held or waited on.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.locks.lock().unwrap().contains_key(key)
    }

    /// Returns whether the lock for `key` is currently locked (`false` if `key` is absent).
    pub fn is_locked<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.locks
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(RwLock::locked)
    }

    fn acquire<A>(&self, key: K, request: impl FnOnce(&RwLock) -> A) -> Acquiring<K>
    where
        A: Future<Output = Release> + Send + 'static,
    {
        // Queue on the lock before leaving the critical section, otherwise a concurrent release
        // could evict the entry in between
        let (lock, acquire) = {
            let mut locks = self.locks.lock().unwrap();
            let lock = locks.entry(key.clone()).or_default().clone();
            let acquire = request(&lock).boxed();
            (lock, acquire)
        };
        Acquiring {
            acquire,
            eviction: Some(Eviction {
                locks: self.locks.clone(),
                key,
                lock,
            }),
        }
    }

    fn try_acquire(
        &self,
        key: K,
        request: impl FnOnce(&RwLock) -> Result<Release, Error>,
    ) -> Result<Release, Error> {
        let (lock, result) = {
            let mut locks = self.locks.lock().unwrap();
            let lock = locks.entry(key.clone()).or_default().clone();
            let result = request(&lock);
            (lock, result)
        };

        // On failure, dropping the eviction removes an entry created by this attempt
        let eviction = Eviction {
            locks: self.locks.clone(),
            key,
            lock,
        };
        let release = result?;
        Ok(Release::new(move || {
            release.release();
            drop(eviction);
        }))
    }
}
