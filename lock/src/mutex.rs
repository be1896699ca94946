//! A FIFO-fair exclusive lock.
//!
//! The lock keeps no queue. Instead, it tracks a single "tail" [Signal] that resolves when the
//! most recently requested acquisition is released. Each new acquisition installs its own
//! [Signal] as the tail and waits on the one it replaced, forming a chain in which every waiter
//! is woken by exactly its predecessor.

use crate::{release::Release, run, signal::Signal, Error};
use std::{
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::trace;

/// A FIFO-fair asynchronous lock.
///
/// Cloning a [Lock] returns a handle to the same lock.
#[derive(Clone, Default)]
pub struct Lock {
    tail: Arc<Mutex<Option<Signal>>>,
}

impl Lock {
    /// Create a new unlocked [Lock].
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock.
    ///
    /// The caller is queued when this function is called (not when the returned future is first
    /// polled) and is granted the lock once every earlier acquisition has been released. If the
    /// lock is idle, the returned future completes on its first poll.
    pub fn acquire(&self) -> impl Future<Output = Release> + Send + 'static {
        let mine = Signal::new();
        let previous = self.tail.lock().unwrap().replace(mine.clone());
        let waiting = previous
            .as_ref()
            .filter(|previous| !previous.is_resolved())
            .map(Signal::wait);

        // Created eagerly so that dropping the future releases our place in the queue
        let release = self.release(previous, mine);
        async move {
            if let Some(waiting) = waiting {
                waiting.await;
            }
            trace!("lock granted");
            release
        }
    }

    /// Acquire the lock only if it is idle.
    pub fn try_acquire(&self) -> Result<Release, Error> {
        let mine = Signal::new();
        {
            let mut tail = self.tail.lock().unwrap();
            if tail.is_some() {
                return Err(Error::Locked);
            }
            *tail = Some(mine.clone());
        }
        trace!("lock granted");
        Ok(self.release(None, mine))
    }

    /// Acquire the lock, run `f`, and release the lock before returning the output of `f`.
    ///
    /// The lock is released even if `f` fails (the output is returned unchanged), panics, or the
    /// returned future is dropped.
    pub fn run_exclusive<F, Fut, T>(&self, f: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        run(self.acquire(), f)
    }

    /// Returns whether the lock is held or any acquisition is waiting for it.
    pub fn locked(&self) -> bool {
        self.tail.lock().unwrap().is_some()
    }

    /// Build the [Release] for an acquisition that waits on `previous` and resolves `mine`.
    ///
    /// If released before `previous` resolves (the acquisition was abandoned), the unlock is
    /// deferred until `previous` resolves so that no successor can overtake the current holder.
    fn release(&self, previous: Option<Signal>, mine: Signal) -> Release {
        let tail = self.tail.clone();
        Release::new(move || {
            let unlock = move || {
                {
                    let mut tail = tail.lock().unwrap();
                    if tail.as_ref().is_some_and(|tail| tail.same(&mine)) {
                        *tail = None;
                    }
                }
                trace!("lock released");
                mine.resolve();
            };
            match previous {
                Some(previous) => previous.on_resolve(unlock),
                None => unlock(),
            }
        })
    }
}
