//! A reader/writer lock with FIFO admission.
//!
//! Every acquisition first passes through an _admission_ step serialized by an inner [Lock].
//! The inner [Lock] is held only while deciding whether to grant access (not while the caller
//! holds the [RwLock]), so readers admitted back-to-back hold the lock concurrently:
//!
//! - A reader is admitted once any active writer has released.
//! - A writer is admitted once any active writer and every reader admitted before it have
//!   released.
//!
//! Because a waiting writer holds the admission step, readers requested after it cannot be
//! admitted until it has been granted and released. A steady stream of readers therefore never
//! starves a writer.

use crate::{mutex::Lock, release::Release, run, signal::Signal, Error};
use futures::future::join_all;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::trace;

/// Active holders of a [RwLock].
#[derive(Default)]
struct State {
    writer: Option<Signal>,
    readers: HashMap<u64, Signal>,
    next_reader: u64,
}

impl State {
    /// Register a new active reader.
    fn add_reader(&mut self) -> (u64, Signal) {
        let id = self.next_reader;
        self.next_reader += 1;
        let reader = Signal::new();
        self.readers.insert(id, reader.clone());
        (id, reader)
    }

    /// Register a new active writer.
    fn set_writer(&mut self) -> Signal {
        let writer = Signal::new();
        self.writer = Some(writer.clone());
        self.readers.clear();
        writer
    }
}

/// An asynchronous reader/writer lock that admits acquisitions in the order they were requested.
///
/// Cloning a [RwLock] returns a handle to the same lock.
#[derive(Clone, Default)]
pub struct RwLock {
    admission: Lock,
    state: Arc<Mutex<State>>,
}

impl RwLock {
    /// Create a new unlocked [RwLock].
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire shared (read) access.
    ///
    /// Like [Lock::acquire], the caller is queued when this function is called.
    pub fn read(&self) -> impl Future<Output = Release> + Send + 'static {
        let state = self.state.clone();
        self.admission.run_exclusive(move || async move {
            let writer = state.lock().unwrap().writer.as_ref().map(Signal::wait);
            if let Some(writer) = writer {
                writer.await;
            }

            let (id, reader) = state.lock().unwrap().add_reader();
            trace!(id, "read granted");
            Self::reader_release(state, id, reader)
        })
    }

    /// Acquire exclusive (write) access.
    ///
    /// Like [Lock::acquire], the caller is queued when this function is called.
    pub fn write(&self) -> impl Future<Output = Release> + Send + 'static {
        let state = self.state.clone();
        self.admission.run_exclusive(move || async move {
            let writer = state.lock().unwrap().writer.as_ref().map(Signal::wait);
            if let Some(writer) = writer {
                writer.await;
            }

            // No reader can be added while we hold admission, so the snapshot is complete
            let readers: Vec<_> = state
                .lock()
                .unwrap()
                .readers
                .values()
                .map(Signal::wait)
                .collect();
            if !readers.is_empty() {
                trace!(readers = readers.len(), "write waiting for readers");
                join_all(readers).await;
            }

            let writer = state.lock().unwrap().set_writer();
            trace!("write granted");
            Self::writer_release(state, writer)
        })
    }

    /// Acquire shared (read) access only if it can be granted without waiting.
    pub fn try_read(&self) -> Result<Release, Error> {
        let admission = self
            .admission
            .try_acquire()
            .map_err(|_| Error::Contended)?;
        let (id, reader) = {
            let mut state = self.state.lock().unwrap();
            if state.writer.is_some() {
                return Err(Error::WriteLocked);
            }
            state.add_reader()
        };
        admission.release();
        trace!(id, "read granted");
        Ok(Self::reader_release(self.state.clone(), id, reader))
    }

    /// Acquire exclusive (write) access only if it can be granted without waiting.
    pub fn try_write(&self) -> Result<Release, Error> {
        let admission = self
            .admission
            .try_acquire()
            .map_err(|_| Error::Contended)?;
        let writer = {
            let mut state = self.state.lock().unwrap();
            if state.writer.is_some() {
                return Err(Error::WriteLocked);
            }
            if !state.readers.is_empty() {
                return Err(Error::ReadLocked);
            }
            state.set_writer()
        };
        admission.release();
        trace!("write granted");
        Ok(Self::writer_release(self.state.clone(), writer))
    }

    /// Acquire shared access, run `f`, and release before returning the output of `f`.
    ///
    /// The lock is released even if `f` fails, panics, or the returned future is dropped.
    pub fn with_read<F, Fut, T>(&self, f: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        run(self.read(), f)
    }

    /// Acquire exclusive access, run `f`, and release before returning the output of `f`.
    ///
    /// The lock is released even if `f` fails, panics, or the returned future is dropped.
    pub fn with_write<F, Fut, T>(&self, f: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        run(self.write(), f)
    }

    /// Returns whether an admission is in progress, a writer is active, or any reader is active.
    pub fn locked(&self) -> bool {
        if self.admission.locked() {
            return true;
        }
        let state = self.state.lock().unwrap();
        state.writer.is_some() || !state.readers.is_empty()
    }

    /// Returns whether two handles refer to the same [RwLock].
    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn reader_release(state: Arc<Mutex<State>>, id: u64, reader: Signal) -> Release {
        Release::new(move || {
            state.lock().unwrap().readers.remove(&id);
            trace!(id, "read released");
            reader.resolve();
        })
    }

    fn writer_release(state: Arc<Mutex<State>>, writer: Signal) -> Release {
        Release::new(move || {
            {
                let mut state = state.lock().unwrap();
                if state
                    .writer
                    .as_ref()
                    .is_some_and(|active| active.same(&writer))
                {
                    state.writer = None;
                }
            }
            trace!("write released");
            writer.resolve();
        })
    }
}
