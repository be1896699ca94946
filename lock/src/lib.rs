//! Serialize access to shared resources across asynchronous tasks.
//!
//! This crate provides three layered primitives:
//!
//! - [Lock]: a FIFO-fair exclusive lock.
//! - [RwLock]: a reader/writer lock that admits readers and writers in the order they were
//!   requested, allowing admitted readers to run concurrently.
//! - [RwLockMap]: a registry of [RwLock]s keyed by an arbitrary key that creates locks on first
//!   use and evicts them once they are no longer held.
//!
//! Every acquisition returns a [Release]. Calling [Release::release] (or dropping the [Release])
//! hands the lock to the next waiter. Releasing more than once is a no-op.
//!
//! # Ordering
//!
//! A position in the queue is taken when an acquisition is _requested_ (when `acquire`, `read`,
//! or `write` is called), not when the returned future is first polled. This makes the order
//! in which waiters are granted access independent of the order in which an executor happens to
//! poll them.
//!
//! # Cancellation
//!
//! Dropping a pending acquisition never lets a later waiter overtake a current holder. A
//! dropped acquisition keeps its place in the queue and releases as soon as it would have been
//! granted.
//!
//! # Example
//!
//! ```rust
//! use commonware_lock::RwLockMap;
//! use futures::executor::block_on;
//!
//! let locks: RwLockMap = RwLockMap::new();
//! block_on(async {
//!     let value = locks.with_write("account".to_string(), || async { 42 }).await;
//!     assert_eq!(value, 42);
//! });
//! assert!(locks.is_empty());
//! ```
//!
//! # Status
//!
//! `commonware-lock` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use std::future::Future;
use thiserror::Error;

mod map;
mod mutex;
mod release;
mod rwlock;
mod signal;

pub use map::RwLockMap;
pub use mutex::Lock;
pub use release::Release;
pub use rwlock::RwLock;

/// Errors that can occur when attempting to acquire a lock without waiting.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("lock is held")]
    Locked,
    #[error("admission in progress")]
    Contended,
    #[error("held by a writer")]
    WriteLocked,
    #[error("held by readers")]
    ReadLocked,
}

/// Wait for `acquire`, run `f`, and release before returning the output of `f`.
///
/// The release also happens if `f` panics or if the returned future is dropped.
async fn run<A, F, Fut, T>(acquire: A, f: F) -> T
where
    A: Future<Output = Release>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let release = acquire.await;
    let output = f().await;
    release.release();
    output
}
