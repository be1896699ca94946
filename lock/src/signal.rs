//! A one-time completion that can be awaited by many tasks.

use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
};

/// Work to run once a [Signal] resolves.
type Follower = Box<dyn FnOnce() + Send>;

thread_local! {
    /// Followers queued on this thread, `Some` while a resolution is draining them.
    static DEFERRED: RefCell<Option<VecDeque<Follower>>> = const { RefCell::new(None) };
}

/// Run `followers` on the current thread.
///
/// A follower that resolves another [Signal] does not run that [Signal]'s followers itself:
/// they are appended to the queue drained by the outermost call. Chains of followers of any
/// length therefore run at constant stack depth, in the order they become runnable.
fn run_followers(followers: impl IntoIterator<Item = Follower>) {
    let draining = DEFERRED.with(|deferred| {
        let mut deferred = deferred.borrow_mut();
        let draining = deferred.is_some();
        deferred.get_or_insert_with(VecDeque::new).extend(followers);
        draining
    });
    if draining {
        return;
    }

    let _drain = Drain;
    while let Some(follower) =
        DEFERRED.with(|deferred| deferred.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        follower();
    }
}

/// Ends the current drain when dropped (including when a follower panics).
struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        // Dropped outside of the borrow: a follower's captures may touch the queue on drop
        let remaining = DEFERRED.with(|deferred| deferred.borrow_mut().take());
        drop(remaining);
    }
}

/// A clonable, single-resolution completion.
///
/// Clones refer to the same completion (compare them with [Signal::same]). Resolving is
/// idempotent: only the first call to [Signal::resolve] wakes waiters and runs followers.
#[derive(Clone)]
pub(crate) struct Signal {
    inner: Arc<Inner>,
}

struct Inner {
    rx: Shared<oneshot::Receiver<()>>,

    // `None` once resolved.
    pending: Mutex<Option<Pending>>,
}

struct Pending {
    tx: oneshot::Sender<()>,
    followers: Vec<Follower>,
}

impl Signal {
    /// Create a new unresolved [Signal].
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                rx: rx.shared(),
                pending: Mutex::new(Some(Pending {
                    tx,
                    followers: Vec::new(),
                })),
            }),
        }
    }

    /// Returns a future that completes once the [Signal] is resolved.
    ///
    /// If every handle to the [Signal] is dropped without resolving it, the future also
    /// completes (nothing is left that could resolve it).
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.rx.clone().map(|_| ())
    }

    /// Returns whether two handles refer to the same [Signal].
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns whether the [Signal] has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.pending.lock().unwrap().is_none()
    }

    /// Resolve the [Signal], waking all waiters and running all followers.
    ///
    /// Returns `false` if the [Signal] was already resolved.
    pub fn resolve(&self) -> bool {
        let Some(pending) = self.inner.pending.lock().unwrap().take() else {
            return false;
        };
        let _ = pending.tx.send(());
        run_followers(pending.followers);
        true
    }

    /// Run `f` once the [Signal] is resolved (immediately if it already is).
    ///
    /// `f` runs on the thread that resolves the [Signal], after the [Signal] is marked resolved
    /// and before the outermost [Signal::resolve] on that thread returns.
    pub fn on_resolve(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if let Some(pending) = pending.as_mut() {
                pending.followers.push(Box::new(f));
                return;
            }
        }
        run_followers([Box::new(f) as Follower]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_resolve_wakes_all_waiters() {
        let signal = Signal::new();
        let first = signal.wait();
        let second = signal.clone().wait();
        assert!(!signal.is_resolved());

        assert!(signal.resolve());
        assert!(signal.is_resolved());
        block_on(async move {
            first.await;
            second.await;
        });

        // Waiting after resolution completes immediately
        assert!(signal.wait().now_or_never().is_some());
    }

    #[test]
    fn test_resolve_idempotent() {
        let signal = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        signal.on_resolve({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(signal.resolve());
        assert!(!signal.resolve());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_resolve_after_resolution_runs_immediately() {
        let signal = Signal::new();
        signal.resolve();
        let count = Arc::new(AtomicUsize::new(0));
        signal.on_resolve({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_long_follower_chain() {
        // Every follower resolves the next signal in the chain
        let signals: Vec<_> = (0..100_000).map(|_| Signal::new()).collect();
        let count = Arc::new(AtomicUsize::new(0));
        for pair in signals.windows(2) {
            let next = pair[1].clone();
            let count = count.clone();
            pair[0].on_resolve(move || {
                count.fetch_add(1, Ordering::SeqCst);
                next.resolve();
            });
        }

        assert!(signals[0].resolve());
        assert_eq!(count.load(Ordering::SeqCst), signals.len() - 1);
        assert!(signals.iter().all(Signal::is_resolved));
    }

    #[test]
    fn test_nested_followers_run_in_order() {
        let first = Signal::new();
        let second = Signal::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        first.on_resolve({
            let second = second.clone();
            let log = log.clone();
            move || {
                second.resolve();
                log.lock().unwrap().push("first");
            }
        });
        second.on_resolve({
            let log = log.clone();
            move || log.lock().unwrap().push("second")
        });
        first.on_resolve({
            let log = log.clone();
            move || log.lock().unwrap().push("third")
        });

        // Followers of `second` are queued behind the followers already runnable
        first.resolve();
        assert_eq!(*log.lock().unwrap(), vec!["first", "third", "second"]);

        // Nothing is left queued once the outermost resolution returns
        let late = Signal::new();
        late.resolve();
        late.on_resolve({
            let log = log.clone();
            move || log.lock().unwrap().push("late")
        });
        assert_eq!(log.lock().unwrap().last(), Some(&"late"));
    }

    #[test]
    fn test_follower_panic_does_not_wedge_thread() {
        let signal = Signal::new();
        signal.on_resolve(|| panic!("boom"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| signal.resolve()));
        assert!(result.is_err());

        // Later resolutions on this thread still run their followers
        let next = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        next.on_resolve({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        next.resolve();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same() {
        let signal = Signal::new();
        assert!(signal.same(&signal.clone()));
        assert!(!signal.same(&Signal::new()));
    }

    #[test]
    fn test_wait_completes_when_dropped_unresolved() {
        let signal = Signal::new();
        let waiter = signal.wait();
        drop(signal);
        assert!(waiter.now_or_never().is_some());
    }
}
