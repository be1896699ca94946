//! One-shot capability to release a held lock.

use std::sync::Mutex;

type Action = Box<dyn FnOnce() + Send>;

/// A capability to release a held lock.
///
/// The lock is released the first time [Release::release] is called or when the [Release] is
/// dropped, whichever happens first. Any further call is a no-op.
#[must_use = "dropping a Release releases the lock immediately"]
pub struct Release {
    action: Mutex<Option<Action>>,
}

impl Release {
    /// Create a new [Release] that runs `action` once.
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Release the lock.
    ///
    /// Calling this more than once has no effect.
    pub fn release(&self) {
        // Take the action before running it so it can never run while the mutex is held
        let action = self.action.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }

    /// Returns whether the lock has already been released.
    pub fn is_released(&self) -> bool {
        self.action.lock().unwrap().is_none()
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting() -> (Release, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let release = Release::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        (release, count)
    }

    #[test]
    fn test_release_once() {
        let (release, count) = counting();
        assert!(!release.is_released());
        release.release();
        assert!(release.is_released());
        release.release();
        drop(release);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_drop() {
        let (release, count) = counting();
        drop(release);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
