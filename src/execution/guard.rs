//! Concurrency Guard
//!
//! One mutual-exclusion lock serializes every transition-affecting operation
//! in the process: forwarding items, entering workflows, and structural edits
//! of workflow definitions.
//!
//! The lock is deliberately coarse. Step behaviors may touch shared external
//! resources (mailboxes, identifier counters) that are not scoped to a single
//! item, so narrowing it to per-item or per-workflow locks requires auditing
//! every registered behavior first.
//!
//! Acquisition blocks without timeout. A stuck behavior holds up every other
//! transition until it returns.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{trace, warn};
use once_cell::sync::Lazy;

/// The process-wide guard shared by default by every engine.
static GLOBAL_GUARD: Lazy<ConcurrencyGuard> = Lazy::new(ConcurrencyGuard::new);

/// Cloneable handle to a mutual-exclusion lock.
///
/// Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGuard {
    lock: Arc<Mutex<()>>,
}

impl ConcurrencyGuard {
    /// Creates an independent lock. Mostly useful for tests; production
    /// code should use [`ConcurrencyGuard::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the process-wide lock.
    pub fn global() -> Self {
        GLOBAL_GUARD.clone()
    }

    /// Blocks until the lock is acquired.
    ///
    /// A panic in a previous holder does not wedge the system: the poisoned
    /// lock is recovered since it protects no data of its own.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        let guard = self.lock.lock().unwrap_or_else(|poisoned| {
            warn!("Workflow lock was poisoned by a panicking holder - recovering");
            poisoned.into_inner()
        });
        trace!("Workflow lock acquired");
        guard
    }

    /// Runs `f` while holding the lock.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.acquire();
        f()
    }

    /// True if both handles refer to the same lock.
    pub fn shares_lock_with(&self, other: &ConcurrencyGuard) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_global_handles_share_lock() {
        let a = ConcurrencyGuard::global();
        let b = ConcurrencyGuard::global();
        assert!(a.shares_lock_with(&b));
        assert!(!a.shares_lock_with(&ConcurrencyGuard::new()));
    }

    #[test]
    fn test_run_serializes_critical_sections() {
        let guard = ConcurrencyGuard::new();
        let events = Arc::new(StdMutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|id| {
                let guard = guard.clone();
                let events = Arc::clone(&events);
                thread::spawn(move || {
                    guard.run(|| {
                        events.lock().unwrap().push(format!("enter-{}", id));
                        thread::sleep(Duration::from_millis(20));
                        events.lock().unwrap().push(format!("exit-{}", id));
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 8);
        for pair in events.chunks(2) {
            let entered = pair[0].strip_prefix("enter-").unwrap();
            let exited = pair[1].strip_prefix("exit-").unwrap();
            assert_eq!(entered, exited, "critical sections interleaved: {:?}", events);
        }
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let guard = ConcurrencyGuard::new();
        let poisoner = guard.clone();

        let result = thread::spawn(move || {
            let _held = poisoner.acquire();
            panic!("behavior crashed");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(guard.run(|| 42), 42);
    }
}
