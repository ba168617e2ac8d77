// ============================================================================
// METRIC STATE TOKEN
// ============================================================================
// Every reservoir-backed metric guards its mutable state with a single-slot
// exclusive token. Writers and readers both take it, so snapshots are
// consistent point-in-time copies. Acquisition spins with backoff and never
// parks. The token is not re-entrant: a thread that already holds it and asks
// again is a bug and is reported as a fatal invariant violation instead of
// spinning forever.
// ============================================================================

use std::cell::UnsafeCell;
use std::fmt::{self, Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::InvariantError;

const UNLOCKED: usize = 0;

static NEXT_THREAD_TOKEN: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TOKEN: usize = NEXT_THREAD_TOKEN.fetch_add(1, AtomicOrdering::Relaxed);
}

#[inline]
fn current_thread_token() -> usize {
    THREAD_TOKEN.with(|token| *token)
}

/// A CAS spinlock that records which thread holds it.
pub struct StateLock<T> {
    holder: CachePadded<AtomicUsize>,
    label: &'static str,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for StateLock<T> {}
unsafe impl<T: Send> Sync for StateLock<T> {}

impl<T> StateLock<T> {
    /// Create an unlocked token around `value`. `label` names the guarded
    /// state in invariant reports.
    pub fn new(label: &'static str, value: T) -> Self {
        Self {
            holder: CachePadded::new(AtomicUsize::new(UNLOCKED)),
            label,
            value: UnsafeCell::new(value),
        }
    }

    /// Spin until the token is ours.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds this token.
    pub fn lock(&self) -> StateGuard<'_, T> {
        match self.try_lock_checked() {
            Ok(guard) => guard,
            Err(err) => panic!("{}", err),
        }
    }

    /// Like [`lock`](Self::lock) but returns re-entrancy as an error.
    pub fn try_lock_checked(&self) -> Result<StateGuard<'_, T>, InvariantError> {
        let me = current_thread_token();
        let backoff = Backoff::new();
        loop {
            match self.holder.compare_exchange_weak(
                UNLOCKED,
                me,
                AtomicOrdering::Acquire,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Ok(StateGuard { lock: self }),
                Err(current) if current == me => {
                    return Err(InvariantError::ReentrantLock(self.label.to_string()));
                }
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Take the token only if it is free right now.
    pub fn try_lock(&self) -> Option<StateGuard<'_, T>> {
        let me = current_thread_token();
        self.holder
            .compare_exchange(UNLOCKED, me, AtomicOrdering::Acquire, AtomicOrdering::Relaxed)
            .ok()
            .map(|_| StateGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.holder.load(AtomicOrdering::Relaxed) != UNLOCKED
    }

    /// Release a token acquired by a guard that was leaked with
    /// `std::mem::forget`. Releasing a free token is an invariant error.
    pub fn force_release(&self) -> Result<(), InvariantError> {
        let previous = self.holder.swap(UNLOCKED, AtomicOrdering::Release);
        if previous == UNLOCKED {
            Err(InvariantError::UnbalancedRelease)
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> Debug for StateLock<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLock")
            .field("label", &self.label)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII holder of a [`StateLock`]; releases on drop.
pub struct StateGuard<'a, T> {
    lock: &'a StateLock<T>,
}

impl<T> Debug for StateGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateGuard").field("label", &self.lock.label).finish()
    }
}

impl<T> Deref for StateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the holder word proves exclusive access for the guard's lifetime.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for StateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.store(UNLOCKED, AtomicOrdering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusive_access_across_threads() {
        let lock = Arc::new(StateLock::new("test", 0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_reentrant_acquire_is_detected() {
        let lock = StateLock::new("counter:a/b", 1);
        let _held = lock.lock();
        let err = lock.try_lock_checked().err().unwrap();
        assert_eq!(err, InvariantError::ReentrantLock("counter:a/b".into()));
    }

    #[test]
    #[should_panic(expected = "Re-entrant")]
    fn test_reentrant_lock_panics() {
        let lock = StateLock::new("x", ());
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    fn test_unbalanced_release() {
        let lock = StateLock::new("x", ());
        assert_eq!(lock.force_release(), Err(InvariantError::UnbalancedRelease));

        std::mem::forget(lock.lock());
        assert!(lock.is_locked());
        assert_eq!(lock.force_release(), Ok(()));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_when_held() {
        let lock = StateLock::new("x", 5);
        let guard = lock.try_lock().unwrap();
        assert_eq!(*guard, 5);
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
