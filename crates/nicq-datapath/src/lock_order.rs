//! Ranked mutexes with a debug lock-order checker
//!
//! Every data path lock carries a [`LockClass`]. Locks must be taken in
//! strictly increasing rank; the interrupt path takes event queue, then
//! completion queue, then work queue, so no other path may take them in
//! the reverse order. Debug builds keep a per-thread stack of held ranks
//! and panic on an out-of-order acquisition. Release builds compile the
//! check away.

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Lock rank, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockClass {
    /// Port-wide classification state
    Port,
    /// Ring group phases and queue lists
    Group,
    /// Flow table entries
    FlowTable,
    /// Event queue CQ index
    EventQueue,
    /// Completion queue state and primary pending list
    CompletionQueue,
    /// Work queue ring and producer counter
    WorkQueue,
    /// Completion queue secondary pending list
    PendingReturns,
    /// Buffer shard lists
    Shard,
}

#[cfg(debug_assertions)]
mod held {
    use super::LockClass;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockClass>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.iter().max() {
                assert!(
                    top < class,
                    "lock order violation: acquiring {class:?} while holding {top:?}"
                );
            }
            held.push(class);
        });
    }

    pub(super) fn release(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&c| c == class) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn snapshot() -> Vec<LockClass> {
        HELD.with(|held| held.borrow().clone())
    }
}

/// Classes held by the current thread (debug builds only; empty otherwise)
pub fn held_classes() -> Vec<LockClass> {
    #[cfg(debug_assertions)]
    {
        held::snapshot()
    }
    #[cfg(not(debug_assertions))]
    {
        Vec::new()
    }
}

/// A `parking_lot::Mutex` tagged with its rank
pub struct OrderedMutex<T> {
    class: LockClass,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wrap `value` in a mutex of rank `class`
    pub fn new(class: LockClass, value: T) -> Self {
        Self {
            class,
            inner: Mutex::new(value),
        }
    }

    /// Rank of this lock
    pub fn class(&self) -> LockClass {
        self.class
    }

    /// Acquire, checking rank order in debug builds
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        held::acquire(self.class);
        OrderedGuard {
            class: self.class,
            guard: self.inner.lock(),
        }
    }

    /// Mutable access without locking; exclusive borrow proves no other
    /// holder exists
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the mutex
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> OrderedMutex<T> {
    /// Mutex holding `T::default()`
    pub fn with_default(class: LockClass) -> Self {
        Self::new(class, T::default())
    }
}

/// Guard returned by [`OrderedMutex::lock`]
pub struct OrderedGuard<'a, T> {
    class: LockClass,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> OrderedGuard<'a, T> {
    /// Block on `cv`, releasing the lock while waiting
    pub fn wait(&mut self, cv: &Condvar) {
        cv.wait(&mut self.guard);
    }

    /// Block on `cv` for at most `timeout`
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> WaitTimeoutResult {
        cv.wait_for(&mut self.guard, timeout)
    }
}

impl<'a, T> Deref for OrderedGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for OrderedGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for OrderedGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        held::release(self.class);
        #[cfg(not(debug_assertions))]
        let _ = self.class;
    }
}
