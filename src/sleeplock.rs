//! Sleep lock: an exclusive lock that may be held for a long time, e.g.
//! across a disk transfer.
//!
//! The locked flag itself is guarded by a short-held spin lock. A contender
//! finding the flag set gives up the processor instead of spinning with
//! preemption off; in-kernel that is a sleep on a wait channel, here it is
//! a yield back to the host scheduler, re-checking on each wakeup.

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut, Drop};
use std::thread;

use crate::spinlock::SpinLock;

pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    data: UnsafeCell<T>,
}

// The locked cell is only touched under the inner spin lock; the data is
// reached exclusively through the guard.
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Acquire the lock, yielding the processor while it is held elsewhere.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();
        while self.locked.get() {
            drop(guard);
            thread::yield_now();
            guard = self.lock.lock();
        }
        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
