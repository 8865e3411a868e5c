//! The lock module.
//!
//! Three lock shapes, per the concurrency rules of a single-CPU kernel:
//! spinlocks (interrupts-off critical sections shared with IRQ handlers),
//! sleepable locks (a spinlock whose guard can sleep on its own wait
//! channel), and sleep locks (long-term per-object locks that put waiters
//! to sleep instead of spinning).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
}

/// A lock that owns its `RawLock` and the data it protects.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// A Lock hands out references only while the raw lock is held.
unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock, T: Send> Send for Lock<R, T> {}

pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a mutable pointer to the inner data without locking.
    /// The caller must ensure the access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Unlock without a guard.
    ///
    /// # Safety
    ///
    /// Use only when the guard was consumed with `mem::forget`.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// The raw lock behind this guard.
    pub(super) fn raw(&self) -> &R {
        &self.lock.lock
    }

    /// Temporarily releases the lock while calling `f`, and re-acquires
    /// it before returning.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

/// Lock guards that a `WaitChannel` can atomically drop and retake.
pub trait Waitable {
    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// Must be paired with `raw_acquire`, with no access to the guarded
    /// data in between.
    unsafe fn raw_release(&mut self);

    /// Re-acquires the lock.
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding `raw_release`.
    unsafe fn raw_acquire(&mut self);
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
