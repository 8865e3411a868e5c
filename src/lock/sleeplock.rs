//! Sleeping locks: the resource locks of the kernel. Long-term mutual
//! exclusion (table-wide invariants, one request per IDE channel) where
//! waiters sleep instead of spinning.

use super::{Guard, Lock, RawLock, SleepableLock};
use crate::proc::{myproc, Pid};

pub struct RawSleepLock {
    /// Pid of the holding process; -1 means unlocked. Holders without a
    /// process context (early boot) record pid 0.
    locked: SleepableLock<Pid>,
}

pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: SleepableLock::new(name, -1),
        }
    }

    fn holder() -> Pid {
        let p = myproc();
        if p.is_null() {
            0
        } else {
            unsafe { (*p).pid_unchecked() }
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = Self::holder();
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = -1;
        guard.wakeup();
    }
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepLock::new(name), data)
    }
}
