//! Spin locks.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};
use crate::intr::{pop_off, push_off};

/// Mutual exclusion lock that disables interrupts for its critical
/// section. On one CPU the interrupt disable is what provides exclusion;
/// the atomic flag catches recursive acquisition.
pub struct RawSpinLock {
    name: &'static str,
    locked: AtomicBool,
}

pub type SpinLock<T> = Lock<RawSpinLock, T>;
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl RawLock for RawSpinLock {
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with an IRQ handler that
        // takes the same lock. On one CPU the flag can only be found set
        // by re-entrant acquisition, but the loop keeps the lock honest
        // for hosted test builds too.
        push_off();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinLock::new(name), data)
    }
}
