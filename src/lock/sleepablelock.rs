//! Sleepable locks.

use super::{Guard, Lock, RawLock, RawSpinLock};
use crate::errno::Result;
use crate::proc::WaitChannel;

/// A spinlock whose guards can sleep on the lock's own wait channel.
pub struct RawSleepableLock {
    lock: RawSpinLock,
    waitchannel: WaitChannel,
}

pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
pub type SleepableLockGuard<'s, T> = Guard<'s, RawSleepableLock, T>;

impl RawSleepableLock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }
}

impl<T> SleepableLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepableLock::new(name), data)
    }
}

impl<T> SleepableLockGuard<'_, T> {
    pub fn sleep(&mut self) {
        let channel = &self.raw().waitchannel as *const WaitChannel;
        unsafe { (*channel).sleep(self) };
    }

    pub fn sleep_interruptible(&mut self) -> Result<()> {
        let channel = &self.raw().waitchannel as *const WaitChannel;
        unsafe { (*channel).sleep_interruptible(self) }
    }

    pub fn sleep_timeout(&mut self, ticks: u32) -> Result<u32> {
        let channel = &self.raw().waitchannel as *const WaitChannel;
        unsafe { (*channel).sleep_timeout(self, ticks) }
    }

    pub fn wakeup(&self) {
        self.raw().waitchannel.wakeup();
    }
}
