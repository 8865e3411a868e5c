//! Sleep channels.
//!
//! A `WaitChannel` is an address used as a rendezvous key: sleepers record
//! it in their proc slot and `wakeup` makes every sleeper on the same
//! channel runnable at once. Wakeups are broadcast, so every caller of
//! `sleep` rechecks its condition in a loop.

use core::ptr;

use crate::{
    errno::{Errno, Result},
    kernel::kernel,
    lock::Waitable,
    proc::{ProcState, SleepKind},
};

pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may share an address, spuriously waking
    /// more sleepers than intended.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release `lk` and sleep on this channel, uninterruptibly.
    /// Reacquires `lk` when awakened.
    pub fn sleep<T: Waitable>(&self, lk: &mut T) {
        let _ = self.sleep_kind(lk, SleepKind::Uninterruptible, 0);
    }

    /// Like `sleep`, but a deliverable signal aborts the wait with
    /// `ERESTART` (either before suspending or after a wakeup).
    pub fn sleep_interruptible<T: Waitable>(&self, lk: &mut T) -> Result<()> {
        self.sleep_kind(lk, SleepKind::Interruptible, 0).map(|_| ())
    }

    /// Sleep bounded by `ticks`; the timer bottom half wakes us when
    /// the per-process timeout reaches zero. Returns the unexpired
    /// remainder; zero means the sleep timed out rather than being
    /// woken by its condition.
    pub fn sleep_timeout<T: Waitable>(&self, lk: &mut T, ticks: u32) -> Result<u32> {
        self.sleep_kind(lk, SleepKind::Interruptible, ticks)
    }

    fn sleep_kind<T: Waitable>(&self, lk: &mut T, kind: SleepKind, timeout: u32) -> Result<u32> {
        let p = myproc_ref();

        // Must hold p's info lock in order to change its state and then
        // call sched(); once we hold it we are guaranteed not to miss any
        // wakeup (wakeup locks the same lock), so it is safe to release lk.
        let mut guard = p.lock();
        unsafe { lk.raw_release() };

        if kind == SleepKind::Interruptible && guard.signal_pending() {
            drop(guard);
            unsafe { lk.raw_acquire() };
            return Err(Errno::ERESTART);
        }

        guard.waitchannel = self;
        guard.sleep_kind = kind;
        guard.timeout = timeout;
        guard.state = ProcState::Sleeping;
        unsafe { kernel().procs.sched(&mut guard) };

        // Tidy up; the remainder says whether a timeout fired.
        guard.waitchannel = ptr::null();
        let remaining = guard.timeout;
        guard.timeout = 0;
        let interrupted = kind == SleepKind::Interruptible && guard.signal_pending();

        drop(guard);
        unsafe { lk.raw_acquire() };

        if interrupted {
            return Err(Errno::ERESTART);
        }
        Ok(remaining)
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup_pool(self);
    }
}

fn myproc_ref() -> &'static crate::proc::Proc {
    let p = crate::proc::myproc();
    assert!(!p.is_null(), "sleep with no process");
    unsafe { &*p }
}
