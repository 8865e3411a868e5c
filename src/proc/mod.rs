//! Per-process state.
//!
//! A `Proc` slot splits into three parts with different access rules:
//! `info` is protected by a per-process spinlock because the timer IRQ and
//! other processes read it (state transitions, signal masks, scheduling
//! counters); `data` is private to the process itself and needs no lock;
//! the table links around the slots belong to `Procs` and its resource
//! lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;

use bitflags::bitflags;

use crate::{
    arch::x86::{SigContext, TaskState},
    file::Fd,
    fs::InodeRef,
    lock::{SpinLock, SpinLockGuard},
    param::{DEF_PRIORITY, MAXPROCNAME, NGROUPS, NOFILE},
    signal::{SigAction, SigSet, NSIG},
    vm::UserMemory,
};

mod procs;
mod wait_channel;

pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ProcState {
    /// Slot is on the free list.
    Unused,
    /// Freshly allocated, not yet runnable.
    Idle,
    Runnable,
    Running,
    Sleeping,
    Stopped,
    Zombie,
}

/// Whether a sleep may be aborted by a signal.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SleepKind {
    Interruptible,
    Uninterruptible,
}

bitflags! {
    pub struct ProcFlags: u32 {
        /// Kernel process; never receives signals.
        const KPROC = 1 << 0;
        /// Permission checks use the real ids (access(2)).
        const USEREAL = 1 << 1;
    }
}

/// Fields that other kernel paths may inspect or mutate; `Proc::info`'s
/// spinlock must be held.
pub struct ProcInfo {
    pub state: ProcState,
    pub sleep_kind: SleepKind,

    /// If sleeping, the channel slept on.
    pub waitchannel: *const WaitChannel,

    /// Remaining ticks of a bounded sleep; 0 means none armed.
    pub timeout: u32,

    /// Exit status (or stop signal) reported to wait4.
    pub xstate: i32,

    pub pid: Pid,
    pub pgid: Pid,
    pub sid: Pid,

    /// Static priority and the decaying quantum counter.
    pub priority: i32,
    pub cpu_count: i32,

    pub flags: ProcFlags,

    /// Signal state: 32-bit masks plus per-signal dispositions.
    pub sigpending: SigSet,
    pub sigblocked: SigSet,
    pub sigexecuting: SigSet,
    pub sigaction: [SigAction; NSIG],

    pub nsignals: u32,
}

/// Resource usage counters, split by trap mode at tick time.
#[derive(Copy, Clone, Default)]
pub struct Rusage {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub nvcsw: u64,
    pub nivcsw: u64,
}

impl Rusage {
    pub const fn zero() -> Self {
        Self {
            utime_ticks: 0,
            stime_ticks: 0,
            minflt: 0,
            majflt: 0,
            nvcsw: 0,
            nivcsw: 0,
        }
    }

    pub fn add(&mut self, other: &Rusage) {
        self.utime_ticks += other.utime_ticks;
        self.stime_ticks += other.stime_ticks;
        self.minflt += other.minflt;
        self.majflt += other.majflt;
        self.nvcsw += other.nvcsw;
        self.nivcsw += other.nivcsw;
    }
}

/// Fields private to the process; no lock needed.
pub struct ProcData {
    /// Register save area: kernel stack top, page directory, resume point.
    pub tss: TaskState,

    /// Virtual address of the kernel stack page.
    pub kstack: usize,

    /// Address space: page directory plus the VMA list.
    pub memory: UserMemory,

    /// User descriptor table; each entry points into the global
    /// open-file table and carries its close-on-exec bit.
    pub fd_table: [Option<Fd>; NOFILE],

    pub cwd: Option<InodeRef>,
    pub root: Option<InodeRef>,

    /// Credentials: real/effective/saved triples.
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
    /// Supplementary groups, -1 terminated.
    pub groups: [i32; NGROUPS],
    pub umask: u32,

    pub usage: Rusage,
    /// Accumulated usage of reaped children.
    pub cusage: Rusage,

    /// Interval timers, in ticks.
    pub it_real_value: u32,
    pub it_real_interval: u32,
    pub it_virt_value: u32,
    pub it_virt_interval: u32,
    pub it_prof_value: u32,
    pub it_prof_interval: u32,

    pub children: u32,

    /// Register frames saved while a handler for the signal runs;
    /// restored by sigreturn.
    pub saved_sigcontext: [SigContext; NSIG],

    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    pub const fn new() -> Self {
        Self {
            tss: TaskState::zero(),
            kstack: 0,
            memory: UserMemory::uninit(),
            fd_table: [None; NOFILE],
            cwd: None,
            root: None,
            uid: 0,
            euid: 0,
            suid: 0,
            gid: 0,
            egid: 0,
            sgid: 0,
            groups: [-1; NGROUPS],
            umask: 0o022,
            usage: Rusage::zero(),
            cusage: Rusage::zero(),
            it_real_value: 0,
            it_real_interval: 0,
            it_virt_value: 0,
            it_virt_interval: 0,
            it_prof_value: 0,
            it_prof_interval: 0,
            children: 0,
            saved_sigcontext: [SigContext::zero(); NSIG],
            name: [0; MAXPROCNAME],
        }
    }

    /// Set the debugging name, truncating and NUL-terminating.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = core::cmp::min(name.len(), MAXPROCNAME - 1);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len] = 0;
    }

    /// Group check; the use-real flag is resolved by the caller.
    pub fn in_group_as(&self, gid: u32, use_real: bool) -> bool {
        let mine = if use_real { self.gid } else { self.egid };
        if gid == mine {
            return true;
        }
        self.groups
            .iter()
            .take_while(|g| **g != -1)
            .any(|g| *g as u32 == gid)
    }
}

/// Per-process state.
pub struct Proc {
    pub info: SpinLock<ProcInfo>,

    pub data: UnsafeCell<ProcData>,

    /// Parent slot index; mutated only under `Procs::wait_lock`.
    parent: UnsafeCell<Option<usize>>,

    /// Waitchannel saying a child of this process died or stopped.
    pub child_waitchannel: WaitChannel,
}

impl Proc {
    pub const fn zero() -> Self {
        Self {
            info: SpinLock::new(
                "proc",
                ProcInfo {
                    state: ProcState::Unused,
                    sleep_kind: SleepKind::Uninterruptible,
                    waitchannel: ptr::null(),
                    timeout: 0,
                    xstate: 0,
                    pid: 0,
                    pgid: 0,
                    sid: 0,
                    priority: DEF_PRIORITY,
                    cpu_count: 0,
                    flags: ProcFlags::empty(),
                    sigpending: SigSet::empty(),
                    sigblocked: SigSet::empty(),
                    sigexecuting: SigSet::empty(),
                    sigaction: [SigAction::default_action(); NSIG],
                    nsignals: 0,
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
            parent: UnsafeCell::new(None),
            child_waitchannel: WaitChannel::new(),
        }
    }

    pub fn lock(&self) -> ProcGuard<'_> {
        ProcGuard {
            proc: self,
            guard: Some(self.info.lock()),
        }
    }

    /// Read the pid without the lock; stale values are acceptable for
    /// debugging output only.
    pub unsafe fn pid_unchecked(&self) -> Pid {
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    /// Parent slot; `Procs::wait_lock` must be held.
    pub unsafe fn parent_slot(&self) -> &mut Option<usize> {
        unsafe { &mut *self.parent.get() }
    }
}

// Proc slots sit in a static table and are shared by design; every shared
// field is behind its lock or documented access rule.
unsafe impl Sync for Proc {}
unsafe impl Send for Proc {}

/// Holds `Proc::info` locked.
pub struct ProcGuard<'s> {
    proc: &'s Proc,
    guard: Option<SpinLockGuard<'s, ProcInfo>>,
}

impl<'s> ProcGuard<'s> {
    pub fn proc(&self) -> &'s Proc {
        self.proc
    }

    /// Mutable access to `ProcData` while the info lock is held.
    ///
    /// # Safety
    ///
    /// Must not be used on the running process while it also holds a
    /// `&mut` to its own data.
    pub unsafe fn data_mut(&mut self) -> &mut ProcData {
        unsafe { &mut *self.proc.data.get() }
    }

    /// A signal is deliverable: pending and not blocked.
    pub fn signal_pending(&self) -> bool {
        !(self.sigpending & !self.sigblocked).is_empty()
    }

    /// Wake from sleep(); caller decides about the scheduler. The
    /// timeout field is left alone so a bounded sleeper can tell a
    /// condition wakeup (nonzero remainder) from expiry (zero).
    pub fn wakeup(&mut self) {
        if self.state == ProcState::Sleeping {
            self.waitchannel = ptr::null();
            self.state = ProcState::Runnable;
        }
    }

    /// Temporarily release the info lock around `f`.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce(&Proc) -> U,
    {
        let proc = self.proc;
        self.guard = None;
        let result = f(proc);
        self.guard = Some(proc.info.lock());
        result
    }
}

impl Deref for ProcGuard<'_> {
    type Target = ProcInfo;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for ProcGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Idle => "idle  ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Sleeping => "sleep ",
            ProcState::Stopped => "stop  ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Default supplementary-group array.
pub const fn no_groups() -> [i32; NGROUPS] {
    [-1; NGROUPS]
}
