//! Signal generation and delivery.
//!
//! Signals are bits in 32-bit masks. `send_sig` sets a pending bit with
//! the side effects POSIX job control wants (stop and continue discard
//! each other, forced defaults, automatic child reaping); `issig` scans
//! for a deliverable signal just before the return to user mode; `psig`
//! either runs the default action or pushes the handler trampoline onto
//! the user stack. The trampoline re-enters the kernel with `sigreturn`
//! to restore the interrupted register frame.

use bitflags::bitflags;

use crate::{
    arch::x86::{SigContext, INT80_INSN_LEN},
    errno::{Errno, Result},
    kernel::kernel,
    param::INIT_PID,
    proc::{myproc, Pid, ProcFlags, ProcState},
};

pub const NSIG: usize = 32;

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGQUIT: usize = 3;
pub const SIGILL: usize = 4;
pub const SIGTRAP: usize = 5;
pub const SIGABRT: usize = 6;
pub const SIGBUS: usize = 7;
pub const SIGFPE: usize = 8;
pub const SIGKILL: usize = 9;
pub const SIGUSR1: usize = 10;
pub const SIGSEGV: usize = 11;
pub const SIGUSR2: usize = 12;
pub const SIGPIPE: usize = 13;
pub const SIGALRM: usize = 14;
pub const SIGTERM: usize = 15;
pub const SIGCHLD: usize = 17;
pub const SIGCONT: usize = 18;
pub const SIGSTOP: usize = 19;
pub const SIGTSTP: usize = 20;
pub const SIGTTIN: usize = 21;
pub const SIGTTOU: usize = 22;
pub const SIGXCPU: usize = 24;
pub const SIGVTALRM: usize = 26;
pub const SIGPROF: usize = 27;

/// A set of signals: bit `n-1` is signal `n`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SigSet(pub u32);

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub const fn of(sig: usize) -> Self {
        SigSet(1 << (sig - 1))
    }

    pub fn contains(self, sig: usize) -> bool {
        self.0 & (1 << (sig - 1)) != 0
    }

    pub fn add(&mut self, sig: usize) {
        self.0 |= 1 << (sig - 1);
    }

    pub fn remove(&mut self, sig: usize) {
        self.0 &= !(1 << (sig - 1));
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitAnd for SigSet {
    type Output = SigSet;
    fn bitand(self, rhs: SigSet) -> SigSet {
        SigSet(self.0 & rhs.0)
    }
}

impl core::ops::BitOr for SigSet {
    type Output = SigSet;
    fn bitor(self, rhs: SigSet) -> SigSet {
        SigSet(self.0 | rhs.0)
    }
}

impl core::ops::Not for SigSet {
    type Output = SigSet;
    fn not(self) -> SigSet {
        SigSet(!self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SigHandler {
    Default,
    Ignore,
    /// User-space handler entry point.
    Handler(usize),
}

bitflags! {
    pub struct SigActionFlags: u32 {
        const NOCLDSTOP = 1;
        const NODEFER = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
        const RESTART = 0x1000_0000;
    }
}

#[derive(Copy, Clone)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: SigSet,
    pub flags: SigActionFlags,
}

impl SigAction {
    pub const fn default_action() -> Self {
        Self {
            handler: SigHandler::Default,
            mask: SigSet::empty(),
            flags: SigActionFlags::empty(),
        }
    }
}

/// Signals that may never be caught, blocked or ignored.
pub fn unmaskable(sig: usize) -> bool {
    sig == SIGKILL || sig == SIGSTOP
}

const STOP_SIGNALS: [usize; 4] = [SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU];

pub fn is_stop_signal(sig: usize) -> bool {
    STOP_SIGNALS.contains(&sig)
}

/// The user-stack trampoline. After the handler returns, it re-enters
/// the kernel with sigreturn to restore the saved frame.
///
/// ```text
///   push eax          ; signum argument
///   call *ecx         ; handler address, placed in ecx by psig
///   add  esp, 4
///   mov  eax, 119     ; __NR_sigreturn
///   int  0x80
/// ```
pub static TRAMPOLINE: [u8; 13] = [
    0x50, 0xff, 0xd1, 0x83, 0xc4, 0x04, 0xb8, 0x77, 0x00, 0x00, 0x00, 0xcd, 0x80,
];

/// Post `sig` to the process in slot `slot`. The caller must not hold
/// that process's info lock.
pub fn send_sig(slot: usize, sig: usize) -> Result<()> {
    if sig == 0 {
        return Ok(());
    }
    if sig > NSIG {
        return Err(Errno::EINVAL);
    }
    let procs = &kernel().procs;
    let p = procs.proc(slot);
    let mut guard = p.lock();

    // Kernel processes can't receive signals.
    if guard.flags.contains(ProcFlags::KPROC) {
        return Ok(());
    }

    match sig {
        SIGKILL | SIGCONT => {
            if guard.state == ProcState::Stopped {
                guard.state = ProcState::Runnable;
                procs.set_need_resched();
            }
            // Discard all pending stop signals.
            for s in STOP_SIGNALS {
                guard.sigpending.remove(s);
            }
        }
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Discard any pending SIGCONT.
            guard.sigpending.remove(SIGCONT);
        }
        // A process cannot hide from these; force the default back.
        SIGFPE | SIGSEGV => {
            if guard.sigaction[sig - 1].handler == SigHandler::Ignore {
                guard.sigaction[sig - 1].handler = SigHandler::Default;
            }
        }
        _ => {}
    }

    let action = guard.sigaction[sig - 1];
    if action.handler == SigHandler::Default {
        // init only takes signals it installed a handler for, and
        // SIGCHLD's default action is to be ignored.
        if guard.pid == INIT_PID || sig == SIGCHLD {
            return Ok(());
        }
    }
    if action.handler == SigHandler::Ignore && !unmaskable(sig) {
        if sig == SIGCHLD {
            // Ignored SIGCHLD: reap, so no zombies accumulate.
            let target = slot;
            drop(guard);
            procs.reap_zombies_of(target);
            return Ok(());
        }
        return Ok(());
    }

    guard.sigpending.add(sig);
    guard.nsignals += 1;

    // Wake the target only if the signal is not blocked, and only from
    // an interruptible sleep; uninterruptible sleeps defer delivery.
    if !guard.sigblocked.contains(sig) || unmaskable(sig) {
        if guard.state == ProcState::Sleeping
            && guard.sleep_kind == crate::proc::SleepKind::Interruptible
        {
            guard.wakeup();
            procs.set_need_resched();
        }
    }
    Ok(())
}

/// Post a signal to the current process.
pub fn send_sig_current(sig: usize) {
    if let Some(slot) = kernel().procs.current_slot() {
        let _ = send_sig(slot, sig);
    }
}

/// Can the current process signal the one in `slot`?
fn can_signal(slot: usize) -> bool {
    let p = myproc();
    if p.is_null() {
        return true;
    }
    let (euid, sid) = {
        let data = unsafe { &*(*p).data.get() };
        let guard = unsafe { (*p).lock() };
        (data.euid, guard.sid)
    };
    if euid == 0 {
        return true;
    }
    let target = kernel().procs.proc(slot);
    let tguard = target.lock();
    let tdata = unsafe { &*target.data.get() };
    euid == tdata.euid || sid == tguard.sid
}

/// kill(2) toward a single pid.
pub fn kill_pid(pid: Pid, sig: usize, from_user: bool) -> Result<()> {
    let slot = kernel().procs.find_pid(pid).ok_or(Errno::ESRCH)?;
    if kernel().procs.proc(slot).lock().state == ProcState::Zombie {
        return Err(Errno::ESRCH);
    }
    if from_user && !can_signal(slot) {
        return Err(Errno::EPERM);
    }
    send_sig(slot, sig)
}

/// kill(2) toward a process group. Job-control stops aimed at an
/// orphaned group from outside it are suppressed with EIO.
pub fn kill_pgrp(pgid: Pid, sig: usize, from_user: bool) -> Result<()> {
    let procs = &kernel().procs;

    if is_stop_signal(sig) && procs.is_orphaned_pgrp(pgid) {
        let sender_in_group = procs
            .current_slot()
            .map(|slot| procs.proc(slot).lock().pgid == pgid)
            .unwrap_or(false);
        if !sender_in_group {
            return Err(Errno::EIO);
        }
    }

    let mut found = false;
    let mut slots = [0usize; crate::param::NPROC];
    let n = procs.members_of_pgrp(pgid, &mut slots);
    for &slot in &slots[..n] {
        if procs.proc(slot).lock().state == ProcState::Zombie {
            continue;
        }
        if from_user && !can_signal(slot) {
            continue;
        }
        let _ = send_sig(slot, sig);
        found = true;
    }
    if found {
        Ok(())
    } else {
        Err(Errno::ESRCH)
    }
}

/// Scan for a deliverable signal before returning to user mode.
/// Side effects mirror the scan the original does: ignored or
/// default-ignored signals are consumed here.
pub fn issig() -> Option<usize> {
    let p = myproc();
    if p.is_null() {
        return None;
    }
    let p = unsafe { &*p };
    let mut reap = false;
    let sig = {
        let mut guard = p.lock();
        let deliverable = guard.sigpending & !guard.sigblocked;
        if deliverable.is_empty() {
            None
        } else {
            let mut hit = None;
            for sig in 1..=NSIG {
                if !deliverable.contains(sig) {
                    continue;
                }
                let action = guard.sigaction[sig - 1];
                if sig == SIGCHLD {
                    if action.handler == SigHandler::Ignore {
                        reap = true;
                    } else if action.handler != SigHandler::Default {
                        hit = Some(sig);
                        break;
                    }
                    // Default: ignored below.
                } else if action.handler != SigHandler::Ignore || unmaskable(sig) {
                    hit = Some(sig);
                    break;
                }
                guard.sigpending.remove(sig);
            }
            hit
        }
    };
    if reap {
        if let Some(slot) = kernel().procs.current_slot() {
            kernel().procs.reap_zombies_of(slot);
            p.lock().sigpending.remove(SIGCHLD);
        }
    }
    sig
}

/// Deliver pending signals against the saved user frame.
pub fn psig(sc: &mut SigContext) {
    let p = myproc();
    if p.is_null() {
        return;
    }
    let p = unsafe { &*p };

    for sig in 1..=NSIG {
        let action = {
            let mut guard = p.lock();
            if !guard.sigpending.contains(sig) || guard.sigblocked.contains(sig) {
                continue;
            }
            guard.sigpending.remove(sig);
            guard.sigaction[sig - 1]
        };

        if let SigHandler::Handler(entry) = action.handler {
            // A fault may have been raised because the process has no
            // stack region at all; there is nowhere to build a handler
            // frame, so terminate now.
            let data = unsafe { &*p.data.get() };
            if data.memory.find_vma(sc.oldesp as usize).is_none() {
                crate::proc::do_exit(sig as i32);
            }

            {
                let mut guard = p.lock();
                guard.sigexecuting = SigSet::of(sig);
                if !action.flags.contains(SigActionFlags::NODEFER) {
                    let mask = guard.sigblocked | SigSet::of(sig) | action.mask;
                    guard.sigblocked = mask;
                }
                if action.flags.contains(SigActionFlags::RESETHAND) {
                    guard.sigaction[sig - 1].handler = SigHandler::Default;
                }
            }

            // Save the interrupted frame, then build the trampoline on
            // the user stack.
            let data = unsafe { &mut *p.data.get() };
            data.saved_sigcontext[sig - 1] = *sc;

            let len = TRAMPOLINE.len() as u32;
            sc.oldesp -= len;
            sc.oldesp -= 4;
            sc.oldesp &= !3;
            unsafe {
                crate::vm::copy_to_user_raw(sc.oldesp as usize, &TRAMPOLINE);
            }
            sc.ecx = entry as u32;
            sc.eax = sig as u32;
            sc.eip = sc.oldesp;
            return;
        }

        if action.handler == SigHandler::Default {
            match sig {
                SIGCONT => {
                    // Already runnable; nothing else to do.
                }
                SIGCHLD => {}
                SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
                    {
                        let mut guard = p.lock();
                        guard.xstate = sig as i32;
                        guard.state = ProcState::Stopped;
                    }
                    kernel().procs.notify_parent_of_stop(
                        !action.flags.contains(SigActionFlags::NOCLDSTOP),
                    );
                    kernel().procs.set_need_resched();
                }
                _ => {
                    crate::proc::do_exit(sig as i32);
                }
            }
        }
    }

    // Coming from a syscall that wants to be restarted with no handler
    // in the way: point EIP back at the `int 0x80`.
    if sc.err > 0 && sc.eax == Errno::ERESTART.as_ret() as u32 {
        sc.eax = sc.err;
        sc.eip -= INT80_INSN_LEN;
    }
}

/// sigreturn(2): restore the frame saved before the handler ran.
pub fn do_sigreturn(sc: &mut SigContext) -> isize {
    let p = myproc();
    if p.is_null() {
        return Errno::EINVAL.as_ret();
    }
    let p = unsafe { &*p };

    let (sig, action) = {
        let mut guard = p.lock();
        let executing = guard.sigexecuting;
        guard.sigexecuting = SigSet::empty();
        let mut sig = 0;
        for s in 1..=NSIG {
            if executing.contains(s) {
                sig = s;
                break;
            }
        }
        if sig == 0 {
            return Errno::EINVAL.as_ret();
        }
        // Undo the temporary block installed at delivery.
        let action = guard.sigaction[sig - 1];
        let mut mask = guard.sigblocked;
        mask.remove(sig);
        mask = SigSet(mask.0 & !action.mask.0);
        guard.sigblocked = mask;
        (sig, action)
    };

    let data = unsafe { &*p.data.get() };
    *sc = data.saved_sigcontext[sig - 1];

    // An interrupted syscall resumes or fails depending on SA_RESTART.
    if sc.eax == Errno::ERESTART.as_ret() as u32 {
        if action.flags.contains(SigActionFlags::RESTART) && sc.err > 0 {
            sc.eax = sc.err;
            sc.eip -= INT80_INSN_LEN;
        } else {
            sc.eax = Errno::EINTR.as_ret() as u32;
        }
    }
    sc.eax as isize
}

/// sigprocmask(2).
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

pub fn do_sigprocmask(how: i32, set: Option<SigSet>, old: &mut SigSet) -> Result<()> {
    let p = myproc();
    if p.is_null() {
        return Err(Errno::ESRCH);
    }
    let mut guard = unsafe { (*p).lock() };
    *old = guard.sigblocked;
    if let Some(set) = set {
        // KILL and STOP can never be blocked.
        let set = SigSet(set.0 & !(SigSet::of(SIGKILL).0 | SigSet::of(SIGSTOP).0));
        guard.sigblocked = match how {
            SIG_BLOCK => guard.sigblocked | set,
            SIG_UNBLOCK => SigSet(guard.sigblocked.0 & !set.0),
            SIG_SETMASK => set,
            _ => return Err(Errno::EINVAL),
        };
    }
    Ok(())
}

/// sigaction(2).
pub fn do_sigaction(sig: usize, new: Option<SigAction>, old: &mut SigAction) -> Result<()> {
    if sig == 0 || sig > NSIG || (new.is_some() && unmaskable(sig)) {
        return Err(Errno::EINVAL);
    }
    let p = myproc();
    if p.is_null() {
        return Err(Errno::ESRCH);
    }
    let mut guard = unsafe { (*p).lock() };
    *old = guard.sigaction[sig - 1];
    if let Some(new) = new {
        guard.sigaction[sig - 1] = new;
        // Setting a signal to be ignored discards any pending instance.
        if new.handler == SigHandler::Ignore {
            guard.sigpending.remove(sig);
        }
    }
    Ok(())
}

#[cfg(test)]
mod delivery_tests {
    use super::*;
    use crate::proc::{with_table, ProcState, SleepKind};

    #[test]
    fn stop_and_cont_discard_each_other() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            procs.proc(slot).lock().pid = 500;

            send_sig(slot, SIGCONT).unwrap();
            assert!(procs.proc(slot).lock().sigpending.contains(SIGCONT));

            // A stop signal purges the pending SIGCONT.
            send_sig(slot, SIGTSTP).unwrap();
            {
                let g = procs.proc(slot).lock();
                assert!(!g.sigpending.contains(SIGCONT));
                assert!(g.sigpending.contains(SIGTSTP));
            }

            // And SIGCONT purges every pending stop signal.
            send_sig(slot, SIGTTIN).unwrap();
            send_sig(slot, SIGCONT).unwrap();
            {
                let g = procs.proc(slot).lock();
                assert!(!g.sigpending.contains(SIGTSTP));
                assert!(!g.sigpending.contains(SIGTTIN));
                assert!(g.sigpending.contains(SIGCONT));
            }
            procs.release_slot(slot);
        });
    }

    #[test]
    fn cont_makes_a_stopped_process_runnable() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(slot).lock();
                g.pid = 501;
                g.state = ProcState::Stopped;
            }
            send_sig(slot, SIGCONT).unwrap();
            assert_eq!(procs.proc(slot).lock().state, ProcState::Runnable);
            procs.release_slot(slot);
        });
    }

    #[test]
    fn ignored_segv_is_forced_back_to_default() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(slot).lock();
                g.pid = 502;
                g.sigaction[SIGSEGV - 1].handler = SigHandler::Ignore;
            }
            send_sig(slot, SIGSEGV).unwrap();
            {
                let g = procs.proc(slot).lock();
                assert_eq!(g.sigaction[SIGSEGV - 1].handler, SigHandler::Default);
                assert!(g.sigpending.contains(SIGSEGV));
            }
            procs.release_slot(slot);
        });
    }

    #[test]
    fn default_sigchld_is_dropped_and_kprocs_get_nothing() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            procs.proc(slot).lock().pid = 503;
            send_sig(slot, SIGCHLD).unwrap();
            assert!(procs.proc(slot).lock().sigpending.is_empty());

            procs
                .proc(slot)
                .lock()
                .flags
                .insert(crate::proc::ProcFlags::KPROC);
            send_sig(slot, SIGTERM).unwrap();
            assert!(procs.proc(slot).lock().sigpending.is_empty());
            procs.release_slot(slot);
        });
    }

    #[test]
    fn signals_wake_only_interruptible_sleeps() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(slot).lock();
                g.pid = 504;
                g.state = ProcState::Sleeping;
                g.sleep_kind = SleepKind::Uninterruptible;
            }
            send_sig(slot, SIGTERM).unwrap();
            // Delivery is deferred past the natural wakeup.
            assert_eq!(procs.proc(slot).lock().state, ProcState::Sleeping);
            assert!(procs.proc(slot).lock().sigpending.contains(SIGTERM));

            {
                let mut g = procs.proc(slot).lock();
                g.state = ProcState::Sleeping;
                g.sleep_kind = SleepKind::Interruptible;
            }
            send_sig(slot, SIGINT).unwrap();
            assert_eq!(procs.proc(slot).lock().state, ProcState::Runnable);
            procs.release_slot(slot);
        });
    }

    #[test]
    fn stop_of_an_orphaned_group_from_outside_is_eio() {
        with_table(|procs| {
            let slot = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(slot).lock();
                g.pid = 800;
                g.pgid = 800;
                g.sid = 800;
                g.state = ProcState::Runnable;
            }
            // No parent anchors the group, so it is orphaned; there is
            // no current process, so the sender is outside the group.
            assert_eq!(kill_pgrp(800, SIGTTIN, false).unwrap_err(), Errno::EIO);
            assert!(procs.proc(slot).lock().sigpending.is_empty());
            assert_ne!(procs.proc(slot).lock().state, ProcState::Stopped);

            // A non-stop signal still goes through.
            kill_pgrp(800, SIGTERM, false).unwrap();
            assert!(procs.proc(slot).lock().sigpending.contains(SIGTERM));
            procs.release_slot(slot);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_block_unblock_round_trip() {
        let mut mask = SigSet::empty();
        let set = SigSet(SigSet::of(SIGUSR1).0 | SigSet::of(SIGTERM).0);
        let before = mask;
        mask = mask | set;
        assert!(mask.contains(SIGUSR1) && mask.contains(SIGTERM));
        mask = SigSet(mask.0 & !set.0);
        assert_eq!(mask, before);
    }

    #[test]
    fn sigset_numbering_matches_bits() {
        assert_eq!(SigSet::of(1).0, 1);
        assert_eq!(SigSet::of(SIGKILL).0, 1 << 8);
        let mut s = SigSet::empty();
        s.add(SIGCHLD);
        assert!(s.contains(SIGCHLD));
        s.remove(SIGCHLD);
        assert!(s.is_empty());
    }

    #[test]
    fn stop_signal_classification() {
        for s in [SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU] {
            assert!(is_stop_signal(s));
        }
        assert!(!is_stop_signal(SIGCONT));
        assert!(!is_stop_signal(SIGKILL));
    }

    #[test]
    fn trampoline_ends_in_int80() {
        // The last two bytes must be `int 0x80`; the immediate before it
        // must be the sigreturn syscall number.
        let n = TRAMPOLINE.len();
        assert_eq!(&TRAMPOLINE[n - 2..], &[0xcd, 0x80]);
        assert_eq!(TRAMPOLINE[7], 119);
    }
}
