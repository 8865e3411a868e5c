//! The process table and scheduler.
//!
//! Slots live in a fixed pool threaded onto two lists: a doubly linked
//! list of allocated slots (scans follow it in allocation order, which
//! is also the scheduler's tie-break order) and a singly linked free
//! list. A resource lock serializes the list surgery; a second one
//! serializes PID allocation. The last few free slots are reserved for
//! the superuser.
//!
//! Scheduling is priority-aged round robin: the timer decays the running
//! process's counter, and the switch picks the runnable process with the
//! highest remaining counter, recharging everyone from their static
//! priority when all runnable counters hit zero.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use itertools::izip;
use pin_project::pin_project;

use crate::{
    arch::x86::{switch_to, SigContext, PAGE_SIZE},
    errno::{Errno, Result},
    kernel::kernel,
    lock::{SleepLock, SpinLock},
    page::p2v,
    param::{DEF_PRIORITY, INIT_PID, MAX_PID, NPROC, SAFE_SLOTS},
    proc::{Pid, Proc, ProcFlags, ProcState, Rusage, SleepKind, WaitChannel},
    signal::{send_sig, SIGCHLD, SIGKILL},
};

const NO_SLOT: usize = usize::MAX;

/// wait4 option bits.
pub const WNOHANG: u32 = 1;
pub const WUNTRACED: u32 = 2;

struct ProcLinks {
    alloc_head: usize,
    alloc_tail: usize,
    free_head: usize,
    next: [usize; NPROC],
    prev: [usize; NPROC],
    free_next: [usize; NPROC],
    free_slots: usize,
}

impl ProcLinks {
    const fn zero() -> Self {
        Self {
            alloc_head: NO_SLOT,
            alloc_tail: NO_SLOT,
            free_head: NO_SLOT,
            next: [NO_SLOT; NPROC],
            prev: [NO_SLOT; NPROC],
            free_next: [NO_SLOT; NPROC],
            free_slots: 0,
        }
    }
}

/// Process system containing and managing all processes.
#[pin_project]
pub struct Procs {
    /// The slots. Pinned: wait channels and parent pointers are
    /// identified by address.
    #[pin]
    pool: [Proc; NPROC],

    /// Protects the table links; the slot resource lock.
    links: SpinLock<ProcLinks>,

    /// Serializes PID allocation.
    pid_lock: SleepLock<()>,

    /// Must be held to read or write any `Proc::parent`; also closes
    /// the window between a parent's wait scan and a child's exit.
    pub wait_lock: SpinLock<()>,

    last_pid: AtomicI32,
    current: AtomicUsize,
    idle_slot: AtomicUsize,
    need_resched: AtomicBool,
    #[pin]
    _marker: core::marker::PhantomPinned,
}

impl Procs {
    pub const fn zero() -> Self {
        Self {
            pool: array![_ => Proc::zero(); NPROC],
            links: SpinLock::new("proc_slots", ProcLinks::zero()),
            pid_lock: SleepLock::new("pid", ()),
            wait_lock: SpinLock::new("wait_lock", ()),
            last_pid: AtomicI32::new(0),
            current: AtomicUsize::new(NO_SLOT),
            idle_slot: AtomicUsize::new(NO_SLOT),
            need_resched: AtomicBool::new(false),
            _marker: core::marker::PhantomPinned,
        }
    }

    pub fn init(&self) {
        let mut links = self.links.lock();
        for slot in (0..NPROC).rev() {
            links.free_next[slot] = links.free_head;
            links.free_head = slot;
            links.free_slots += 1;
        }
    }

    pub fn proc(&self, slot: usize) -> &Proc {
        &self.pool[slot]
    }

    pub fn current_slot(&self) -> Option<usize> {
        match self.current.load(Ordering::Relaxed) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Relaxed);
    }

    pub fn take_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::Relaxed)
    }

    pub fn free_slots(&self) -> usize {
        self.links.lock().free_slots
    }

    /// Snapshot the allocated slots in table order.
    pub fn allocated(&self, out: &mut [usize]) -> usize {
        let links = self.links.lock();
        let mut n = 0;
        let mut slot = links.alloc_head;
        while slot != NO_SLOT && n < out.len() {
            out[n] = slot;
            n += 1;
            slot = links.next[slot];
        }
        n
    }

    /// Take a slot off the free list and append it to the allocated
    /// list. The reserved tail of the pool only serves the superuser.
    pub fn alloc_slot(&self, superuser: bool) -> Result<usize> {
        let mut links = self.links.lock();
        if links.free_slots <= SAFE_SLOTS && !superuser {
            return Err(Errno::EAGAIN);
        }
        let slot = links.free_head;
        if slot == NO_SLOT {
            return Err(Errno::EAGAIN);
        }
        links.free_head = links.free_next[slot];
        links.free_slots -= 1;

        let tail = links.alloc_tail;
        links.prev[slot] = tail;
        links.next[slot] = NO_SLOT;
        if tail != NO_SLOT {
            links.next[tail] = slot;
        } else {
            links.alloc_head = slot;
        }
        links.alloc_tail = slot;
        drop(links);

        self.proc(slot).lock().state = ProcState::Idle;
        Ok(slot)
    }

    /// Unlink a slot and put it back on the free list, cleared.
    pub fn release_slot(&self, slot: usize) {
        {
            let p = self.proc(slot);
            let mut guard = p.lock();
            guard.state = ProcState::Unused;
            guard.pid = 0;
            guard.pgid = 0;
            guard.sid = 0;
            guard.sigpending = crate::signal::SigSet::empty();
            guard.sigblocked = crate::signal::SigSet::empty();
            guard.sigexecuting = crate::signal::SigSet::empty();
            for a in guard.sigaction.iter_mut() {
                *a = crate::signal::SigAction::default_action();
            }
            guard.priority = DEF_PRIORITY;
            guard.cpu_count = 0;
            guard.xstate = 0;
            guard.flags = ProcFlags::empty();
            unsafe {
                *guard.data_mut() = crate::proc::ProcData::new();
            }
        }
        {
            let _wait = self.wait_lock.lock();
            unsafe { *self.proc(slot).parent_slot() = None };
        }

        let mut links = self.links.lock();
        let (prev, next) = (links.prev[slot], links.next[slot]);
        if prev != NO_SLOT {
            links.next[prev] = next;
        } else if links.alloc_head == slot {
            links.alloc_head = next;
        }
        if next != NO_SLOT {
            links.prev[next] = prev;
        } else if links.alloc_tail == slot {
            links.alloc_tail = prev;
        }
        links.prev[slot] = NO_SLOT;
        links.next[slot] = NO_SLOT;
        links.free_next[slot] = links.free_head;
        links.free_head = slot;
        links.free_slots += 1;
    }

    /// A PID never reused while live as a pid, pgid or sid anywhere.
    pub fn get_unused_pid(&self) -> Result<Pid> {
        let _pid_guard = self.pid_lock.lock();
        let mut wrapped = 0;
        loop {
            let mut candidate = self.last_pid.load(Ordering::Relaxed) + 1;
            if candidate > MAX_PID {
                candidate = INIT_PID;
                wrapped += 1;
                if wrapped > 1 {
                    crate::println!("WARNING: get_unused_pid(): out of PID numbers!");
                    return Err(Errno::EAGAIN);
                }
            }
            self.last_pid.store(candidate, Ordering::Relaxed);

            let mut slots = [0usize; NPROC];
            let n = self.allocated(&mut slots);
            let clash = slots[..n].iter().any(|&s| {
                let g = self.proc(s).lock();
                candidate == g.pid || candidate == g.pgid || candidate == g.sid
            });
            if !clash {
                return Ok(candidate);
            }
        }
    }

    pub fn find_pid(&self, pid: Pid) -> Option<usize> {
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        slots[..n]
            .iter()
            .copied()
            .find(|&s| self.proc(s).lock().pid == pid)
    }

    pub fn members_of_pgrp(&self, pgid: Pid, out: &mut [usize]) -> usize {
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        let mut m = 0;
        for &s in &slots[..n] {
            if self.proc(s).lock().pgid == pgid && m < out.len() {
                out[m] = s;
                m += 1;
            }
        }
        m
    }

    pub fn count_runnable(&self) -> u32 {
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        slots[..n]
            .iter()
            .filter(|&&s| {
                matches!(
                    self.proc(s).lock().state,
                    ProcState::Runnable | ProcState::Running
                )
            })
            .count() as u32
    }

    /// An orphaned process group: every non-zombie member's parent is
    /// either in the group or outside the member's session.
    pub fn is_orphaned_pgrp(&self, pgid: Pid) -> bool {
        let _wait = self.wait_lock.lock();
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        for &s in &slots[..n] {
            let (member_pgid, member_sid, state) = {
                let g = self.proc(s).lock();
                (g.pgid, g.sid, g.state)
            };
            if member_pgid != pgid || state == ProcState::Zombie {
                continue;
            }
            let parent = unsafe { *self.proc(s).parent_slot() };
            if let Some(pp) = parent {
                let pg = self.proc(pp).lock();
                if pg.pgid != pgid && pg.sid == member_sid {
                    // An anchor outside the group but inside the
                    // session: not orphaned.
                    return false;
                }
            }
        }
        true
    }

    /// Wake every process sleeping on `target`.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let myslot = self.current_slot();
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        for &s in &slots[..n] {
            if Some(s) == myslot {
                continue;
            }
            let mut guard = self.proc(s).lock();
            if guard.state == ProcState::Sleeping
                && core::ptr::eq(guard.waitchannel, target as *const _)
            {
                guard.wakeup();
                self.set_need_resched();
            }
        }
    }

    pub fn wakeup_proc(&self, slot: usize) {
        let mut guard = self.proc(slot).lock();
        guard.wakeup();
        self.set_need_resched();
    }

    /// Pick the runnable process with the highest remaining counter
    /// (allocation order breaks ties); recharge all counters from the
    /// static priority when every runnable counter is spent. Falls back
    /// to the idle process.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled. Reads `info` without locks; on this
    /// CPU nothing else runs meanwhile.
    unsafe fn pick_next(&self) -> usize {
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        let idle = self.idle_slot.load(Ordering::Relaxed);
        loop {
            let mut best = NO_SLOT;
            let mut best_count = 0;
            for &s in &slots[..n] {
                if s == idle {
                    continue;
                }
                let info = unsafe { &*self.proc(s).info.get_mut_raw() };
                if info.state == ProcState::Runnable && info.cpu_count > best_count {
                    best = s;
                    best_count = info.cpu_count;
                }
            }
            if best != NO_SLOT {
                return best;
            }

            // All runnable counters are zero: recharge, or idle if
            // nothing is runnable at all.
            let mut any_runnable = false;
            for &s in &slots[..n] {
                let info = unsafe { &mut *self.proc(s).info.get_mut_raw() };
                if s != idle && info.state == ProcState::Runnable {
                    any_runnable = true;
                }
                info.cpu_count = info.cpu_count / 2 + info.priority;
            }
            if !any_runnable {
                return idle;
            }
        }
    }

    /// Switch away from the current process, which has already moved
    /// itself out of `Running` under its info lock (held by `guard`).
    ///
    /// # Safety
    ///
    /// Must be called with exactly the one info lock held.
    pub unsafe fn sched(&self, guard: &mut crate::proc::ProcGuard<'_>) {
        debug_assert!(guard.state != ProcState::Running, "sched running");

        let cur = self.current.load(Ordering::Relaxed);
        let next = unsafe { self.pick_next() };
        if next == cur {
            // Still the best choice: keep running.
            guard.state = ProcState::Running;
            return;
        }
        {
            let ninfo = unsafe { &mut *self.proc(next).info.get_mut_raw() };
            if ninfo.state == ProcState::Runnable {
                ninfo.state = ProcState::Running;
            }
        }
        self.current.store(next, Ordering::Relaxed);

        let cur_tss = unsafe { &mut (*self.proc(cur).data.get()).tss as *mut _ };
        let next_tss = unsafe { &(*self.proc(next).data.get()).tss as *const _ };
        {
            let data = unsafe { &mut *self.proc(cur).data.get() };
            data.usage.nvcsw += 1;
        }
        // The guard's lock is released around the switch; we come back
        // here when rescheduled.
        guard.reacquire_after(|_| unsafe {
            switch_to(cur_tss, next_tss);
        });
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_cpu(&self) {
        let slot = match self.current_slot() {
            Some(s) => s,
            None => return,
        };
        let p = self.proc(slot);
        let mut guard = p.lock();
        if guard.state == ProcState::Running {
            guard.state = ProcState::Runnable;
        }
        unsafe { self.sched(&mut guard) };
    }

    /// Create a new process, copying the parent. The child returns to
    /// user mode through `forkret` with EAX = 0.
    pub fn fork(&self, sc: &SigContext) -> Result<Pid> {
        let parent_slot = self.current_slot().ok_or(Errno::EAGAIN)?;
        let parent = self.proc(parent_slot);
        let pdata = unsafe { &mut *parent.data.get() };

        let slot = self.alloc_slot(pdata.euid == 0)?;
        let slot_guard = scopeguard::guard(slot, |slot| self.release_slot(slot));

        let pid = self.get_unused_pid()?;

        // Kernel stack page.
        let kstack_frame = kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?;
        let kstack_guard = scopeguard::guard(kstack_frame, |frame| {
            kernel().frames.lock().decref(frame)
        });
        let kstack = p2v(kernel().frames.lock().addr_of(kstack_frame));

        // Address space: shared frames, write-protected both sides.
        let memory = pdata.memory.clone_for_fork()?;
        let _ = scopeguard::ScopeGuard::into_inner(kstack_guard);

        let child = self.proc(slot);
        {
            let cdata = unsafe { &mut *child.data.get() };
            cdata.memory = memory;
            cdata.kstack = kstack;
            cdata.tss = pdata.tss;
            cdata.tss.cr3 = cdata.memory.pgdir as u32;
            cdata.tss.esp0 = (kstack + PAGE_SIZE - 4) as u32;

            // The child's first run starts in forkret on a stack that
            // holds the parent's trap frame with EAX forced to zero.
            let frame_addr = kstack_frame_addr(kstack);
            let child_sc = frame_addr as *mut SigContext;
            unsafe {
                *child_sc = *sc;
                (*child_sc).eax = 0;
            }
            cdata.tss.eip = forkret as usize as u32;
            cdata.tss.esp = frame_addr as u32;

            // Share the descriptor table, bumping each description.
            let mut ftable = kernel().ftable.inner.lock();
            for (cfd, pfd) in izip!(cdata.fd_table.iter_mut(), pdata.fd_table.iter()) {
                if let Some(fd) = pfd {
                    ftable.dup(fd.file);
                    *cfd = Some(*fd);
                }
            }
            drop(ftable);

            cdata.cwd = pdata.cwd.map(|ino| kernel().itable.idup(ino));
            cdata.root = pdata.root.map(|ino| kernel().itable.idup(ino));
            cdata.uid = pdata.uid;
            cdata.euid = pdata.euid;
            cdata.suid = pdata.suid;
            cdata.gid = pdata.gid;
            cdata.egid = pdata.egid;
            cdata.sgid = pdata.sgid;
            cdata.groups = pdata.groups;
            cdata.umask = pdata.umask;
            cdata.it_real_interval = pdata.it_real_interval;
            cdata.it_virt_interval = pdata.it_virt_interval;
            cdata.it_prof_interval = pdata.it_prof_interval;
            cdata.name = pdata.name;
            pdata.children += 1;
        }

        {
            let pguard = parent.lock();
            let mut cguard = child.lock();
            cguard.pid = pid;
            cguard.pgid = pguard.pgid;
            cguard.sid = pguard.sid;
            cguard.priority = pguard.priority;
            cguard.cpu_count = pguard.cpu_count / 2;
            cguard.sigaction = pguard.sigaction;
            cguard.sigblocked = pguard.sigblocked;
        }

        {
            let _wait = self.wait_lock.lock();
            unsafe { *child.parent_slot() = Some(parent_slot) };
        }

        child.lock().state = ProcState::Runnable;
        let _ = scopeguard::ScopeGuard::into_inner(slot_guard);
        Ok(pid)
    }

    /// Hand the children of `slot` to init and wake it if any were
    /// zombies already.
    fn reparent(&self, slot: usize) {
        let init_slot = self.find_pid(INIT_PID);
        let mut slots = [0usize; NPROC];
        let n = self.allocated(&mut slots);
        let _wait = self.wait_lock.lock();
        for &s in &slots[..n] {
            let parent = unsafe { self.proc(s).parent_slot() };
            if *parent == Some(slot) {
                *parent = init_slot;
                if let Some(init_slot) = init_slot {
                    self.proc(init_slot).child_waitchannel.wakeup();
                }
            }
        }
    }

    /// Collect one zombie (or, with WUNTRACED, stopped) child matching
    /// `selector`: >0 exact pid, 0 caller's group, -1 any, <-1 group
    /// -selector.
    pub fn wait4(&self, selector: Pid, options: u32) -> Result<(Pid, i32)> {
        let myslot = self.current_slot().ok_or(Errno::ESRCH)?;
        let me = self.proc(myslot);
        let my_pgid = me.lock().pgid;

        // The wait lock is held across the scan and into the sleep, so
        // an exiting child cannot slip its wakeup in between.
        let mut wait_guard = self.wait_lock.lock();
        loop {
            let mut havekids = false;
            let mut slots = [0usize; NPROC];
            let n = self.allocated(&mut slots);
            let mut reap: Option<(usize, Pid, i32)> = None;
            for &s in &slots[..n] {
                if unsafe { *self.proc(s).parent_slot() } != Some(myslot) {
                    continue;
                }
                let (pid, pgid, state, xstate) = {
                    let g = self.proc(s).lock();
                    (g.pid, g.pgid, g.state, g.xstate)
                };
                let selected = match selector {
                    0 => pgid == my_pgid,
                    -1 => true,
                    p if p > 0 => pid == p,
                    p => pgid == -p,
                };
                if !selected {
                    continue;
                }
                havekids = true;

                if state == ProcState::Zombie {
                    reap = Some((s, pid, xstate));
                    break;
                }
                if options & WUNTRACED != 0 && state == ProcState::Stopped && xstate != 0 {
                    self.proc(s).lock().xstate = 0;
                    return Ok((pid, (xstate << 8) | 0x7f));
                }
            }

            if let Some((s, pid, xstate)) = reap {
                // Fold the child's usage into ours and free the slot;
                // the release re-takes the wait lock itself.
                drop(wait_guard);
                let cusage = {
                    let cdata = unsafe { &*self.proc(s).data.get() };
                    let mut sum = cdata.usage;
                    sum.add(&cdata.cusage);
                    sum
                };
                let mydata = unsafe { &mut *me.data.get() };
                mydata.cusage.add(&cusage);
                if mydata.children > 0 {
                    mydata.children -= 1;
                }
                self.reap_slot(s);
                return Ok((pid, xstate));
            }

            if !havekids {
                return Err(Errno::ECHILD);
            }
            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }

            me.child_waitchannel
                .sleep_interruptible(&mut wait_guard)
                .map_err(|_| Errno::EINTR)?;
        }
    }

    /// Free everything a zombie still owns: kernel stack, page
    /// directory, the slot itself.
    fn reap_slot(&self, slot: usize) {
        {
            let data = unsafe { &mut *self.proc(slot).data.get() };
            let kstack = core::mem::replace(&mut data.kstack, 0);
            if kstack != 0 {
                let mut frames = kernel().frames.lock();
                if let Some(frame) = frames.frame_of(crate::page::v2p(kstack)) {
                    frames.decref(frame);
                }
            }
            data.memory.release();
        }
        self.release_slot(slot);
    }

    /// Reap every zombie child of `slot` without reporting (ignored
    /// SIGCHLD).
    pub fn reap_zombies_of(&self, slot: usize) {
        loop {
            let mut slots = [0usize; NPROC];
            let n = self.allocated(&mut slots);
            let zombie = slots[..n].iter().copied().find(|&s| {
                let is_child = {
                    let _wait = self.wait_lock.lock();
                    (unsafe { *self.proc(s).parent_slot() }) == Some(slot)
                };
                is_child && self.proc(s).lock().state == ProcState::Zombie
            });
            match zombie {
                Some(s) => {
                    let data = unsafe { &mut *self.proc(slot).data.get() };
                    if data.children > 0 {
                        data.children -= 1;
                    }
                    self.reap_slot(s);
                }
                None => return,
            }
        }
    }

    /// Tell the parent the current process stopped.
    pub fn notify_parent_of_stop(&self, send_chld: bool) {
        let myslot = match self.current_slot() {
            Some(s) => s,
            None => return,
        };
        let parent = {
            let _wait = self.wait_lock.lock();
            unsafe { *self.proc(myslot).parent_slot() }
        };
        if let Some(pp) = parent {
            if send_chld {
                let _ = send_sig(pp, SIGCHLD);
            }
            self.proc(pp).child_waitchannel.wakeup();
        }
    }

    /// Spawn a kernel process running `f`. It never returns to user
    /// mode and never receives signals.
    pub fn kernel_process(&self, name: &[u8], f: fn() -> !) -> Result<usize> {
        let slot = self.alloc_slot(true)?;
        let pid = self.get_unused_pid()?;

        let kstack_frame = kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?;
        let kstack = p2v(kernel().frames.lock().addr_of(kstack_frame));

        {
            let data = unsafe { &mut *self.proc(slot).data.get() };
            data.kstack = kstack;
            data.set_name(name);
            data.tss.cr3 = kernel().master_pgdir() as u32;
            data.tss.eip = f as usize as u32;
            data.tss.esp = (kstack + PAGE_SIZE - 4) as u32;
            data.tss.esp0 = data.tss.esp;
        }
        {
            let mut guard = self.proc(slot).lock();
            guard.pid = pid;
            guard.flags.insert(ProcFlags::KPROC);
            guard.priority = DEF_PRIORITY;
            guard.cpu_count = DEF_PRIORITY;
            guard.state = ProcState::Runnable;
        }
        Ok(slot)
    }

    /// The idle process: spin in `hlt` with the lowest possible claim
    /// on the CPU.
    pub fn idle_process_init(&self) -> Result<()> {
        let slot = self.alloc_slot(true)?;
        {
            let data = unsafe { &mut *self.proc(slot).data.get() };
            data.set_name(b"idle");
            data.tss.cr3 = kernel().master_pgdir() as u32;
            data.tss.eip = idle_loop as usize as u32;
        }
        {
            let mut guard = self.proc(slot).lock();
            guard.pid = 0;
            guard.flags.insert(ProcFlags::KPROC);
            guard.priority = 0;
            guard.state = ProcState::Runnable;
        }
        self.idle_slot.store(slot, Ordering::Relaxed);
        self.current.store(slot, Ordering::Relaxed);
        Ok(())
    }
}

fn idle_loop() -> ! {
    loop {
        crate::arch::x86::idle_wait();
        if kernel().procs.take_need_resched() {
            kernel().procs.yield_cpu();
        }
    }
}

/// Where fork parks the child's first user frame on its kernel stack.
pub(crate) fn kstack_frame_addr(kstack: usize) -> usize {
    kstack + PAGE_SIZE - core::mem::size_of::<SigContext>() - 16
}

/// A forked child's very first scheduling resumes here; the crafted
/// kernel stack holds the user frame to return with.
fn forkret() -> ! {
    let kstack = unsafe { current_proc_data() }.kstack;
    unsafe { crate::trap::return_to_user(kstack_frame_addr(kstack)) }
}

/// Return the current `Proc`, or null if none (early boot, IRQ with no
/// process).
pub fn myproc() -> *mut Proc {
    let procs = &kernel().procs;
    match procs.current_slot() {
        Some(slot) => procs.proc(slot) as *const Proc as *mut Proc,
        None => core::ptr::null_mut(),
    }
}

/// The running process; panics when there is none.
pub fn current_proc() -> &'static Proc {
    let p = myproc();
    assert!(!p.is_null(), "no current process");
    unsafe { &*p }
}

/// The running process's private half.
///
/// # Safety
///
/// Only the process itself may take this; never cache it across a
/// context switch.
pub unsafe fn current_proc_data() -> &'static mut crate::proc::ProcData {
    unsafe { &mut *current_proc().data.get() }
}

/// Exit the current process. Does not return; the slot lingers as a
/// zombie until the parent waits.
pub fn do_exit(status: i32) -> ! {
    let procs = &kernel().procs;
    let slot = procs.current_slot().expect("exit with no process");
    let me = procs.proc(slot);
    assert_ne!(me.lock().pid, INIT_PID, "init exiting");

    // Close every descriptor.
    let data = unsafe { &mut *me.data.get() };
    for fd in 0..data.fd_table.len() {
        if let Some(fd_entry) = data.fd_table[fd].take() {
            crate::syscall::close_file(fd_entry.file);
        }
    }
    if let Some(cwd) = data.cwd.take() {
        kernel().itable.iput(cwd);
    }
    if let Some(root) = data.root.take() {
        kernel().itable.iput(root);
    }

    // Drop the address space now; the kernel stack and page directory
    // wait for the reaper.
    data.memory.release();

    procs.reparent(slot);

    // Parent might be sleeping in wait4.
    let parent = {
        let _wait = procs.wait_lock.lock();
        unsafe { *me.parent_slot() }
    };
    if let Some(pp) = parent {
        let _ = send_sig(pp, SIGCHLD);
        procs.proc(pp).child_waitchannel.wakeup();
    }

    let mut guard = me.lock();
    guard.xstate = status;
    guard.state = ProcState::Zombie;
    unsafe { procs.sched(&mut guard) };
    unreachable!("zombie exit");
}

/// Kill with extreme prejudice: used by fault paths.
pub fn force_sig_kill(slot: usize) {
    let _ = send_sig(slot, SIGKILL);
}

/// Mark interruptible sleepers killable-aware: a process that was
/// sleeping uninterruptibly keeps its signal pending until wakeup.
pub fn signal_pending_current() -> bool {
    let p = myproc();
    if p.is_null() {
        return false;
    }
    unsafe { (*p).lock().signal_pending() }
}

/// Sleep kinds re-exported for drivers.
pub const SLEEP_INTERRUPTIBLE: SleepKind = SleepKind::Interruptible;
pub const SLEEP_UNINTERRUPTIBLE: SleepKind = SleepKind::Uninterruptible;

/// Serializes every test that touches the kernel's static proc table,
/// across modules.
#[cfg(test)]
pub(crate) static TABLE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Test entry to the shared table: serialized, lazily initialized.
#[cfg(test)]
pub(crate) fn with_table(f: impl FnOnce(&Procs)) {
    let _guard = match TABLE_TEST_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let procs = &kernel().procs;
    if procs.free_slots() == 0 {
        procs.init();
    }
    f(procs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_alloc_release_round_trip() {
        with_table(|procs| {
            let free0 = procs.free_slots();
            let slot = procs.alloc_slot(true).unwrap();
            assert_eq!(procs.free_slots(), free0 - 1);
            let mut out = [0usize; NPROC];
            let n = procs.allocated(&mut out);
            assert!(out[..n].contains(&slot));
            procs.release_slot(slot);
            assert_eq!(procs.free_slots(), free0);
        });
    }

    #[test]
    fn safe_slots_reserved_for_superuser() {
        with_table(|procs| {
            let mut taken = std::vec::Vec::new();
            while procs.free_slots() > SAFE_SLOTS {
                taken.push(procs.alloc_slot(false).unwrap());
            }
            assert_eq!(procs.alloc_slot(false).unwrap_err(), Errno::EAGAIN);
            let root_slot = procs.alloc_slot(true).unwrap();
            procs.release_slot(root_slot);
            for s in taken {
                procs.release_slot(s);
            }
        });
    }

    #[test]
    fn pid_allocation_avoids_live_pid_pgid_sid() {
        with_table(|procs| {
            let a = procs.alloc_slot(true).unwrap();
            let next = procs.last_pid.load(Ordering::Relaxed) + 1;
            {
                let mut g = procs.proc(a).lock();
                g.pid = next + 1;
                g.pgid = next + 2;
                g.sid = next + 3;
            }
            // Force the allocator to walk straight into the occupied
            // range; it must skip pid, pgid and sid values.
            procs.last_pid.store(next, Ordering::Relaxed);
            let got = procs.get_unused_pid().unwrap();
            assert_eq!(got, next + 4);
            procs.release_slot(a);
        });
    }

    #[test]
    fn orphaned_pgrp_detection() {
        with_table(|procs| {
            // Build: parent P (pgid 900, sid 900) with child C in its
            // own group 901, same session.
            let p = procs.alloc_slot(true).unwrap();
            let c = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(p).lock();
                g.pid = 900;
                g.pgid = 900;
                g.sid = 900;
            }
            {
                let mut g = procs.proc(c).lock();
                g.pid = 901;
                g.pgid = 901;
                g.sid = 900;
            }
            {
                let _w = procs.wait_lock.lock();
                unsafe { *procs.proc(c).parent_slot() = Some(p) };
            }
            // Parent outside the group but in the session anchors it.
            assert!(!procs.is_orphaned_pgrp(901));
            // Parent dies: group 901 becomes orphaned.
            procs.proc(p).lock().state = ProcState::Zombie;
            {
                let _w = procs.wait_lock.lock();
                unsafe { *procs.proc(c).parent_slot() = None };
            }
            assert!(procs.is_orphaned_pgrp(901));
            procs.release_slot(c);
            procs.release_slot(p);
        });
    }

    #[test]
    fn members_and_find_pid() {
        with_table(|procs| {
            let a = procs.alloc_slot(true).unwrap();
            let b = procs.alloc_slot(true).unwrap();
            {
                let mut g = procs.proc(a).lock();
                g.pid = 700;
                g.pgid = 70;
            }
            {
                let mut g = procs.proc(b).lock();
                g.pid = 701;
                g.pgid = 70;
            }
            assert_eq!(procs.find_pid(700), Some(a));
            assert_eq!(procs.find_pid(9999), None);
            let mut out = [0usize; NPROC];
            assert_eq!(procs.members_of_pgrp(70, &mut out), 2);
            procs.release_slot(a);
            procs.release_slot(b);
        });
    }
}
