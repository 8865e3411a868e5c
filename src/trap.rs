//! Traps, interrupts and bottom halves.
//!
//! Every kernel entry funnels through `trap_entry` with the saved
//! register frame. IRQ handlers run with interrupts off and only post
//! work; bottom halves run it afterwards with interrupts on, at task
//! granularity. The pre-return-to-user tail delivers signals and honors
//! the reschedule flag; kernel code itself is never preempted.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    arch::x86::{read_cr2, FaultError, SigContext, PAGE_OFFSET},
    kernel::kernel,
    param::NR_BH,
    proc::myproc,
    signal::{issig, psig, send_sig_current, SIGBUS, SIGFPE, SIGILL, SIGSEGV},
    vm::{VmaType, PROT_NONE, PROT_WRITE, ZERO_PAGE},
};

/// Fixed bottom-half slots.
pub const BH_TIMER: usize = 0;
pub const BH_CALLOUTS: usize = 1;
pub const BH_IDE0: usize = 2;
pub const BH_IDE1: usize = 3;

type BhFn = fn();

fn bh_nop() {}

pub struct BhTable {
    active: [AtomicBool; NR_BH],
    handlers: crate::lock::SpinLock<[BhFn; NR_BH]>,
}

impl BhTable {
    pub const fn zero() -> Self {
        const OFF: AtomicBool = AtomicBool::new(false);
        Self {
            active: [OFF; NR_BH],
            handlers: crate::lock::SpinLock::new("bh", [bh_nop; NR_BH]),
        }
    }

    pub fn register(&self, slot: usize, f: BhFn) {
        self.handlers.lock()[slot] = f;
    }

    /// Queue a bottom half from IRQ context.
    pub fn mark(&self, slot: usize) {
        self.active[slot].store(true, Ordering::Release);
    }

    /// Run every queued bottom half; called on the way out of a trap
    /// with interrupts enabled.
    pub fn run(&self) {
        for slot in 0..NR_BH {
            if self.active[slot].swap(false, Ordering::Acquire) {
                let f = self.handlers.lock()[slot];
                f();
            }
        }
    }
}

/// Exception vectors we care about by name.
pub const T_DIVIDE: u32 = 0;
pub const T_ILLEGAL_OP: u32 = 6;
pub const T_DOUBLE_FAULT: u32 = 8;
pub const T_GPF: u32 = 13;
pub const T_PAGE_FAULT: u32 = 14;
pub const T_SYSCALL: u32 = 0x80;
pub const T_IRQ0: u32 = 0x20;

/// Handle one trap with its saved frame. `trap` is the vector number.
pub fn trap_entry(trap: u32, sc: &mut SigContext) {
    match trap {
        T_SYSCALL => {
            crate::syscall::do_syscall(sc);
        }
        T_PAGE_FAULT => {
            do_page_fault(sc);
        }
        T_DIVIDE => user_fault_or_panic(sc, SIGFPE, "divide error"),
        T_ILLEGAL_OP => user_fault_or_panic(sc, SIGILL, "invalid opcode"),
        T_GPF => user_fault_or_panic(sc, SIGSEGV, "general protection fault"),
        T_DOUBLE_FAULT => panic!("double fault"),
        n if n >= T_IRQ0 && n < T_IRQ0 + 16 => {
            kernel().irqs.dispatch((n - T_IRQ0) as usize, sc);
        }
        _ => {
            user_fault_or_panic(sc, SIGBUS, "unknown trap");
        }
    }

    // Deferred work, then the pre-return checks.
    kernel().bh_table.run();
    trap_return(sc);
}

/// Faults taken while running user code kill the process; in kernel
/// mode they are fatal.
fn user_fault_or_panic(sc: &SigContext, sig: usize, what: &str) {
    if sc.from_user() {
        send_sig_current(sig);
    } else {
        crate::etrace::dump_registers(sc);
        panic!("{} in kernel mode at {:#x}", what, sc.eip);
    }
}

/// The page-fault matrix: user/kernel x present/absent x read/write.
///
/// Not present: demand-fill, stack growth, or SIGSEGV. Present+write:
/// copy-on-write or SIGSEGV. Kernel-mode faults on user addresses are
/// the lazy-address-check recovery path; anything else in kernel mode
/// panics.
pub fn do_page_fault(sc: &mut SigContext) {
    let cr2 = read_cr2();
    let err = FaultError::from_bits_truncate(sc.err as usize);
    let user = err.contains(FaultError::USER);

    let p = myproc();
    if p.is_null() {
        crate::etrace::dump_registers(sc);
        panic!("page fault with no process at {:#x}", cr2);
    }
    let data = unsafe { &mut *(*p).data.get() };

    if err.contains(FaultError::PROTECTION) {
        if err.contains(FaultError::WRITE) {
            // Write to a present page: CoW if the page was demoted for
            // sharing, otherwise a real violation.
            let in_vma = data
                .memory
                .find_vma(cr2)
                .map(|v| v.prot & PROT_WRITE != 0)
                .unwrap_or(false);
            if in_vma && data.memory.wp_fault(cr2).is_ok() {
                return;
            }
        }
        // A kernel-mode violation on a user address is the lazy
        // user-pointer check recovering (an unchecked copy hit a
        // read-only region); it kills the process, not the kernel.
        if user || cr2 < PAGE_OFFSET {
            send_sig_current(SIGSEGV);
            return;
        }
        crate::etrace::dump_registers(sc);
        panic!("kernel protection fault at {:#x}", cr2);
    }

    // Page not present: find (or grow) the region and fill on demand.
    if page_not_present(data, cr2, sc).is_err() {
        if user || cr2 < PAGE_OFFSET {
            send_sig_current(SIGSEGV);
        } else {
            crate::etrace::dump_registers(sc);
            panic!("kernel page fault at {:#x}", cr2);
        }
    }
}

/// Demand fill: map from the page cache, read through the block layer,
/// or hand out a zero page; grows the stack when the fault is a
/// plausible push below it.
fn page_not_present(
    data: &mut crate::proc::ProcData,
    cr2: usize,
    sc: &SigContext,
) -> core::result::Result<(), ()> {
    if data.memory.find_vma(cr2).is_none() {
        // Between the previous region and the stack, close to the user
        // stack pointer: extend the stack region down.
        if !data.memory.vmas.grow_stack(cr2, sc.oldesp as usize) {
            return Err(());
        }
    }
    let vma = *data.memory.find_vma(cr2).ok_or(())?;
    if vma.prot == PROT_NONE {
        return Err(());
    }

    let page_addr = cr2 & crate::arch::x86::PAGE_MASK;
    if let Some(ino) = vma.inode {
        let file_offset = (page_addr - vma.start) as u32 + vma.offset;

        // Shared or read-only file pages come from (or populate) the
        // page cache keyed by (dev, inode, offset).
        let (dev, inum) = kernel().itable.with(ino, |i| (i.dev, i.inum));
        let cached = if vma.prot & PROT_WRITE == 0 || vma.flags & crate::vm::MAP_SHARED != 0 {
            kernel().frames.lock().lookup_cache(dev, inum, file_offset)
        } else {
            None
        };
        if let Some(frame) = cached {
            data.memory
                .map_page(page_addr, frame, vma.prot)
                .map_err(|_| ())?;
            data.usage.minflt += 1;
            return Ok(());
        }

        // Read the page through the filesystem, one block at a time.
        let frame = data
            .memory
            .map_page(page_addr, crate::page::NO_FRAME, vma.prot)
            .map_err(|_| ())?;
        let filled = {
            let frames = kernel().frames.lock();
            let bytes = unsafe { crate::page::frame_bytes(&frames, frame) };
            drop(frames);
            bytes.fill(0);
            crate::exec::read_at(ino, file_offset as u64, bytes)
        };
        if filled.is_err() {
            data.memory.unmap_page(page_addr);
            return Err(());
        }
        if vma.prot & PROT_WRITE == 0 || vma.flags & crate::vm::MAP_SHARED != 0 {
            let mut frames = kernel().frames.lock();
            if frames.lookup_cache(dev, inum, file_offset).is_none() {
                frames.insert_cache(frame, dev, inum, file_offset);
            }
        }
        data.usage.majflt += 1;
        return Ok(());
    }

    // Anonymous: a zero-filled frame.
    let frame = data
        .memory
        .map_page(page_addr, crate::page::NO_FRAME, vma.prot)
        .map_err(|_| ())?;
    if vma.flags & ZERO_PAGE != 0 || vma.typ == VmaType::Stack || vma.typ == VmaType::Heap {
        let frames = kernel().frames.lock();
        let bytes = unsafe { crate::page::frame_bytes(&frames, frame) };
        drop(frames);
        bytes.fill(0);
    }
    data.usage.minflt += 1;
    Ok(())
}

/// Pre-return-to-user tail: run signal delivery and honor preemption.
/// Preemption happens only here, at the boundary back to user mode.
pub fn trap_return(sc: &mut SigContext) {
    if !sc.from_user() {
        return;
    }
    loop {
        if kernel().procs.take_need_resched() {
            kernel().procs.yield_cpu();
            continue;
        }
        break;
    }
    if issig().is_some() {
        psig(sc);
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        /// Jump back to user mode through the `SigContext` at `frame`
        /// on the current kernel stack; the fork child enters here
        /// first. The stack pointer is set explicitly because the call
        /// chain reaching this point has pushed past the frame.
        ///
        /// # Safety
        ///
        /// `frame` must point at a valid `SigContext` built for user
        /// mode, on this process's kernel stack.
        pub unsafe fn return_to_user(frame: usize) -> ! {
            unsafe {
                core::arch::asm!(
                    "mov esp, {0}",
                    "jmp trapret",
                    in(reg) frame,
                    options(noreturn),
                );
            }
        }
    } else {
        /// # Safety
        ///
        /// Never reached on a hosted build.
        pub unsafe fn return_to_user(_frame: usize) -> ! {
            unreachable!("return_to_user on a hosted build")
        }
    }
}

/// IRQ routing: a fixed vector of handlers by IRQ line.
pub struct IrqTable {
    handlers: crate::lock::SpinLock<[Option<fn(&SigContext)>; 16]>,
}

impl IrqTable {
    pub const fn zero() -> Self {
        Self {
            handlers: crate::lock::SpinLock::new("irqs", [None; 16]),
        }
    }

    pub fn register(&self, irq: usize, f: fn(&SigContext)) {
        self.handlers.lock()[irq] = Some(f);
    }

    pub fn dispatch(&self, irq: usize, sc: &SigContext) {
        let handler = self.handlers.lock()[irq];
        match handler {
            Some(f) => f(sc),
            None => crate::println!("WARNING: unexpected interrupt irq={}", irq),
        }
    }
}
