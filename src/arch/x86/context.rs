//! Saved register frames.
//!
//! `SigContext` is the register image pushed on the kernel stack when a
//! trap, interrupt or `int 0x80` enters the kernel from user mode, in push
//! order. Signal delivery saves and restores whole `SigContext`s, and
//! syscalls that need the frame (`fork`, `sigreturn`, `iopl`) receive a
//! pointer to it.
//!
//! `TaskState` is the per-process save area used by the context switch:
//! kernel stack top, page directory and the resume point.

use cfg_if::cfg_if;
use static_assertions::const_assert_eq;

#[derive(Copy, Clone, Default, Debug)]
#[repr(C)]
pub struct SigContext {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    /// Hardware error code, reused to stash the syscall number so an
    /// interrupted syscall can be restarted.
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// User stack pointer at trap time.
    pub oldesp: u32,
    pub oldss: u32,
}

const_assert_eq!(core::mem::size_of::<SigContext>(), 18 * 4);

impl SigContext {
    pub const fn zero() -> Self {
        Self {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            err: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            oldesp: 0,
            oldss: 0,
        }
    }

    /// Did the trap come from user mode?
    pub fn from_user(&self) -> bool {
        self.cs != super::KERNEL_CS
    }
}

/// Register save area switched by `switch_to`. The page directory travels
/// with it, so resuming a task also resumes its address space.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TaskState {
    /// Top of the kernel stack for ring transitions.
    pub esp0: u32,
    /// Physical address of the page directory.
    pub cr3: u32,
    /// Resume point.
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eflags: u32,
}

impl TaskState {
    pub const fn zero() -> Self {
        Self {
            esp0: 0,
            cr3: 0,
            eip: 0,
            esp: 0,
            ebp: 0,
            ebx: 0,
            esi: 0,
            edi: 0,
            eflags: 0,
        }
    }
}

cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        extern "C" {
            /// swtch.S: save the callee-saved state into `old`, install
            /// `new`'s page directory and stack, and resume at `new.eip`.
            fn swtch(old: *mut TaskState, new: *const TaskState);
        }

        /// Switch from the running task's state to `new`.
        ///
        /// # Safety
        ///
        /// Interrupts must be disabled; `old` and `new` must be valid
        /// save areas and `new.cr3` a live page directory.
        pub unsafe fn switch_to(old: *mut TaskState, new: *const TaskState) {
            unsafe { swtch(old, new) };
        }
    } else {
        /// # Safety
        ///
        /// Never reached on a hosted build.
        pub unsafe fn switch_to(_old: *mut TaskState, _new: *const TaskState) {
            unreachable!("context switch on a hosted build");
        }
    }
}
