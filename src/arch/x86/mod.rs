//! Single-CPU x86-32: paging layout, trap frame, task state and the
//! small amount of assembly the rest of the kernel needs.

pub mod asm;
pub mod context;

pub use asm::*;
pub use context::*;

use bitflags::bitflags;

/// Bytes per page and per page frame.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Start of the kernel mapping, shared by every address space.
pub const PAGE_OFFSET: usize = 0xc000_0000;

/// Entries per page directory / page table.
pub const PD_ENTRIES: usize = 1024;
pub const PT_ENTRIES: usize = 1024;

/// Page-directory index of a virtual address.
#[inline]
pub const fn pde_index(addr: usize) -> usize {
    (addr >> 22) & 0x3ff
}

/// Page-table index of a virtual address.
#[inline]
pub const fn pte_index(addr: usize) -> usize {
    (addr >> PAGE_SHIFT) & 0x3ff
}

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & PAGE_MASK
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & PAGE_MASK
}

bitflags! {
    /// x86 page-table entry bits. COW lives in one of the bits the MMU
    /// ignores.
    pub struct PteFlags: usize {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const COW = 1 << 9;
    }
}

/// Page-fault error code pushed by the CPU.
bitflags! {
    pub struct FaultError: usize {
        /// Fault was a protection violation (page was present).
        const PROTECTION = 1 << 0;
        /// Fault was caused by a write.
        const WRITE = 1 << 1;
        /// Fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// Kernel code segment selector, used to tell user from kernel frames.
pub const KERNEL_CS: u32 = 0x08;
pub const USER_CS: u32 = 0x23;
pub const USER_DS: u32 = 0x2b;

/// `int 0x80` instruction length, for re-arming restarted syscalls.
pub const INT80_INSN_LEN: u32 = 2;

// The two assembly entry points the portable code needs by symbol. The
// IDT vector stubs that push the `SigContext` on the way in live with
// the boot glue (entry.S), outside the core.
#[cfg(all(target_arch = "x86", not(test)))]
core::arch::global_asm!(
    r#"
    .globl swtch
    # swtch(old: *mut TaskState, new: *const TaskState)
    # TaskState: esp0 +0, cr3 +4, eip +8, esp +12, ebp +16,
    #            ebx +20, esi +24, edi +28, eflags +32
swtch:
    mov eax, [esp + 4]
    mov edx, [esp + 8]

    # Save the resume point: the caller's return address, and the stack
    # as it will be after that return.
    mov ecx, [esp]
    mov [eax + 8], ecx
    lea ecx, [esp + 4]
    mov [eax + 12], ecx
    mov [eax + 16], ebp
    mov [eax + 20], ebx
    mov [eax + 24], esi
    mov [eax + 28], edi
    pushfd
    pop ecx
    mov [eax + 32], ecx

    # Install the next task's address space and registers.
    mov ecx, [edx + 4]
    mov cr3, ecx
    mov esp, [edx + 12]
    mov ebp, [edx + 16]
    mov ebx, [edx + 20]
    mov esi, [edx + 24]
    mov edi, [edx + 28]
    push dword ptr [edx + 32]
    popfd
    jmp dword ptr [edx + 8]

    .globl trapret
    # Return to user mode with a SigContext at the stack pointer.
trapret:
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 4          # error code / syscall number
    iretd
"#
);
