//! The system-call gateway.
//!
//! One trap vector, Linux i386 numbering, a dense table indexed by the
//! syscall number with `ENOSYS` holes. Arguments are positional in
//! EBX..EBP; the saved register frame rides along for the few calls
//! that need it (fork, sigreturn). Return convention: non-negative
//! result in EAX, negative errno on failure.

use core::sync::atomic::{AtomicUsize, Ordering};

use cfg_if::cfg_if;
use cstr_core::CStr;

use crate::{
    arch::x86::SigContext,
    errno::{Errno, Result},
    file::OpenFile,
    kernel::kernel,
    param::MAXPATH,
    proc::myproc,
    vm::{PROT_READ, PROT_WRITE},
};

mod file;
mod proc;

pub use file::*;
pub use proc::*;

pub const NR_SYSCALLS: usize = 200;

/// Positional arguments, EBX..EBP order.
pub type SysArgs = [usize; 6];

pub type SysFn = fn(&SysArgs, &mut SigContext) -> Result<isize>;

struct SysEntry {
    f: SysFn,
}

static SYSCALL_TABLE: spin::Once<[Option<SysEntry>; NR_SYSCALLS]> = spin::Once::new();

/// Count of syscalls served, for the statistics readers.
pub static NR_SYSCALLS_SERVED: AtomicUsize = AtomicUsize::new(0);

macro_rules! syscall_table {
    ($(($nr:expr, $f:expr)),* $(,)?) => {{
        const NONE: Option<SysEntry> = None;
        let mut table = [NONE; NR_SYSCALLS];
        $(
            table[$nr] = Some(SysEntry { f: $f });
        )*
        table
    }};
}

/// Populate the dispatch table. Numbering follows the i386 Linux ABI.
pub fn init() {
    let _ = SYSCALL_TABLE.call_once(|| {
        syscall_table![
            (1, sys_exit),
            (2, sys_fork),
            (3, sys_read),
            (4, sys_write),
            (5, sys_open),
            (6, sys_close),
            (7, sys_waitpid),
            (9, sys_link),
            (10, sys_unlink),
            (11, sys_execve),
            (12, sys_chdir),
            (14, sys_mknod),
            (15, sys_chmod),
            (18, sys_stat),
            (19, sys_lseek),
            (20, sys_getpid),
            (21, sys_mount),
            (22, sys_umount),
            (23, sys_setuid),
            (24, sys_getuid),
            (27, sys_alarm),
            (29, sys_pause),
            (33, sys_access),
            (36, sys_sync),
            (37, sys_kill),
            (38, sys_rename),
            (39, sys_mkdir),
            (40, sys_rmdir),
            (41, sys_dup),
            (42, sys_pipe),
            (45, sys_brk),
            (46, sys_setgid),
            (47, sys_getgid),
            (49, sys_geteuid),
            (50, sys_getegid),
            (54, sys_ioctl),
            (55, sys_fcntl),
            (57, sys_setpgid),
            (60, sys_umask),
            (63, sys_dup2),
            (64, sys_getppid),
            (65, sys_getpgrp),
            (66, sys_setsid),
            (67, sys_sigaction),
            (70, sys_setreuid),
            (72, sys_sigsuspend),
            (83, sys_symlink),
            (85, sys_readlink),
            (90, sys_mmap),
            (91, sys_munmap),
            (92, sys_truncate),
            (102, sys_socketcall),
            (104, sys_setitimer),
            (108, sys_fstat),
            (114, sys_wait4),
            (119, sys_sigreturn),
            (125, sys_mprotect),
            (126, sys_sigprocmask),
            (132, sys_getpgid),
            (141, sys_getdents),
            (142, sys_select),
            (147, sys_getsid),
            (162, sys_nanosleep),
            (182, sys_chown),
        ]
    });
}

/// The `int 0x80` entry: dispatch and fold the result into EAX.
pub fn do_syscall(sc: &mut SigContext) {
    let num = sc.eax as usize;
    let args: SysArgs = [
        sc.ebx as usize,
        sc.ecx as usize,
        sc.edx as usize,
        sc.esi as usize,
        sc.edi as usize,
        sc.ebp as usize,
    ];
    // Stash the number so a restarted syscall can be re-issued.
    sc.err = sc.eax;

    let _ = NR_SYSCALLS_SERVED.fetch_add(1, Ordering::Relaxed);

    let entry = SYSCALL_TABLE
        .get()
        .and_then(|t| t.get(num))
        .and_then(|e| e.as_ref());
    let ret = match entry {
        Some(e) => (e.f)(&args, sc).unwrap_or_else(|e| e.as_ret()),
        None => Errno::ENOSYS.as_ret(),
    };
    sc.eax = ret as u32;
}

cfg_if! {
    if #[cfg(feature = "lazy-user-check")] {
        /// Validate a user pointer: only the null case is rejected; the
        /// page-fault handler recovers everything else.
        pub fn verify_address(_prot: u32, addr: usize, _size: usize) -> Result<()> {
            if addr == 0 {
                return Err(Errno::EFAULT);
            }
            Ok(())
        }
    } else {
        /// Validate a user pointer range against the VMA list with the
        /// requested protection, with an allowance for a not-yet-grown
        /// stack.
        pub fn verify_address(prot: u32, addr: usize, size: usize) -> Result<()> {
            let p = myproc();
            if p.is_null() {
                return Ok(());
            }
            let data = unsafe { &*(*p).data.get() };
            // The first process has no address space yet while it sets
            // itself up from the boot trampoline; those calls are
            // trusted.
            if data.memory.vmas.is_empty() {
                return Ok(());
            }

            let mut cursor = addr;
            let end = addr.checked_add(size).ok_or(Errno::EFAULT)?;
            loop {
                let vma = match data.memory.vmas.find(cursor) {
                    Some(v) => v,
                    None => {
                        // A miss just below the stack region may be a
                        // stack push the fault handler will satisfy.
                        let stack_ok = data
                            .memory
                            .vmas
                            .iter()
                            .any(|v| v.typ == crate::vm::VmaType::Stack && cursor < v.start);
                        if stack_ok {
                            return Ok(());
                        }
                        return Err(Errno::EFAULT);
                    }
                };
                if prot & PROT_WRITE != 0 && vma.prot & PROT_WRITE == 0 {
                    return Err(Errno::EFAULT);
                }
                if prot & PROT_READ != 0 && vma.prot & PROT_READ == 0 {
                    return Err(Errno::EFAULT);
                }
                if end <= vma.end {
                    return Ok(());
                }
                cursor = vma.end;
            }
        }
    }
}

/// Copy a NUL-terminated user path into `buf`, bounded by MAXPATH.
pub fn get_user_path<'a>(addr: usize, buf: &'a mut [u8; MAXPATH]) -> Result<&'a [u8]> {
    verify_address(PROT_READ, addr, 1)?;
    unsafe { crate::vm::copy_from_user_raw(addr, buf) };
    let nul = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(Errno::ENAMETOOLONG)?;
    let s = CStr::from_bytes_with_nul(&buf[..=nul]).map_err(|_| Errno::EINVAL)?;
    Ok(s.to_bytes())
}

/// Fetch one u32 from user memory.
pub fn get_user_u32(addr: usize) -> Result<u32> {
    verify_address(PROT_READ, addr, 4)?;
    let mut raw = [0u8; 4];
    unsafe { crate::vm::copy_from_user_raw(addr, &mut raw) };
    Ok(u32::from_le_bytes(raw))
}

/// Store one u32 to user memory.
pub fn put_user_u32(addr: usize, value: u32) -> Result<()> {
    verify_address(PROT_WRITE, addr, 4)?;
    unsafe { crate::vm::copy_to_user_raw(addr, &value.to_le_bytes()) };
    Ok(())
}

/// Copy an object out to user memory.
pub fn put_user_bytes(addr: usize, bytes: &[u8]) -> Result<()> {
    verify_address(PROT_WRITE, addr, bytes.len())?;
    unsafe { crate::vm::copy_to_user_raw(addr, bytes) };
    Ok(())
}

/// Drop one share of an open-file description, running the close hook
/// and releasing the inode on the last one.
pub fn close_file(idx: u16) {
    let closed = kernel().ftable.inner.lock().put(idx);
    if let Some((inode, fops, flags)) = closed {
        if let Some(ino) = inode {
            let mut tmp = OpenFile {
                inode: Some(ino),
                flags,
                offset: 0,
                count: 0,
                fops,
            };
            let _ = fops.close(ino, &mut tmp);
            kernel().itable.iput(ino);
        }
    }
}
