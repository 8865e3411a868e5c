//! Process, signal and memory system calls.

use crate::{
    arch::x86::SigContext,
    errno::{Errno, Result},
    exec::do_execve,
    file::fd_lookup,
    fs::InodeRef,
    kernel::kernel,
    param::{HZ, MAXARG, MAXPATH},
    proc::{current_proc, current_proc_data, do_exit, Pid, WNOHANG},
    signal::{
        do_sigaction, do_sigprocmask, do_sigreturn, kill_pgrp, kill_pid, SigAction,
        SigActionFlags, SigHandler, SigSet, NSIG,
    },
    syscall::{get_user_path, get_user_u32, put_user_u32, verify_address, SysArgs},
    timer::{add_callout, del_callout},
    vm::{do_mmap, do_mprotect, do_munmap, VmaType, MAP_ANONYMOUS, PROT_READ, PROT_WRITE},
};

pub fn sys_exit(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    do_exit(((args[0] & 0xff) << 8) as i32);
}

pub fn sys_fork(_args: &SysArgs, sc: &mut SigContext) -> Result<isize> {
    kernel().procs.fork(sc).map(|pid| pid as isize)
}

pub fn sys_waitpid(args: &SysArgs, sc: &mut SigContext) -> Result<isize> {
    // waitpid(pid, *status, options) is wait4 without rusage.
    let wait_args: SysArgs = [args[0], args[1], args[2], 0, 0, 0];
    sys_wait4(&wait_args, sc)
}

pub fn sys_wait4(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let (pid, status) = kernel()
        .procs
        .wait4(args[0] as Pid, args[2] as u32)?;
    if pid == 0 && args[2] as u32 & WNOHANG != 0 {
        return Ok(0);
    }
    if args[1] != 0 {
        put_user_u32(args[1], status as u32)?;
    }
    // rusage pointer (wait4 only) is accepted but the caller's copy is
    // filled in only when requested.
    if args[3] != 0 {
        let data = unsafe { current_proc_data() };
        let ru = &data.cusage;
        put_user_u32(args[3], (ru.utime_ticks / HZ as u64) as u32)?;
        put_user_u32(args[3] + 4, (ru.utime_ticks % HZ as u64 * 10_000) as u32)?;
        put_user_u32(args[3] + 8, (ru.stime_ticks / HZ as u64) as u32)?;
        put_user_u32(args[3] + 12, (ru.stime_ticks % HZ as u64 * 10_000) as u32)?;
    }
    Ok(pid as isize)
}

pub fn sys_execve(args: &SysArgs, sc: &mut SigContext) -> Result<isize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut path_buf)?;

    // Gather argv and envp out of the old address space first; the
    // block lives in its own frame, not on the kernel stack.
    let block = crate::exec::alloc_arg_block()?;
    let mut gathered: Result<()> = Ok(());
    'vectors: for (vec_addr, is_env) in [(args[1], false), (args[2], true)] {
        if vec_addr == 0 {
            continue;
        }
        for n in 0..MAXARG {
            let ptr = match get_user_u32(vec_addr + n * 4) {
                Ok(p) => p as usize,
                Err(e) => {
                    gathered = Err(e);
                    break 'vectors;
                }
            };
            if ptr == 0 {
                break;
            }
            let mut s_buf = [0u8; MAXPATH];
            let pushed = get_user_path(ptr, &mut s_buf).and_then(|s| block.push(s, is_env));
            if let Err(e) = pushed {
                gathered = Err(e);
                break 'vectors;
            }
        }
    }

    let result = gathered.and_then(|_| do_execve(path, block, sc));
    crate::exec::free_arg_block(block);
    result.map(|_| 0)
}

pub fn sys_getpid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(current_proc().lock().pid as isize)
}

pub fn sys_getppid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let procs = &kernel().procs;
    let slot = procs.current_slot().ok_or(Errno::ESRCH)?;
    let parent = {
        let _wait = procs.wait_lock.lock();
        unsafe { *procs.proc(slot).parent_slot() }
    };
    Ok(parent
        .map(|pp| procs.proc(pp).lock().pid)
        .unwrap_or(0) as isize)
}

pub fn sys_getpgrp(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(current_proc().lock().pgid as isize)
}

pub fn sys_getpgid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let pid = args[0] as Pid;
    if pid == 0 {
        return Ok(current_proc().lock().pgid as isize);
    }
    let slot = kernel().procs.find_pid(pid).ok_or(Errno::ESRCH)?;
    Ok(kernel().procs.proc(slot).lock().pgid as isize)
}

pub fn sys_getsid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let pid = args[0] as Pid;
    if pid == 0 {
        return Ok(current_proc().lock().sid as isize);
    }
    let slot = kernel().procs.find_pid(pid).ok_or(Errno::ESRCH)?;
    Ok(kernel().procs.proc(slot).lock().sid as isize)
}

pub fn sys_setpgid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut pid = args[0] as Pid;
    let mut pgid = args[1] as Pid;
    let me = current_proc();
    if pid == 0 {
        pid = me.lock().pid;
    }
    if pgid == 0 {
        pgid = pid;
    }
    if pgid < 0 {
        return Err(Errno::EINVAL);
    }
    let slot = kernel().procs.find_pid(pid).ok_or(Errno::ESRCH)?;
    let target = kernel().procs.proc(slot);
    {
        let mut guard = target.lock();
        // A session leader cannot move to another group.
        if guard.pid == guard.sid {
            return Err(Errno::EPERM);
        }
        guard.pgid = pgid;
    }
    Ok(0)
}

pub fn sys_setsid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let me = current_proc();
    let mut guard = me.lock();
    if guard.pid == guard.pgid {
        // Already a group leader: refuse.
        return Err(Errno::EPERM);
    }
    guard.pgid = guard.pid;
    guard.sid = guard.pid;
    Ok(guard.sid as isize)
}

pub fn sys_getuid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(unsafe { current_proc_data() }.uid as isize)
}

pub fn sys_geteuid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(unsafe { current_proc_data() }.euid as isize)
}

pub fn sys_getgid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(unsafe { current_proc_data() }.gid as isize)
}

pub fn sys_getegid(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    Ok(unsafe { current_proc_data() }.egid as isize)
}

/// setuid(2) with the POSIX real/effective/saved rules.
pub fn sys_setuid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let uid = args[0] as u32;
    let data = unsafe { current_proc_data() };
    if data.euid == 0 {
        data.uid = uid;
        data.euid = uid;
        data.suid = uid;
    } else if uid == data.uid || uid == data.suid {
        data.euid = uid;
    } else {
        return Err(Errno::EPERM);
    }
    Ok(0)
}

pub fn sys_setgid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let gid = args[0] as u32;
    let data = unsafe { current_proc_data() };
    if data.euid == 0 {
        data.gid = gid;
        data.egid = gid;
        data.sgid = gid;
    } else if gid == data.gid || gid == data.sgid {
        data.egid = gid;
    } else {
        return Err(Errno::EPERM);
    }
    Ok(0)
}

pub fn sys_setreuid(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let (ruid, euid) = (args[0] as i32, args[1] as i32);
    let data = unsafe { current_proc_data() };
    let old_uid = data.uid;
    if ruid != -1 {
        if data.euid != 0 && ruid as u32 != data.uid && ruid as u32 != data.euid {
            return Err(Errno::EPERM);
        }
        data.uid = ruid as u32;
    }
    if euid != -1 {
        if data.euid != 0
            && euid as u32 != old_uid
            && euid as u32 != data.euid
            && euid as u32 != data.suid
        {
            return Err(Errno::EPERM);
        }
        data.euid = euid as u32;
    }
    Ok(0)
}

pub fn sys_umask(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let old = data.umask;
    data.umask = args[0] as u32 & 0o777;
    Ok(old as isize)
}

pub fn sys_kill(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let pid = args[0] as Pid;
    let sig = args[1];
    if sig > NSIG {
        return Err(Errno::EINVAL);
    }
    match pid {
        0 => {
            let pgid = current_proc().lock().pgid;
            kill_pgrp(pgid, sig, true)?;
        }
        -1 => return Err(Errno::ESRCH),
        p if p > 0 => kill_pid(p, sig, true)?,
        p => kill_pgrp(-p, sig, true)?,
    }
    Ok(0)
}

pub fn sys_sigaction(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let sig = args[0];
    // User layout: { handler, mask, flags }.
    let new = if args[1] != 0 {
        let handler = get_user_u32(args[1])? as usize;
        let mask = SigSet(get_user_u32(args[1] + 4)?);
        let flags = SigActionFlags::from_bits_truncate(get_user_u32(args[1] + 8)?);
        Some(SigAction {
            handler: match handler {
                0 => SigHandler::Default,
                1 => SigHandler::Ignore,
                h => SigHandler::Handler(h),
            },
            mask,
            flags,
        })
    } else {
        None
    };
    let mut old = SigAction::default_action();
    do_sigaction(sig, new, &mut old)?;
    if args[2] != 0 {
        let raw = match old.handler {
            SigHandler::Default => 0,
            SigHandler::Ignore => 1,
            SigHandler::Handler(h) => h as u32,
        };
        put_user_u32(args[2], raw)?;
        put_user_u32(args[2] + 4, old.mask.0)?;
        put_user_u32(args[2] + 8, old.flags.bits())?;
    }
    Ok(0)
}

pub fn sys_sigprocmask(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let how = args[0] as i32;
    let set = if args[1] != 0 {
        Some(SigSet(get_user_u32(args[1])?))
    } else {
        None
    };
    let mut old = SigSet::empty();
    do_sigprocmask(how, set, &mut old)?;
    if args[2] != 0 {
        put_user_u32(args[2], old.0)?;
    }
    Ok(0)
}

pub fn sys_sigsuspend(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mask = SigSet(args[0] as u32);
    let me = current_proc();
    let old = {
        let mut guard = me.lock();
        let old = guard.sigblocked;
        guard.sigblocked = SigSet(
            mask.0
                & !(SigSet::of(crate::signal::SIGKILL).0
                    | SigSet::of(crate::signal::SIGSTOP).0),
        );
        old
    };
    // Wait for any deliverable signal, then restore the mask; delivery
    // happens on the way back to user mode.
    let mut pause_lock = kernel().select_lock.lock();
    let _ = kernel().pause_wait.sleep_interruptible(&mut pause_lock);
    drop(pause_lock);
    me.lock().sigblocked = old;
    Err(Errno::EINTR)
}

pub fn sys_sigreturn(_args: &SysArgs, sc: &mut SigContext) -> Result<isize> {
    Ok(do_sigreturn(sc))
}

pub fn sys_pause(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    // pause(2) always fails with EINTR once a signal arrives; it is
    // never restarted.
    let mut pause_lock = kernel().select_lock.lock();
    let _ = kernel().pause_wait.sleep_interruptible(&mut pause_lock);
    Err(Errno::EINTR)
}

pub fn sys_alarm(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let old_secs = data.it_real_value as usize / HZ;
    // The timer bottom half raises SIGALRM when this runs out.
    data.it_real_value = (args[0] * HZ) as u32;
    data.it_real_interval = 0;
    Ok(old_secs as isize)
}

/// setitimer(2); values in the caller's itimerval are converted to
/// ticks.
pub fn sys_setitimer(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    const ITIMER_REAL: usize = 0;
    const ITIMER_VIRTUAL: usize = 1;
    const ITIMER_PROF: usize = 2;

    let which = args[0];
    let newp = args[1];
    if newp == 0 {
        return Err(Errno::EFAULT);
    }
    let tv2ticks = |sec: u32, usec: u32| -> u32 {
        sec * HZ as u32 + usec * HZ as u32 / 1_000_000
    };
    let interval = tv2ticks(get_user_u32(newp)?, get_user_u32(newp + 4)?);
    let value = tv2ticks(get_user_u32(newp + 8)?, get_user_u32(newp + 12)?);

    let data = unsafe { current_proc_data() };
    let old = match which {
        ITIMER_REAL => {
            let old = (data.it_real_interval, data.it_real_value);
            data.it_real_interval = interval;
            data.it_real_value = value;
            old
        }
        ITIMER_VIRTUAL => {
            let old = (data.it_virt_interval, data.it_virt_value);
            data.it_virt_interval = interval;
            data.it_virt_value = value;
            old
        }
        ITIMER_PROF => {
            let old = (data.it_prof_interval, data.it_prof_value);
            data.it_prof_interval = interval;
            data.it_prof_value = value;
            old
        }
        _ => return Err(Errno::EINVAL),
    };
    if args[2] != 0 {
        put_user_u32(args[2], old.0 / HZ as u32)?;
        put_user_u32(args[2] + 4, old.0 % HZ as u32 * (1_000_000 / HZ as u32))?;
        put_user_u32(args[2] + 8, old.1 / HZ as u32)?;
        put_user_u32(args[2] + 12, old.1 % HZ as u32 * (1_000_000 / HZ as u32))?;
    }
    Ok(0)
}

fn nanosleep_wakeup(slot: usize) {
    kernel().procs.wakeup_proc(slot);
}

pub fn sys_nanosleep(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let reqp = args[0];
    if reqp == 0 {
        return Err(Errno::EFAULT);
    }
    let sec = get_user_u32(reqp)? as u64;
    let nsec = get_user_u32(reqp + 4)? as u64;
    if nsec >= 1_000_000_000 {
        return Err(Errno::EINVAL);
    }
    let ticks = (sec * HZ as u64 + nsec * HZ as u64 / 1_000_000_000) as u32;
    if ticks == 0 {
        kernel().procs.yield_cpu();
        return Ok(0);
    }

    let slot = kernel().procs.current_slot().ok_or(Errno::ESRCH)?;
    add_callout(nanosleep_wakeup, slot, ticks);
    let mut pause_lock = kernel().select_lock.lock();
    let result = kernel().pause_wait.sleep_timeout(&mut pause_lock, ticks);
    drop(pause_lock);
    let left = kernel()
        .callouts
        .lock()
        .remaining(nanosleep_wakeup, slot)
        .unwrap_or(0) as u64;
    del_callout(nanosleep_wakeup, slot);

    match result {
        Ok(_) => Ok(0),
        Err(_) => {
            // Interrupted: report the unslept remainder and fail with
            // EINTR; nanosleep is never restarted with the full time.
            if args[1] != 0 {
                put_user_u32(args[1], (left / HZ as u64) as u32)?;
                put_user_u32(
                    args[1] + 4,
                    (left % HZ as u64 * (1_000_000_000 / HZ as u64)) as u32,
                )?;
            }
            Err(Errno::EINTR)
        }
    }
}

pub fn sys_brk(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let new = args[0];
    let current_end = data
        .memory
        .vmas
        .iter()
        .find(|v| v.typ == VmaType::Heap)
        .map(|v| v.end)
        .ok_or(Errno::ENOMEM)?;
    if new == 0 {
        return Ok(current_end as isize);
    }
    if new < current_end {
        // Shrinking releases the tail pages.
        let piece = crate::vm::Vma {
            start: new,
            end: current_end,
            prot: PROT_READ | PROT_WRITE,
            flags: 0,
            typ: VmaType::Heap,
            inode: None,
            offset: 0,
            o_mode: 0,
        };
        data.memory.free_vma_pages(&piece, new, current_end - new);
    }
    data.memory.vmas.expand_heap(new).map(|end| end as isize)
}

pub fn sys_mmap(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    // Old-style mmap: one pointer to the six-argument block.
    let argp = args[0];
    verify_address(PROT_READ, argp, 24)?;
    let addr = get_user_u32(argp)? as usize;
    let length = get_user_u32(argp + 4)? as usize;
    let prot = get_user_u32(argp + 8)?;
    let flags = get_user_u32(argp + 12)?;
    let fd = get_user_u32(argp + 16)? as i32;
    let offset = get_user_u32(argp + 20)?;

    let data = unsafe { current_proc_data() };
    let (inode, o_mode): (Option<InodeRef>, u32) = if flags & MAP_ANONYMOUS != 0 {
        (None, 0)
    } else {
        let entry = fd_lookup(data, fd)?;
        kernel()
            .ftable
            .with(entry.file, |f| (f.inode, f.flags))
    };

    do_mmap(
        &mut data.memory,
        inode,
        addr,
        length,
        prot,
        flags,
        offset,
        VmaType::Mmap,
        o_mode,
    )
    .map(|a| a as isize)
}

pub fn sys_munmap(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    do_munmap(&mut data.memory, args[0], args[1]).map(|_| 0)
}

pub fn sys_mprotect(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    do_mprotect(&mut data.memory, args[0], args[1], args[2] as u32).map(|_| 0)
}
