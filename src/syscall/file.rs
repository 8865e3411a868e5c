//! File-descriptor system calls: mostly argument checking, then calls
//! into the VFS.

use crate::{
    arch::x86::SigContext,
    dev::{BLK_DEV, CHR_DEV},
    errno::{Errno, Result},
    file::{
        fd_alloc, fd_lookup, readable, writable, OpenFile, O_ACCMODE, O_CREAT, O_EXCL, O_TRUNC,
    },
    fs::{
        check_permission, namei, namei_parent, stat, FileOps, InodeRef, PermMask, SelectEvent,
        Stat, SELECT_WAIT,
    },
    kernel::kernel,
    param::{HZ, MAXPATH, NOFILE},
    proc::current_proc_data,
    syscall::{
        close_file, get_user_path, get_user_u32, put_user_bytes, put_user_u32, verify_address,
        SysArgs,
    },
    vm::{PROT_READ, PROT_WRITE},
};

/// Resolve the file operations for an inode: device nodes dispatch
/// through the registry, everything else through its filesystem.
fn fops_for(ino: InodeRef) -> Result<&'static dyn FileOps> {
    let (mode, rdev, ops) = kernel().itable.with(ino, |i| (i.mode, i.rdev, i.ops));
    if stat::s_ischr(mode) {
        return kernel()
            .devices
            .get(CHR_DEV, rdev)
            .map(|d| d.fops)
            .ok_or(Errno::ENXIO);
    }
    if stat::s_isblk(mode) {
        return kernel()
            .devices
            .get(BLK_DEV, rdev)
            .map(|d| d.fops)
            .ok_or(Errno::ENXIO);
    }
    ops.map(|o| o.fops).ok_or(Errno::ENOENT)
}

/// The open(2) body.
pub fn do_open(path: &[u8], flags: u32, mode: u32) -> Result<i32> {
    let itable = &kernel().itable;

    let ino = if flags & O_CREAT != 0 {
        let (parent, name) = namei_parent(path)?;
        let prepared = check_permission(PermMask::WRITE, parent)
            .and_then(|_| itable.with(parent, |i| i.ops).ok_or(Errno::ENOENT))
            .and_then(|ops| {
                itable
                    .with(parent, |i| i.sb)
                    .ok_or(Errno::ENOENT)
                    .map(|sb| (ops, sb))
            });
        let result = match prepared {
            Err(e) => Err(e),
            Ok((ops, sb)) => {
                itable.lock_inode(parent);
                let existing = ops.iops.lookup(parent, name);
                match existing {
                    Ok(inum) => {
                        itable.unlock_inode(parent);
                        if flags & O_EXCL != 0 {
                            Err(Errno::EEXIST)
                        } else {
                            itable.iget(sb, inum)
                        }
                    }
                    Err(Errno::ENOENT) => {
                        let umask = unsafe { current_proc_data() }.umask;
                        let created = ops
                            .iops
                            .create(parent, name, (mode & !umask) | stat::S_IFREG);
                        itable.unlock_inode(parent);
                        created.and_then(|inum| itable.iget(sb, inum))
                    }
                    Err(e) => {
                        itable.unlock_inode(parent);
                        Err(e)
                    }
                }
            }
        };
        itable.iput(parent);
        result?
    } else {
        namei(path, true)?
    };

    let ino_mode = itable.with(ino, |i| i.mode);
    let mut perm = PermMask::empty();
    if readable(flags) {
        perm |= PermMask::READ;
    }
    if writable(flags) {
        perm |= PermMask::WRITE;
    }
    if let Err(e) = check_permission(perm, ino) {
        itable.iput(ino);
        return Err(e);
    }
    if stat::s_isdir(ino_mode) && writable(flags) {
        itable.iput(ino);
        return Err(Errno::EISDIR);
    }

    let fops = match fops_for(ino) {
        Ok(f) => f,
        Err(e) => {
            itable.iput(ino);
            return Err(e);
        }
    };

    if flags & O_TRUNC != 0 && writable(flags) {
        if let Some(ops) = itable.with(ino, |i| i.ops) {
            itable.lock_inode(ino);
            let _ = ops.iops.truncate(ino, 0);
            itable.unlock_inode(ino);
        }
    }

    let idx = {
        let mut ftable = kernel().ftable.inner.lock();
        ftable.alloc(Some(ino), flags & !(O_CREAT | O_EXCL | O_TRUNC), fops)
    };
    let idx = match idx {
        Ok(idx) => idx,
        Err(e) => {
            itable.iput(ino);
            return Err(e);
        }
    };

    // The driver sees the open and may refuse it.
    let open_res = kernel().ftable.with(idx, |f| {
        let mut tmp = OpenFile {
            inode: f.inode,
            flags: f.flags,
            offset: f.offset,
            count: f.count,
            fops,
        };
        let r = fops.open(ino, &mut tmp);
        f.offset = tmp.offset;
        r
    });
    if let Err(e) = open_res {
        close_file(idx);
        return Err(e);
    }

    let data = unsafe { current_proc_data() };
    match fd_alloc(data, idx, 0) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            close_file(idx);
            Err(e)
        }
    }
}

/// Snapshot an open file's dispatch state.
fn file_state(idx: u16) -> (Option<InodeRef>, u32, u64, &'static dyn FileOps) {
    kernel()
        .ftable
        .with(idx, |f| (f.inode, f.flags, f.offset, f.fops))
}

pub fn do_read(fd: i32, addr: usize, count: usize) -> Result<usize> {
    verify_address(PROT_WRITE, addr, count)?;
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, fd)?;
    let (inode, flags, offset, fops) = file_state(entry.file);
    if !readable(flags) {
        return Err(Errno::EINVAL);
    }
    let ino = inode.ok_or(Errno::EINVAL)?;

    let buf = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, count) };
    let mut tmp = OpenFile {
        inode,
        flags,
        offset,
        count: 1,
        fops,
    };
    let n = fops.read(ino, &mut tmp, buf)?;
    kernel().ftable.with(entry.file, |f| {
        // Drivers that track their own position update the description;
        // plain files advance by the bytes read.
        f.offset = if tmp.offset != offset {
            tmp.offset
        } else {
            offset + n as u64
        };
    });
    Ok(n)
}

pub fn do_write(fd: i32, addr: usize, count: usize) -> Result<usize> {
    verify_address(PROT_READ, addr, count)?;
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, fd)?;
    let (inode, flags, offset, fops) = file_state(entry.file);
    if !writable(flags) {
        return Err(Errno::EINVAL);
    }
    let ino = inode.ok_or(Errno::EINVAL)?;

    let buf = unsafe { core::slice::from_raw_parts(addr as *const u8, count) };
    let mut tmp = OpenFile {
        inode,
        flags,
        offset,
        count: 1,
        fops,
    };
    let n = fops.write(ino, &mut tmp, buf)?;
    kernel().ftable.with(entry.file, |f| {
        f.offset = if tmp.offset != offset {
            tmp.offset
        } else {
            offset + n as u64
        };
    });
    Ok(n)
}

pub fn sys_read(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    do_read(args[0] as i32, args[1], args[2]).map(|n| n as isize)
}

pub fn sys_write(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    do_write(args[0] as i32, args[1], args[2]).map(|n| n as isize)
}

pub fn sys_open(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    do_open(path, args[1] as u32, args[2] as u32).map(|fd| fd as isize)
}

pub fn sys_close(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let fd = args[0] as i32;
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, fd)?;
    data.fd_table[fd as usize] = None;
    close_file(entry.file);
    Ok(0)
}

pub fn sys_lseek(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, args[0] as i32)?;
    let (inode, _flags, offset, fops) = file_state(entry.file);
    let ino = inode.ok_or(Errno::ESPIPE)?;
    let size = kernel().itable.with(ino, |i| i.size);

    let pos = args[1] as i32 as i64;
    let new = match args[2] as i32 {
        crate::fs::SEEK_SET => pos,
        crate::fs::SEEK_CUR => offset as i64 + pos,
        crate::fs::SEEK_END => size as i64 + pos,
        _ => return Err(Errno::EINVAL),
    };
    if new < 0 {
        return Err(Errno::EINVAL);
    }
    // Pipes and other unseekable files refuse here.
    let new = fops.llseek(ino, new)?;
    kernel().ftable.with(entry.file, |f| f.offset = new as u64);
    Ok(new as isize)
}

pub fn sys_dup(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, args[0] as i32)?;
    kernel().ftable.inner.lock().dup(entry.file);
    match fd_alloc(data, entry.file, 0) {
        Ok(fd) => Ok(fd as isize),
        Err(e) => {
            close_file(entry.file);
            Err(e)
        }
    }
}

pub fn sys_dup2(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let (oldfd, newfd) = (args[0] as i32, args[1] as i32);
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, oldfd)?;
    if newfd < 0 || newfd as usize >= NOFILE {
        return Err(Errno::EINVAL);
    }
    if oldfd == newfd {
        return Ok(newfd as isize);
    }
    if let Some(old) = data.fd_table[newfd as usize].take() {
        close_file(old.file);
    }
    kernel().ftable.inner.lock().dup(entry.file);
    data.fd_table[newfd as usize] = Some(crate::file::Fd {
        file: entry.file,
        cloexec: false,
    });
    Ok(newfd as isize)
}

pub fn sys_pipe(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    verify_address(PROT_WRITE, args[0], 8)?;
    let (fd0, fd1) = crate::pipe::do_pipe()?;
    put_user_u32(args[0], fd0 as u32)?;
    put_user_u32(args[0] + 4, fd1 as u32)?;
    Ok(0)
}

pub fn sys_ioctl(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, args[0] as i32)?;
    let (inode, _flags, _offset, fops) = file_state(entry.file);
    let ino = inode.ok_or(Errno::ENOTTY)?;
    fops.ioctl(ino, args[1] as u32, args[2]).map(|n| n as isize)
}

/// fcntl commands.
const F_DUPFD: u32 = 0;
const F_GETFD: u32 = 1;
const F_SETFD: u32 = 2;
const F_GETFL: u32 = 3;
const F_SETFL: u32 = 4;
const FD_CLOEXEC: u32 = 1;

pub fn sys_fcntl(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let fd = args[0] as i32;
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, fd)?;
    match args[1] as u32 {
        F_DUPFD => {
            kernel().ftable.inner.lock().dup(entry.file);
            match fd_alloc(data, entry.file, args[2]) {
                Ok(fd) => Ok(fd as isize),
                Err(e) => {
                    close_file(entry.file);
                    Err(e)
                }
            }
        }
        F_GETFD => Ok(if entry.cloexec { FD_CLOEXEC as isize } else { 0 }),
        F_SETFD => {
            if let Some(f) = data.fd_table[fd as usize].as_mut() {
                f.cloexec = args[2] as u32 & FD_CLOEXEC != 0;
            }
            Ok(0)
        }
        F_GETFL => Ok(kernel().ftable.with(entry.file, |f| f.flags) as isize),
        F_SETFL => {
            let keep = O_ACCMODE;
            kernel().ftable.with(entry.file, |f| {
                f.flags = (f.flags & keep) | (args[2] as u32 & !keep);
            });
            Ok(0)
        }
        _ => Err(Errno::EINVAL),
    }
}

fn stat_of(ino: InodeRef) -> Stat {
    kernel().itable.with(ino, |i| Stat {
        st_dev: i.dev as u16,
        st_ino: i.inum,
        st_mode: i.mode as u16,
        st_nlink: i.nlink,
        st_uid: i.uid as u16,
        st_gid: i.gid as u16,
        st_rdev: i.rdev as u16,
        st_size: i.size as u32,
        st_blksize: 1024,
        st_blocks: i.blocks,
        st_atime: i.atime,
        st_mtime: i.mtime,
        st_ctime: i.ctime,
    })
}

pub fn sys_stat(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let ino = namei(path, true)?;
    let st = stat_of(ino);
    kernel().itable.iput(ino);
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &st as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    put_user_bytes(args[1], bytes)?;
    Ok(0)
}

pub fn sys_fstat(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, args[0] as i32)?;
    let (inode, ..) = file_state(entry.file);
    let ino = inode.ok_or(Errno::EINVAL)?;
    let st = stat_of(ino);
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &st as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    put_user_bytes(args[1], bytes)?;
    Ok(0)
}

pub fn sys_getdents(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    verify_address(PROT_WRITE, args[1], args[2])?;
    let data = unsafe { current_proc_data() };
    let entry = fd_lookup(data, args[0] as i32)?;
    let (inode, flags, offset, fops) = file_state(entry.file);
    let ino = inode.ok_or(Errno::EINVAL)?;
    let mode = kernel().itable.with(ino, |i| i.mode);
    if !stat::s_isdir(mode) {
        return Err(Errno::ENOTDIR);
    }
    let buf = unsafe { core::slice::from_raw_parts_mut(args[1] as *mut u8, args[2]) };
    let mut tmp = OpenFile {
        inode,
        flags,
        offset,
        count: 1,
        fops,
    };
    let n = fops.readdir(ino, &mut tmp, buf)?;
    kernel().ftable.with(entry.file, |f| f.offset = tmp.offset);
    Ok(n as isize)
}

pub fn sys_chdir(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let ino = namei(path, true)?;
    let mode = kernel().itable.with(ino, |i| i.mode);
    if !stat::s_isdir(mode) {
        kernel().itable.iput(ino);
        return Err(Errno::ENOTDIR);
    }
    if let Err(e) = check_permission(PermMask::EXEC, ino) {
        kernel().itable.iput(ino);
        return Err(e);
    }
    let data = unsafe { current_proc_data() };
    if let Some(old) = data.cwd.replace(ino) {
        kernel().itable.iput(old);
    }
    Ok(0)
}

/// Shared parent-directory preamble for the namespace-changing calls.
fn parent_for_write<'a>(path: &'a [u8]) -> Result<(InodeRef, &'a crate::fs::FileName)> {
    let (parent, name) = namei_parent(path)?;
    if let Err(e) = check_permission(PermMask::WRITE | PermMask::EXEC, parent) {
        kernel().itable.iput(parent);
        return Err(e);
    }
    Ok((parent, name))
}

pub fn sys_mkdir(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let (parent, name) = parent_for_write(path)?;
    let ops = kernel().itable.with(parent, |i| i.ops).ok_or(Errno::ENOENT);
    let result = ops.and_then(|ops| {
        let umask = unsafe { current_proc_data() }.umask;
        kernel().itable.lock_inode(parent);
        let r = ops
            .iops
            .mkdir(parent, name, (args[1] as u32 & !umask) | stat::S_IFDIR);
        kernel().itable.unlock_inode(parent);
        r
    });
    kernel().itable.iput(parent);
    result.map(|_| 0)
}

pub fn sys_rmdir(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let (parent, name) = parent_for_write(path)?;
    let ops = kernel().itable.with(parent, |i| i.ops).ok_or(Errno::ENOENT);
    let result = ops.and_then(|ops| {
        kernel().itable.lock_inode(parent);
        let r = ops.iops.rmdir(parent, name);
        kernel().itable.unlock_inode(parent);
        r
    });
    kernel().itable.iput(parent);
    result.map(|_| 0)
}

pub fn sys_unlink(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let (parent, name) = parent_for_write(path)?;
    let ops = kernel().itable.with(parent, |i| i.ops).ok_or(Errno::ENOENT);
    let result = ops.and_then(|ops| {
        kernel().itable.lock_inode(parent);
        let r = ops.iops.unlink(parent, name);
        kernel().itable.unlock_inode(parent);
        r
    });
    kernel().itable.iput(parent);
    result.map(|_| 0)
}

pub fn sys_link(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old_path = get_user_path(args[0], &mut old_buf)?;
    let new_path = get_user_path(args[1], &mut new_buf)?;

    let old = namei(old_path, false)?;
    let old_mode = kernel().itable.with(old, |i| i.mode);
    if stat::s_isdir(old_mode) {
        kernel().itable.iput(old);
        return Err(Errno::EISDIR);
    }
    let (parent, name) = match parent_for_write(new_path) {
        Ok(p) => p,
        Err(e) => {
            kernel().itable.iput(old);
            return Err(e);
        }
    };
    // Hard links cannot cross filesystems.
    let same_dev = kernel().itable.with(old, |i| i.dev)
        == kernel().itable.with(parent, |i| i.dev);
    let result = if !same_dev {
        Err(Errno::EINVAL)
    } else {
        kernel()
            .itable
            .with(parent, |i| i.ops)
            .ok_or(Errno::ENOENT)
            .and_then(|ops| {
                kernel().itable.lock_inode(parent);
                let r = ops.iops.link(old, parent, name);
                kernel().itable.unlock_inode(parent);
                r
            })
    };
    kernel().itable.iput(parent);
    kernel().itable.iput(old);
    result.map(|_| 0)
}

pub fn sys_symlink(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut target_buf = [0u8; MAXPATH];
    let mut link_buf = [0u8; MAXPATH];
    let target = get_user_path(args[0], &mut target_buf)?;
    let link_path = get_user_path(args[1], &mut link_buf)?;
    let (parent, name) = parent_for_write(link_path)?;
    let result = kernel()
        .itable
        .with(parent, |i| i.ops)
        .ok_or(Errno::ENOENT)
        .and_then(|ops| {
            kernel().itable.lock_inode(parent);
            let r = ops.iops.symlink(parent, name, target);
            kernel().itable.unlock_inode(parent);
            r
        });
    kernel().itable.iput(parent);
    result.map(|_| 0)
}

pub fn sys_readlink(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    verify_address(PROT_WRITE, args[1], args[2])?;
    let ino = namei(path, false)?;
    let mode = kernel().itable.with(ino, |i| i.mode);
    if !stat::s_islnk(mode) {
        kernel().itable.iput(ino);
        return Err(Errno::EINVAL);
    }
    let mut target = [0u8; MAXPATH];
    let result = kernel()
        .itable
        .with(ino, |i| i.ops)
        .ok_or(Errno::EINVAL)
        .and_then(|ops| ops.iops.readlink(ino, &mut target));
    kernel().itable.iput(ino);
    let n = result?;
    let n = core::cmp::min(n, args[2]);
    put_user_bytes(args[1], &target[..n])?;
    Ok(n as isize)
}

pub fn sys_rename(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old_path = get_user_path(args[0], &mut old_buf)?;
    let new_path = get_user_path(args[1], &mut new_buf)?;
    let (old_parent, old_name) = parent_for_write(old_path)?;
    let (new_parent, new_name) = match parent_for_write(new_path) {
        Ok(p) => p,
        Err(e) => {
            kernel().itable.iput(old_parent);
            return Err(e);
        }
    };
    let result = kernel()
        .itable
        .with(old_parent, |i| i.ops)
        .ok_or(Errno::ENOENT)
        .and_then(|ops| {
            kernel().itable.lock_inode(old_parent);
            let r = ops.iops.rename(old_parent, old_name, new_parent, new_name);
            kernel().itable.unlock_inode(old_parent);
            r
        });
    kernel().itable.iput(new_parent);
    kernel().itable.iput(old_parent);
    result.map(|_| 0)
}

pub fn sys_mknod(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    if data.euid != 0 {
        return Err(Errno::EPERM);
    }
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let (parent, name) = parent_for_write(path)?;
    let result = kernel()
        .itable
        .with(parent, |i| i.ops)
        .ok_or(Errno::ENOENT)
        .and_then(|ops| {
            kernel().itable.lock_inode(parent);
            let r = ops
                .iops
                .mknod(parent, name, args[1] as u32, args[2] as u32);
            kernel().itable.unlock_inode(parent);
            r
        });
    kernel().itable.iput(parent);
    result.map(|_| 0)
}

pub fn sys_chmod(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let ino = namei(path, true)?;
    let data = unsafe { current_proc_data() };
    let owner = kernel().itable.with(ino, |i| i.uid);
    if data.euid != 0 && data.euid != owner {
        kernel().itable.iput(ino);
        return Err(Errno::EPERM);
    }
    kernel().itable.with(ino, |i| {
        i.mode = (i.mode & stat::S_IFMT) | (args[1] as u32 & 0o7777);
        i.state.insert(crate::fs::inode::InodeState::DIRTY);
    });
    kernel().itable.iput(ino);
    Ok(0)
}

pub fn sys_chown(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let ino = namei(path, true)?;
    let data = unsafe { current_proc_data() };
    if data.euid != 0 {
        kernel().itable.iput(ino);
        return Err(Errno::EPERM);
    }
    kernel().itable.with(ino, |i| {
        if args[1] as i32 != -1 {
            i.uid = args[1] as u32;
        }
        if args[2] as i32 != -1 {
            i.gid = args[2] as u32;
        }
        // Changing ownership clears the set-id bits.
        i.mode &= !(stat::S_ISUID | stat::S_ISGID);
        i.state.insert(crate::fs::inode::InodeState::DIRTY);
    });
    kernel().itable.iput(ino);
    Ok(0)
}

pub fn sys_truncate(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;
    let ino = namei(path, true)?;
    let result = check_permission(PermMask::WRITE, ino).and_then(|_| {
        kernel()
            .itable
            .with(ino, |i| i.ops)
            .ok_or(Errno::EINVAL)
            .and_then(|ops| {
                kernel().itable.lock_inode(ino);
                let r = ops.iops.truncate(ino, args[1] as u64);
                kernel().itable.unlock_inode(ino);
                r
            })
    });
    kernel().itable.iput(ino);
    result.map(|_| 0)
}

pub fn sys_access(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;

    // access(2) checks with the real ids.
    let p = crate::proc::current_proc();
    p.lock().flags.insert(crate::proc::ProcFlags::USEREAL);
    let result = namei(path, true).and_then(|ino| {
        let r = check_permission(
            PermMask::from_bits_truncate(args[1] as u32 & 0o7),
            ino,
        );
        kernel().itable.iput(ino);
        r
    });
    p.lock().flags.remove(crate::proc::ProcFlags::USEREAL);
    result.map(|_| 0)
}

pub fn sys_sync(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    kernel().itable.sync_inodes(0);
    kernel().supers.sync_superblocks(0);
    crate::bio::sync_buffers(0);
    Ok(0)
}

pub fn sys_mount(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    if data.euid != 0 {
        return Err(Errno::EPERM);
    }
    let mut dev_buf = [0u8; MAXPATH];
    let mut dir_buf = [0u8; MAXPATH];
    let mut type_buf = [0u8; MAXPATH];
    let dev_path = get_user_path(args[0], &mut dev_buf)?;
    let dir_path = get_user_path(args[1], &mut dir_buf)?;
    let fstype = get_user_path(args[2], &mut type_buf)?;
    let fstype = core::str::from_utf8(fstype).map_err(|_| Errno::EINVAL)?;

    // Resolve the device node to its device number.
    let dev_ino = namei(dev_path, true)?;
    let (mode, rdev) = kernel().itable.with(dev_ino, |i| (i.mode, i.rdev));
    kernel().itable.iput(dev_ino);
    if !stat::s_isblk(mode) {
        return Err(Errno::ENOTDIR);
    }

    let flags = crate::fs::MountFlags::from_bits_truncate(args[3] as u32);
    crate::fs::superblock::mount_fs(rdev, dir_path, fstype, flags)?;
    Ok(0)
}

pub fn sys_umount(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let data = unsafe { current_proc_data() };
    if data.euid != 0 {
        return Err(Errno::EPERM);
    }
    let mut buf = [0u8; MAXPATH];
    let path = get_user_path(args[0], &mut buf)?;

    // Accept either the device node or the mount directory.
    let ino = namei(path, true)?;
    let (mode, rdev, sb, dev) =
        kernel().itable.with(ino, |i| (i.mode, i.rdev, i.sb, i.dev));
    kernel().itable.iput(ino);
    let dev = if stat::s_isblk(mode) {
        rdev
    } else {
        let sb = sb.ok_or(Errno::EINVAL)?;
        let root = kernel().supers.root_of(sb);
        if root != Some(ino) {
            return Err(Errno::EINVAL);
        }
        dev
    };
    crate::fs::superblock::umount_fs(dev)?;
    Ok(0)
}

/// select(2): two passes over the descriptor sets. If nothing is ready
/// on the first pass, sleep on the global select channel (woken by any
/// driver that changes readiness) or until the timeout callout fires.
pub fn sys_select(args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    let nfds = core::cmp::min(args[0], NOFILE);
    let sets = [args[1], args[2], args[3]];
    let timeout_addr = args[4];

    // A null timeout blocks indefinitely; {0,0} polls once.
    let timeout_ticks = if timeout_addr == 0 {
        None
    } else {
        let sec = get_user_u32(timeout_addr)? as u64;
        let usec = get_user_u32(timeout_addr + 4)? as u64;
        Some((sec * HZ as u64 + usec * HZ as u64 / 1_000_000) as u32)
    };

    let events = [SelectEvent::Read, SelectEvent::Write, SelectEvent::Except];
    loop {
        let mut out = [0u32; 3];
        let mut ready = 0;
        let data = unsafe { current_proc_data() };
        for (set_idx, &set_addr) in sets.iter().enumerate() {
            if set_addr == 0 {
                continue;
            }
            let requested = get_user_u32(set_addr)?;
            for fd in 0..nfds {
                if requested & (1 << fd) == 0 {
                    continue;
                }
                let entry = fd_lookup(data, fd as i32)?;
                let (inode, _flags, _offset, fops) = file_state(entry.file);
                let ino = inode.ok_or(Errno::EINVAL)?;
                if fops.select(ino, events[set_idx])? {
                    out[set_idx] |= 1 << fd;
                    ready += 1;
                }
            }
        }

        if ready > 0 || timeout_ticks == Some(0) {
            for (set_idx, &set_addr) in sets.iter().enumerate() {
                if set_addr != 0 {
                    put_user_u32(set_addr, out[set_idx])?;
                }
            }
            return Ok(ready);
        }

        // Nothing ready: wait for a readiness change or the timeout.
        let mut guard = kernel().select_lock.lock();
        match timeout_ticks {
            Some(t) => {
                let remaining = SELECT_WAIT.sleep_timeout(&mut guard, t)?;
                if remaining == 0 {
                    drop(guard);
                    for &set_addr in sets.iter() {
                        if set_addr != 0 {
                            put_user_u32(set_addr, 0)?;
                        }
                    }
                    return Ok(0);
                }
            }
            None => SELECT_WAIT.sleep_interruptible(&mut guard)?,
        }
    }
}

pub fn sys_socketcall(_args: &SysArgs, _sc: &mut SigContext) -> Result<isize> {
    // The Unix-domain socket family plugs in here; without it the
    // whole multiplexer is unsupported.
    Err(Errno::ENOSYS)
}
