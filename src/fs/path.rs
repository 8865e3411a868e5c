//! Path walking and permission checks.

use bitflags::bitflags;

use crate::{
    errno::{Errno, Result},
    fs::{stat, InodeRef},
    kernel::kernel,
    param::{MAXPATH, MAXSYMLINKS, NAME_MAX},
    proc::myproc,
};

bitflags! {
    /// rwx mask bits, as in the low mode bits.
    pub struct PermMask: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// One path component: nonempty, no slashes, bounded length.
#[derive(PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct FileName([u8]);

impl FileName {
    pub fn new(bytes: &[u8]) -> Result<&Self> {
        if bytes.is_empty() {
            return Err(Errno::ENOENT);
        }
        if bytes.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        if bytes.iter().any(|b| *b == b'/' || *b == 0) {
            return Err(Errno::EINVAL);
        }
        // SAFETY: FileName is repr(transparent) over [u8].
        Ok(unsafe { &*(bytes as *const [u8] as *const FileName) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_dot(&self) -> bool {
        &self.0 == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        &self.0 == b".."
    }
}

/// Iterator over the components of a byte path.
pub struct Components<'a> {
    rest: &'a [u8],
}

impl<'a> Components<'a> {
    pub fn new(path: &'a [u8]) -> Self {
        Self { rest: path }
    }
}

impl<'a> Iterator for Components<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&b'/') = self.rest.first() {
            self.rest = &self.rest[1..];
        }
        if self.rest.is_empty() {
            return None;
        }
        let end = self
            .rest
            .iter()
            .position(|b| *b == b'/')
            .unwrap_or(self.rest.len());
        let (item, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(item)
    }
}

/// The pure mode check: does a caller with these credentials satisfy
/// `mask` against `(mode, uid, gid)`? `in_group` covers supplementary
/// groups. Superuser passes everything except execute, which wants at
/// least one x bit somewhere.
pub fn perm_ok(
    mask: PermMask,
    mode: u32,
    owner: u32,
    group_matches: bool,
    uid: u32,
    superuser: bool,
) -> bool {
    if superuser {
        if mask.contains(PermMask::EXEC) {
            return mode & 0o111 != 0;
        }
        return true;
    }
    let shift = if uid == owner {
        6
    } else if group_matches {
        3
    } else {
        0
    };
    (mode >> shift) & mask.bits() == mask.bits()
}

/// Permission check against the current process's credentials.
/// `access(2)` sets the use-real flag so the real ids are consulted.
pub fn check_permission(mask: PermMask, ino: InodeRef) -> Result<()> {
    let (mode, owner, group) = kernel().itable.with(ino, |i| (i.mode, i.uid, i.gid));

    let p = myproc();
    if p.is_null() {
        // Boot-time path walks (mounting root, spawning init) are
        // trusted.
        return Ok(());
    }
    let use_real = {
        let guard = unsafe { (*p).lock() };
        guard.flags.contains(crate::proc::ProcFlags::USEREAL)
    };
    let data = unsafe { &*(*p).data.get() };
    let (uid, euid) = (data.uid, data.euid);
    let acting_uid = if use_real { uid } else { euid };
    let group_matches = data.in_group_as(group, use_real);

    if perm_ok(mask, mode, owner, group_matches, acting_uid, euid == 0) {
        Ok(())
    } else {
        Err(Errno::EACCES)
    }
}

fn process_base(path: &[u8]) -> InodeRef {
    let p = myproc();
    let (root, cwd) = if p.is_null() {
        (None, None)
    } else {
        let data = unsafe { &*(*p).data.get() };
        (data.root, data.cwd)
    };
    let fallback = kernel().root_inode();
    let base = if path.first() == Some(&b'/') {
        root.unwrap_or(fallback)
    } else {
        cwd.or(root).unwrap_or(fallback)
    };
    kernel().itable.idup(base)
}

/// Walk `path` and return the final inode with a reference.
/// Symlinks in the middle are always followed; the last component only
/// when `follow` is set.
pub fn namei(path: &[u8], follow: bool) -> Result<InodeRef> {
    namei_depth(path, follow, 0)
}

/// Walk to the parent of the last component; returns the referenced
/// parent directory and the trailing name.
pub fn namei_parent<'a>(path: &'a [u8]) -> Result<(InodeRef, &'a FileName)> {
    if path.len() > MAXPATH {
        return Err(Errno::ENAMETOOLONG);
    }
    let trimmed = trim_trailing_slashes(path);
    let split = trimmed
        .iter()
        .rposition(|b| *b == b'/')
        .map(|i| (&trimmed[..i], &trimmed[i + 1..]))
        .unwrap_or((b"" as &[u8], trimmed));
    let (dir_part, last) = split;
    let name = FileName::new(last)?;
    let parent = if dir_part.is_empty() {
        if path.first() == Some(&b'/') {
            namei_depth(b"/", true, 0)?
        } else {
            let base = process_base(b".");
            base
        }
    } else {
        namei_depth(dir_part, true, 0)?
    };
    let mode = kernel().itable.with(parent, |i| i.mode);
    if !stat::s_isdir(mode) {
        kernel().itable.iput(parent);
        return Err(Errno::ENOTDIR);
    }
    Ok((parent, name))
}

fn trim_trailing_slashes(path: &[u8]) -> &[u8] {
    let mut end = path.len();
    while end > 1 && path[end - 1] == b'/' {
        end -= 1;
    }
    &path[..end]
}

fn namei_depth(path: &[u8], follow: bool, depth: usize) -> Result<InodeRef> {
    if depth > MAXSYMLINKS {
        return Err(Errno::ELOOP);
    }
    if path.len() > MAXPATH {
        return Err(Errno::ENAMETOOLONG);
    }

    let itable = &kernel().itable;
    let mut dir = process_base(path);
    let mut components = Components::new(path).peekable();

    while let Some(raw) = components.next() {
        let last = components.peek().is_none();
        let name = match FileName::new(raw) {
            Ok(n) => n,
            Err(e) => {
                itable.iput(dir);
                return Err(e);
            }
        };

        let mode = itable.with(dir, |i| i.mode);
        if !stat::s_isdir(mode) {
            itable.iput(dir);
            return Err(Errno::ENOTDIR);
        }
        if let Err(e) = check_permission(PermMask::EXEC, dir) {
            itable.iput(dir);
            return Err(e);
        }

        if name.is_dot() {
            continue;
        }

        // `..` at the root of a mounted tree steps over to the covered
        // directory first, so the lookup observes the outer filesystem.
        let lookup_dir = if name.is_dotdot() {
            match crossing_up(dir) {
                Some(covered) => {
                    let covered = itable.idup(covered);
                    itable.iput(dir);
                    covered
                }
                None => dir,
            }
        } else {
            dir
        };
        dir = lookup_dir;

        let ops = match itable.with(dir, |i| i.ops) {
            Some(ops) => ops,
            None => {
                itable.iput(dir);
                return Err(Errno::ENOENT);
            }
        };
        let sb = itable.with(dir, |i| i.sb).ok_or(Errno::ENOENT);
        let sb = match sb {
            Ok(sb) => sb,
            Err(e) => {
                itable.iput(dir);
                return Err(e);
            }
        };

        itable.lock_inode(dir);
        let inum = ops.iops.lookup(dir, name);
        itable.unlock_inode(dir);
        let inum = match inum {
            Ok(inum) => inum,
            Err(e) => {
                itable.iput(dir);
                return Err(e);
            }
        };

        let next = match itable.iget(sb, inum) {
            Ok(ino) => ino,
            Err(e) => {
                itable.iput(dir);
                return Err(e);
            }
        };

        // Resolve symlinks, restarting from the target with the rest of
        // the path appended. The scratch buffers come from the frame
        // allocator: two path-sized buffers per recursion level would
        // not fit on a one-page kernel stack.
        let next_mode = itable.with(next, |i| i.mode);
        if stat::s_islnk(next_mode) && (!last || follow) {
            let scratch = match NameScratch::alloc() {
                Ok(s) => s,
                Err(e) => {
                    itable.iput(next);
                    itable.iput(dir);
                    return Err(e);
                }
            };
            let (target, buf) = scratch.buffers();

            let link_ops = itable.with(next, |i| i.ops);
            let n = match link_ops {
                Some(link_ops) => {
                    itable.lock_inode(next);
                    let res = link_ops.iops.readlink(next, target);
                    itable.unlock_inode(next);
                    res
                }
                None => Err(Errno::EINVAL),
            };
            itable.iput(next);
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    itable.iput(dir);
                    scratch.free();
                    return Err(e);
                }
            };
            let joined = match join_rest(buf, &target[..n], components) {
                Ok(j) => j,
                Err(e) => {
                    itable.iput(dir);
                    scratch.free();
                    return Err(e);
                }
            };
            let absolute = target.first() == Some(&b'/');
            let result = if absolute {
                itable.iput(dir);
                namei_depth(&buf[..joined], follow, depth + 1)
            } else {
                namei_from(dir, &buf[..joined], follow, depth + 1)
            };
            scratch.free();
            return result;
        }

        itable.iput(dir);
        dir = next;
    }

    Ok(dir)
}

/// Append the unconsumed components to a symlink target.
fn join_rest(
    buf: &mut [u8; MAXPATH],
    target: &[u8],
    mut rest: core::iter::Peekable<Components<'_>>,
) -> Result<usize> {
    let mut len = 0;
    let mut push = |buf: &mut [u8; MAXPATH], bytes: &[u8], len: &mut usize| -> Result<()> {
        if *len + bytes.len() > MAXPATH {
            return Err(Errno::ENAMETOOLONG);
        }
        buf[*len..*len + bytes.len()].copy_from_slice(bytes);
        *len += bytes.len();
        Ok(())
    };
    push(buf, target, &mut len)?;
    while let Some(c) = rest.next() {
        push(buf, b"/", &mut len)?;
        push(buf, c, &mut len)?;
    }
    Ok(len)
}

/// Walk a relative path seeded from `dir` (whose reference is consumed).
fn namei_from(dir: InodeRef, path: &[u8], follow: bool, depth: usize) -> Result<InodeRef> {
    let mut current = dir;
    for comp in Components::new(path) {
        let name = match FileName::new(comp) {
            Ok(n) => n,
            Err(e) => {
                kernel().itable.iput(current);
                return Err(e);
            }
        };
        current = walk_one(current, name, follow, depth)?;
    }
    Ok(current)
}

/// One lookup step from `dir` (consumes the reference on success or
/// error). Symlink targets are followed.
fn walk_one(dir: InodeRef, name: &FileName, follow: bool, depth: usize) -> Result<InodeRef> {
    if depth > MAXSYMLINKS {
        kernel().itable.iput(dir);
        return Err(Errno::ELOOP);
    }
    let itable = &kernel().itable;

    let mode = itable.with(dir, |i| i.mode);
    if !stat::s_isdir(mode) {
        itable.iput(dir);
        return Err(Errno::ENOTDIR);
    }
    if let Err(e) = check_permission(PermMask::EXEC, dir) {
        itable.iput(dir);
        return Err(e);
    }
    if name.is_dot() {
        return Ok(dir);
    }
    let dir = if name.is_dotdot() {
        match crossing_up(dir) {
            Some(covered) => {
                let covered = itable.idup(covered);
                itable.iput(dir);
                covered
            }
            None => dir,
        }
    } else {
        dir
    };

    let ops = itable.with(dir, |i| i.ops).ok_or(Errno::ENOENT);
    let ops = match ops {
        Ok(o) => o,
        Err(e) => {
            itable.iput(dir);
            return Err(e);
        }
    };
    let sb = match itable.with(dir, |i| i.sb) {
        Some(sb) => sb,
        None => {
            itable.iput(dir);
            return Err(Errno::ENOENT);
        }
    };
    itable.lock_inode(dir);
    let inum = ops.iops.lookup(dir, name);
    itable.unlock_inode(dir);
    let next = match inum.and_then(|inum| itable.iget(sb, inum)) {
        Ok(n) => n,
        Err(e) => {
            itable.iput(dir);
            return Err(e);
        }
    };

    let next_mode = itable.with(next, |i| i.mode);
    if stat::s_islnk(next_mode) && follow {
        let scratch = match NameScratch::alloc() {
            Ok(s) => s,
            Err(e) => {
                itable.iput(next);
                itable.iput(dir);
                return Err(e);
            }
        };
        let (target, _) = scratch.buffers();
        let link_ops = itable.with(next, |i| i.ops).unwrap_or(ops);
        itable.lock_inode(next);
        let n = link_ops.iops.readlink(next, target);
        itable.unlock_inode(next);
        itable.iput(next);
        let n = match n {
            Ok(n) => n,
            Err(e) => {
                itable.iput(dir);
                scratch.free();
                return Err(e);
            }
        };
        let result = if target.first() == Some(&b'/') {
            itable.iput(dir);
            namei_depth(&target[..n], true, depth + 1)
        } else {
            namei_from(dir, &target[..n], true, depth + 1)
        };
        scratch.free();
        return result;
    }

    itable.iput(dir);
    Ok(next)
}

/// A frame-backed pair of path buffers for symlink resolution, in the
/// manner of the allocated name copies at the syscall boundary.
struct NameScratch {
    frame: u32,
}

static_assertions::const_assert!(2 * MAXPATH <= crate::arch::x86::PAGE_SIZE);

impl NameScratch {
    fn alloc() -> Result<NameScratch> {
        let frame = kernel()
            .frames
            .lock()
            .alloc()
            .ok_or(Errno::ENOMEM)?;
        Ok(NameScratch { frame })
    }

    /// The two buffers, carved out of the frame.
    fn buffers(&self) -> (&'static mut [u8; MAXPATH], &'static mut [u8; MAXPATH]) {
        let frames = kernel().frames.lock();
        let bytes = unsafe { crate::page::frame_bytes(&frames, self.frame) };
        let base = bytes.as_mut_ptr();
        unsafe {
            (
                &mut *(base as *mut [u8; MAXPATH]),
                &mut *(base.add(MAXPATH) as *mut [u8; MAXPATH]),
            )
        }
    }

    fn free(self) {
        kernel().frames.lock().decref(self.frame);
    }
}

/// If `dir` is the root of a mounted filesystem, the directory it
/// covers; otherwise `None`. The process root never crosses up.
fn crossing_up(dir: InodeRef) -> Option<InodeRef> {
    let p = myproc();
    if !p.is_null() {
        let data = unsafe { &*(*p).data.get() };
        if data.root == Some(dir) {
            return None;
        }
    }
    let sb = kernel().itable.with(dir, |i| i.sb)?;
    if kernel().supers.root_of(sb) == Some(dir) {
        kernel().supers.covered_of(sb)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_split_and_skip_slashes() {
        let got: std::vec::Vec<&[u8]> = Components::new(b"/usr//bin/ls/").collect();
        assert_eq!(got, [b"usr" as &[u8], b"bin", b"ls"]);
        assert_eq!(Components::new(b"///").count(), 0);
        assert_eq!(Components::new(b"a").count(), 1);
    }

    #[test]
    fn filename_rejects_bad_names() {
        assert!(FileName::new(b"ok.txt").is_ok());
        assert_eq!(FileName::new(b"").unwrap_err(), Errno::ENOENT);
        assert_eq!(FileName::new(b"a/b").unwrap_err(), Errno::EINVAL);
        let long = [b'x'; NAME_MAX + 1];
        assert_eq!(FileName::new(&long).unwrap_err(), Errno::ENAMETOOLONG);
    }

    #[test]
    fn perm_bits_owner_group_other() {
        // rw-r----- owned by 10:20
        let mode = 0o640;
        assert!(perm_ok(PermMask::READ | PermMask::WRITE, mode, 10, false, 10, false));
        assert!(perm_ok(PermMask::READ, mode, 10, true, 11, false));
        assert!(!perm_ok(PermMask::WRITE, mode, 10, true, 11, false));
        assert!(!perm_ok(PermMask::READ, mode, 10, false, 12, false));
    }

    #[test]
    fn superuser_bypasses_all_but_exec() {
        assert!(perm_ok(PermMask::WRITE, 0o000, 10, false, 0, true));
        // Execute still wants an x bit somewhere.
        assert!(!perm_ok(PermMask::EXEC, 0o644, 10, false, 0, true));
        assert!(perm_ok(PermMask::EXEC, 0o100, 10, false, 0, true));
    }
}
