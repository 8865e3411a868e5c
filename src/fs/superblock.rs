//! Mounted filesystems.
//!
//! One table slot per mount: the device, the filesystem type, the root
//! inode of the mounted tree and the directory inode it covers. The
//! covered inode's `mount_point` field is what makes `iget` cross into
//! the mounted tree; `..` crosses back by consulting `covered` here.

use array_macro::array;
use bitflags::bitflags;

use crate::{
    errno::{Errno, Result},
    fs::{stat, FilesystemType, FsOpFlags, FsOps, InodeRef},
    kernel::kernel,
    param::NR_SUPER,
    proc::WaitChannel,
};

bitflags! {
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
        const NOSUID = 1 << 1;
        const NODEV = 1 << 2;
        const NOEXEC = 1 << 3;
    }
}

const DIRNAME_MAX: usize = 64;

pub struct Superblock {
    pub in_use: bool,
    pub dev: u32,
    pub flags: MountFlags,
    pub block_size: u32,
    pub fstype: Option<&'static FilesystemType>,
    /// Root inode of the mounted filesystem.
    pub root: Option<InodeRef>,
    /// Directory inode this mount covers; `None` for the root mount.
    pub covered: Option<InodeRef>,
    pub dirty: bool,
    pub locked: bool,
    /// Private word for the filesystem (e.g. a pool index).
    pub fs_data: u32,
    dirname: [u8; DIRNAME_MAX],
    dirname_len: usize,
}

impl Superblock {
    const fn zero() -> Self {
        Self {
            in_use: false,
            dev: 0,
            flags: MountFlags::empty(),
            block_size: 1024,
            fstype: None,
            root: None,
            covered: None,
            dirty: false,
            locked: false,
            fs_data: 0,
            dirname: [0; DIRNAME_MAX],
            dirname_len: 0,
        }
    }

    pub fn dirname(&self) -> &[u8] {
        &self.dirname[..self.dirname_len]
    }

    pub fn set_dirname(&mut self, name: &[u8]) {
        let len = core::cmp::min(name.len(), DIRNAME_MAX);
        self.dirname[..len].copy_from_slice(&name[..len]);
        self.dirname_len = len;
    }
}

pub struct SuperTable {
    pub inner: crate::lock::SpinLock<SuperTableInner>,
    channels: [WaitChannel; NR_SUPER],
}

pub struct SuperTableInner {
    pool: [Superblock; NR_SUPER],
}

impl SuperTableInner {
    pub const fn zero() -> Self {
        Self {
            pool: array![_ => Superblock::zero(); NR_SUPER],
        }
    }

    pub fn sb(&self, idx: usize) -> &Superblock {
        &self.pool[idx]
    }

    pub fn sb_mut(&mut self, idx: usize) -> &mut Superblock {
        &mut self.pool[idx]
    }

    pub fn find_dev(&self, dev: u32) -> Option<usize> {
        self.pool
            .iter()
            .position(|s| s.in_use && s.dev == dev)
    }

    pub fn alloc(&mut self, dev: u32, fstype: &'static FilesystemType) -> Option<usize> {
        let idx = self.pool.iter().position(|s| !s.in_use)?;
        let s = &mut self.pool[idx];
        *s = Superblock::zero();
        s.in_use = true;
        s.dev = dev;
        s.fstype = Some(fstype);
        Some(idx)
    }

    pub fn free(&mut self, idx: usize) {
        self.pool[idx] = Superblock::zero();
    }
}

impl SuperTable {
    pub const fn zero() -> Self {
        Self {
            inner: crate::lock::SpinLock::new("supers", SuperTableInner::zero()),
            channels: array![_ => WaitChannel::new(); NR_SUPER],
        }
    }

    pub fn with<R>(&self, idx: usize, f: impl FnOnce(&mut Superblock) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.sb_mut(idx))
    }

    pub fn dev_of(&self, idx: usize) -> u32 {
        self.inner.lock().sb(idx).dev
    }

    pub fn ops_of(&self, idx: usize) -> &'static FsOps {
        self.inner
            .lock()
            .sb(idx)
            .fstype
            .map(|t| t.ops)
            .unwrap_or(&crate::fs::NULL_FS_OPS)
    }

    pub fn root_of(&self, idx: usize) -> Option<InodeRef> {
        self.inner.lock().sb(idx).root
    }

    pub fn covered_of(&self, idx: usize) -> Option<InodeRef> {
        self.inner.lock().sb(idx).covered
    }

    /// Superblocks are locked across metadata updates; waiters sleep.
    pub fn lock_sb(&self, idx: usize) {
        loop {
            let mut inner = self.inner.lock();
            if !inner.sb(idx).locked {
                inner.sb_mut(idx).locked = true;
                return;
            }
            self.channels[idx].sleep(&mut inner);
        }
    }

    pub fn unlock_sb(&self, idx: usize) {
        self.inner.lock().sb_mut(idx).locked = false;
        self.channels[idx].wakeup();
    }

    /// Write back every dirty superblock (of `dev`, or all when 0).
    pub fn sync_superblocks(&self, dev: u32) {
        for idx in 0..NR_SUPER {
            let (want, ops) = {
                let inner = self.inner.lock();
                let s = inner.sb(idx);
                (
                    s.in_use && s.dirty && (dev == 0 || s.dev == dev),
                    s.fstype.map(|t| t.ops),
                )
            };
            if want {
                if let Some(ops) = ops {
                    self.lock_sb(idx);
                    if ops.sops.write_superblock(idx).is_ok() {
                        self.with(idx, |s| s.dirty = false);
                    }
                    self.unlock_sb(idx);
                }
            }
        }
    }
}

/// Mount `fstype_name` from `dev` over the directory at `path`.
/// An empty path mounts the root filesystem.
pub fn mount_fs(dev: u32, path: &[u8], fstype_name: &str, flags: MountFlags) -> Result<usize> {
    let fstype = kernel()
        .fstypes
        .lock()
        .by_name(fstype_name)
        .ok_or(Errno::ENODEV)?;

    if fstype.ops.flags.contains(FsOpFlags::REQUIRES_DEV)
        && kernel().devices.get(crate::dev::BLK_DEV, dev).is_none()
    {
        return Err(Errno::ENXIO);
    }

    if kernel().supers.inner.lock().find_dev(dev).is_some() {
        return Err(Errno::EBUSY);
    }

    // Resolve the directory to cover, unless this is the root mount.
    let covered = if path.is_empty() {
        None
    } else {
        let dir = crate::fs::namei(path, true)?;
        let mode = kernel().itable.with(dir, |i| i.mode);
        if !stat::s_isdir(mode) {
            kernel().itable.iput(dir);
            return Err(Errno::ENOTDIR);
        }
        let already = kernel().itable.with(dir, |i| i.mount_point.is_some());
        if already {
            kernel().itable.iput(dir);
            return Err(Errno::EBUSY);
        }
        Some(dir)
    };

    let idx = match kernel().supers.inner.lock().alloc(dev, fstype) {
        Some(idx) => idx,
        None => {
            if let Some(dir) = covered {
                kernel().itable.iput(dir);
            }
            return Err(Errno::ENOMEM);
        }
    };
    kernel().supers.with(idx, |s| {
        s.flags = flags;
        s.set_dirname(path);
    });

    // The filesystem reads its metadata and installs the root inode.
    if let Err(e) = fstype.ops.sops.read_superblock(idx, dev) {
        kernel().supers.inner.lock().free(idx);
        if let Some(dir) = covered {
            kernel().itable.iput(dir);
        }
        return Err(e);
    }

    let root = kernel().supers.root_of(idx).ok_or(Errno::EIO)?;
    if let Some(dir) = covered {
        kernel()
            .itable
            .with(dir, |i| i.mount_point = Some(root.0));
        kernel().supers.with(idx, |s| s.covered = Some(dir));
    }
    Ok(idx)
}

/// Unmount the filesystem on `dev`. Fails with `EBUSY` while any inode
/// of the filesystem is still referenced (beyond the idle root).
pub fn umount_fs(dev: u32) -> Result<()> {
    let idx = kernel()
        .supers
        .inner
        .lock()
        .find_dev(dev)
        .ok_or(Errno::EINVAL)?;

    let root = kernel().supers.root_of(idx).ok_or(Errno::EINVAL)?;
    if kernel().itable.inner.lock().fs_busy(dev, root.0) {
        return Err(Errno::EBUSY);
    }

    let ops = kernel().supers.ops_of(idx);
    kernel().itable.sync_inodes(dev);
    crate::bio::sync_buffers(dev);
    kernel().supers.sync_superblocks(dev);
    let _ = ops.sops.release_superblock(idx);

    let covered = kernel().supers.covered_of(idx);
    if let Some(dir) = covered {
        kernel().itable.with(dir, |i| i.mount_point = None);
        kernel().itable.iput(dir);
    }
    kernel().itable.iput(root);
    kernel().itable.invalidate_inodes(dev);
    crate::bio::invalidate_buffers(dev);
    kernel().supers.inner.lock().free(idx);
    Ok(())
}
