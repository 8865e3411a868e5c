//! The virtual filesystem layer.
//!
//! Every filesystem and device driver implements the subset it supports
//! of four operation groups; unimplemented operations fall through to the
//! defaults below (`ENOSYS`, or a harmless no-op where POSIX wants one).
//! A filesystem registers a `FilesystemType`; mounting binds one to a
//! device and a covered directory through the superblock table.

use bitflags::bitflags;

use crate::{
    errno::{Errno, Result},
    file::OpenFile,
    proc::WaitChannel,
    vm::Vma,
};

pub mod inode;
pub mod path;
pub mod stat;
pub mod superblock;

pub use inode::{InodeRef, Itable};
pub use path::{check_permission, namei, namei_parent, FileName, PermMask};
pub use stat::{Stat, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG};
pub use superblock::{MountFlags, SuperTable, Superblock};

bitflags! {
    pub struct FsOpFlags: u32 {
        /// Mounted on a real block device.
        const REQUIRES_DEV = 1 << 0;
        /// Internal mount (pipefs, procfs); no device behind it.
        const KERN_MOUNT = 1 << 1;
    }
}

#[derive(Copy, Clone, PartialEq)]
pub enum SelectEvent {
    Read,
    Write,
    Except,
}

/// Whence values of llseek.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// File-level operations: everything reached through a descriptor.
pub trait FileOps: Sync {
    fn open(&self, _ino: InodeRef, _file: &mut OpenFile) -> Result<()> {
        Ok(())
    }

    fn close(&self, _ino: InodeRef, _file: &mut OpenFile) -> Result<()> {
        Ok(())
    }

    fn read(&self, _ino: InodeRef, _file: &mut OpenFile, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::ENOSYS)
    }

    fn write(&self, _ino: InodeRef, _file: &mut OpenFile, _buf: &[u8]) -> Result<usize> {
        Err(Errno::ENOSYS)
    }

    fn ioctl(&self, _ino: InodeRef, _cmd: u32, _arg: usize) -> Result<usize> {
        Err(Errno::ENOTTY)
    }

    fn llseek(&self, _ino: InodeRef, offset: i64) -> Result<i64> {
        Ok(offset)
    }

    /// Fill `buf` with getdents records; returns bytes produced.
    fn readdir(&self, _ino: InodeRef, _file: &mut OpenFile, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::ENOTDIR)
    }

    /// The 64-bit dirent layout; filesystems that support it override.
    fn readdir64(&self, _ino: InodeRef, _file: &mut OpenFile, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::ENOSYS)
    }

    fn mmap(&self, _ino: InodeRef, _vma: &Vma) -> Result<()> {
        Err(Errno::ENODEV)
    }

    /// Is the file ready for `event` without blocking?
    fn select(&self, _ino: InodeRef, _event: SelectEvent) -> Result<bool> {
        Ok(true)
    }
}

/// Inode-level operations: namespace and metadata.
pub trait InodeOps: Sync {
    fn lookup(&self, _dir: InodeRef, _name: &FileName) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    fn create(&self, _dir: InodeRef, _name: &FileName, _mode: u32) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    fn mknod(&self, _dir: InodeRef, _name: &FileName, _mode: u32, _rdev: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, _dir: InodeRef, _name: &FileName, _mode: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, _dir: InodeRef, _name: &FileName) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn link(&self, _old: InodeRef, _dir: InodeRef, _name: &FileName) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, _dir: InodeRef, _name: &FileName) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, _dir: InodeRef, _name: &FileName, _target: &[u8]) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn rename(
        &self,
        _old_dir: InodeRef,
        _old_name: &FileName,
        _new_dir: InodeRef,
        _new_name: &FileName,
    ) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, _ino: InodeRef, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EINVAL)
    }

    /// Resolve a symlink directly to an inode number, for filesystems
    /// that can do better than `readlink` plus a re-walk.
    fn followlink(&self, _dir: InodeRef, _ino: InodeRef) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, _ino: InodeRef, _length: u64) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Block number backing byte `offset` of the file.
    fn bmap(&self, _ino: InodeRef, _offset: u64, _write: bool) -> Result<u32> {
        Err(Errno::ENOSYS)
    }
}

/// Block-transfer operations of a block device driver.
pub trait BlockOps: Sync {
    fn read_block(&self, _dev: u32, _block: u32, _buf: &mut [u8], _size: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn write_block(&self, _dev: u32, _block: u32, _buf: &[u8], _size: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }
}

/// Superblock-level operations of a filesystem.
pub trait SuperOps: Sync {
    /// Fill the in-core image of `(sb.dev, ino.inum)`.
    fn read_inode(&self, _ino: InodeRef) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn write_inode(&self, _ino: InodeRef) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Allocate a fresh on-disk inode; returns its number.
    fn ialloc(&self, _ino: InodeRef, _mode: u32) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    fn ifree(&self, _ino: InodeRef) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, _sb: usize, _buf: &mut StatFs) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Read the superblock off the device at mount time.
    fn read_superblock(&self, _sb: usize, _dev: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn remount_fs(&self, _sb: usize, _flags: MountFlags) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn write_superblock(&self, _sb: usize) -> Result<()> {
        Ok(())
    }

    fn release_superblock(&self, _sb: usize) -> Result<()> {
        Ok(())
    }
}

/// The all-defaults row: what a driver gets for every group it does not
/// implement.
pub struct NoOps;

impl FileOps for NoOps {}
impl InodeOps for NoOps {}
impl BlockOps for NoOps {}
impl SuperOps for NoOps {}

pub static NO_OPS: NoOps = NoOps;

/// Dispatch record with every operation unsupported.
pub static NULL_FS_OPS: FsOps = FsOps::empty(FsOpFlags::empty());

/// One filesystem's (or device's) complete dispatch record.
pub struct FsOps {
    pub flags: FsOpFlags,
    pub fops: &'static dyn FileOps,
    pub iops: &'static dyn InodeOps,
    pub bops: &'static dyn BlockOps,
    pub sops: &'static dyn SuperOps,
}

impl FsOps {
    pub const fn empty(flags: FsOpFlags) -> Self {
        Self {
            flags,
            fops: &NO_OPS,
            iops: &NO_OPS,
            bops: &NO_OPS,
            sops: &NO_OPS,
        }
    }
}

pub struct FilesystemType {
    pub name: &'static str,
    pub ops: &'static FsOps,
}

pub struct StatFs {
    pub f_type: u32,
    pub f_bsize: u32,
    pub f_blocks: u32,
    pub f_bfree: u32,
    pub f_files: u32,
    pub f_ffree: u32,
}

/// Registered filesystem types.
pub struct FsTypeTable {
    types: [Option<&'static FilesystemType>; crate::param::NR_FSTYPES],
}

impl FsTypeTable {
    pub const fn zero() -> Self {
        Self {
            types: [None; crate::param::NR_FSTYPES],
        }
    }

    pub fn register(&mut self, fstype: &'static FilesystemType) -> Result<()> {
        if self.by_name(fstype.name).is_some() {
            return Err(Errno::EBUSY);
        }
        for slot in self.types.iter_mut() {
            if slot.is_none() {
                *slot = Some(fstype);
                return Ok(());
            }
        }
        Err(Errno::ENOMEM)
    }

    pub fn by_name(&self, name: &str) -> Option<&'static FilesystemType> {
        self.types
            .iter()
            .filter_map(|t| *t)
            .find(|t| t.name == name)
    }
}

/// Processes blocked in select sleep here; any driver that becomes ready
/// broadcasts a wakeup and every sleeper re-evaluates its sets.
pub static SELECT_WAIT: WaitChannel = WaitChannel::new();

#[cfg(test)]
mod vfs_tests {
    //! End-to-end walks over a tiny synchronous in-memory filesystem:
    //! the kind of external collaborator the VFS interfaces exist for.

    use super::*;
    use crate::fs::inode::InodeRef;
    use crate::kernel::kernel;

    /// Directory tree, by (inode, name) -> inode:
    ///   1 /           (dir)
    ///   2 /hello      (file, 6 bytes)
    ///   3 /sub        (dir)
    ///   4 /link       (symlink -> /sub)
    ///   5 /sub/x      (file)
    ///   6 /loop       (symlink -> /loop)
    struct TestFs;

    fn inum_of(dir: InodeRef) -> u32 {
        kernel().itable.with(dir, |i| i.inum)
    }

    impl InodeOps for TestFs {
        fn lookup(&self, dir: InodeRef, name: &FileName) -> crate::errno::Result<u32> {
            let dir_inum = inum_of(dir);
            let found = match (dir_inum, name.as_bytes()) {
                (1, b".") | (1, b"..") => 1,
                (1, b"hello") => 2,
                (1, b"sub") => 3,
                (1, b"link") => 4,
                (1, b"loop") => 6,
                (3, b".") => 3,
                (3, b"..") => 1,
                (3, b"x") => 5,
                _ => return Err(Errno::ENOENT),
            };
            Ok(found)
        }

        fn readlink(&self, ino: InodeRef, buf: &mut [u8]) -> crate::errno::Result<usize> {
            let target: &[u8] = match inum_of(ino) {
                4 => b"/sub",
                6 => b"/loop",
                _ => return Err(Errno::EINVAL),
            };
            buf[..target.len()].copy_from_slice(target);
            Ok(target.len())
        }
    }

    impl SuperOps for TestFs {
        fn read_inode(&self, ino: InodeRef) -> crate::errno::Result<()> {
            kernel().itable.with(ino, |i| {
                i.nlink = 1;
                i.mode = match i.inum {
                    1 | 3 => stat::S_IFDIR | 0o755,
                    4 | 6 => S_IFLNK | 0o777,
                    2 | 5 => S_IFREG | 0o644,
                    _ => return Err(Errno::EIO),
                };
                if i.inum == 2 {
                    i.size = 6;
                }
                Ok(())
            })
        }

        fn read_superblock(&self, sb: usize, _dev: u32) -> crate::errno::Result<()> {
            let root = kernel().itable.iget(sb, 1)?;
            kernel().supers.with(sb, |s| s.root = Some(root));
            Ok(())
        }
    }

    static TESTFS: TestFs = TestFs;
    static TESTFS_OPS: FsOps = FsOps {
        flags: FsOpFlags::KERN_MOUNT,
        fops: &NO_OPS,
        iops: &TESTFS,
        bops: &NO_OPS,
        sops: &TESTFS,
    };
    static TESTFS_TYPE: FilesystemType = FilesystemType {
        name: "testfs",
        ops: &TESTFS_OPS,
    };

    // One root mount shared by the whole test process; individual
    // scenarios serialize on the lock and mount secondary instances.
    static SETUP: std::sync::Mutex<bool> = std::sync::Mutex::new(false);

    fn with_root(f: impl FnOnce()) {
        let mut ready = match SETUP.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*ready {
            // Back the frame allocator with real host memory so the
            // symlink scratch buffers work under the test harness.
            #[repr(align(4096))]
            struct TestRam([u8; 32 * 4096]);
            static mut TEST_RAM: TestRam = TestRam([0; 32 * 4096]);
            let base = unsafe { core::ptr::addr_of!(TEST_RAM) as usize }
                .wrapping_sub(crate::arch::x86::PAGE_OFFSET);
            kernel().frames.lock().init(base, 32, 0);

            kernel().itable.init();
            let _ = kernel().fstypes.lock().register(&TESTFS_TYPE);
            let sb = crate::fs::superblock::mount_fs(
                0xfe00,
                b"",
                "testfs",
                MountFlags::empty(),
            )
            .expect("mount root testfs");
            kernel().set_root_sb(sb);
            *ready = true;
        }
        f();
    }

    #[test]
    fn namei_resolves_paths_dots_and_symlinks() {
        with_root(|| {
            let itable = &kernel().itable;

            let hello = namei(b"/hello", true).unwrap();
            assert_eq!(inum_of(hello), 2);
            assert_eq!(itable.with(hello, |i| i.size), 6);
            itable.iput(hello);

            // `.` and `..` walk in place and upward.
            let again = namei(b"/sub/../hello", true).unwrap();
            assert_eq!(inum_of(again), 2);
            itable.iput(again);
            let root = namei(b"/sub/./..", true).unwrap();
            assert_eq!(inum_of(root), 1);
            itable.iput(root);

            // `..` at the root stays at the root.
            let still_root = namei(b"/../..", true).unwrap();
            assert_eq!(inum_of(still_root), 1);
            itable.iput(still_root);

            // Symlink to /sub is followed mid-path and, on request, at
            // the end.
            let x = namei(b"/link/x", true).unwrap();
            assert_eq!(inum_of(x), 5);
            itable.iput(x);
            let sub = namei(b"/link", true).unwrap();
            assert_eq!(inum_of(sub), 3);
            itable.iput(sub);
            let link_itself = namei(b"/link", false).unwrap();
            assert_eq!(inum_of(link_itself), 4);
            itable.iput(link_itself);

            assert_eq!(namei(b"/nosuch", true).unwrap_err(), Errno::ENOENT);
            assert_eq!(namei(b"/hello/deeper", true).unwrap_err(), Errno::ENOTDIR);
            // A self-referential symlink runs out of link budget.
            assert_eq!(namei(b"/loop", true).unwrap_err(), Errno::ELOOP);
        });
    }

    #[test]
    fn mount_covers_directory_and_umount_restores_it() {
        with_root(|| {
            let itable = &kernel().itable;

            // Second instance mounted over /sub.
            let sb2 = crate::fs::superblock::mount_fs(
                0xfe01,
                b"/sub",
                "testfs",
                MountFlags::empty(),
            )
            .unwrap();

            // Walking into /sub now lands in the mounted root (same
            // inum, other device).
            let inner_root = namei(b"/sub", true).unwrap();
            assert_eq!(inum_of(inner_root), 1);
            assert_eq!(itable.with(inner_root, |i| i.dev), 0xfe01);
            // `..` crosses back over the mount to the outer root.
            let outer = namei(b"/sub/..", true).unwrap();
            assert_eq!(itable.with(outer, |i| i.dev), 0xfe00);
            assert_eq!(inum_of(outer), 1);
            itable.iput(outer);

            // Busy while the inner root is referenced...
            assert_eq!(
                crate::fs::superblock::umount_fs(0xfe01).unwrap_err(),
                Errno::EBUSY
            );
            itable.iput(inner_root);
            // ...and clean once released.
            crate::fs::superblock::umount_fs(0xfe01).unwrap();

            // The covered directory is visible again.
            let sub = namei(b"/sub", true).unwrap();
            assert_eq!(itable.with(sub, |i| i.dev), 0xfe00);
            assert_eq!(inum_of(sub), 3);
            itable.iput(sub);

            // Double mount on the same device is refused while mounted.
            let sb3 = crate::fs::superblock::mount_fs(
                0xfe01,
                b"/sub",
                "testfs",
                MountFlags::empty(),
            )
            .unwrap();
            assert_eq!(
                crate::fs::superblock::mount_fs(
                    0xfe01,
                    b"/sub",
                    "testfs",
                    MountFlags::empty()
                )
                .unwrap_err(),
                Errno::EBUSY
            );
            crate::fs::superblock::umount_fs(0xfe01).unwrap();
            let _ = (sb2, sb3);
        });
    }

    #[test]
    fn unknown_fstype_is_enodev() {
        with_root(|| {
            assert_eq!(
                crate::fs::superblock::mount_fs(0xfe7f, b"/sub", "xenofs", MountFlags::empty())
                    .unwrap_err(),
                Errno::ENODEV
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_null_row() {
        let ino = InodeRef::test_token();
        assert_eq!(NO_OPS.ioctl(ino, 0, 0), Err(Errno::ENOTTY));
        assert_eq!(NO_OPS.lookup(ino, FileName::new(b"x").unwrap()), Err(Errno::ENOSYS));
        assert_eq!(NO_OPS.read_block(0, 0, &mut [], 0), Err(Errno::ENOSYS));
        assert_eq!(NO_OPS.write_superblock(0), Ok(()));
        assert_eq!(NO_OPS.select(ino, SelectEvent::Read), Ok(true));
    }

    #[test]
    fn fstype_registry_rejects_duplicates() {
        static OPS: FsOps = FsOps::empty(FsOpFlags::KERN_MOUNT);
        static T1: FilesystemType = FilesystemType { name: "testfs", ops: &OPS };
        static T2: FilesystemType = FilesystemType { name: "testfs", ops: &OPS };
        let mut reg = FsTypeTable::zero();
        reg.register(&T1).unwrap();
        assert_eq!(reg.register(&T2), Err(Errno::EBUSY));
        assert!(core::ptr::eq(reg.by_name("testfs").unwrap(), &T1));
        assert!(reg.by_name("nope").is_none());
    }
}
