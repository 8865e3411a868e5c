//! Inode cache.
//!
//! Same shape as the buffer cache: a fixed pool chained into a
//! `(dev ^ inum)` hash plus a free list of unreferenced entries. An inode
//! with `count > 0` is never on the free list; dirty inodes are written
//! back before their slot is recycled. `iget` transparently substitutes
//! the mounted root when it lands on a mount point, so lookups never see
//! the covered directory, except through `..`, which the path walker
//! resolves against the covered side explicitly.

use array_macro::array;
use bitflags::bitflags;

use crate::{
    errno::{Errno, Result},
    fs::FsOps,
    kernel::kernel,
    param::{NINODE, NR_INO_HASH},
    proc::WaitChannel,
};

const NO_INODE: u16 = u16::MAX;

bitflags! {
    pub struct InodeState: u16 {
        const LOCKED = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

/// Per-filesystem private state hanging off a generic inode.
pub enum InodeExt {
    Empty,
    /// pipefs: index into the pipe pool.
    Pipe(u16),
    /// Opaque words for an out-of-tree filesystem.
    Raw([u32; 4]),
}

/// In-core image of a filesystem object.
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    pub count: u32,
    pub state: InodeState,

    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub nlink: u16,
    pub blocks: u32,
    /// Device this special file represents, if any.
    pub rdev: u32,

    /// For a covered directory: slot of the mounted root inode.
    pub mount_point: Option<u16>,
    /// Owning superblock slot.
    pub sb: Option<usize>,
    pub ops: Option<&'static FsOps>,
    pub ext: InodeExt,

    next_hash: u16,
    next_free: u16,
    prev_free: u16,
}

impl Inode {
    const fn zero() -> Self {
        Self {
            dev: 0,
            inum: 0,
            count: 0,
            state: InodeState::empty(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlink: 0,
            blocks: 0,
            rdev: 0,
            mount_point: None,
            sb: None,
            ops: None,
            ext: InodeExt::Empty,
            next_hash: NO_INODE,
            next_free: NO_INODE,
            prev_free: NO_INODE,
        }
    }

    fn clear(&mut self) {
        let next_free = self.next_free;
        let prev_free = self.prev_free;
        *self = Self::zero();
        self.next_free = next_free;
        self.prev_free = prev_free;
    }

    pub fn locked(&self) -> bool {
        self.state.contains(InodeState::LOCKED)
    }

    pub fn dirty(&self) -> bool {
        self.state.contains(InodeState::DIRTY)
    }
}

/// A referenced in-core inode, identified by its cache slot.
/// Reference counting is explicit: `idup` and `iput`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InodeRef(pub(crate) u16);

impl InodeRef {
    pub fn slot(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub fn test_token() -> Self {
        InodeRef(0)
    }
}

const fn ino_hash(dev: u32, inum: u32) -> usize {
    ((dev ^ inum) as usize) % NR_INO_HASH
}

pub struct ItableInner {
    pool: [Inode; NINODE],
    hash: [u16; NR_INO_HASH],
    free_head: u16,
    free_tail: u16,
    pub nr_free: usize,
}

/// Outcome of the non-sleeping half of `iget`.
pub enum IGet {
    /// Referenced hit (mount points already substituted).
    Hit(u16),
    /// The matching entry is locked; sleep and retry.
    Wait(u16),
    /// Fresh entry, locked, identity set; caller must read_inode and
    /// then `commit_new` or `abort_new`.
    Fresh(u16),
    /// Pool exhausted.
    NoneFree,
}

impl ItableInner {
    pub const fn zero() -> Self {
        Self {
            pool: array![_ => Inode::zero(); NINODE],
            hash: [NO_INODE; NR_INO_HASH],
            free_head: NO_INODE,
            free_tail: NO_INODE,
            nr_free: 0,
        }
    }

    pub fn init(&mut self) {
        for idx in 0..NINODE as u16 {
            self.push_free_tail(idx);
        }
    }

    pub fn inode(&self, idx: u16) -> &Inode {
        &self.pool[idx as usize]
    }

    pub fn inode_mut(&mut self, idx: u16) -> &mut Inode {
        &mut self.pool[idx as usize]
    }

    fn push_free_tail(&mut self, idx: u16) {
        let tail = self.free_tail;
        let i = &mut self.pool[idx as usize];
        i.next_free = NO_INODE;
        i.prev_free = tail;
        if tail != NO_INODE {
            self.pool[tail as usize].next_free = idx;
        } else {
            self.free_head = idx;
        }
        self.free_tail = idx;
        self.nr_free += 1;
    }

    fn remove_free(&mut self, idx: u16) {
        let (prev, next) = {
            let i = &self.pool[idx as usize];
            (i.prev_free, i.next_free)
        };
        if prev != NO_INODE {
            self.pool[prev as usize].next_free = next;
        } else if self.free_head == idx {
            self.free_head = next;
        }
        if next != NO_INODE {
            self.pool[next as usize].prev_free = prev;
        } else if self.free_tail == idx {
            self.free_tail = prev;
        }
        let i = &mut self.pool[idx as usize];
        i.prev_free = NO_INODE;
        i.next_free = NO_INODE;
        self.nr_free -= 1;
    }

    fn insert_hash(&mut self, idx: u16) {
        let bucket = {
            let i = &self.pool[idx as usize];
            ino_hash(i.dev, i.inum)
        };
        self.pool[idx as usize].next_hash = self.hash[bucket];
        self.hash[bucket] = idx;
    }

    fn remove_hash(&mut self, idx: u16) {
        let i = &self.pool[idx as usize];
        if i.inum == 0 {
            return;
        }
        let bucket = ino_hash(i.dev, i.inum);
        let next = i.next_hash;
        let mut link = self.hash[bucket];
        if link == idx {
            self.hash[bucket] = next;
        } else {
            while link != NO_INODE {
                let link_next = self.pool[link as usize].next_hash;
                if link_next == idx {
                    self.pool[link as usize].next_hash = next;
                    break;
                }
                link = link_next;
            }
        }
        self.pool[idx as usize].next_hash = NO_INODE;
    }

    pub fn lookup(&self, dev: u32, inum: u32) -> Option<u16> {
        let mut idx = self.hash[ino_hash(dev, inum)];
        while idx != NO_INODE {
            let i = &self.pool[idx as usize];
            if i.dev == dev && i.inum == inum {
                return Some(idx);
            }
            idx = i.next_hash;
        }
        None
    }

    /// Recycle an unreferenced entry, stripped of its old identity.
    fn get_free_inode(&mut self) -> Option<u16> {
        let idx = self.free_head;
        if idx == NO_INODE {
            return None;
        }
        self.remove_free(idx);
        self.remove_hash(idx);
        self.pool[idx as usize].clear();
        Some(idx)
    }

    /// The non-sleeping core of `iget`.
    pub fn try_iget(&mut self, sb: usize, dev: u32, inum: u32) -> IGet {
        if let Some(mut idx) = self.lookup(dev, inum) {
            if self.pool[idx as usize].locked() {
                return IGet::Wait(idx);
            }
            // Crossing a mount point: hand out the mounted root instead.
            if let Some(root) = self.pool[idx as usize].mount_point {
                idx = root;
                if self.pool[idx as usize].locked() {
                    return IGet::Wait(idx);
                }
            }
            let i = &mut self.pool[idx as usize];
            i.count += 1;
            if i.count == 1 {
                self.remove_free(idx);
            }
            return IGet::Hit(idx);
        }

        match self.get_free_inode() {
            None => IGet::NoneFree,
            Some(idx) => {
                let i = &mut self.pool[idx as usize];
                i.dev = dev;
                i.rdev = dev;
                i.inum = inum;
                i.sb = Some(sb);
                i.count = 1;
                i.state = InodeState::LOCKED;
                IGet::Fresh(idx)
            }
        }
    }

    /// A fresh entry was filled by read_inode; make it findable.
    pub fn commit_new(&mut self, idx: u16) {
        self.insert_hash(idx);
        self.pool[idx as usize].state.remove(InodeState::LOCKED);
    }

    /// read_inode failed; the slot goes straight back to the free list.
    pub fn abort_new(&mut self, idx: u16) {
        let i = &mut self.pool[idx as usize];
        i.count = 0;
        i.state = InodeState::empty();
        i.inum = 0;
        self.push_free_tail(idx);
    }

    /// The non-sleeping core of `iput` once the count reaches zero and
    /// any write-back has been done.
    pub fn release(&mut self, idx: u16) {
        debug_assert_eq!(self.pool[idx as usize].count, 0);
        self.push_free_tail(idx);
    }

    /// Any referenced inode on this device besides (possibly) the root
    /// with a single reference? Used by umount.
    pub fn fs_busy(&self, dev: u32, root: u16) -> bool {
        for (n, i) in self.pool.iter().enumerate() {
            if i.dev == dev && i.count > 0 {
                if n == root as usize && i.count == 1 {
                    continue;
                }
                return true;
            }
        }
        false
    }

    /// Strip the cache of every inode on `dev`.
    pub fn invalidate_dev(&mut self, dev: u32) {
        for idx in 0..NINODE as u16 {
            if self.pool[idx as usize].dev == dev && self.pool[idx as usize].inum != 0 {
                self.remove_hash(idx);
            }
        }
    }

    /// Slots that are dirty (and belong to `dev`, when nonzero).
    pub fn collect_dirty(&self, dev: u32, out: &mut [u16]) -> usize {
        let mut n = 0;
        for idx in 0..NINODE as u16 {
            let i = &self.pool[idx as usize];
            if i.inum != 0 && i.dirty() && (dev == 0 || i.dev == dev) {
                if n < out.len() {
                    out[n] = idx;
                    n += 1;
                }
            }
        }
        n
    }
}

/// The inode cache: the locked pool plus per-slot wait channels for the
/// sleep-on-locked-inode protocol.
pub struct Itable {
    pub inner: crate::lock::SpinLock<ItableInner>,
    channels: [WaitChannel; NINODE],
}

impl Itable {
    pub const fn zero() -> Self {
        Self {
            inner: crate::lock::SpinLock::new("itable", ItableInner::zero()),
            channels: array![_ => WaitChannel::new(); NINODE],
        }
    }

    pub fn init(&self) {
        self.inner.lock().init();
    }

    /// Lock an inode, sleeping until it is free.
    pub fn lock_inode(&self, ino: InodeRef) {
        loop {
            let mut inner = self.inner.lock();
            if !inner.inode(ino.0).locked() {
                inner.inode_mut(ino.0).state.insert(InodeState::LOCKED);
                return;
            }
            self.channels[ino.slot()].sleep(&mut inner);
        }
    }

    pub fn unlock_inode(&self, ino: InodeRef) {
        let mut inner = self.inner.lock();
        inner.inode_mut(ino.0).state.remove(InodeState::LOCKED);
        drop(inner);
        self.channels[ino.slot()].wakeup();
    }

    /// Run `f` on the inode's in-core image under the table lock.
    pub fn with<R>(&self, ino: InodeRef, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.inode_mut(ino.0))
    }

    /// Returns a referenced in-core inode, reading it through the
    /// superblock's `read_inode` on a miss.
    pub fn iget(&self, sb: usize, inum: u32) -> Result<InodeRef> {
        if inum == 0 {
            return Err(Errno::ENOENT);
        }
        let dev = kernel().supers.dev_of(sb);
        loop {
            let mut inner = self.inner.lock();
            match inner.try_iget(sb, dev, inum) {
                IGet::Hit(idx) => return Ok(InodeRef(idx)),
                IGet::Wait(idx) => {
                    self.channels[idx as usize].sleep(&mut inner);
                }
                IGet::NoneFree => return Err(Errno::ENOMEM),
                IGet::Fresh(idx) => {
                    let ops = kernel().supers.ops_of(sb);
                    inner.inode_mut(idx).ops = Some(ops);
                    drop(inner);
                    // The entry is locked; reading may sleep in bread.
                    let res = ops.sops.read_inode(InodeRef(idx));
                    let mut inner = self.inner.lock();
                    match res {
                        Ok(()) => {
                            inner.commit_new(idx);
                            drop(inner);
                            self.channels[idx as usize].wakeup();
                            return Ok(InodeRef(idx));
                        }
                        Err(e) => {
                            inner.abort_new(idx);
                            drop(inner);
                            self.channels[idx as usize].wakeup();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// An in-core-only inode with no on-disk identity (pipes). The
    /// caller owns the single reference.
    pub fn alloc_anonymous(
        &self,
        sb: Option<usize>,
        mode: u32,
        ops: Option<&'static FsOps>,
    ) -> Result<InodeRef> {
        let mut inner = self.inner.lock();
        let idx = inner.get_free_inode().ok_or(Errno::ENOMEM)?;
        let i = inner.inode_mut(idx);
        i.sb = sb;
        i.ops = ops;
        i.mode = mode;
        i.count = 1;
        Ok(InodeRef(idx))
    }

    /// Take another reference.
    pub fn idup(&self, ino: InodeRef) -> InodeRef {
        let mut inner = self.inner.lock();
        inner.inode_mut(ino.0).count += 1;
        ino
    }

    /// Ask the filesystem for a brand-new inode.
    pub fn ialloc(&self, sb: usize, mode: u32) -> Result<InodeRef> {
        let dev = kernel().supers.dev_of(sb);
        let ops = kernel().supers.ops_of(sb);
        let mut inner = self.inner.lock();
        let idx = inner.get_free_inode().ok_or(Errno::ENOMEM)?;
        {
            let i = inner.inode_mut(idx);
            i.sb = Some(sb);
            i.dev = dev;
            i.rdev = dev;
            i.ops = Some(ops);
            i.count = 1;
            i.state = InodeState::LOCKED;
        }
        drop(inner);
        match ops.sops.ialloc(InodeRef(idx), mode) {
            Ok(inum) => {
                let mut inner = self.inner.lock();
                let i = inner.inode_mut(idx);
                i.inum = inum;
                i.mode = mode;
                i.state.remove(InodeState::LOCKED);
                inner.insert_hash(idx);
                drop(inner);
                self.channels[idx as usize].wakeup();
                Ok(InodeRef(idx))
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.abort_new(idx);
                drop(inner);
                self.channels[idx as usize].wakeup();
                Err(e)
            }
        }
    }

    /// Drop a reference. On the last one: free the on-disk inode if the
    /// link count is zero, write it back if dirty, and return the slot
    /// to the free list.
    pub fn iput(&self, ino: InodeRef) {
        // Let any in-flight operation on the inode finish first.
        self.lock_inode(ino);

        let mut inner = self.inner.lock();
        let idx = ino.0;
        assert!(inner.inode(idx).count > 0, "iput of a free inode");
        inner.inode_mut(idx).count -= 1;
        if inner.inode(idx).count > 0 {
            inner.inode_mut(idx).state.remove(InodeState::LOCKED);
            drop(inner);
            self.channels[ino.slot()].wakeup();
            return;
        }

        let (nlink, dirty, ops) = {
            let i = inner.inode(idx);
            (i.nlink, i.dirty(), i.ops)
        };
        drop(inner);

        if let Some(ops) = ops {
            if nlink == 0 {
                let _ = ops.sops.ifree(ino);
                self.inner.lock().remove_hash(idx);
            }
            if dirty {
                // Write-back may sleep; the inode stays locked meanwhile.
                if ops.sops.write_inode(ino).is_ok() {
                    self.with(ino, |i| i.state.remove(InodeState::DIRTY));
                } else {
                    // Keep the inode around, still dirty.
                    let mut inner = self.inner.lock();
                    inner.inode_mut(idx).count += 1;
                    inner.inode_mut(idx).state.remove(InodeState::LOCKED);
                    drop(inner);
                    self.channels[ino.slot()].wakeup();
                    return;
                }
            }
        } else {
            // No backing filesystem (pipe inodes): nothing to flush.
            self.with(ino, |i| i.state.remove(InodeState::DIRTY));
        }

        let mut inner = self.inner.lock();
        inner.inode_mut(idx).state.remove(InodeState::LOCKED);
        inner.release(idx);
        drop(inner);
        self.channels[ino.slot()].wakeup();
    }

    /// Write every dirty inode (of `dev`, or all when 0).
    pub fn sync_inodes(&self, dev: u32) {
        let _sync = kernel().sync_resource.lock();
        let mut dirty = [0u16; NINODE];
        let n = self.inner.lock().collect_dirty(dev, &mut dirty);
        for &idx in &dirty[..n] {
            let ino = InodeRef(idx);
            self.lock_inode(ino);
            let ops = self.with(ino, |i| i.ops);
            if let Some(ops) = ops {
                if ops.sops.write_inode(ino).is_ok() {
                    self.with(ino, |i| i.state.remove(InodeState::DIRTY));
                }
            }
            self.unlock_inode(ino);
        }
    }

    pub fn invalidate_inodes(&self, dev: u32) {
        self.inner.lock().invalidate_dev(dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ItableInner {
        let mut t = ItableInner::zero();
        t.init();
        t
    }

    #[test]
    fn iget_hit_counts_and_leaves_free_list() {
        let mut t = table();
        let free0 = t.nr_free;
        let idx = match t.try_iget(0, 3, 12) {
            IGet::Fresh(i) => i,
            _ => panic!("expected fresh"),
        };
        assert_eq!(t.nr_free, free0 - 1);
        t.commit_new(idx);
        // A second iget hits the same slot and bumps the count.
        match t.try_iget(0, 3, 12) {
            IGet::Hit(i) => assert_eq!(i, idx),
            _ => panic!("expected hit"),
        }
        assert_eq!(t.inode(idx).count, 2);
        assert_eq!(t.nr_free, free0 - 1);
    }

    #[test]
    fn at_most_one_inode_per_identity() {
        let mut t = table();
        let a = match t.try_iget(0, 1, 5) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(a);
        let b = match t.try_iget(0, 1, 5) {
            IGet::Hit(i) => i,
            _ => panic!(),
        };
        assert_eq!(a, b);
        // Different device, same inum: distinct identity.
        let c = match t.try_iget(1, 2, 5) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        assert_ne!(a, c);
    }

    #[test]
    fn locked_entry_makes_caller_wait() {
        let mut t = table();
        let idx = match t.try_iget(0, 1, 5) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        // Still locked (read_inode in flight): a second getter waits.
        match t.try_iget(0, 1, 5) {
            IGet::NoneFree | IGet::Hit(_) | IGet::Fresh(_) => panic!("expected wait"),
            IGet::Wait(i) => assert_eq!(i, idx),
        }
        t.commit_new(idx);
    }

    #[test]
    fn mount_point_is_substituted() {
        let mut t = table();
        let covered = match t.try_iget(0, 1, 7) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(covered);
        let root = match t.try_iget(1, 2, 1) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(root);
        t.inode_mut(covered).mount_point = Some(root);

        match t.try_iget(0, 1, 7) {
            IGet::Hit(i) => assert_eq!(i, root, "iget must yield the mounted root"),
            _ => panic!(),
        }
        assert_eq!(t.inode(root).count, 2);
        // The covered inode's own count is untouched by the crossing.
        assert_eq!(t.inode(covered).count, 1);
    }

    #[test]
    fn release_returns_to_free_list() {
        let mut t = table();
        let free0 = t.nr_free;
        let idx = match t.try_iget(0, 9, 9) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(idx);
        t.inode_mut(idx).count = 0;
        t.release(idx);
        assert_eq!(t.nr_free, free0);
        // Identity survives on the free list and can be re-hit.
        match t.try_iget(0, 9, 9) {
            IGet::Hit(i) => assert_eq!(i, idx),
            _ => panic!("freed inode should still be findable"),
        }
    }

    #[test]
    fn fs_busy_ignores_an_idle_root() {
        let mut t = table();
        let root = match t.try_iget(0, 5, 1) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(root);
        assert!(!t.fs_busy(5, root));
        let file = match t.try_iget(0, 5, 33) {
            IGet::Fresh(i) => i,
            _ => panic!(),
        };
        t.commit_new(file);
        assert!(t.fs_busy(5, root));
    }
}
