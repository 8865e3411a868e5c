//! Buffer cache.
//!
//! One cached copy per `(device, block, size)`, found through a chained
//! hash; reuse is LRU through a doubly linked free list whose head end
//! collects invalid buffers so they are picked first; deferred writes sit
//! on a dirty list drained by the flusher. The pool grows on demand up to
//! `NBUF` slots and shrinks again under page pressure.
//!
//! Interface:
//! * `bread` returns a locked, valid buffer.
//! * After changing buffer data, call `bwrite`; the disk write is
//!   deferred to the flusher.
//! * When done with a buffer, call `brelse`.
//!
//! The cache spinlock is held across the whole lookup-or-grow path, so
//! two callers can never both conclude the same block is absent; the
//! at-most-one-copy invariant holds by construction.

use array_macro::array;
use bitflags::bitflags;

use crate::{
    dev::BLK_DEV,
    errno::{Errno, Result},
    kernel::kernel,
    page::NO_FRAME,
    param::{BUFFER_DIRTY_RATIO, NBUF, NR_BUF_HASH, NR_BUF_RECLAIM},
    proc::WaitChannel,
};

const NO_BUF: u16 = u16::MAX;

bitflags! {
    pub struct BufFlags: u16 {
        /// Held for I/O or by a caller; never on the free list.
        const LOCKED = 1 << 0;
        /// Must reach the disk before the slot is reused.
        const DIRTY = 1 << 1;
        /// Data reflects the disk block.
        const VALID = 1 << 2;
    }
}

pub struct BufEntry {
    pub dev: u32,
    pub block: u32,
    pub size: u32,
    pub flags: BufFlags,
    /// Backing frame, or NO_FRAME before first use / after reclaim.
    pub frame: u32,

    next_hash: u16,
    prev_hash: u16,
    next_free: u16,
    prev_free: u16,
    next_dirty: u16,
    prev_dirty: u16,
    /// Slot has been handed out by `grow` and not reclaimed.
    in_pool: bool,
}

impl BufEntry {
    const fn zero() -> Self {
        Self {
            dev: 0,
            block: 0,
            size: 0,
            flags: BufFlags::empty(),
            frame: NO_FRAME,
            next_hash: NO_BUF,
            prev_hash: NO_BUF,
            next_free: NO_BUF,
            prev_free: NO_BUF,
            next_dirty: NO_BUF,
            prev_dirty: NO_BUF,
            in_pool: false,
        }
    }

    pub fn dirty(&self) -> bool {
        self.flags.contains(BufFlags::DIRTY)
    }

    pub fn valid(&self) -> bool {
        self.flags.contains(BufFlags::VALID)
    }

    fn locked(&self) -> bool {
        self.flags.contains(BufFlags::LOCKED)
    }
}

const fn buf_hash(dev: u32, block: u32) -> usize {
    ((dev ^ block) as usize) % NR_BUF_HASH
}

/// Outcome of the non-sleeping half of `getblk`.
#[derive(Debug, PartialEq)]
pub enum GetBlk {
    /// Locked cache hit; data may or may not be valid.
    Hit(u16),
    /// The wanted buffer is locked by someone else; sleep and retry.
    Wait,
    /// Free list empty and pool at capacity; sleep on a release.
    NoneFree,
    /// A locked LRU victim still carrying its old identity. If dirty it
    /// must be written out and released before retrying; if clean the
    /// caller assigns the new identity.
    Victim(u16),
}

pub struct Bcache {
    pool: [BufEntry; NBUF],
    hash: [u16; NR_BUF_HASH],
    /// LRU list: head is reused first, releases go to the tail unless
    /// the buffer is invalid.
    free_head: u16,
    free_tail: u16,
    dirty_head: u16,
    dirty_tail: u16,
    /// Slots never handed out yet; pool growth takes from here.
    unused_head: u16,
    pub nr_buffers: usize,
    pub nr_dirty: usize,
}

impl Bcache {
    pub const fn zero() -> Self {
        Self {
            pool: array![_ => BufEntry::zero(); NBUF],
            hash: [NO_BUF; NR_BUF_HASH],
            free_head: NO_BUF,
            free_tail: NO_BUF,
            dirty_head: NO_BUF,
            dirty_tail: NO_BUF,
            unused_head: NO_BUF,
            nr_buffers: 0,
            nr_dirty: 0,
        }
    }

    pub fn init(&mut self) {
        self.unused_head = NO_BUF;
        for idx in (0..NBUF as u16).rev() {
            self.pool[idx as usize].next_free = self.unused_head;
            self.unused_head = idx;
        }
    }

    /// Dirty-buffer count that wakes the flusher.
    pub fn max_dirty(&self) -> usize {
        NBUF * BUFFER_DIRTY_RATIO / 100
    }

    pub fn buf(&self, idx: u16) -> &BufEntry {
        &self.pool[idx as usize]
    }

    pub fn buf_mut(&mut self, idx: u16) -> &mut BufEntry {
        &mut self.pool[idx as usize]
    }

    fn hash_of(&self, idx: u16) -> usize {
        let b = &self.pool[idx as usize];
        buf_hash(b.dev, b.block)
    }

    fn insert_hash(&mut self, idx: u16) {
        let bucket = self.hash_of(idx);
        let head = self.hash[bucket];
        let b = &mut self.pool[idx as usize];
        b.prev_hash = NO_BUF;
        b.next_hash = head;
        if head != NO_BUF {
            self.pool[head as usize].prev_hash = idx;
        }
        self.hash[bucket] = idx;
    }

    fn remove_hash(&mut self, idx: u16) {
        let bucket = self.hash_of(idx);
        let (prev, next) = {
            let b = &self.pool[idx as usize];
            (b.prev_hash, b.next_hash)
        };
        if prev != NO_BUF {
            self.pool[prev as usize].next_hash = next;
        } else if self.hash[bucket] == idx {
            self.hash[bucket] = next;
        }
        if next != NO_BUF {
            self.pool[next as usize].prev_hash = prev;
        }
        let b = &mut self.pool[idx as usize];
        b.prev_hash = NO_BUF;
        b.next_hash = NO_BUF;
    }

    fn push_free_tail(&mut self, idx: u16) {
        let tail = self.free_tail;
        let b = &mut self.pool[idx as usize];
        b.next_free = NO_BUF;
        b.prev_free = tail;
        if tail != NO_BUF {
            self.pool[tail as usize].next_free = idx;
        } else {
            self.free_head = idx;
        }
        self.free_tail = idx;
    }

    fn push_free_head(&mut self, idx: u16) {
        let head = self.free_head;
        let b = &mut self.pool[idx as usize];
        b.prev_free = NO_BUF;
        b.next_free = head;
        if head != NO_BUF {
            self.pool[head as usize].prev_free = idx;
        } else {
            self.free_tail = idx;
        }
        self.free_head = idx;
    }

    fn remove_free(&mut self, idx: u16) {
        let (prev, next) = {
            let b = &self.pool[idx as usize];
            (b.prev_free, b.next_free)
        };
        if prev != NO_BUF {
            self.pool[prev as usize].next_free = next;
        } else if self.free_head == idx {
            self.free_head = next;
        }
        if next != NO_BUF {
            self.pool[next as usize].prev_free = prev;
        } else if self.free_tail == idx {
            self.free_tail = prev;
        }
        let b = &mut self.pool[idx as usize];
        b.prev_free = NO_BUF;
        b.next_free = NO_BUF;
    }

    fn on_dirty_list(&self, idx: u16) -> bool {
        let b = &self.pool[idx as usize];
        b.prev_dirty != NO_BUF || b.next_dirty != NO_BUF || self.dirty_head == idx
    }

    fn push_dirty_tail(&mut self, idx: u16) {
        if self.on_dirty_list(idx) {
            return;
        }
        let tail = self.dirty_tail;
        let b = &mut self.pool[idx as usize];
        b.next_dirty = NO_BUF;
        b.prev_dirty = tail;
        if tail != NO_BUF {
            self.pool[tail as usize].next_dirty = idx;
        } else {
            self.dirty_head = idx;
        }
        self.dirty_tail = idx;
        self.nr_dirty += 1;
    }

    fn remove_dirty(&mut self, idx: u16) {
        if !self.on_dirty_list(idx) {
            return;
        }
        let (prev, next) = {
            let b = &self.pool[idx as usize];
            (b.prev_dirty, b.next_dirty)
        };
        if prev != NO_BUF {
            self.pool[prev as usize].next_dirty = next;
        } else if self.dirty_head == idx {
            self.dirty_head = next;
        }
        if next != NO_BUF {
            self.pool[next as usize].prev_dirty = prev;
        } else if self.dirty_tail == idx {
            self.dirty_tail = prev;
        }
        let b = &mut self.pool[idx as usize];
        b.prev_dirty = NO_BUF;
        b.next_dirty = NO_BUF;
        self.nr_dirty -= 1;
    }

    pub fn lookup(&self, dev: u32, block: u32, size: u32) -> Option<u16> {
        let mut idx = self.hash[buf_hash(dev, block)];
        while idx != NO_BUF {
            let b = &self.pool[idx as usize];
            if b.dev == dev && b.block == block && b.size == size {
                return Some(idx);
            }
            idx = b.next_hash;
        }
        None
    }

    /// Add one slot to the pool, locked, with no identity yet.
    fn grow(&mut self) -> Option<u16> {
        let idx = self.unused_head;
        if idx == NO_BUF {
            return None;
        }
        self.unused_head = self.pool[idx as usize].next_free;
        let b = &mut self.pool[idx as usize];
        *b = BufEntry::zero();
        b.in_pool = true;
        b.flags = BufFlags::LOCKED;
        self.nr_buffers += 1;
        Some(idx)
    }

    /// The non-sleeping core of `getblk`. On `Hit`/`Victim` the returned
    /// buffer is locked and off the free list.
    pub fn try_getblk(&mut self, dev: u32, block: u32, size: u32) -> GetBlk {
        if let Some(idx) = self.lookup(dev, block, size) {
            if self.pool[idx as usize].locked() {
                return GetBlk::Wait;
            }
            self.remove_free(idx);
            self.pool[idx as usize].flags.insert(BufFlags::LOCKED);
            return GetBlk::Hit(idx);
        }

        // Miss: grow the pool if below the cap, otherwise recycle the
        // least-recently-used free buffer.
        if let Some(idx) = self.grow() {
            return GetBlk::Victim(idx);
        }
        let idx = self.free_head;
        if idx == NO_BUF {
            return GetBlk::NoneFree;
        }
        self.remove_free(idx);
        self.pool[idx as usize].flags.insert(BufFlags::LOCKED);
        GetBlk::Victim(idx)
    }

    /// Rekey a locked victim to a new identity; data becomes invalid.
    pub fn assign(&mut self, idx: u16, dev: u32, block: u32, size: u32) {
        debug_assert!(self.pool[idx as usize].locked());
        debug_assert!(!self.pool[idx as usize].dirty());
        if self.pool[idx as usize].size != 0 {
            self.remove_hash(idx);
        }
        let b = &mut self.pool[idx as usize];
        b.dev = dev;
        b.block = block;
        b.size = size;
        b.flags.remove(BufFlags::VALID);
        self.insert_hash(idx);
    }

    /// The non-sleeping core of `brelse`: back to the free list, MRU end,
    /// or the LRU end when invalid so stale slots are reused first.
    pub fn release(&mut self, idx: u16) {
        let b = &mut self.pool[idx as usize];
        debug_assert!(b.locked(), "brelse of unlocked buffer");
        if b.dirty() {
            self.push_dirty_tail(idx);
        }
        if self.pool[idx as usize].valid() {
            self.push_free_tail(idx);
        } else {
            self.push_free_head(idx);
        }
        self.pool[idx as usize].flags.remove(BufFlags::LOCKED);
    }

    /// Pop the oldest dirty buffer, locked and delisted, for writing.
    pub fn take_dirty(&mut self) -> Option<u16> {
        let mut idx = self.dirty_head;
        while idx != NO_BUF {
            if !self.pool[idx as usize].locked() {
                self.remove_dirty(idx);
                self.remove_free(idx);
                self.pool[idx as usize].flags.insert(BufFlags::LOCKED);
                return Some(idx);
            }
            idx = self.pool[idx as usize].next_dirty;
        }
        None
    }

    /// Put a still-dirty buffer back (write failed or wrong device).
    pub fn requeue_dirty(&mut self, idx: u16) {
        debug_assert!(self.pool[idx as usize].locked());
        self.push_dirty_tail(idx);
        self.push_free_tail(idx);
        self.pool[idx as usize].flags.remove(BufFlags::LOCKED);
    }

    pub fn mark_clean(&mut self, idx: u16) {
        self.pool[idx as usize].flags.remove(BufFlags::DIRTY);
    }

    pub fn mark_dirty(&mut self, idx: u16) {
        self.pool[idx as usize]
            .flags
            .insert(BufFlags::DIRTY | BufFlags::VALID);
    }

    /// Drop every unlocked buffer belonging to `dev` from the hash.
    /// Returns whether a locked buffer was skipped, so the caller can
    /// sleep and retry.
    pub fn invalidate_dev(&mut self, dev: u32) -> bool {
        let mut skipped = false;
        for idx in 0..NBUF as u16 {
            let b = &self.pool[idx as usize];
            if !b.in_pool || b.dev != dev || b.size == 0 {
                continue;
            }
            if b.locked() {
                skipped = true;
                continue;
            }
            self.remove_hash(idx);
            self.remove_dirty(idx);
            let b = &mut self.pool[idx as usize];
            b.flags.remove(BufFlags::VALID | BufFlags::DIRTY);
            b.size = 0;
            // Stays on the free list; now invalid, so move to the head.
            self.remove_free(idx);
            self.push_free_head(idx);
        }
        skipped
    }

    /// Detach one clean LRU buffer and return its frame for the page
    /// allocator. Dirty victims are surfaced to the caller instead.
    pub fn reclaim_one(&mut self) -> Option<(u16, u32)> {
        let idx = self.free_head;
        if idx == NO_BUF {
            return None;
        }
        self.remove_free(idx);
        if self.pool[idx as usize].dirty() {
            // Caller must sync it first; hand it back locked.
            self.pool[idx as usize].flags.insert(BufFlags::LOCKED);
            return Some((idx, NO_FRAME));
        }
        if self.pool[idx as usize].size != 0 {
            self.remove_hash(idx);
        }
        let b = &mut self.pool[idx as usize];
        let frame = b.frame;
        *b = BufEntry::zero();
        b.next_free = self.unused_head;
        self.unused_head = idx;
        self.nr_buffers -= 1;
        Some((idx, frame))
    }
}

/// A locked buffer held by a caller. Not `Clone`; `brelse` or `bwrite`
/// consumes it; silently dropping one would leak the buffer lock.
pub struct BufRef {
    idx: u16,
    pub dev: u32,
    pub block: u32,
    pub size: u32,
}

impl Drop for BufRef {
    fn drop(&mut self) {
        panic!("buffer dropped without brelse");
    }
}

impl BufRef {
    pub fn idx(&self) -> u16 {
        self.idx
    }

    /// The buffer's bytes, via the kernel mapping of its frame.
    pub fn data(&self) -> &mut [u8] {
        let bcache = kernel().bcache.lock();
        let frame = bcache.buf(self.idx).frame;
        drop(bcache);
        let ft = kernel().frames.lock();
        let bytes = unsafe { crate::page::frame_bytes(&ft, frame) };
        &mut bytes[..self.size as usize]
    }
}

/// Wait channels: one for lock collisions, one for free-list exhaustion.
pub static BUFFER_WAIT: WaitChannel = WaitChannel::new();
pub static BUFFER_FREE_WAIT: WaitChannel = WaitChannel::new();
/// The flusher sleeps here until the dirty count passes the watermark.
pub static FLUSHD_WAIT: WaitChannel = WaitChannel::new();

fn write_one(dev: u32, block: u32, size: u32, frame: u32) -> Result<()> {
    let d = kernel().devices.get(BLK_DEV, dev).ok_or(Errno::ENXIO)?;
    let ft = kernel().frames.lock();
    let bytes = unsafe { crate::page::frame_bytes(&ft, frame) };
    drop(ft);
    d.bops.write_block(dev, block, &bytes[..size as usize], size)
}

fn read_one(dev: u32, block: u32, size: u32, frame: u32) -> Result<()> {
    let d = kernel().devices.get(BLK_DEV, dev).ok_or(Errno::ENXIO)?;
    let ft = kernel().frames.lock();
    let bytes = unsafe { crate::page::frame_bytes(&ft, frame) };
    drop(ft);
    d.bops.read_block(dev, block, &mut bytes[..size as usize], size)
}

/// Return a locked buffer with the contents of the indicated block.
pub fn bread(dev: u32, block: u32, size: u32) -> Result<BufRef> {
    loop {
        let mut bcache = kernel().bcache.lock();
        match bcache.try_getblk(dev, block, size) {
            GetBlk::Hit(idx) => {
                drop(bcache);
                return fill(idx, dev, block, size);
            }
            GetBlk::Wait => {
                BUFFER_WAIT.sleep(&mut bcache);
            }
            GetBlk::NoneFree => {
                FLUSHD_WAIT.wakeup();
                BUFFER_FREE_WAIT.sleep(&mut bcache);
            }
            GetBlk::Victim(idx) => {
                let dirty = bcache.buf(idx).dirty();
                if dirty {
                    let (vdev, vblock, vsize, vframe) = {
                        let b = bcache.buf(idx);
                        (b.dev, b.block, b.size, b.frame)
                    };
                    drop(bcache);
                    // Flush the old identity before reuse; an error keeps
                    // it dirty and we just try the next victim.
                    let wrote = write_one(vdev, vblock, vsize, vframe).is_ok();
                    let mut bcache = kernel().bcache.lock();
                    if wrote {
                        bcache.remove_dirty(idx);
                        bcache.mark_clean(idx);
                    }
                    bcache.release(idx);
                    drop(bcache);
                    BUFFER_WAIT.wakeup();
                    continue;
                }
                // Attach a data frame on first use.
                if bcache.buf(idx).frame == NO_FRAME {
                    let frame = kernel().frames.lock().alloc();
                    match frame {
                        Some(f) => bcache.buf_mut(idx).frame = f,
                        None => {
                            bcache.release(idx);
                            drop(bcache);
                            kernel().out_of_memory();
                            continue;
                        }
                    }
                }
                bcache.assign(idx, dev, block, size);
                drop(bcache);
                return fill(idx, dev, block, size);
            }
        }
    }
}

/// Read the block in if the (locked) buffer is not yet valid.
fn fill(idx: u16, dev: u32, block: u32, size: u32) -> Result<BufRef> {
    let (valid, frame) = {
        let bcache = kernel().bcache.lock();
        let b = bcache.buf(idx);
        (b.valid(), b.frame)
    };
    if !valid {
        if let Err(e) = read_one(dev, block, size, frame) {
            brelse(BufRef {
                idx,
                dev,
                block,
                size,
            });
            return Err(e);
        }
        kernel()
            .bcache
            .lock()
            .buf_mut(idx)
            .flags
            .insert(BufFlags::VALID);
    }
    Ok(BufRef {
        idx,
        dev,
        block,
        size,
    })
}

/// Mark dirty and release; the actual write is the flusher's problem.
pub fn bwrite(buf: BufRef) {
    let mut bcache = kernel().bcache.lock();
    bcache.mark_dirty(buf.idx);
    let over = bcache.nr_dirty > bcache.max_dirty();
    bcache.release(buf.idx);
    drop(bcache);
    BUFFER_WAIT.wakeup();
    BUFFER_FREE_WAIT.wakeup();
    if over {
        FLUSHD_WAIT.wakeup();
    }
    core::mem::forget(buf);
}

pub fn brelse(buf: BufRef) {
    let mut bcache = kernel().bcache.lock();
    bcache.release(buf.idx);
    drop(bcache);
    BUFFER_WAIT.wakeup();
    BUFFER_FREE_WAIT.wakeup();
    core::mem::forget(buf);
}

/// Write every dirty buffer (of `dev`, or all when 0). A global sync
/// resource lock keeps concurrent syncs from interleaving; requeued
/// buffers of other devices end the pass when seen again.
pub fn sync_buffers(dev: u32) {
    let _sync = kernel().sync_resource.lock();
    let mut first: Option<u16> = None;
    loop {
        let mut bcache = kernel().bcache.lock();
        let idx = match bcache.take_dirty() {
            Some(idx) => idx,
            None => break,
        };
        if first == Some(idx) {
            bcache.requeue_dirty(idx);
            break;
        }
        let (bdev, bblock, bsize, bframe) = {
            let b = bcache.buf(idx);
            (b.dev, b.block, b.size, b.frame)
        };
        if dev != 0 && bdev != dev {
            if first.is_none() {
                first = Some(idx);
            }
            bcache.requeue_dirty(idx);
            continue;
        }
        drop(bcache);
        let ok = write_one(bdev, bblock, bsize, bframe).is_ok();
        let mut bcache = kernel().bcache.lock();
        if ok {
            bcache.mark_clean(idx);
            bcache.release(idx);
        } else {
            bcache.requeue_dirty(idx);
        }
        drop(bcache);
        BUFFER_WAIT.wakeup();
    }
}

/// Forget every buffer of a device (media change, umount).
pub fn invalidate_buffers(dev: u32) {
    loop {
        let mut bcache = kernel().bcache.lock();
        if !bcache.invalidate_dev(dev) {
            return;
        }
        // Someone holds a buffer of this device; wait for the release.
        BUFFER_WAIT.sleep(&mut bcache);
    }
}

/// Called by the page-pressure thread: give frames back to the allocator,
/// up to a fixed quota per pass.
pub fn reclaim_buffers() -> usize {
    let mut reclaimed = 0;
    while reclaimed < NR_BUF_RECLAIM {
        let mut bcache = kernel().bcache.lock();
        match bcache.reclaim_one() {
            None => break,
            Some((idx, NO_FRAME)) => {
                // Dirty victim: flush, release, retry.
                let (bdev, bblock, bsize, bframe) = {
                    let b = bcache.buf(idx);
                    (b.dev, b.block, b.size, b.frame)
                };
                drop(bcache);
                let ok = write_one(bdev, bblock, bsize, bframe).is_ok();
                let mut bcache = kernel().bcache.lock();
                if ok {
                    bcache.remove_dirty(idx);
                    bcache.mark_clean(idx);
                }
                bcache.release(idx);
            }
            Some((_, frame)) => {
                drop(bcache);
                if frame != NO_FRAME {
                    kernel().frames.lock().decref(frame);
                }
                reclaimed += 1;
            }
        }
    }
    BUFFER_WAIT.wakeup();
    if reclaimed > 0 {
        kernel().free_page_wait.wakeup();
    }
    reclaimed
}

/// The flusher thread: block until the dirty count passes the high
/// watermark, then write batches until it drops below, yielding between
/// batches.
pub fn kbdflushd() -> ! {
    loop {
        {
            let mut bcache = kernel().bcache.lock();
            while bcache.nr_dirty <= bcache.max_dirty() {
                FLUSHD_WAIT.sleep(&mut bcache);
            }
        }
        let mut flushed = 0;
        loop {
            let mut bcache = kernel().bcache.lock();
            let idx = match bcache.take_dirty() {
                Some(idx) => idx,
                None => break,
            };
            let (bdev, bblock, bsize, bframe) = {
                let b = bcache.buf(idx);
                (b.dev, b.block, b.size, b.frame)
            };
            drop(bcache);
            let ok = write_one(bdev, bblock, bsize, bframe).is_ok();
            let mut bcache = kernel().bcache.lock();
            if ok {
                bcache.mark_clean(idx);
                bcache.release(idx);
                flushed += 1;
            } else {
                bcache.requeue_dirty(idx);
            }
            let below = bcache.nr_dirty < bcache.max_dirty();
            drop(bcache);
            BUFFER_WAIT.wakeup();
            if flushed == NR_BUF_RECLAIM {
                if below {
                    break;
                }
                flushed = 0;
                kernel().procs.yield_cpu();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Bcache {
        let mut c = Bcache::zero();
        c.init();
        c
    }

    fn get(c: &mut Bcache, dev: u32, block: u32) -> u16 {
        match c.try_getblk(dev, block, 1024) {
            GetBlk::Hit(i) => i,
            GetBlk::Victim(i) => {
                if c.buf(i).frame == NO_FRAME {
                    c.buf_mut(i).frame = block; // stand-in frame
                }
                c.assign(i, dev, block, 1024);
                i
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn at_most_one_buffer_per_identity() {
        let mut c = cache();
        let a = get(&mut c, 3, 40);
        c.release(a);
        let b = get(&mut c, 3, 40);
        assert_eq!(a, b);
        assert_eq!(c.nr_buffers, 1);
        // Same block, different size is a distinct identity.
        c.release(b);
        let d = get(&mut c, 3, 40);
        assert_eq!(d, b);
    }

    #[test]
    fn locked_hit_asks_caller_to_wait() {
        let mut c = cache();
        let a = get(&mut c, 1, 7);
        assert_eq!(c.try_getblk(1, 7, 1024), GetBlk::Wait);
        c.release(a);
        assert_eq!(c.try_getblk(1, 7, 1024), GetBlk::Hit(a));
    }

    #[test]
    fn released_valid_buffer_can_be_rehit() {
        let mut c = cache();
        let a = get(&mut c, 1, 9);
        c.buf_mut(a).flags.insert(BufFlags::VALID);
        c.release(a);
        match c.try_getblk(1, 9, 1024) {
            GetBlk::Hit(i) => {
                assert_eq!(i, a);
                assert!(c.buf(i).valid());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pool_grows_to_cap_then_recycles_lru() {
        let mut c = cache();
        for block in 0..NBUF as u32 {
            let i = get(&mut c, 1, block);
            c.buf_mut(i).flags.insert(BufFlags::VALID);
            c.release(i);
        }
        assert_eq!(c.nr_buffers, NBUF);
        // Next miss recycles block 0, the least recently used.
        let v = get(&mut c, 1, 5000);
        assert_eq!(c.nr_buffers, NBUF);
        assert!(!c.buf(v).valid());
        assert_eq!(c.lookup(1, 0, 1024), None);
        assert_eq!(c.lookup(1, 5000, 1024), Some(v));
    }

    #[test]
    fn invalid_buffers_are_reused_first() {
        let mut c = cache();
        for block in 0..NBUF as u32 {
            let i = get(&mut c, 1, block);
            c.buf_mut(i).flags.insert(BufFlags::VALID);
            c.release(i);
        }
        // Invalidate one identity; it moves to the LRU head.
        let target = c.lookup(1, 10, 1024).unwrap();
        c.invalidate_dev(0); // no-op: nothing on dev 0
        let i = target;
        c.remove_free(i);
        c.buf_mut(i).flags.remove(BufFlags::VALID);
        c.push_free_head(i); // what release() does for invalid buffers
        let v = get(&mut c, 2, 1);
        assert_eq!(v, target);
    }

    #[test]
    fn dirty_list_fifo_and_watermark() {
        let mut c = cache();
        let mut order = [0u16; 3];
        for (n, block) in [11u32, 22, 33].iter().enumerate() {
            let i = get(&mut c, 1, *block);
            c.mark_dirty(i);
            c.release(i);
            order[n] = i;
        }
        assert_eq!(c.nr_dirty, 3);
        assert!(c.nr_dirty <= c.max_dirty());
        for expect in order {
            let got = c.take_dirty().unwrap();
            assert_eq!(got, expect);
            c.mark_clean(got);
            c.release(got);
        }
        assert_eq!(c.nr_dirty, 0);
        assert!(c.take_dirty().is_none());
    }

    #[test]
    fn dirty_release_keeps_buffer_findable() {
        let mut c = cache();
        let i = get(&mut c, 4, 8);
        c.mark_dirty(i);
        c.release(i);
        // Dirty and free at once: a re-hit must remove it from the free
        // list but leave it dirty.
        match c.try_getblk(4, 8, 1024) {
            GetBlk::Hit(j) => {
                assert_eq!(i, j);
                assert!(c.buf(j).dirty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalidate_dev_drops_identities() {
        let mut c = cache();
        let a = get(&mut c, 1, 3);
        c.buf_mut(a).flags.insert(BufFlags::VALID);
        c.release(a);
        let b = get(&mut c, 2, 3);
        c.buf_mut(b).flags.insert(BufFlags::VALID);
        c.release(b);
        assert!(!c.invalidate_dev(1));
        assert_eq!(c.lookup(1, 3, 1024), None);
        assert_eq!(c.lookup(2, 3, 1024), Some(b));
    }

    #[test]
    fn invalidate_skips_locked_buffers() {
        let mut c = cache();
        let a = get(&mut c, 1, 3);
        assert!(c.invalidate_dev(1));
        assert_eq!(c.lookup(1, 3, 1024), Some(a));
    }

    #[test]
    fn reclaim_returns_frames_and_shrinks_pool() {
        let mut c = cache();
        for block in 0..4u32 {
            let i = get(&mut c, 1, block);
            c.buf_mut(i).flags.insert(BufFlags::VALID);
            c.release(i);
        }
        assert_eq!(c.nr_buffers, 4);
        let (_, frame) = c.reclaim_one().unwrap();
        assert_ne!(frame, NO_FRAME);
        assert_eq!(c.nr_buffers, 3);
        assert_eq!(c.lookup(1, 0, 1024), None);
    }
}
