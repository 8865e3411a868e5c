//! Per-process virtual memory.
//!
//! An address space is a two-level x86-32 page table plus a sorted list
//! of VMA regions. The kernel half (above PAGE_OFFSET) is shared by all
//! address spaces and never copied. Regions are non-overlapping, sorted
//! by start, and adjacent compatible regions are merged on insert.

use core::fmt::{self, Write};

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    arch::x86::{
        invalidate_tlb, pde_index, pg_round_down, pg_round_up, pte_index, PteFlags, PAGE_MASK,
        PAGE_OFFSET, PAGE_SHIFT, PAGE_SIZE, PD_ENTRIES, PT_ENTRIES,
    },
    errno::{Errno, Result},
    fs::InodeRef,
    kernel::kernel,
    page::{p2v, v2p, NO_FRAME},
    param::NVMA,
};

pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;
pub const PROT_EXEC: u32 = 4;

pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_TYPE: u32 = 0x0f;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANONYMOUS: u32 = 0x20;
/// Internal: demand-filled pages are zeroed.
pub const ZERO_PAGE: u32 = 0x8000_0000;

/// Floor of the address-space search for non-fixed mmaps.
pub const MMAP_START: usize = 0x4000_0000;

/// Stack faults at most this far below the stack pointer count as
/// plausible pushes.
pub const STACK_SLACK: usize = 32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VmaType {
    Text,
    Data,
    Bss,
    Heap,
    Stack,
    Mmap,
    Shm,
}

impl VmaType {
    fn section(&self) -> &'static str {
        match self {
            VmaType::Text => "text",
            VmaType::Data => "data",
            VmaType::Bss => "bss",
            VmaType::Heap => "heap",
            VmaType::Stack => "stack",
            VmaType::Mmap => "mmap",
            VmaType::Shm => "shm",
        }
    }
}

/// One contiguous region `[start, end)` of homogeneous protection and
/// backing.
#[derive(Copy, Clone, Debug)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub prot: u32,
    pub flags: u32,
    pub typ: VmaType,
    pub inode: Option<InodeRef>,
    pub offset: u32,
    /// Open mode of the backing file at mmap time.
    pub o_mode: u32,
}

impl Vma {
    fn shares_backing(&self, other: &Vma) -> bool {
        match (self.inode, other.inode) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Adjacent regions merge when everything but the boundary matches
    /// and the file offsets are continuous.
    fn can_merge(&self, next: &Vma) -> bool {
        self.end == next.start
            && self.prot == next.prot
            && self.flags == next.flags
            && self.typ == next.typ
            && self.typ != VmaType::Shm
            && self.shares_backing(next)
            && (self.inode.is_none()
                || self.offset as usize + (self.end - self.start) == next.offset as usize)
    }
}

/// The sorted, non-overlapping region list.
pub struct VmaList {
    regions: ArrayVec<Vma, NVMA>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self {
            regions: ArrayVec::new_const(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Insert keeping the list sorted; merge with both neighbors where
    /// compatible.
    pub fn insert(&mut self, vma: Vma) -> Result<()> {
        debug_assert!(vma.start < vma.end);
        if self.find_intersection(vma.start, vma.end).is_some() {
            return Err(Errno::EINVAL);
        }
        let pos = self
            .regions
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.regions.len());
        self.regions
            .try_insert(pos, vma)
            .map_err(|_| Errno::ENOMEM)?;

        // Merge right, then left.
        if pos + 1 < self.regions.len() && self.regions[pos].can_merge(&self.regions[pos + 1]) {
            self.regions[pos].end = self.regions[pos + 1].end;
            let _ = self.regions.remove(pos + 1);
        }
        if pos > 0 && self.regions[pos - 1].can_merge(&self.regions[pos]) {
            self.regions[pos - 1].end = self.regions[pos].end;
            let _ = self.regions.remove(pos);
        }
        Ok(())
    }

    /// Region containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&Vma> {
        if addr == 0 {
            return None;
        }
        let addr = addr & PAGE_MASK;
        self.regions
            .iter()
            .find(|v| addr >= v.start && addr < v.end)
    }

    pub fn find_mut(&mut self, addr: usize) -> Option<&mut Vma> {
        if addr == 0 {
            return None;
        }
        let addr = addr & PAGE_MASK;
        self.regions
            .iter_mut()
            .find(|v| addr >= v.start && addr < v.end)
    }

    /// Any region intersecting `[start, end)`.
    pub fn find_intersection(&self, start: usize, end: usize) -> Option<&Vma> {
        self.regions
            .iter()
            .take_while(|v| v.start < end)
            .find(|v| start < v.end)
    }

    /// First free `length`-byte range above the mmap floor.
    pub fn unmapped_area(&self, length: usize) -> Option<usize> {
        if length == 0 {
            return None;
        }
        let mut addr = MMAP_START;
        for v in &self.regions {
            if v.end <= addr {
                continue;
            }
            if v.start >= addr + length {
                break;
            }
            addr = pg_round_up(v.end);
        }
        if addr + length <= PAGE_OFFSET {
            Some(addr)
        } else {
            None
        }
    }

    /// Carve `[start, start+length)` out of the list, splitting a
    /// region that spans it. Returns the affected copy for the caller's
    /// page work.
    pub fn remove_range(&mut self, start: usize, length: usize) -> Option<Vma> {
        let pos = self
            .regions
            .iter()
            .position(|v| start >= v.start && start < v.end)?;
        let mut v = self.regions[pos];
        let end = core::cmp::min(start + length, v.end);

        if v.start == start && v.end == end {
            let _ = self.regions.remove(pos);
        } else if v.start == start {
            self.regions[pos].start = end;
            if v.inode.is_some() {
                self.regions[pos].offset += (end - v.start) as u32;
            }
        } else if v.end == end {
            self.regions[pos].end = start;
        } else {
            // Split: shrink the front, insert the tail.
            self.regions[pos].end = start;
            let mut tail = v;
            tail.start = end;
            if tail.inode.is_some() {
                tail.offset += (end - v.start) as u32;
            }
            let _ = self.regions.try_insert(pos + 1, tail);
        }
        v.start = start;
        v.end = end;
        Some(v)
    }

    /// Grow the stack region down to cover a fault at `addr`, if `addr`
    /// sits between the previous region and the stack and plausibly
    /// near the user stack pointer `usp`.
    pub fn grow_stack(&mut self, addr: usize, usp: usize) -> bool {
        if addr + STACK_SLACK < usp || addr >= PAGE_OFFSET {
            return false;
        }
        let pos = match self
            .regions
            .iter()
            .position(|v| v.typ == VmaType::Stack && addr < v.start)
        {
            Some(pos) => pos,
            None => return false,
        };
        if pos > 0 && addr < self.regions[pos - 1].end {
            return false;
        }
        self.regions[pos].start = addr & PAGE_MASK;
        true
    }

    /// Move the heap break; fails if the new end would collide with the
    /// next region.
    pub fn expand_heap(&mut self, new_end: usize) -> Result<usize> {
        let pos = self
            .regions
            .iter()
            .position(|v| v.typ == VmaType::Heap)
            .ok_or(Errno::ENOMEM)?;
        if let Some(next) = self.regions.get(pos + 1) {
            if new_end > next.start {
                return Err(Errno::ENOMEM);
            }
        }
        if new_end <= self.regions[pos].start {
            return Err(Errno::EINVAL);
        }
        self.regions[pos].end = new_end;
        Ok(new_end)
    }

    /// One line per region, the /proc/pid/maps layout:
    /// `start-end rwxp offset major:minor inode [section]`.
    pub fn format_maps(&self, out: &mut impl Write) -> fmt::Result {
        for v in &self.regions {
            let r = if v.prot & PROT_READ != 0 { 'r' } else { '-' };
            let w = if v.prot & PROT_WRITE != 0 { 'w' } else { '-' };
            let x = if v.prot & PROT_EXEC != 0 { 'x' } else { '-' };
            let s = if v.flags & MAP_SHARED != 0 { 's' } else { 'p' };
            let (maj, min, ino) = match v.inode {
                Some(ino) => {
                    let (dev, inum) = kernel().itable.with(ino, |i| (i.dev, i.inum));
                    (crate::dev::major(dev), crate::dev::minor(dev), inum)
                }
                None => (0, 0, 0),
            };
            writeln!(
                out,
                "{:08x}-{:08x} {}{}{}{} {:08x} {:02x}:{:02x} {} [{}]",
                v.start,
                v.end,
                r,
                w,
                x,
                s,
                v.offset,
                maj,
                min,
                ino,
                v.typ.section()
            )?;
        }
        Ok(())
    }
}

/// A process address space: page directory plus regions.
pub struct UserMemory {
    /// Physical address of the page directory; 0 when uninitialized.
    pub pgdir: usize,
    pub vmas: VmaList,
    /// Resident pages, for accounting.
    pub rss: u32,
}

impl UserMemory {
    pub const fn uninit() -> Self {
        Self {
            pgdir: 0,
            vmas: VmaList::new(),
            rss: 0,
        }
    }

    pub fn find_vma(&self, addr: usize) -> Option<&Vma> {
        self.vmas.find(addr)
    }

    /// Fresh page directory with the kernel half copied from the master
    /// directory.
    pub fn new_pgdir() -> Result<usize> {
        let frame = kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?;
        let pa = kernel().frames.lock().addr_of(frame);
        let dir = unsafe { &mut *(p2v(pa) as *mut [usize; PD_ENTRIES]) };
        let master = kernel().master_pgdir();
        let kstart = pde_index(PAGE_OFFSET);
        for i in 0..PD_ENTRIES {
            dir[i] = if i >= kstart {
                unsafe { (*(p2v(master) as *const [usize; PD_ENTRIES]))[i] }
            } else {
                0
            };
        }
        Ok(pa)
    }

    fn pte_ptr(&self, addr: usize, alloc: bool) -> Option<*mut usize> {
        debug_assert!(self.pgdir != 0);
        let dir = unsafe { &mut *(p2v(self.pgdir) as *mut [usize; PD_ENTRIES]) };
        let pde = &mut dir[pde_index(addr)];
        if *pde & PteFlags::PRESENT.bits() == 0 {
            if !alloc {
                return None;
            }
            let frame = kernel().frames.lock().alloc()?;
            let pa = kernel().frames.lock().addr_of(frame);
            unsafe { (p2v(pa) as *mut [usize; PT_ENTRIES]).write_bytes(0, 1) };
            *pde = pa | (PteFlags::PRESENT | PteFlags::RW | PteFlags::USER).bits();
        }
        let table = unsafe { &mut *(p2v(*pde & PAGE_MASK) as *mut [usize; PT_ENTRIES]) };
        Some(&mut table[pte_index(addr)] as *mut usize)
    }

    fn prot_to_pte(prot: u32) -> PteFlags {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if prot & PROT_WRITE != 0 {
            flags |= PteFlags::RW;
        }
        flags
    }

    /// Install `frame` at `addr`. A zero `frame` allocates a fresh one.
    /// Returns the frame installed.
    pub fn map_page(&mut self, addr: usize, frame: u32, prot: u32) -> Result<u32> {
        let frame = if frame == NO_FRAME {
            kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?
        } else {
            kernel().frames.lock().incref(frame);
            frame
        };
        let pte = self
            .pte_ptr(pg_round_down(addr), true)
            .ok_or(Errno::ENOMEM)?;
        let pa = kernel().frames.lock().addr_of(frame);
        unsafe { *pte = pa | Self::prot_to_pte(prot).bits() };
        self.rss += 1;
        Ok(frame)
    }

    /// Drop the mapping at `addr`, dereferencing its frame.
    pub fn unmap_page(&mut self, addr: usize) {
        if let Some(pte) = self.pte_ptr(pg_round_down(addr), false) {
            let entry = unsafe { *pte };
            if entry & PteFlags::PRESENT.bits() != 0 {
                let mut frames = kernel().frames.lock();
                if let Some(frame) = frames.frame_of(entry & PAGE_MASK) {
                    frames.decref(frame);
                }
                unsafe { *pte = 0 };
                self.rss -= 1;
            }
        }
    }

    /// Resolve a user address to its PTE value, if mapped.
    pub fn probe(&self, addr: usize) -> Option<usize> {
        let pte = self.pte_ptr(pg_round_down(addr), false)?;
        let entry = unsafe { *pte };
        if entry & PteFlags::PRESENT.bits() != 0 {
            Some(entry)
        } else {
            None
        }
    }

    /// Clone for fork: regions are copied; writable private pages are
    /// not: both sides lose the write bit and gain COW, and the frame
    /// count goes up.
    pub fn clone_for_fork(&mut self) -> Result<UserMemory> {
        let mut child = UserMemory {
            pgdir: Self::new_pgdir()?,
            vmas: VmaList::new(),
            rss: 0,
        };
        for vma in self.vmas.iter() {
            let _ = child.vmas.insert(*vma);
            if let Some(ino) = vma.inode {
                let _ = kernel().itable.idup(ino);
            }
        }

        for vma in self.vmas.iter() {
            let cow = vma.flags & MAP_PRIVATE != 0 && vma.prot & PROT_WRITE != 0;
            for addr in num_iter::range_step(vma.start, vma.end, PAGE_SIZE) {
                if let Some(entry) = self.probe(addr) {
                    let pa = entry & PAGE_MASK;
                    let mut flags = PteFlags::from_bits_truncate(entry);
                    if cow && flags.contains(PteFlags::RW) {
                        flags.remove(PteFlags::RW);
                        flags.insert(PteFlags::COW);
                        // Demote the parent's mapping too.
                        if let Some(pte) = self.pte_ptr(addr, false) {
                            unsafe { *pte = pa | flags.bits() };
                        }
                    }
                    let cpte = child.pte_ptr(addr, true).ok_or(Errno::ENOMEM)?;
                    unsafe { *cpte = pa | flags.bits() };
                    let mut frames = kernel().frames.lock();
                    if let Some(frame) = frames.frame_of(pa) {
                        frames.incref(frame);
                    }
                    child.rss += 1;
                }
            }
        }
        invalidate_tlb();
        Ok(child)
    }

    /// The copy-on-write fault: copy when the frame is shared, just
    /// re-enable write when this is the last reference.
    pub fn wp_fault(&mut self, addr: usize) -> Result<()> {
        let entry = self.probe(addr).ok_or(Errno::EFAULT)?;
        let flags = PteFlags::from_bits_truncate(entry);
        if !flags.contains(PteFlags::COW) {
            // Not a CoW page: genuine protection violation.
            return Err(Errno::EFAULT);
        }
        let pa = entry & PAGE_MASK;
        let frame = {
            let frames = kernel().frames.lock();
            frames.frame_of(pa).ok_or(Errno::EFAULT)?
        };
        let count = kernel().frames.lock().refcount(frame);
        let pte = self.pte_ptr(addr, false).ok_or(Errno::EFAULT)?;
        if count > 1 {
            let new_frame = kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?;
            let new_pa = kernel().frames.lock().addr_of(new_frame);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    p2v(pa) as *const u8,
                    p2v(new_pa) as *mut u8,
                    PAGE_SIZE,
                );
                *pte = new_pa
                    | (PteFlags::PRESENT | PteFlags::RW | PteFlags::USER).bits();
            }
            kernel().frames.lock().decref(frame);
        } else {
            // Last reference: make it writable in place.
            unsafe {
                *pte = pa | (PteFlags::PRESENT | PteFlags::RW | PteFlags::USER).bits();
            }
        }
        invalidate_tlb();
        Ok(())
    }

    /// Release every user page and page table; the regions drop their
    /// inode references through the caller.
    pub fn release(&mut self) {
        if self.pgdir == 0 {
            return;
        }
        let mut regions: ArrayVec<Vma, NVMA> = ArrayVec::new();
        for v in self.vmas.iter() {
            let _ = regions.try_push(*v);
        }
        for vma in &regions {
            self.free_vma_pages(vma, vma.start, vma.end - vma.start);
            if let Some(ino) = vma.inode {
                kernel().itable.iput(ino);
            }
        }
        self.vmas.clear();

        // Free the user-half page tables and the directory itself.
        let dir = unsafe { &mut *(p2v(self.pgdir) as *mut [usize; PD_ENTRIES]) };
        for i in 0..pde_index(PAGE_OFFSET) {
            if dir[i] & PteFlags::PRESENT.bits() != 0 {
                let mut frames = kernel().frames.lock();
                if let Some(frame) = frames.frame_of(dir[i] & PAGE_MASK) {
                    frames.decref(frame);
                }
                dir[i] = 0;
            }
        }
        let mut frames = kernel().frames.lock();
        if let Some(frame) = frames.frame_of(self.pgdir) {
            frames.decref(frame);
        }
        self.pgdir = 0;
        self.rss = 0;
        invalidate_tlb();
    }

    /// Tear down the pages of `[start, start+length)` inside `vma`,
    /// writing dirty shared file pages back first.
    pub fn free_vma_pages(&mut self, vma: &Vma, start: usize, length: usize) {
        for addr in num_iter::range_step(start, start + length, PAGE_SIZE) {
            if let Some(entry) = self.probe(addr) {
                if vma.prot & PROT_WRITE != 0 && vma.flags & MAP_SHARED != 0 {
                    if let Some(ino) = vma.inode {
                        let offset = (addr - vma.start) as u32 + vma.offset;
                        write_shared_page(ino, offset, entry & PAGE_MASK);
                    }
                }
                self.unmap_page(addr);
            }
        }
    }
}

/// Write one dirty shared page back through the file's write operation.
fn write_shared_page(ino: InodeRef, offset: u32, pa: usize) {
    let ops = kernel().itable.with(ino, |i| i.ops);
    if let Some(ops) = ops {
        let bytes = unsafe { core::slice::from_raw_parts(p2v(pa) as *const u8, PAGE_SIZE) };
        let mut file = crate::file::OpenFile {
            inode: Some(ino),
            flags: crate::file::O_WRONLY,
            offset: offset as u64,
            count: 1,
            fops: ops.fops,
        };
        let _ = ops.fops.write(ino, &mut file, bytes);
    }
}

/// mmap(2) body, after argument fetch.
pub fn do_mmap(
    memory: &mut UserMemory,
    inode: Option<InodeRef>,
    start: usize,
    length: usize,
    prot: u32,
    mut flags: u32,
    offset: u32,
    typ: VmaType,
    o_mode: u32,
) -> Result<usize> {
    let length = pg_round_up(length);
    if length == 0 {
        return Ok(start);
    }
    if start > PAGE_OFFSET || start + length > PAGE_OFFSET {
        return Err(Errno::EINVAL);
    }

    if let Some(ino) = inode {
        let mode = kernel().itable.with(ino, |i| i.mode);
        if !crate::fs::stat::s_isreg(mode) && !crate::fs::stat::s_ischr(mode) {
            return Err(Errno::ENODEV);
        }
        // The file must have been opened with read permission whatever
        // the mapping protection asks for.
        if o_mode & crate::file::O_ACCMODE == crate::file::O_WRONLY {
            return Err(Errno::EACCES);
        }
        match flags & MAP_TYPE {
            MAP_SHARED => {
                if prot & PROT_WRITE != 0 && !crate::file::writable(o_mode) {
                    return Err(Errno::EACCES);
                }
            }
            MAP_PRIVATE => {}
            _ => return Err(Errno::EINVAL),
        }
        let _ = kernel().itable.idup(ino);
    } else {
        // Anonymous maps must be private (shared anonymous memory only
        // exists as SysV shm) and are zero-filled on demand.
        if flags & MAP_TYPE != MAP_PRIVATE {
            return Err(Errno::EINVAL);
        }
        if typ != VmaType::Shm {
            flags |= ZERO_PAGE;
        }
    }

    let start = if flags & MAP_FIXED != 0 {
        if start & !PAGE_MASK != 0 {
            if let Some(ino) = inode {
                kernel().itable.iput(ino);
            }
            return Err(Errno::EINVAL);
        }
        start
    } else {
        match memory.vmas.unmapped_area(length) {
            Some(a) => a,
            None => {
                if let Some(ino) = inode {
                    kernel().itable.iput(ino);
                }
                return Err(Errno::ENOMEM);
            }
        }
    };

    let vma = Vma {
        start,
        end: start + length,
        prot,
        flags,
        typ,
        inode,
        offset,
        o_mode,
    };

    if let Some(ino) = inode {
        let ops = kernel().itable.with(ino, |i| i.ops);
        if let Some(ops) = ops {
            if let Err(e) = ops.fops.mmap(ino, &vma) {
                kernel().itable.iput(ino);
                return Err(e);
            }
        }
    }

    if let Err(e) = memory.vmas.insert(vma) {
        if let Some(ino) = inode {
            kernel().itable.iput(ino);
        }
        return Err(e);
    }
    Ok(start)
}

/// munmap(2) body.
pub fn do_munmap(memory: &mut UserMemory, addr: usize, length: usize) -> Result<()> {
    if addr & !PAGE_MASK != 0 {
        return Err(Errno::EINVAL);
    }
    let mut length = pg_round_up(length);
    let mut addr = addr;
    while length > 0 {
        match memory.vmas.remove_range(addr, length) {
            Some(piece) => {
                let size = piece.end - piece.start;
                memory.free_vma_pages(&piece, piece.start, size);
                if let Some(ino) = piece.inode {
                    // Only a fully removed region drops its reference.
                    if memory
                        .vmas
                        .iter()
                        .all(|v| v.inode != Some(ino))
                    {
                        kernel().itable.iput(ino);
                    }
                }
                length -= size;
                addr += size;
            }
            None => {
                // Hole: skip a page and keep going.
                if length <= PAGE_SIZE {
                    break;
                }
                length -= PAGE_SIZE;
                addr += PAGE_SIZE;
            }
        }
    }
    invalidate_tlb();
    Ok(())
}

/// mprotect(2) body: split the affected range out, then reinsert it
/// with the new protection (merging handles re-coalescing).
pub fn do_mprotect(memory: &mut UserMemory, addr: usize, length: usize, prot: u32) -> Result<()> {
    if addr & !PAGE_MASK != 0 {
        return Err(Errno::EINVAL);
    }
    let length = pg_round_up(length);
    let mut cursor = addr;
    while cursor < addr + length {
        let piece = match memory.vmas.remove_range(cursor, addr + length - cursor) {
            Some(p) => p,
            None => return Err(Errno::ENOMEM),
        };
        let mut updated = piece;
        updated.prot = prot;
        memory.vmas.insert(updated)?;
        cursor = piece.end;
    }
    invalidate_tlb();
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        /// Raw copy into user space. The kernel runs on the faulting
        /// process's page tables, so user addresses are directly
        /// addressable; the fault handler covers not-yet-present pages.
        ///
        /// # Safety
        ///
        /// `addr` must have been validated against the VMA list (or the
        /// lazy check must be active).
        pub unsafe fn copy_to_user_raw(addr: usize, bytes: &[u8]) {
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
            }
        }

        /// Raw copy out of user space; see `copy_to_user_raw`.
        ///
        /// # Safety
        ///
        /// As for `copy_to_user_raw`.
        pub unsafe fn copy_from_user_raw(addr: usize, bytes: &mut [u8]) {
            unsafe {
                core::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), bytes.len());
            }
        }
    } else {
        /// # Safety
        ///
        /// Inert off the real machine.
        pub unsafe fn copy_to_user_raw(_addr: usize, _bytes: &[u8]) {}

        /// # Safety
        ///
        /// Inert off the real machine.
        pub unsafe fn copy_from_user_raw(_addr: usize, _bytes: &mut [u8]) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: usize, end: usize, prot: u32) -> Vma {
        Vma {
            start,
            end,
            prot,
            flags: MAP_PRIVATE | ZERO_PAGE,
            typ: VmaType::Mmap,
            inode: None,
            offset: 0,
            o_mode: 0,
        }
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        let mut l = VmaList::new();
        l.insert(anon(0x60000000, 0x60004000, PROT_READ)).unwrap();
        l.insert(anon(0x40000000, 0x40002000, PROT_READ)).unwrap();
        l.insert(anon(0x50000000, 0x50001000, PROT_READ | PROT_WRITE))
            .unwrap();
        let starts: std::vec::Vec<usize> = l.iter().map(|v| v.start).collect();
        assert_eq!(starts, [0x40000000, 0x50000000, 0x60000000]);
        for pair in starts.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // Overlap is refused.
        assert!(l.insert(anon(0x50000800, 0x50002000, PROT_READ)).is_err());
    }

    #[test]
    fn adjacent_compatible_regions_merge() {
        let mut l = VmaList::new();
        l.insert(anon(0x40000000, 0x40002000, PROT_READ)).unwrap();
        l.insert(anon(0x40002000, 0x40004000, PROT_READ)).unwrap();
        assert_eq!(l.len(), 1);
        let v = l.iter().next().unwrap();
        assert_eq!((v.start, v.end), (0x40000000, 0x40004000));
        // Different protection does not merge.
        l.insert(anon(0x40004000, 0x40005000, PROT_READ | PROT_WRITE))
            .unwrap();
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn merge_requires_offset_continuity() {
        let mut l = VmaList::new();
        let file = |start: usize, end: usize, offset: u32| Vma {
            start,
            end,
            prot: PROT_READ,
            flags: MAP_PRIVATE,
            typ: VmaType::Mmap,
            inode: Some(InodeRef::test_token()),
            offset,
            o_mode: 0,
        };
        l.insert(file(0x40000000, 0x40001000, 0)).unwrap();
        // Continuous offset merges.
        l.insert(file(0x40001000, 0x40002000, 0x1000)).unwrap();
        assert_eq!(l.len(), 1);
        // Discontinuous offset does not.
        l.insert(file(0x40002000, 0x40003000, 0x5000)).unwrap();
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn find_and_intersection() {
        let mut l = VmaList::new();
        l.insert(anon(0x40000000, 0x40003000, PROT_READ)).unwrap();
        assert!(l.find(0x40000fff).is_some());
        assert!(l.find(0x40003000).is_none());
        assert!(l.find(0).is_none());
        assert!(l.find_intersection(0x40002000, 0x40004000).is_some());
        assert!(l.find_intersection(0x40003000, 0x40004000).is_none());
    }

    #[test]
    fn unmapped_area_respects_floor_and_gaps() {
        let mut l = VmaList::new();
        assert_eq!(l.unmapped_area(0x2000), Some(MMAP_START));
        l.insert(anon(MMAP_START, MMAP_START + 0x3000, PROT_READ))
            .unwrap();
        assert_eq!(l.unmapped_area(0x1000), Some(MMAP_START + 0x3000));
        l.insert(anon(MMAP_START + 0x3000, MMAP_START + 0x5000, PROT_WRITE))
            .unwrap();
        assert_eq!(l.unmapped_area(0x1000), Some(MMAP_START + 0x5000));
    }

    #[test]
    fn remove_range_splits() {
        let mut l = VmaList::new();
        l.insert(anon(0x40000000, 0x40005000, PROT_READ)).unwrap();
        let piece = l.remove_range(0x40001000, 0x1000).unwrap();
        assert_eq!((piece.start, piece.end), (0x40001000, 0x40002000));
        let parts: std::vec::Vec<(usize, usize)> =
            l.iter().map(|v| (v.start, v.end)).collect();
        assert_eq!(
            parts,
            [(0x40000000, 0x40001000), (0x40002000, 0x40005000)]
        );
    }

    #[test]
    fn stack_grows_down_only_near_sp() {
        let mut l = VmaList::new();
        let mut stack = anon(0xbfff0000, 0xc0000000, PROT_READ | PROT_WRITE);
        stack.typ = VmaType::Stack;
        stack.flags = MAP_PRIVATE;
        l.insert(stack).unwrap();
        l.insert(anon(0x40000000, 0x40001000, PROT_READ)).unwrap();

        // Fault just below the region, near the stack pointer: grows.
        assert!(l.grow_stack(0xbffeffe0, 0xbffeffe4));
        assert_eq!(
            l.iter().find(|v| v.typ == VmaType::Stack).unwrap().start,
            0xbffef000
        );
        // Far below the stack pointer: refused.
        assert!(!l.grow_stack(0x80000000, 0xbffe0000));
        // Inside another region's range: refused.
        assert!(!l.grow_stack(0x40000800, 0x40000800));
    }

    #[test]
    fn heap_expansion_stops_at_next_region() {
        let mut l = VmaList::new();
        let mut heap = anon(0x08050000, 0x08060000, PROT_READ | PROT_WRITE);
        heap.typ = VmaType::Heap;
        l.insert(heap).unwrap();
        l.insert(anon(0x08100000, 0x08101000, PROT_READ)).unwrap();
        assert_eq!(l.expand_heap(0x08070000).unwrap(), 0x08070000);
        assert_eq!(l.expand_heap(0x08200000).unwrap_err(), Errno::ENOMEM);
    }

    #[test]
    fn maps_format_shape() {
        let mut l = VmaList::new();
        let mut v = anon(0x40000000, 0x40001000, PROT_READ | PROT_EXEC);
        v.typ = VmaType::Text;
        l.insert(v).unwrap();
        let mut out = std::string::String::new();
        l.format_maps(&mut out).unwrap();
        assert_eq!(
            out,
            "40000000-40001000 r-xp 00000000 00:00 0 [text]\n"
        );
    }
}
