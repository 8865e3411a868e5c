//! execve: replace the address space with a fresh ELF image.
//!
//! Text and data map demand-paged from the file; bss, heap and stack
//! are anonymous zero-fill regions. The initial stack carries argc, the
//! argv and envp vectors, the ELF auxiliary vector and the string area.
//! Close-on-exec descriptors close, signal dispositions fall back to
//! default unless ignored, and set-id bits update the effective ids.

use scopeguard::ScopeGuard;
use zerocopy::LayoutVerified;

use crate::{
    arch::x86::{pg_round_up, SigContext, PAGE_OFFSET, PAGE_SIZE, USER_CS, USER_DS},
    elf::{
        ElfHdr, ProgHdr, AT_BASE, AT_EGID, AT_ENTRY, AT_EUID, AT_FLAGS, AT_GID, AT_NULL,
        AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_UID, PF_W, PF_X,
    },
    errno::{Errno, Result},
    file::OpenFile,
    fs::{check_permission, namei, stat, InodeRef, PermMask},
    kernel::kernel,
    param::MAXARG,
    proc::current_proc_data,
    signal::{SigAction, SigHandler},
    vm::{
        do_mmap, UserMemory, VmaType, MAP_FIXED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
        ZERO_PAGE,
    },
};

/// User stack: one page of argument block at the very top of the user
/// half, growing down on demand from there.
pub const USER_STACK_TOP: usize = PAGE_OFFSET;

/// String-area budget. The whole `ArgBlock` must fit in one frame,
/// because exec builds it there rather than on the one-page kernel
/// stack.
const ARG_MAX_BYTES: usize = 3072;

static_assertions::const_assert!(core::mem::size_of::<ArgBlock>() <= PAGE_SIZE);

/// Read file bytes through the VFS at an absolute offset. The fault
/// handler also uses this to demand-fill mapped pages.
pub fn read_at(ino: InodeRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let ops = kernel().itable.with(ino, |i| i.ops).ok_or(Errno::EIO)?;
    let mut file = OpenFile {
        inode: Some(ino),
        flags: crate::file::O_RDONLY,
        offset,
        count: 1,
        fops: ops.fops,
    };
    ops.fops.read(ino, &mut file, buf)
}

/// The argument block carried across the address-space swap: string
/// bytes plus the index boundaries of argv and envp within them.
pub struct ArgBlock {
    bytes: [u8; ARG_MAX_BYTES],
    /// (offset, len) per string; argv first, then envp.
    entries: [(u16, u16); MAXARG * 2],
    pub argc: usize,
    pub envc: usize,
    used: usize,
}

impl ArgBlock {
    pub fn new() -> Self {
        Self {
            bytes: [0; ARG_MAX_BYTES],
            entries: [(0, 0); MAXARG * 2],
            argc: 0,
            envc: 0,
            used: 0,
        }
    }

    pub fn push(&mut self, s: &[u8], is_env: bool) -> Result<()> {
        if self.argc + self.envc >= MAXARG * 2 || (!is_env && self.argc >= MAXARG) {
            return Err(Errno::E2BIG);
        }
        if self.used + s.len() + 1 > ARG_MAX_BYTES {
            return Err(Errno::E2BIG);
        }
        self.bytes[self.used..self.used + s.len()].copy_from_slice(s);
        self.bytes[self.used + s.len()] = 0;
        self.entries[self.argc + self.envc] = (self.used as u16, (s.len() + 1) as u16);
        self.used += s.len() + 1;
        if is_env {
            self.envc += 1;
        } else {
            debug_assert_eq!(self.envc, 0, "argv after envp");
            self.argc += 1;
        }
        Ok(())
    }

    fn string(&self, n: usize) -> &[u8] {
        let (off, len) = self.entries[n];
        &self.bytes[off as usize..(off + len) as usize]
    }
}

/// Carve an `ArgBlock` out of a fresh frame, zero-initialized in place
/// (every field is a plain integer, so all-zeroes is the empty block).
pub fn alloc_arg_block() -> Result<&'static mut ArgBlock> {
    let frame = kernel().frames.lock().alloc().ok_or(Errno::ENOMEM)?;
    let frames = kernel().frames.lock();
    let bytes = unsafe { crate::page::frame_bytes(&frames, frame) };
    drop(frames);
    bytes.fill(0);
    Ok(unsafe { &mut *(bytes.as_mut_ptr() as *mut ArgBlock) })
}

pub fn free_arg_block(block: &'static mut ArgBlock) {
    let pa = crate::page::v2p(block as *mut ArgBlock as usize);
    let mut frames = kernel().frames.lock();
    if let Some(frame) = frames.frame_of(pa) {
        frames.decref(frame);
    }
}

/// Lay out the initial user stack inside `page`, which maps the
/// `[top - PAGE_SIZE, top)` range. Returns the initial user ESP.
///
/// Top-down: string area, AT pairs, envp vector, argv vector, argc.
pub fn build_arg_stack(
    page: &mut [u8; PAGE_SIZE],
    top: usize,
    args: &ArgBlock,
    aux: &[(u32, u32)],
) -> Result<usize> {
    fn w32(page: &mut [u8; PAGE_SIZE], base: usize, addr: usize, val: u32) {
        let off = addr - base;
        page[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    let nstrings = args.argc + args.envc;
    let vectors = 1 + (args.argc + 1) + (args.envc + 1) + aux.len() * 2;
    let need = args.used + vectors * 4;
    if need > PAGE_SIZE {
        return Err(Errno::E2BIG);
    }

    // Strings at the very top.
    let base = top - PAGE_SIZE;
    let strings_start = top - args.used;
    let dst = strings_start - base;
    page[dst..dst + args.used].copy_from_slice(&args.bytes[..args.used]);

    let mut string_addrs = [0u32; MAXARG * 2];
    let mut str_addr = strings_start;
    for n in 0..nstrings {
        string_addrs[n] = str_addr as u32;
        str_addr += args.string(n).len();
    }

    // Vectors below the strings, ending 4-aligned.
    let mut sp = (strings_start - vectors * 4) & !3;
    let start_sp = sp;

    w32(page, base, sp, args.argc as u32);
    sp += 4;
    for n in 0..args.argc {
        w32(page, base, sp, string_addrs[n]);
        sp += 4;
    }
    w32(page, base, sp, 0);
    sp += 4;
    for n in 0..args.envc {
        w32(page, base, sp, string_addrs[args.argc + n]);
        sp += 4;
    }
    w32(page, base, sp, 0);
    sp += 4;
    for &(tag, value) in aux {
        w32(page, base, sp, tag);
        sp += 4;
        w32(page, base, sp, value);
        sp += 4;
    }
    debug_assert_eq!(aux.last(), Some(&(AT_NULL, 0)));

    Ok(start_sp)
}

/// The execve body. On success the saved frame resumes at the new
/// entry point and never returns to the old image.
pub fn do_execve(path: &[u8], args: &ArgBlock, sc: &mut SigContext) -> Result<usize> {
    let itable = &kernel().itable;

    let ino = namei(path, true)?;
    let ino_guard = scopeguard::guard(ino, |ino| itable.iput(ino));

    let (mode, uid, gid, size) =
        itable.with(ino, |i| (i.mode, i.uid, i.gid, i.size));
    if !stat::s_isreg(mode) {
        return Err(Errno::EACCES);
    }
    check_permission(PermMask::EXEC, ino)?;

    // Parse the headers before committing to anything.
    let mut hdr_raw = [0u8; core::mem::size_of::<ElfHdr>()];
    if read_at(ino, 0, &mut hdr_raw)? != hdr_raw.len() {
        return Err(Errno::ELIBBAD);
    }
    let elf = LayoutVerified::<_, ElfHdr>::new(&hdr_raw[..])
        .ok_or(Errno::ELIBBAD)?
        .into_ref()
        .clone();
    if !elf.is_valid() || elf.phnum == 0 {
        return Err(Errno::ELIBBAD);
    }

    let mut phdrs = [ProgHdr::default(); 16];
    let phnum = core::cmp::min(elf.phnum as usize, phdrs.len());
    for (n, ph) in phdrs[..phnum].iter_mut().enumerate() {
        let off = elf.phoff as u64 + (n * core::mem::size_of::<ProgHdr>()) as u64;
        let mut raw = [0u8; core::mem::size_of::<ProgHdr>()];
        if read_at(ino, off, &mut raw)? != raw.len() {
            return Err(Errno::ELIBBAD);
        }
        *ph = LayoutVerified::<_, ProgHdr>::new(&raw[..])
            .ok_or(Errno::ELIBBAD)?
            .into_ref()
            .clone();
        if ph.is_load() && (ph.memsz < ph.filesz || ph.vaddr as usize >= PAGE_OFFSET) {
            return Err(Errno::ELIBBAD);
        }
        if ph.filesz as u64 > size {
            return Err(Errno::ELIBBAD);
        }
    }

    // Point of no return: tear down the old image.
    let data = unsafe { current_proc_data() };
    data.memory.release();
    let mut memory = UserMemory {
        pgdir: UserMemory::new_pgdir()?,
        vmas: crate::vm::VmaList::new(),
        rss: 0,
    };

    let mut brk = 0usize;
    for ph in &phdrs[..phnum] {
        if !ph.is_load() {
            continue;
        }
        let prot = PROT_READ
            | if ph.flags & PF_W != 0 { PROT_WRITE } else { 0 }
            | if ph.flags & PF_X != 0 { PROT_EXEC } else { 0 };
        let typ = if ph.flags & PF_X != 0 {
            VmaType::Text
        } else {
            VmaType::Data
        };
        // File-backed part, demand-paged from the image; do_mmap takes
        // its own inode reference.
        if ph.filesz > 0 {
            do_mmap(
                &mut memory,
                Some(ino),
                ph.vaddr as usize & crate::arch::x86::PAGE_MASK,
                (ph.vaddr as usize & (PAGE_SIZE - 1)) + ph.filesz as usize,
                prot,
                MAP_PRIVATE | MAP_FIXED,
                ph.off & crate::arch::x86::PAGE_MASK as u32,
                typ,
                crate::file::O_RDONLY,
            )?;
        }
        // Zero-filled tail (bss).
        if ph.memsz > ph.filesz {
            let bss_start = pg_round_up(ph.vaddr as usize + ph.filesz as usize);
            let bss_end = pg_round_up(ph.vaddr as usize + ph.memsz as usize);
            if bss_end > bss_start {
                do_mmap(
                    &mut memory,
                    None,
                    bss_start,
                    bss_end - bss_start,
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_FIXED | ZERO_PAGE,
                    0,
                    VmaType::Bss,
                    0,
                )?;
            }
        }
        brk = core::cmp::max(brk, pg_round_up(ph.vaddr as usize + ph.memsz as usize));
    }

    // An initially empty heap right after the image, and the stack at
    // the top of the user half.
    do_mmap(
        &mut memory,
        None,
        brk,
        PAGE_SIZE,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_FIXED | ZERO_PAGE,
        0,
        VmaType::Heap,
        0,
    )?;
    do_mmap(
        &mut memory,
        None,
        USER_STACK_TOP - PAGE_SIZE,
        PAGE_SIZE,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_FIXED,
        0,
        VmaType::Stack,
        0,
    )?;

    // Build the argument page and install it at the stack top.
    let (new_euid, new_egid) = {
        let mut euid = data.euid;
        let mut egid = data.egid;
        if mode & stat::S_ISUID != 0 {
            euid = uid;
        }
        if mode & stat::S_ISGID != 0 {
            egid = gid;
        }
        (euid, egid)
    };
    let aux = [
        (AT_PHDR, elf.phoff),
        (AT_PHENT, core::mem::size_of::<ProgHdr>() as u32),
        (AT_PHNUM, elf.phnum as u32),
        (AT_PAGESZ, PAGE_SIZE as u32),
        (AT_BASE, 0),
        (AT_FLAGS, 0),
        (AT_ENTRY, elf.entry),
        (AT_UID, data.uid),
        (AT_EUID, new_euid),
        (AT_GID, data.gid),
        (AT_EGID, new_egid),
        (AT_NULL, 0),
    ];

    let stack_frame = memory.map_page(
        USER_STACK_TOP - PAGE_SIZE,
        crate::page::NO_FRAME,
        PROT_READ | PROT_WRITE,
    )?;
    let sp = {
        let frames = kernel().frames.lock();
        let page = unsafe { crate::page::frame_bytes(&frames, stack_frame) };
        page.fill(0);
        build_arg_stack(page, USER_STACK_TOP, args, &aux)?
    };

    // Commit: descriptors, credentials, signals, registers.
    data.memory = memory;
    data.tss.cr3 = data.memory.pgdir as u32;
    data.euid = new_euid;
    data.egid = new_egid;

    for fd in data.fd_table.iter_mut() {
        if matches!(fd, Some(e) if e.cloexec) {
            let file = fd.take().unwrap().file;
            crate::syscall::close_file(file);
        }
    }

    {
        let p = crate::proc::current_proc();
        let mut guard = p.lock();
        for action in guard.sigaction.iter_mut() {
            if action.handler != SigHandler::Ignore {
                *action = SigAction::default_action();
            }
        }
        guard.sigexecuting = crate::signal::SigSet::empty();
    }

    let name_start = path.iter().rposition(|b| *b == b'/').map_or(0, |i| i + 1);
    data.set_name(&path[name_start..]);

    drop(ScopeGuard::into_inner(ino_guard));
    itable.iput(ino);

    sc.eip = elf.entry;
    sc.oldesp = sp as u32;
    sc.cs = USER_CS;
    sc.ds = USER_DS;
    sc.es = USER_DS;
    sc.oldss = USER_DS;
    sc.eax = 0;
    unsafe { crate::arch::x86::load_cr3(data.memory.pgdir) };
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(argv: &[&[u8]], envp: &[&[u8]]) -> ArgBlock {
        let mut b = ArgBlock::new();
        for a in argv {
            b.push(a, false).unwrap();
        }
        for e in envp {
            b.push(e, true).unwrap();
        }
        b
    }

    fn read32(page: &[u8; PAGE_SIZE], top: usize, addr: usize) -> u32 {
        let off = addr - (top - PAGE_SIZE);
        u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
    }

    #[test]
    fn stack_layout_argc_argv_envp_auxv() {
        let mut page = [0u8; PAGE_SIZE];
        let top = 0xc000_0000usize;
        let args = block(&[b"init", b"-s"], &[b"TERM=linux"]);
        let aux = [(AT_PAGESZ, 4096), (AT_ENTRY, 0x8048000), (AT_NULL, 0)];
        let sp = build_arg_stack(&mut page, top, &args, &aux).unwrap();

        assert_eq!(sp % 4, 0);
        // argc
        assert_eq!(read32(&page, top, sp), 2);
        // argv[0] points at "init\0"
        let argv0 = read32(&page, top, sp + 4) as usize;
        let off = argv0 - (top - PAGE_SIZE);
        assert_eq!(&page[off..off + 5], b"init\0");
        // argv[1] is "-s\0", then the NULL terminator.
        let argv1 = read32(&page, top, sp + 8) as usize;
        let off = argv1 - (top - PAGE_SIZE);
        assert_eq!(&page[off..off + 3], b"-s\0");
        assert_eq!(read32(&page, top, sp + 12), 0);
        // envp[0], NULL.
        let envp0 = read32(&page, top, sp + 16) as usize;
        let off = envp0 - (top - PAGE_SIZE);
        assert_eq!(&page[off..off + 11], b"TERM=linux\0");
        assert_eq!(read32(&page, top, sp + 20), 0);
        // First aux pair follows, and the vector ends with AT_NULL.
        assert_eq!(read32(&page, top, sp + 24), AT_PAGESZ);
        assert_eq!(read32(&page, top, sp + 28), 4096);
        assert_eq!(read32(&page, top, sp + 40), AT_NULL);
    }

    #[test]
    fn argument_block_enforces_limits() {
        let mut b = ArgBlock::new();
        let big = [b'a'; ARG_MAX_BYTES];
        assert_eq!(b.push(&big, false).unwrap_err(), Errno::E2BIG);
        for _ in 0..MAXARG {
            b.push(b"x", false).unwrap();
        }
        assert_eq!(b.push(b"y", false).unwrap_err(), Errno::E2BIG);
    }

    #[test]
    fn strings_survive_round_trip() {
        let args = block(&[b"a", b"bc"], &[]);
        assert_eq!(args.string(0), b"a\0");
        assert_eq!(args.string(1), b"bc\0");
        assert_eq!(args.argc, 2);
    }
}
