//! The kernel: one struct owning every subsystem, reachable through a
//! single accessor. Interrupt handlers and syscalls share it by going
//! through the per-subsystem locks.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    bio::Bcache,
    bootparams::BootParams,
    console::Printer,
    dev::DeviceTable,
    errno::Result,
    etrace::SymbolEntry,
    file::FileTable,
    fs::{FsTypeTable, InodeRef, Itable, SuperTable},
    ide::IdeChannel,
    lock::{SleepLock, SleepableLock, SpinLock},
    page::FrameTable,
    pipe::PipePool,
    proc::{Procs, WaitChannel},
    timer::{CalloutTable, LoadAvg},
    trap::{BhTable, IrqTable},
};

pub struct Kernel {
    panicked: AtomicBool,

    pub printer: SpinLock<Printer>,

    /// Physical frames and the page cache.
    pub frames: SpinLock<FrameTable>,

    /// The buffer cache.
    pub bcache: SpinLock<Bcache>,

    /// The inode cache.
    pub itable: Itable,

    /// Mounted filesystems.
    pub supers: SuperTable,

    pub fstypes: SpinLock<FsTypeTable>,

    /// Global open-file descriptions.
    pub ftable: FileTable,

    pub devices: DeviceTable,

    pub pipes: PipePool,

    pub procs: Procs,

    /// Tick counter; sleepers on it are woken every tick.
    pub ticks: SleepableLock<u64>,
    pub uptime_secs: SpinLock<u64>,
    pub loadavg: SpinLock<LoadAvg>,
    pub callouts: SpinLock<CalloutTable>,

    pub bh_table: BhTable,
    pub irqs: IrqTable,

    pub ide: [IdeChannel; 2],

    /// Serializes whole-cache sync passes.
    pub sync_resource: SleepLock<()>,

    /// Guard lock for the select/pause wait channels.
    pub select_lock: SpinLock<()>,
    pub pause_wait: WaitChannel,

    /// Sleepers waiting for a free page; the reclaimer wakes them.
    pub free_page_wait: WaitChannel,
    reclaim_wait: WaitChannel,

    master_pgdir: AtomicUsize,
    root_sb: spin::Once<usize>,
    pub bootparams: spin::Once<BootParams>,
    symtab: spin::Once<&'static [SymbolEntry]>,
}

static KERNEL: Kernel = Kernel::zero();

/// The kernel. Safe to access from anywhere; every field guards itself.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: SpinLock::new("printer", Printer::new()),
            frames: SpinLock::new("frames", FrameTable::zero()),
            bcache: SpinLock::new("bcache", Bcache::zero()),
            itable: Itable::zero(),
            supers: SuperTable::zero(),
            fstypes: SpinLock::new("fstypes", FsTypeTable::zero()),
            ftable: FileTable::zero(),
            devices: DeviceTable::zero(),
            pipes: PipePool::zero(),
            procs: Procs::zero(),
            ticks: SleepableLock::new("time", 0),
            uptime_secs: SpinLock::new("uptime", 0),
            loadavg: SpinLock::new("loadavg", LoadAvg::zero()),
            callouts: SpinLock::new("callouts", CalloutTable::zero()),
            bh_table: BhTable::zero(),
            irqs: IrqTable::zero(),
            ide: [
                IdeChannel::new(0, 0x1f0, 0x3f6, 14),
                IdeChannel::new(1, 0x170, 0x376, 15),
            ],
            sync_resource: SleepLock::new("sync", ()),
            select_lock: SpinLock::new("select", ()),
            pause_wait: WaitChannel::new(),
            free_page_wait: WaitChannel::new(),
            reclaim_wait: WaitChannel::new(),
            master_pgdir: AtomicUsize::new(0),
            root_sb: spin::Once::new(),
            bootparams: spin::Once::new(),
            symtab: spin::Once::new(),
        }
    }

    pub fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Prints the given formatted string with the Printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // Bypass the lock: the machine is going down and the
            // holder may never release it.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }

    /// Physical address of the page directory holding the shared
    /// kernel half.
    pub fn master_pgdir(&self) -> usize {
        self.master_pgdir.load(Ordering::Relaxed)
    }

    pub fn set_master_pgdir(&self, pa: usize) {
        self.master_pgdir.store(pa, Ordering::Relaxed);
    }

    /// Root inode of the root mount; panics before the root is mounted.
    pub fn root_inode(&self) -> InodeRef {
        let sb = *self.root_sb.get().expect("root filesystem not mounted");
        self.supers.root_of(sb).expect("root mount has no root")
    }

    pub fn set_root_sb(&self, sb: usize) {
        let _ = self.root_sb.call_once(|| sb);
    }

    pub fn symtab(&self) -> Option<&'static [SymbolEntry]> {
        self.symtab.get().copied()
    }

    pub fn install_symtab(&self, table: &'static [SymbolEntry]) {
        let _ = self.symtab.call_once(|| table);
    }

    /// Out of pages: kick the reclaimer and wait for it to free some.
    pub fn out_of_memory(&self) {
        self.reclaim_wait.wakeup();
        let mut guard = self.select_lock.lock();
        self.free_page_wait.sleep(&mut guard);
    }
}

/// print! prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic: register dump, stack trace, halt.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("PANIC: {}", info);
    crate::etrace::stack_trace(current_frame_pointer());
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
fn current_frame_pointer() -> usize {
    let ebp: usize;
    unsafe { core::arch::asm!("mov {}, ebp", out(reg) ebp) };
    ebp
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn current_frame_pointer() -> usize {
    0
}

/// The page-pressure thread: reclaim buffer-cache memory when the
/// allocator runs low, waking anyone stuck in `out_of_memory`.
fn kswapd() -> ! {
    loop {
        {
            let mut guard = kernel().select_lock.lock();
            while !kernel().frames.lock().low_memory() {
                kernel().reclaim_wait.sleep(&mut guard);
            }
        }
        let reclaimed = crate::bio::reclaim_buffers();
        if reclaimed > 0 {
            kernel().free_page_wait.wakeup();
        } else {
            // Nothing reclaimable; yield rather than spin.
            kernel().procs.yield_cpu();
        }
    }
}

fn kbdflushd() -> ! {
    crate::bio::kbdflushd()
}

/// First kernel process: mount the root filesystem and exec init.
/// Runs as a process because mounting sleeps in the block layer.
fn init_trampoline() -> ! {
    let params = kernel().bootparams.get();
    let (root_dev, fstype) = match params {
        Some(p) => (p.root_dev.unwrap_or(crate::dev::mkdev(3, 0)), p.rootfstype_str()),
        None => (crate::dev::mkdev(3, 0), ""),
    };

    let fstype_known = !fstype.is_empty()
        && kernel().fstypes.lock().by_name(fstype).is_some();
    if fstype_known {
        match crate::fs::superblock::mount_fs(
            root_dev,
            b"",
            fstype,
            crate::fs::MountFlags::empty(),
        ) {
            Ok(sb) => {
                kernel().set_root_sb(sb);
                let root = kernel().root_inode();
                let data = unsafe { crate::proc::current_proc_data() };
                data.cwd = Some(kernel().itable.idup(root));
                data.root = Some(kernel().itable.idup(root));

                // From here on this is a real user process: session
                // leader of session 1, and signalable again.
                {
                    let p = crate::proc::current_proc();
                    let mut guard = p.lock();
                    guard.flags.remove(crate::proc::ProcFlags::KPROC);
                    guard.pgid = guard.pid;
                    guard.sid = guard.pid;
                }

                match crate::exec::alloc_arg_block() {
                    Ok(args) => {
                        let _ = args.push(b"/sbin/init", false);
                        let mut sc = crate::arch::x86::SigContext::zero();
                        let run = crate::exec::do_execve(b"/sbin/init", args, &mut sc);
                        crate::exec::free_arg_block(args);
                        match run {
                            Ok(_) => {
                                // Park the freshly built frame on our
                                // kernel stack and drop to user mode.
                                let data = unsafe { crate::proc::current_proc_data() };
                                let frame =
                                    crate::proc::kstack_frame_addr(data.kstack);
                                unsafe {
                                    core::ptr::write(
                                        frame as *mut crate::arch::x86::SigContext,
                                        sc,
                                    );
                                    crate::trap::return_to_user(frame)
                                }
                            }
                            Err(e) => {
                                println!("WARNING: cannot run /sbin/init: {:?}", e);
                            }
                        }
                    }
                    Err(e) => println!("WARNING: exec of init failed: {:?}", e),
                }
            }
            Err(e) => {
                println!("WARNING: cannot mount root (dev {:#x}): {:?}", root_dev, e);
            }
        }
    } else {
        println!("WARNING: no root filesystem type registered");
    }

    // Without init there is nothing to schedule; stay as the idle-ish
    // caretaker so the machine remains debuggable.
    loop {
        kernel().procs.yield_cpu();
    }
}

fn timer_irq(sc: &crate::arch::x86::SigContext) {
    crate::timer::irq_timer(sc);
}

/// Boot entry, after the early assembly set up paging with the kernel
/// high half and a stack. `cmdline` is the Multiboot command line;
/// `mem_kb` the usable memory above 1 MiB.
pub fn kernel_main(cmdline: &[u8], mem_kb: usize, master_pgdir: usize) -> ! {
    kernel().printer.lock().init();
    println!();
    println!("rx86 kernel is booting");
    println!();

    kernel().set_master_pgdir(master_pgdir);
    let _ = kernel()
        .bootparams
        .call_once(|| crate::bootparams::parse_cmdline(cmdline));

    // Frame table over all of RAM; the first megabyte plus the kernel
    // image stay reserved.
    {
        let nframes = mem_kb / 4;
        let reserved = 1024; // up to 4 MiB: image, boot tables
        kernel()
            .frames
            .lock()
            .init(0, nframes, reserved);
    }

    kernel().bcache.lock().init();
    kernel().itable.init();
    kernel().callouts.lock().init();
    kernel().procs.init();

    // Trap plumbing: the timer drives scheduling and callouts.
    kernel().irqs.register(0, timer_irq);
    kernel().bh_table.register(crate::trap::BH_TIMER, crate::timer::irq_timer_bh);
    kernel()
        .bh_table
        .register(crate::trap::BH_CALLOUTS, crate::timer::do_callouts_bh);

    crate::syscall::init();

    // Internal filesystems and drivers.
    let _ = kernel().fstypes.lock().register(&crate::pipe::PIPEFS_TYPE);
    crate::ide::ide_init();

    // The resident kernel processes. init spawns first so it gets
    // PID 1, which the signal and reparenting rules key on.
    kernel()
        .procs
        .idle_process_init()
        .expect("idle process");
    kernel()
        .procs
        .kernel_process(b"init", init_trampoline)
        .expect("init");
    kernel()
        .procs
        .kernel_process(b"kbdflushd", kbdflushd)
        .expect("kbdflushd");
    kernel()
        .procs
        .kernel_process(b"kswapd", kswapd)
        .expect("kswapd");

    println!(
        "memory    {} KiB, {} frames free",
        mem_kb,
        kernel().frames.lock().free_frames()
    );

    // From here the timer drives everything.
    unsafe { crate::arch::x86::intr_on() };
    loop {
        crate::arch::x86::idle_wait();
        if kernel().procs.take_need_resched() {
            kernel().procs.yield_cpu();
        }
    }
}

/// Register a filesystem implementation (called by out-of-tree
/// filesystem crates during their init).
pub fn register_filesystem(fstype: &'static crate::fs::FilesystemType) -> Result<()> {
    kernel().fstypes.lock().register(fstype)
}
