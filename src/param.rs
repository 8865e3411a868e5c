/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Process slots reserved for the superuser.
pub const SAFE_SLOTS: usize = 4;

/// Highest PID value before wrapping around.
pub const MAX_PID: i32 = 32767;

/// PID of the init process.
pub const INIT_PID: i32 = 1;

/// Open files per process.
pub const NOFILE: usize = 32;

/// Open-file descriptions per system.
pub const NFILE: usize = 256;

/// In-core inode slots.
pub const NINODE: usize = 128;

/// Inode hash buckets.
pub const NR_INO_HASH: usize = 64;

/// Buffer pool capacity (the pool grows lazily up to this).
pub const NBUF: usize = 256;

/// Buffer hash buckets.
pub const NR_BUF_HASH: usize = 64;

/// Percentage of the buffer pool that may be dirty before the
/// flusher is woken.
pub const BUFFER_DIRTY_RATIO: usize = 60;

/// Buffers written or reclaimed per pass.
pub const NR_BUF_RECLAIM: usize = 64;

/// Physical frames the frame table can describe (128 MiB of RAM).
pub const NR_FRAMES: usize = 32768;

/// Page-cache hash buckets.
pub const NR_PAGE_HASH: usize = 1024;

/// Mounted filesystems.
pub const NR_SUPER: usize = 8;

/// Registered filesystem types.
pub const NR_FSTYPES: usize = 8;

/// Character / block device majors.
pub const NR_CHRDEV: usize = 32;
pub const NR_BLKDEV: usize = 32;

/// One-shot timer slots.
pub const NR_CALLOUTS: usize = 16;

/// Bottom-half slots.
pub const NR_BH: usize = 8;

/// Timer interrupts per second.
pub const HZ: usize = 100;

/// Default static priority, in ticks of quantum.
pub const DEF_PRIORITY: i32 = 20;

/// Supplementary groups per process.
pub const NGROUPS: usize = 32;

/// Symlink resolution depth limit of namei.
pub const MAXSYMLINKS: usize = 8;

/// Maximum file path name.
pub const MAXPATH: usize = 1024;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// VMA regions per process.
pub const NVMA: usize = 64;

/// Pipes in the system.
pub const NR_PIPES: usize = 64;

/// Pipe ring-buffer size.
pub const PIPESIZE: usize = 4096;

/// IDE channels (primary, secondary).
pub const NR_IDE_CHANNELS: usize = 2;

/// Retries before an ATA command is declared failed.
pub const ATA_MAX_RETRIES: usize = 5;

/// Ticks before a pending IDE interrupt is declared lost.
pub const IDE_TIMEOUT_TICKS: usize = 3 * HZ;

/// RAM-disk size ceiling accepted from the command line, in KiB.
pub const RAMDISK_MAX_KB: usize = 16384;
