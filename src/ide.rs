//! IDE/ATA driver: the block-device request path.
//!
//! Each channel owns a request queue and a small state record
//! (`wait_interrupt`, `irq_timeout`). A request is programmed with the
//! drive selected and LBA (or CHS on old drives) loaded, then the
//! caller sleeps on the channel until the completion IRQ or the timeout
//! callout fires. Transient errors retry a bounded number of times; a
//! hard error soft-resets the channel and fails with EIO; writes to
//! read-only media (ATAPI) fail with EROFS before touching the wire;
//! a media change invalidates the device's cached buffers. ATAPI
//! devices add a 12-byte packet layer on top with 2 KiB sectors.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::{
    dev::BLK_DEV,
    errno::{Errno, Result},
    fs::{BlockOps, FsOpFlags, FsOps},
    kernel::kernel,
    lock::{SleepLock, SpinLock},
    param::{ATA_MAX_RETRIES, IDE_TIMEOUT_TICKS, NR_IDE_CHANNELS},
    proc::WaitChannel,
    timer::{add_callout, del_callout},
};

pub const IDE_MAJOR: u32 = 3;
pub const SECTOR_SIZE: usize = 512;
pub const ATAPI_SECTOR_SIZE: usize = 2048;

/// Register offsets from the channel base port.
const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_NSECTOR: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRVHD: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;

bitflags! {
    pub struct AtaStatus: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const DF = 1 << 5;
        const RDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

bitflags! {
    pub struct AtaError: u8 {
        const AMNF = 1 << 0;
        const TK0NF = 1 << 1;
        const ABRT = 1 << 2;
        const MCR = 1 << 3;
        const IDNF = 1 << 4;
        const MC = 1 << 5;
        const UNC = 1 << 6;
        const BBK = 1 << 7;
    }
}

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xec;
const CMD_PACKET: u8 = 0xa0;
const CMD_IDENTIFY_PACKET: u8 = 0xa1;

/// Control-register bits.
const CTRL_SRST: u8 = 0x04;
const CTRL_NIEN: u8 = 0x02;

/// ATAPI packet opcodes.
pub const ATAPI_TEST_UNIT: u8 = 0x00;
pub const ATAPI_REQUEST_SENSE: u8 = 0x03;
pub const ATAPI_START_STOP: u8 = 0x1b;
pub const ATAPI_MEDIUM_REMOVAL: u8 = 0x1e;
pub const ATAPI_READ10: u8 = 0x28;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum IoDir {
    Read,
    Write,
}

/// One queued transfer.
#[derive(Copy, Clone, Debug)]
pub struct IdeRequest {
    pub dir: IoDir,
    pub dev: u32,
    pub block: u32,
    pub blksize: u32,
    /// Kernel buffer address.
    pub buf: usize,
    pub status: ReqStatus,
    pub errno: Option<Errno>,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ReqStatus {
    Pending,
    Active,
    Done,
}

/// The per-device pending queue, FIFO.
pub struct RequestQueue {
    requests: ArrayVec<IdeRequest, 16>,
}

impl RequestQueue {
    pub const fn new() -> Self {
        Self {
            requests: ArrayVec::new_const(),
        }
    }

    pub fn push(&mut self, req: IdeRequest) -> Result<usize> {
        self.requests.try_push(req).map_err(|_| Errno::EAGAIN)?;
        Ok(self.requests.len() - 1)
    }

    /// The request to service next: the oldest not yet done.
    pub fn head(&mut self) -> Option<&mut IdeRequest> {
        self.requests
            .iter_mut()
            .find(|r| r.status != ReqStatus::Done)
    }

    pub fn pop_done(&mut self) {
        while let Some(first) = self.requests.first() {
            if first.status == ReqStatus::Done {
                let _ = self.requests.remove(0);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Geometry and identity of one attached drive.
#[derive(Copy, Clone)]
pub struct AtaDrive {
    pub present: bool,
    pub atapi: bool,
    pub lba: bool,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors: u16,
    pub nr_sectors: u32,
}

impl AtaDrive {
    const fn empty() -> Self {
        Self {
            present: false,
            atapi: false,
            lba: false,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            nr_sectors: 0,
        }
    }
}

/// The ATA IDENTIFY block, the words we consume.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct IdentifyData {
    pub config: u16,
    pub cylinders: u16,
    _r0: u16,
    pub heads: u16,
    _r1: [u16; 2],
    pub sectors: u16,
    _r2: [u16; 42],
    /// Word 49: bit 9 set means LBA supported.
    pub capabilities: u16,
    _r3: [u16; 10],
    /// Words 60-61: total addressable sectors in LBA mode.
    pub lba_sectors: [u16; 2],
    _r4: [u16; 194],
}

impl IdentifyData {
    pub fn supports_lba(&self) -> bool {
        self.capabilities & (1 << 9) != 0
    }

    pub fn total_sectors(&self) -> u32 {
        (self.lba_sectors[0] as u32) | ((self.lba_sectors[1] as u32) << 16)
    }

    pub fn parse(raw: &[u8]) -> Option<IdentifyData> {
        LayoutVerified::<_, IdentifyData>::new(raw).map(|lv| *lv.into_ref())
    }
}

/// Split a logical sector number into CHS for pre-LBA drives.
pub fn chs_of(sector: u32, heads: u16, sectors: u16) -> (u16, u8, u8) {
    let spt = sectors as u32;
    let tracks = sector / spt;
    let sect = (sector % spt) + 1;
    let cyl = tracks / heads as u32;
    let head = tracks % heads as u32;
    (cyl as u16, head as u8, sect as u8)
}

/// Decode an ATAPI REQUEST SENSE response.
pub fn decode_sense(sense: &[u8]) -> (u8, u8) {
    let key = sense.get(2).copied().unwrap_or(0) & 0x0f;
    let asc = sense.get(12).copied().unwrap_or(0);
    (key, asc)
}

struct IdeInner {
    wait_interrupt: bool,
    irq_timeout: bool,
    queue: RequestQueue,
    drives: [AtaDrive; 2],
}

pub struct IdeChannel {
    pub base: u16,
    pub ctrl: u16,
    pub irq: usize,
    channel_no: usize,
    /// One request in flight per channel.
    lock: SleepLock<()>,
    inner: SpinLock<IdeInner>,
    irq_wait: WaitChannel,
}

impl IdeChannel {
    pub const fn new(channel_no: usize, base: u16, ctrl: u16, irq: usize) -> Self {
        Self {
            base,
            ctrl,
            irq,
            channel_no,
            lock: SleepLock::new("ide", ()),
            inner: SpinLock::new(
                "ide_inner",
                IdeInner {
                    wait_interrupt: false,
                    irq_timeout: false,
                    queue: RequestQueue::new(),
                    drives: [AtaDrive::empty(); 2],
                },
            ),
            irq_wait: WaitChannel::new(),
        }
    }

    fn inb(&self, reg: u16) -> u8 {
        crate::arch::x86::inb(self.base + reg)
    }

    fn outb(&self, reg: u16, val: u8) {
        crate::arch::x86::outb(self.base + reg, val)
    }

    /// Poll until BSY clears, bounded.
    fn wait_ready(&self) -> Result<AtaStatus> {
        for _ in 0..100_000 {
            let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
            if !status.contains(AtaStatus::BSY) {
                return Ok(status);
            }
            core::hint::spin_loop();
        }
        Err(Errno::EIO)
    }

    fn select_drive(&self, drive: usize, lba_bits: u8) -> Result<()> {
        self.wait_ready()?;
        self.outb(REG_DRVHD, 0xa0 | ((drive as u8) << 4) | 0x40 | (lba_bits & 0x0f));
        self.wait_ready()?;
        Ok(())
    }

    /// Soft reset after a hard error: SRST pulse on the control port.
    fn reset(&self) {
        crate::arch::x86::outb(self.ctrl, CTRL_SRST);
        for _ in 0..1000 {
            core::hint::spin_loop();
        }
        crate::arch::x86::outb(self.ctrl, 0);
        let _ = self.wait_ready();
    }

    /// Program one sector transfer and issue the command.
    fn start_request(&self, drive: usize, sector: u32, dir: IoDir) -> Result<()> {
        let d = self.inner.lock().drives[drive];
        if !d.present {
            return Err(Errno::ENXIO);
        }
        if sector >= d.nr_sectors && d.nr_sectors > 0 {
            return Err(Errno::ENOSPC);
        }

        if d.lba {
            self.select_drive(drive, ((sector >> 24) & 0x0f) as u8)?;
            self.outb(REG_NSECTOR, 1);
            self.outb(REG_LBA_LOW, sector as u8);
            self.outb(REG_LBA_MID, (sector >> 8) as u8);
            self.outb(REG_LBA_HIGH, (sector >> 16) as u8);
        } else {
            let (cyl, head, sect) = chs_of(sector, d.heads, d.sectors);
            self.select_drive(drive, head & 0x0f)?;
            self.outb(REG_NSECTOR, 1);
            self.outb(REG_LBA_LOW, sect);
            self.outb(REG_LBA_MID, cyl as u8);
            self.outb(REG_LBA_HIGH, (cyl >> 8) as u8);
        }

        {
            let mut inner = self.inner.lock();
            inner.wait_interrupt = true;
            inner.irq_timeout = false;
        }
        add_callout(ide_timeout, self.channel_no, IDE_TIMEOUT_TICKS as u32);

        self.outb(
            REG_COMMAND,
            match dir {
                IoDir::Read => CMD_READ_PIO,
                IoDir::Write => CMD_WRITE_PIO,
            },
        );
        Ok(())
    }

    /// Sleep until the IRQ (or timeout) finishes the in-flight sector.
    fn wait_for_irq(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.wait_interrupt && !inner.irq_timeout {
            self.irq_wait.sleep(&mut inner);
        }
        let timed_out = inner.irq_timeout;
        inner.irq_timeout = false;
        drop(inner);
        del_callout(ide_timeout, self.channel_no);
        if timed_out {
            // Verify: the command may have completed while the callout
            // raced in.
            let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
            if status.contains(AtaStatus::BSY) || status.contains(AtaStatus::ERR) {
                return Err(Errno::EIO);
            }
        }
        Ok(())
    }

    /// Outcome of one sector: classify the status/error registers.
    fn check_result(&self, dev: u32) -> Result<()> {
        let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
        if !status.contains(AtaStatus::ERR) && !status.contains(AtaStatus::DF) {
            return Ok(());
        }
        let error = AtaError::from_bits_truncate(self.inb(REG_ERROR));
        if error.contains(AtaError::MC) || error.contains(AtaError::MCR) {
            // Media changed: everything cached for this device is
            // stale.
            crate::bio::invalidate_buffers(dev);
            return Err(Errno::ENOMEDIUM);
        }
        // Everything else (UNC, BBK, ABRT, seek/address errors) is a
        // plain I/O failure; retries and the reset decide its fate.
        Err(Errno::EIO)
    }

    /// One complete sector transfer with retries and reset-on-error.
    fn transfer_sector(&self, drive: usize, sector: u32, buf: &mut [u8], dir: IoDir, dev: u32) -> Result<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let mut last = Errno::EIO;
        for _retry in 0..ATA_MAX_RETRIES {
            match self.try_transfer(drive, sector, buf, dir) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = e;
                    // A media change is final; transient errors retry
                    // after a channel reset.
                    if let Err(Errno::ENOMEDIUM) = self.check_result(dev) {
                        return Err(Errno::ENOMEDIUM);
                    }
                    self.reset();
                }
            }
        }
        Err(last)
    }

    fn try_transfer(&self, drive: usize, sector: u32, buf: &mut [u8], dir: IoDir) -> Result<()> {
        self.start_request(drive, sector, dir)?;
        match dir {
            IoDir::Read => {
                // Data arrives with the IRQ; the handler drains it.
                self.wait_for_irq()?;
                let words =
                    unsafe { core::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u16, SECTOR_SIZE / 2) };
                crate::arch::x86::insw(self.base + REG_DATA, words);
            }
            IoDir::Write => {
                // DRQ first, then the data, then the completion IRQ.
                self.wait_ready()?;
                let words =
                    unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const u16, SECTOR_SIZE / 2) };
                crate::arch::x86::outsw(self.base + REG_DATA, words);
                self.wait_for_irq()?;
            }
        }
        let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
        if status.contains(AtaStatus::ERR) || status.contains(AtaStatus::DF) {
            return Err(Errno::EIO);
        }
        Ok(())
    }

    /// The IRQ handler: acknowledge, clear the wait flag, cancel the
    /// timeout, wake the originator.
    pub fn intr(&self) {
        let _ = self.inb(REG_STATUS);
        let mut inner = self.inner.lock();
        inner.wait_interrupt = false;
        drop(inner);
        self.irq_wait.wakeup();
    }

    /// Send an ATAPI packet and transfer `data` in 2 KiB chunks.
    pub fn atapi_packet(&self, drive: usize, packet: &[u8; 12], data: &mut [u8]) -> Result<()> {
        self.select_drive(drive, 0)?;
        // Byte-count limit for PIO transfers.
        self.outb(REG_LBA_MID, (ATAPI_SECTOR_SIZE & 0xff) as u8);
        self.outb(REG_LBA_HIGH, (ATAPI_SECTOR_SIZE >> 8) as u8);
        {
            let mut inner = self.inner.lock();
            inner.wait_interrupt = true;
            inner.irq_timeout = false;
        }
        add_callout(ide_timeout, self.channel_no, IDE_TIMEOUT_TICKS as u32);
        self.outb(REG_COMMAND, CMD_PACKET);
        self.wait_ready()?;

        let words =
            unsafe { core::slice::from_raw_parts(packet.as_ptr() as *const u16, 6) };
        crate::arch::x86::outsw(self.base + REG_DATA, words);

        for chunk in data.chunks_mut(ATAPI_SECTOR_SIZE) {
            self.wait_for_irq()?;
            let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
            if status.contains(AtaStatus::ERR) {
                // Ask the device why.
                let mut sense = [0u8; 18];
                let mut sense_pkt = [0u8; 12];
                sense_pkt[0] = ATAPI_REQUEST_SENSE;
                sense_pkt[4] = sense.len() as u8;
                let _ = self.atapi_packet(drive, &sense_pkt, &mut sense);
                let (key, asc) = decode_sense(&sense);
                crate::println!("WARNING: atapi sense key={:#x} asc={:#x}", key, asc);
                return Err(Errno::EIO);
            }
            if !chunk.is_empty() {
                let words = unsafe {
                    core::slice::from_raw_parts_mut(chunk.as_mut_ptr() as *mut u16, chunk.len() / 2)
                };
                crate::arch::x86::insw(self.base + REG_DATA, words);
            }
        }
        del_callout(ide_timeout, self.channel_no);
        Ok(())
    }

    /// Probe both drives with IDENTIFY (or IDENTIFY PACKET).
    pub fn identify(&self) {
        for drive in 0..2 {
            if self.select_drive(drive, 0).is_err() {
                continue;
            }
            self.outb(REG_COMMAND, CMD_IDENTIFY);
            let status = AtaStatus::from_bits_truncate(self.inb(REG_STATUS));
            if status.is_empty() {
                continue;
            }
            let atapi = {
                // ATAPI drives abort IDENTIFY and set the signature.
                let mid = self.inb(REG_LBA_MID);
                let high = self.inb(REG_LBA_HIGH);
                mid == 0x14 && high == 0xeb
            };
            if atapi {
                self.outb(REG_COMMAND, CMD_IDENTIFY_PACKET);
            }
            if self.wait_ready().is_err() {
                continue;
            }
            let mut raw = [0u8; 512];
            let words = unsafe {
                core::slice::from_raw_parts_mut(raw.as_mut_ptr() as *mut u16, 256)
            };
            crate::arch::x86::insw(self.base + REG_DATA, words);
            if let Some(id) = IdentifyData::parse(&raw[..]) {
                let mut inner = self.inner.lock();
                inner.drives[drive] = AtaDrive {
                    present: true,
                    atapi,
                    lba: id.supports_lba(),
                    cylinders: id.cylinders,
                    heads: id.heads,
                    sectors: id.sectors,
                    nr_sectors: if id.supports_lba() {
                        id.total_sectors()
                    } else {
                        id.cylinders as u32 * id.heads as u32 * id.sectors as u32
                    },
                };
            }
        }
    }

    /// Service one block transfer through the request queue; the
    /// channel lock admits one request to the hardware at a time.
    fn do_request(&self, dir: IoDir, dev: u32, block: u32, buf: usize, blksize: u32) -> Result<()> {
        let drive = (crate::dev::minor(dev) >> 6) as usize & 1;

        // ATAPI media is read-only through this driver; refuse writes
        // before they ever reach the wire.
        if dir == IoDir::Write && self.inner.lock().drives[drive].atapi {
            return Err(Errno::EROFS);
        }

        {
            let mut inner = self.inner.lock();
            let _ = inner.queue.push(IdeRequest {
                dir,
                dev,
                block,
                blksize,
                buf,
                status: ReqStatus::Pending,
                errno: None,
            })?;
        }

        let _chan = self.lock.lock();
        {
            let mut inner = self.inner.lock();
            if let Some(req) = inner.queue.head() {
                req.status = ReqStatus::Active;
            }
        }

        let sectors_per_block = blksize as usize / SECTOR_SIZE;
        let first_sector = block * sectors_per_block as u32;
        let mut result = Ok(());
        for s in 0..sectors_per_block {
            let sector_buf = unsafe {
                core::slice::from_raw_parts_mut(
                    (buf + s * SECTOR_SIZE) as *mut u8,
                    SECTOR_SIZE,
                )
            };
            if let Err(e) =
                self.transfer_sector(drive, first_sector + s as u32, sector_buf, dir, dev)
            {
                result = Err(e);
                break;
            }
        }

        let mut inner = self.inner.lock();
        if let Some(req) = inner.queue.head() {
            req.status = ReqStatus::Done;
            req.errno = result.err();
        }
        inner.queue.pop_done();
        result
    }
}

fn ide_timeout(channel_no: usize) {
    let channel = &kernel().ide[channel_no];
    let mut inner = channel.inner.lock();
    if inner.wait_interrupt {
        inner.irq_timeout = true;
        inner.wait_interrupt = false;
        drop(inner);
        channel.irq_wait.wakeup();
    }
}

pub fn ide0_intr(_sc: &crate::arch::x86::SigContext) {
    kernel().ide[0].intr();
}

pub fn ide1_intr(_sc: &crate::arch::x86::SigContext) {
    kernel().ide[1].intr();
}

fn channel_of(dev: u32) -> &'static IdeChannel {
    // Minors 0-63: hd0/hd1 on the primary channel; 64-127: secondary.
    let channel = (crate::dev::minor(dev) >> 7) as usize & 1;
    &kernel().ide[channel]
}

struct IdeBlockOps;

impl BlockOps for IdeBlockOps {
    fn read_block(&self, dev: u32, block: u32, buf: &mut [u8], size: u32) -> Result<()> {
        channel_of(dev).do_request(IoDir::Read, dev, block, buf.as_mut_ptr() as usize, size)
    }

    fn write_block(&self, dev: u32, block: u32, buf: &[u8], size: u32) -> Result<()> {
        channel_of(dev).do_request(IoDir::Write, dev, block, buf.as_ptr() as usize, size)
    }
}

static IDE_BLOCK_OPS: IdeBlockOps = IdeBlockOps;

pub static IDE_FS_OPS: FsOps = FsOps {
    flags: FsOpFlags::REQUIRES_DEV,
    fops: &crate::fs::NO_OPS,
    iops: &crate::fs::NO_OPS,
    bops: &IDE_BLOCK_OPS,
    sops: &crate::fs::NO_OPS,
};

/// Probe the channels and register the block devices.
pub fn ide_init() {
    debug_assert_eq!(kernel().ide.len(), NR_IDE_CHANNELS);
    for (n, channel) in kernel().ide.iter().enumerate() {
        // Interrupts enabled on the channel (nIEN clear).
        crate::arch::x86::outb(channel.ctrl, 0);
        channel.identify();
        kernel()
            .irqs
            .register(channel.irq, if n == 0 { ide0_intr } else { ide1_intr });
    }

    let mut dev = crate::dev::Device::new("ide", IDE_MAJOR, 1024, &IDE_FS_OPS);
    for (n, channel) in kernel().ide.iter().enumerate() {
        let inner = channel.inner.lock();
        for drive in 0..2 {
            if inner.drives[drive].present {
                dev.set_minor((n as u32) << 7 | (drive as u32) << 6);
            }
        }
    }
    let _ = kernel().devices.register(BLK_DEV, dev);
    crate::println!(
        "ide       0x{:x}-0x{:x}    {}",
        kernel().ide[0].base,
        kernel().ide[0].base + 7,
        kernel().ide[0].irq
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_conversion_matches_geometry() {
        // 16 heads, 63 sectors per track.
        let (c, h, s) = chs_of(0, 16, 63);
        assert_eq!((c, h, s), (0, 0, 1));
        let (c, h, s) = chs_of(62, 16, 63);
        assert_eq!((c, h, s), (0, 0, 63));
        let (c, h, s) = chs_of(63, 16, 63);
        assert_eq!((c, h, s), (0, 1, 1));
        let (c, h, s) = chs_of(63 * 16, 16, 63);
        assert_eq!((c, h, s), (1, 0, 1));
    }

    #[test]
    fn identify_block_layout() {
        assert_eq!(core::mem::size_of::<IdentifyData>(), 512);
        let mut raw = [0u8; 512];
        // Word 1 = cylinders, word 3 = heads, word 6 = sectors.
        raw[2] = 0x10;
        raw[6] = 16;
        raw[12] = 63;
        // Word 49 bit 9: LBA.
        raw[99] = 0x02;
        // Words 60-61: sector count 0x12345.
        raw[120] = 0x45;
        raw[121] = 0x23;
        raw[122] = 0x01;
        let id = IdentifyData::parse(&raw[..]).unwrap();
        assert_eq!(id.cylinders, 0x10);
        assert_eq!(id.heads, 16);
        assert_eq!(id.sectors, 63);
        assert!(id.supports_lba());
        assert_eq!(id.total_sectors(), 0x12345);
    }

    #[test]
    fn request_queue_is_fifo() {
        let mut q = RequestQueue::new();
        for block in [5u32, 9, 1] {
            q.push(IdeRequest {
                dir: IoDir::Read,
                dev: 0x300,
                block,
                blksize: 1024,
                buf: 0,
                status: ReqStatus::Pending,
                errno: None,
            })
            .unwrap();
        }
        assert_eq!(q.head().unwrap().block, 5);
        q.head().unwrap().status = ReqStatus::Done;
        q.pop_done();
        assert_eq!(q.head().unwrap().block, 9);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn sense_decoding() {
        let mut sense = [0u8; 18];
        sense[2] = 0x76; // high bits masked off
        sense[12] = 0x28;
        assert_eq!(decode_sense(&sense), (0x6, 0x28));
        assert_eq!(decode_sense(&[]), (0, 0));
    }
}
