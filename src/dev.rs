//! Device registry.
//!
//! Two arrays indexed by major number, one for character devices and one
//! for block devices. Each entry carries a minor bitmap (a minor must be
//! set there to be considered present), the per-minor block size, and
//! the dispatch record its filesystem hooks live in.

use crate::{
    errno::{Errno, Result},
    fs::FsOps,
    param::{NR_BLKDEV, NR_CHRDEV},
};

pub const CHR_DEV: u32 = 1;
pub const BLK_DEV: u32 = 2;

/// Device numbers are `major << 8 | minor`.
#[inline]
pub const fn mkdev(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff)
}

#[inline]
pub const fn major(dev: u32) -> u32 {
    (dev >> 8) & 0xff
}

#[inline]
pub const fn minor(dev: u32) -> u32 {
    dev & 0xff
}

pub struct Device {
    pub name: &'static str,
    pub major: u32,
    /// One bit per possible minor.
    pub minors: [u64; 4],
    /// Block size per minor (block devices).
    pub blksize: u32,
    pub ops: &'static FsOps,
}

impl Device {
    pub const fn new(name: &'static str, major: u32, blksize: u32, ops: &'static FsOps) -> Self {
        Self {
            name,
            major,
            minors: [0; 4],
            blksize,
            ops,
        }
    }

    pub fn set_minor(&mut self, minor: u32) {
        self.minors[(minor / 64) as usize] |= 1 << (minor % 64);
    }

    pub fn clear_minor(&mut self, minor: u32) {
        self.minors[(minor / 64) as usize] &= !(1 << (minor % 64));
    }

    pub fn has_minor(&self, minor: u32) -> bool {
        self.minors[(minor / 64) as usize] & (1 << (minor % 64)) != 0
    }
}

/// A registered device as handed to callers: the dispatch groups split
/// out, so `d.bops.read_block(..)` reads naturally at call sites.
#[derive(Copy, Clone)]
pub struct DeviceHandle {
    pub name: &'static str,
    pub blksize: u32,
    pub fops: &'static dyn crate::fs::FileOps,
    pub bops: &'static dyn crate::fs::BlockOps,
}

pub struct DeviceTable {
    chr: crate::lock::SpinLock<[Option<Device>; NR_CHRDEV]>,
    blk: crate::lock::SpinLock<[Option<Device>; NR_BLKDEV]>,
}

impl DeviceTable {
    pub const fn zero() -> Self {
        const NONE: Option<Device> = None;
        Self {
            chr: crate::lock::SpinLock::new("chrdevs", [NONE; NR_CHRDEV]),
            blk: crate::lock::SpinLock::new("blkdevs", [NONE; NR_BLKDEV]),
        }
    }

    pub fn register(&self, kind: u32, dev: Device) -> Result<()> {
        let table = if kind == CHR_DEV { &self.chr } else { &self.blk };
        let mut table = table.lock();
        let slot = table
            .get_mut(dev.major as usize)
            .ok_or(Errno::EINVAL)?;
        if slot.is_some() {
            return Err(Errno::EBUSY);
        }
        *slot = Some(dev);
        Ok(())
    }

    /// Mark one minor of an already-registered major as present.
    pub fn add_minor(&self, kind: u32, major_no: u32, minor_no: u32) -> Result<()> {
        let table = if kind == CHR_DEV { &self.chr } else { &self.blk };
        let mut table = table.lock();
        let slot = table
            .get_mut(major_no as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::ENXIO)?;
        slot.set_minor(minor_no);
        Ok(())
    }

    /// Look up `dev`, checking minor-bitmap membership.
    pub fn get(&self, kind: u32, dev: u32) -> Option<DeviceHandle> {
        let table = if kind == CHR_DEV { &self.chr } else { &self.blk };
        let table = table.lock();
        let d = table.get(major(dev) as usize)?.as_ref()?;
        if !d.has_minor(minor(dev)) {
            return None;
        }
        Some(DeviceHandle {
            name: d.name,
            blksize: d.blksize,
            fops: d.ops.fops,
            bops: d.ops.bops,
        })
    }

    pub fn blksize(&self, dev: u32) -> u32 {
        self.get(BLK_DEV, dev).map(|d| d.blksize).unwrap_or(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FsOpFlags, FsOps};

    static OPS: FsOps = FsOps::empty(FsOpFlags::REQUIRES_DEV);

    #[test]
    fn dev_number_packing() {
        let dev = mkdev(3, 65);
        assert_eq!(major(dev), 3);
        assert_eq!(minor(dev), 65);
    }

    #[test]
    fn registry_checks_minor_bitmap() {
        let t = DeviceTable::zero();
        let mut d = Device::new("hd", 3, 1024, &OPS);
        d.set_minor(0);
        d.set_minor(64);
        t.register(BLK_DEV, d).unwrap();

        assert!(t.get(BLK_DEV, mkdev(3, 0)).is_some());
        assert!(t.get(BLK_DEV, mkdev(3, 64)).is_some());
        assert!(t.get(BLK_DEV, mkdev(3, 1)).is_none());
        assert!(t.get(BLK_DEV, mkdev(4, 0)).is_none());
        assert!(t.get(CHR_DEV, mkdev(3, 0)).is_none());

        t.add_minor(BLK_DEV, 3, 1).unwrap();
        assert!(t.get(BLK_DEV, mkdev(3, 1)).is_some());
    }

    #[test]
    fn duplicate_major_is_rejected() {
        let t = DeviceTable::zero();
        t.register(CHR_DEV, Device::new("tty", 4, 0, &OPS)).unwrap();
        assert_eq!(
            t.register(CHR_DEV, Device::new("tty2", 4, 0, &OPS)).unwrap_err(),
            Errno::EBUSY
        );
    }
}
