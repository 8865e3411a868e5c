//! Multiboot command-line parameters.
//!
//! `root=` names the root device, `rootfstype=` its filesystem,
//! `ramdisksize=` is clamped to a sane ceiling, and everything after
//! `--` belongs to init, not the kernel.

use arrayvec::ArrayVec;

use crate::{
    dev::mkdev,
    ide::IDE_MAJOR,
    param::RAMDISK_MAX_KB,
};

const VALUE_MAX: usize = 32;
const INIT_ARGS_MAX: usize = 128;

pub struct BootParams {
    pub root_dev: Option<u32>,
    pub rootfstype: ArrayVec<u8, VALUE_MAX>,
    pub noramdisk: bool,
    pub ramdisksize_kb: usize,
    pub initrd: ArrayVec<u8, VALUE_MAX>,
    pub console_dev: Option<u32>,
    /// Everything after `--`, passed to init verbatim.
    pub init_args: ArrayVec<u8, INIT_ARGS_MAX>,
}

impl BootParams {
    pub fn defaults() -> Self {
        Self {
            root_dev: None,
            rootfstype: ArrayVec::new(),
            noramdisk: false,
            ramdisksize_kb: 0,
            initrd: ArrayVec::new(),
            console_dev: None,
            init_args: ArrayVec::new(),
        }
    }

    pub fn rootfstype_str(&self) -> &str {
        core::str::from_utf8(&self.rootfstype).unwrap_or("")
    }
}

/// Map a device path from the command line to a device number.
/// Only the devices the core knows about resolve here.
pub fn name_to_dev(name: &[u8]) -> Option<u32> {
    let tail = name.strip_prefix(b"/dev/")?;
    match tail {
        b"hda" => return Some(mkdev(IDE_MAJOR, 0)),
        b"hdb" => return Some(mkdev(IDE_MAJOR, 64)),
        b"hdc" => return Some(mkdev(IDE_MAJOR, 128)),
        b"hdd" => return Some(mkdev(IDE_MAJOR, 192)),
        b"ram0" => return Some(mkdev(1, 0)),
        b"console" => return Some(mkdev(5, 1)),
        b"ttyS0" => return Some(mkdev(4, 64)),
        _ => {}
    }
    // hdXN: partition N of a disk.
    if tail.len() == 4 && tail.starts_with(b"hd") {
        let unit = match tail[2] {
            b'a' => 0,
            b'b' => 64,
            b'c' => 128,
            b'd' => 192,
            _ => return None,
        };
        let part = (tail[3] as char).to_digit(10)?;
        if part == 0 || part > 8 {
            return None;
        }
        return Some(mkdev(IDE_MAJOR, unit + part));
    }
    None
}

fn parse_number(value: &[u8]) -> Option<usize> {
    let s = core::str::from_utf8(value).ok()?;
    s.parse().ok()
}

/// Parse the Multiboot command line. Unknown words are ignored, which
/// is what boot loaders expect.
pub fn parse_cmdline(cmdline: &[u8]) -> BootParams {
    let mut params = BootParams::defaults();
    let mut rest = cmdline;

    // The string after "--" delimits kernel args from init args.
    if let Some(pos) = cmdline
        .windows(2)
        .position(|w| w == b"--")
    {
        let (kernel_part, init_part) = cmdline.split_at(pos);
        rest = kernel_part;
        let init_part = &init_part[2..];
        let trimmed = trim(init_part);
        let _ = params.init_args.try_extend_from_slice(trimmed);
    }

    for word in rest.split(|b| *b == b' ').filter(|w| !w.is_empty()) {
        let (key, value) = match word.iter().position(|b| *b == b'=') {
            Some(eq) => (&word[..eq], &word[eq + 1..]),
            None => (word, &word[..0]),
        };
        match key {
            b"root" => params.root_dev = name_to_dev(value),
            b"rootfstype" => {
                params.rootfstype.clear();
                let _ = params.rootfstype.try_extend_from_slice(value);
            }
            b"noramdisk" => params.noramdisk = true,
            b"ramdisksize" => {
                // Clamped: a typo must not eat the whole RAM.
                let kb = parse_number(value).unwrap_or(0);
                params.ramdisksize_kb = core::cmp::min(kb, RAMDISK_MAX_KB);
            }
            b"initrd" => {
                params.initrd.clear();
                let _ = params.initrd.try_extend_from_slice(value);
            }
            b"console" => params.console_dev = name_to_dev(value),
            _ => {}
        }
    }
    params
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| *b != b' ').unwrap_or(s.len());
    let end = s.iter().rposition(|b| *b != b' ').map_or(start, |i| i + 1);
    &s[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cmdline_round_trip() {
        let p = parse_cmdline(b"root=/dev/hda1 rootfstype=minix console=/dev/ttyS0 -- -s single");
        assert_eq!(p.root_dev, Some(mkdev(IDE_MAJOR, 1)));
        assert_eq!(p.rootfstype_str(), "minix");
        assert_eq!(p.console_dev, Some(mkdev(4, 64)));
        assert_eq!(&p.init_args[..], b"-s single");
    }

    #[test]
    fn ramdisk_size_is_clamped() {
        let p = parse_cmdline(b"ramdisksize=999999999");
        assert_eq!(p.ramdisksize_kb, RAMDISK_MAX_KB);
        let p = parse_cmdline(b"ramdisksize=4096 noramdisk");
        assert_eq!(p.ramdisksize_kb, 4096);
        assert!(p.noramdisk);
    }

    #[test]
    fn device_names_resolve() {
        assert_eq!(name_to_dev(b"/dev/hda"), Some(mkdev(3, 0)));
        assert_eq!(name_to_dev(b"/dev/hdb2"), Some(mkdev(3, 66)));
        assert_eq!(name_to_dev(b"/dev/hda0"), None);
        assert_eq!(name_to_dev(b"/dev/sda"), None);
        assert_eq!(name_to_dev(b"hda"), None);
    }

    #[test]
    fn unknown_words_are_ignored() {
        let p = parse_cmdline(b"quiet splash root=/dev/hdb");
        assert_eq!(p.root_dev, Some(mkdev(3, 64)));
        assert!(!p.noramdisk);
    }

    #[test]
    fn empty_cmdline_gives_defaults() {
        let p = parse_cmdline(b"");
        assert!(p.root_dev.is_none());
        assert!(p.init_args.is_empty());
    }
}
