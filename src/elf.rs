//! ELF32 images.

use zerocopy::{AsBytes, FromBytes};

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464c_457f;

pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;

/// Program-header types.
pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;

/// Program-header permission bits.
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// Auxiliary-vector tags pushed for the startup code.
pub const AT_NULL: u32 = 0;
pub const AT_PHDR: u32 = 3;
pub const AT_PHENT: u32 = 4;
pub const AT_PHNUM: u32 = 5;
pub const AT_PAGESZ: u32 = 6;
pub const AT_BASE: u32 = 7;
pub const AT_FLAGS: u32 = 8;
pub const AT_ENTRY: u32 = 9;
pub const AT_UID: u32 = 11;
pub const AT_EUID: u32 = 12;
pub const AT_GID: u32 = 13;
pub const AT_EGID: u32 = 14;

#[derive(Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct ElfHdr {
    /// Must equal ELF_MAGIC.
    pub magic: u32,
    pub ident: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHdr {
    pub fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC && self.typ == ET_EXEC && self.machine == EM_386
    }
}

#[derive(Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgHdr {
    pub fn is_load(&self) -> bool {
        self.typ == PT_LOAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::LayoutVerified;

    #[test]
    fn header_layout_is_52_bytes() {
        assert_eq!(core::mem::size_of::<ElfHdr>(), 52);
        assert_eq!(core::mem::size_of::<ProgHdr>(), 32);
    }

    #[test]
    fn header_parses_from_bytes() {
        let mut raw = [0u8; 52];
        raw[..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        raw[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        raw[18..20].copy_from_slice(&EM_386.to_le_bytes());
        raw[24..28].copy_from_slice(&0x0804_8000u32.to_le_bytes());
        let hdr = LayoutVerified::<_, ElfHdr>::new(&raw[..]).unwrap();
        assert!(hdr.is_valid());
        assert_eq!(hdr.entry, 0x0804_8000);
    }

    #[test]
    fn wrong_machine_is_rejected() {
        let mut hdr = ElfHdr::default();
        hdr.magic = ELF_MAGIC;
        hdr.typ = ET_EXEC;
        hdr.machine = 62; // x86-64
        assert!(!hdr.is_valid());
    }
}
