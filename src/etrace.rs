//! Panic diagnostics: register dump and an EBP-chain stack trace
//! resolved against the kernel's compiled-in symbol table.

use crate::arch::x86::{SigContext, PAGE_OFFSET};
use crate::kernel::kernel;
use crate::println;

/// One kernel symbol: start address and name, sorted by address.
pub type SymbolEntry = (usize, &'static str);

/// Find the symbol covering `addr` in a sorted table.
pub fn resolve(symtab: &[SymbolEntry], addr: usize) -> Option<(&'static str, usize)> {
    let idx = match symtab.binary_search_by_key(&addr, |e| e.0) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    let (start, name) = symtab[idx];
    Some((name, addr - start))
}

pub fn dump_registers(sc: &SigContext) {
    println!(
        "EIP: {:04x}:{:08x}  EFLAGS: {:08x}",
        sc.cs, sc.eip, sc.eflags
    );
    println!(
        "EAX: {:08x} EBX: {:08x} ECX: {:08x} EDX: {:08x}",
        sc.eax, sc.ebx, sc.ecx, sc.edx
    );
    println!(
        "ESI: {:08x} EDI: {:08x} EBP: {:08x} ESP: {:08x}",
        sc.esi, sc.edi, sc.ebp, sc.oldesp
    );
    println!("DS: {:04x} ES: {:04x} ERR: {:08x}", sc.ds, sc.es, sc.err);
    stack_trace(sc.ebp as usize);
}

/// Walk the saved-EBP chain: each frame holds [saved ebp, return addr].
pub fn stack_trace(mut ebp: usize) {
    println!("Call trace:");
    let symtab = kernel().symtab();
    for _ in 0..16 {
        if ebp < PAGE_OFFSET || ebp & 3 != 0 {
            break;
        }
        let (next, ret) = unsafe {
            let frame = ebp as *const usize;
            (*frame, *frame.add(1))
        };
        if ret == 0 {
            break;
        }
        match symtab.and_then(|t| resolve(t, ret)) {
            Some((name, off)) => println!("  [<{:08x}>] {}+{:#x}", ret, name, off),
            None => println!("  [<{:08x}>]", ret),
        }
        if next <= ebp {
            break;
        }
        ebp = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYMS: &[SymbolEntry] = &[
        (0xc0100000, "kernel_main"),
        (0xc0101000, "do_syscall"),
        (0xc0102500, "bread"),
    ];

    #[test]
    fn resolves_to_enclosing_symbol() {
        assert_eq!(resolve(SYMS, 0xc0100010), Some(("kernel_main", 0x10)));
        assert_eq!(resolve(SYMS, 0xc0101000), Some(("do_syscall", 0)));
        assert_eq!(resolve(SYMS, 0xc0102fff), Some(("bread", 0xaff)));
    }

    #[test]
    fn below_first_symbol_is_unknown() {
        assert_eq!(resolve(SYMS, 0x1000), None);
    }
}
