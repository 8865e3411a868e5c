//! Interrupt-disable regions.
//!
//! Short critical sections that touch lists shared with IRQ handlers run
//! with interrupts off. `HeldInterrupts` is the scoped form; `push_off`
//! and `pop_off` are the matched raw form used by the spinlock, so nested
//! sections restore the interrupt flag only at the outermost exit.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::arch::x86::{intr_get, intr_off, intr_on};

// One CPU, so the nesting depth is a kernel-global.
static NOFF: AtomicI32 = AtomicI32::new(0);
static INTENA: AtomicBool = AtomicBool::new(false);

/// like intr_off()/intr_on() except that they are matched:
/// it takes two pop_off()s to undo two push_off()s. Also, if interrupts
/// are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();
    unsafe { intr_off() };

    if NOFF.load(Ordering::Relaxed) == 0 {
        INTENA.store(old, Ordering::Relaxed);
    }
    let _ = NOFF.fetch_add(1, Ordering::Relaxed);
}

/// pop_off() should be paired with push_off().
pub fn pop_off() {
    debug_assert!(!intr_get(), "pop_off - interruptible");
    let noff = NOFF.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(noff >= 1, "pop_off");

    if noff == 1 && INTENA.load(Ordering::Relaxed) {
        unsafe { intr_on() };
    }
}

/// Scoped interrupts-off region; re-enables on every exit path.
pub struct HeldInterrupts;

impl HeldInterrupts {
    pub fn new() -> Self {
        push_off();
        HeldInterrupts
    }
}

impl Default for HeldInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        pop_off();
    }
}
