//! Ticks, callouts and interval timers.
//!
//! The callout table is a singly linked list ordered by expiry where
//! each node stores the delta to its predecessor, so the tick handler
//! only ever decrements the head. Expired callouts run from the
//! callouts bottom half, never from IRQ context.

use array_macro::array;

use crate::{
    arch::x86::SigContext,
    kernel::kernel,
    param::{HZ, NR_CALLOUTS},
    proc::ProcState,
    signal::{send_sig, SIGALRM, SIGPROF, SIGVTALRM},
};

const NO_CALLOUT: u8 = u8::MAX;

/// Identity of a registered callout, for deletion.
pub type CalloutFn = fn(usize);

#[derive(Copy, Clone)]
struct Callout {
    /// Ticks remaining after the predecessor expires.
    expires: u32,
    f: CalloutFn,
    arg: usize,
    next: u8,
}

fn nop(_: usize) {}

impl Callout {
    const fn zero() -> Self {
        Self {
            expires: 0,
            f: nop,
            arg: 0,
            next: NO_CALLOUT,
        }
    }
}

pub struct CalloutTable {
    pool: [Callout; NR_CALLOUTS],
    free_head: u8,
    head: u8,
}

impl CalloutTable {
    pub const fn zero() -> Self {
        Self {
            pool: array![_ => Callout::zero(); NR_CALLOUTS],
            free_head: NO_CALLOUT,
            head: NO_CALLOUT,
        }
    }

    pub fn init(&mut self) {
        self.free_head = NO_CALLOUT;
        for idx in (0..NR_CALLOUTS as u8).rev() {
            self.pool[idx as usize].next = self.free_head;
            self.free_head = idx;
        }
        self.head = NO_CALLOUT;
    }

    fn get_free(&mut self) -> Option<u8> {
        let idx = self.free_head;
        if idx == NO_CALLOUT {
            return None;
        }
        self.free_head = self.pool[idx as usize].next;
        self.pool[idx as usize].next = NO_CALLOUT;
        Some(idx)
    }

    fn put_free(&mut self, idx: u8) {
        self.pool[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    /// Arm a one-shot timer `ticks` from now. Re-arming an identical
    /// `(f, arg)` replaces the earlier registration.
    pub fn add(&mut self, f: CalloutFn, arg: usize, ticks: u32) -> bool {
        self.del(f, arg);
        let idx = match self.get_free() {
            Some(idx) => idx,
            None => return false,
        };
        let c = &mut self.pool[idx as usize];
        c.expires = ticks;
        c.f = f;
        c.arg = arg;
        c.next = NO_CALLOUT;

        // Walk the delta chain: each node consumed subtracts its delta;
        // we park in front of the first node expiring later.
        let mut remaining = ticks;
        let mut link = self.head;
        let mut prev = NO_CALLOUT;
        while link != NO_CALLOUT {
            let link_exp = self.pool[link as usize].expires;
            if link_exp > remaining {
                self.pool[link as usize].expires = link_exp - remaining;
                break;
            }
            remaining -= link_exp;
            prev = link;
            link = self.pool[link as usize].next;
        }
        self.pool[idx as usize].expires = remaining;
        self.pool[idx as usize].next = link;
        if prev == NO_CALLOUT {
            self.head = idx;
        } else {
            self.pool[prev as usize].next = idx;
        }
        true
    }

    /// Cancel a registration; the successor absorbs the freed delta.
    pub fn del(&mut self, f: CalloutFn, arg: usize) {
        let mut prev = NO_CALLOUT;
        let mut link = self.head;
        while link != NO_CALLOUT {
            let c = self.pool[link as usize];
            if c.f == f && c.arg == arg {
                if c.next != NO_CALLOUT {
                    self.pool[c.next as usize].expires += c.expires;
                }
                if prev == NO_CALLOUT {
                    self.head = c.next;
                } else {
                    self.pool[prev as usize].next = c.next;
                }
                self.put_free(link);
                return;
            }
            prev = link;
            link = c.next;
        }
    }

    /// One tick: decrement the head only. Returns true when a callout
    /// became due and the bottom half should run.
    pub fn tick(&mut self) -> bool {
        if self.head == NO_CALLOUT {
            return false;
        }
        let head = &mut self.pool[self.head as usize];
        if head.expires > 0 {
            head.expires -= 1;
        }
        head.expires == 0
    }

    /// Pop every due callout and hand it to `run`.
    pub fn run_expired(&mut self, mut run: impl FnMut(CalloutFn, usize)) {
        while self.head != NO_CALLOUT {
            let idx = self.head;
            let c = self.pool[idx as usize];
            if c.expires != 0 {
                break;
            }
            self.head = c.next;
            self.put_free(idx);
            run(c.f, c.arg);
        }
    }

    /// Ticks until `(f, arg)` fires, if armed. Mostly for diagnostics.
    pub fn remaining(&self, f: CalloutFn, arg: usize) -> Option<u32> {
        let mut acc = 0;
        let mut link = self.head;
        while link != NO_CALLOUT {
            let c = &self.pool[link as usize];
            acc += c.expires;
            if c.f == f && c.arg == arg {
                return Some(acc);
            }
            link = c.next;
        }
        None
    }
}

/// Load-average bookkeeping, sampled every LOAD_FREQ ticks in
/// fixed-point with 11 fraction bits.
pub const FIXED_1: u32 = 1 << 11;
pub const LOAD_FREQ: u32 = 5 * HZ as u32;
pub const EXP_1: u32 = 1884;
pub const EXP_5: u32 = 2014;
pub const EXP_15: u32 = 2037;

pub struct LoadAvg {
    pub avenrun: [u32; 3],
    countdown: u32,
}

impl LoadAvg {
    pub const fn zero() -> Self {
        Self {
            avenrun: [0; 3],
            countdown: LOAD_FREQ,
        }
    }

    pub fn tick(&mut self, active: u32) {
        if self.countdown > 0 {
            self.countdown -= 1;
            return;
        }
        self.countdown = LOAD_FREQ;
        let active = active * FIXED_1;
        for (avg, exp) in self.avenrun.iter_mut().zip([EXP_1, EXP_5, EXP_15]) {
            *avg = (*avg * exp + active * (FIXED_1 - exp)) >> 11;
        }
    }
}

/// The timer IRQ: count the tick, charge the running process by trap
/// mode, and queue the timer bottom half.
pub fn irq_timer(sc: &SigContext) {
    {
        let mut ticks = kernel().ticks.lock();
        *ticks = ticks.wrapping_add(1);
        if *ticks % HZ as u64 == 0 {
            *kernel().uptime_secs.lock() += 1;
        }
        ticks.wakeup();
    }
    kernel().bh_table.mark(crate::trap::BH_TIMER);

    if let Some(slot) = kernel().procs.current_slot() {
        let p = kernel().procs.proc(slot);
        let data = unsafe { &mut *p.data.get() };
        if sc.from_user() {
            data.usage.utime_ticks += 1;
            if data.it_virt_value > 0 {
                data.it_virt_value -= 1;
                if data.it_virt_value == 0 {
                    data.it_virt_value = data.it_virt_interval;
                    let _ = send_sig(slot, SIGVTALRM);
                }
            }
        } else {
            data.usage.stime_ticks += 1;
        }
    }
}

/// The timer bottom half: profiling timers, per-process timeouts and
/// real-interval timers, load average, quantum aging, and the callout
/// head decrement.
pub fn irq_timer_bh() {
    let procs = &kernel().procs;

    if let Some(slot) = procs.current_slot() {
        let p = procs.proc(slot);
        let data = unsafe { &mut *p.data.get() };
        if data.it_prof_value > 0 {
            data.it_prof_value -= 1;
            if data.it_prof_value == 0 {
                data.it_prof_value = data.it_prof_interval;
                let _ = send_sig(slot, SIGPROF);
            }
        }
    }

    kernel().loadavg.lock().tick(procs.count_runnable());

    let mut slots = [0usize; crate::param::NPROC];
    let n = procs.allocated(&mut slots);
    for &slot in &slots[..n] {
        let p = procs.proc(slot);
        {
            let mut guard = p.lock();
            if guard.timeout > 0 {
                guard.timeout -= 1;
                if guard.timeout == 0 && guard.state == ProcState::Sleeping {
                    guard.wakeup();
                }
            }
        }
        let fire_alarm = {
            let data = unsafe { &mut *p.data.get() };
            if data.it_real_value > 0 {
                data.it_real_value -= 1;
                if data.it_real_value == 0 {
                    data.it_real_value = data.it_real_interval;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if fire_alarm {
            let _ = send_sig(slot, SIGALRM);
        }
    }

    if kernel().callouts.lock().tick() {
        kernel().bh_table.mark(crate::trap::BH_CALLOUTS);
    }

    // Quantum aging of the running process; the idle process (pid 0)
    // has no quantum to spend.
    if let Some(slot) = procs.current_slot() {
        let p = procs.proc(slot);
        let mut guard = p.lock();
        if guard.pid != 0 {
            guard.cpu_count -= 1;
            if guard.cpu_count <= 0 {
                guard.cpu_count = 0;
                procs.set_need_resched();
            }
        }
    }
}

/// The callouts bottom half.
pub fn do_callouts_bh() {
    // Handlers run outside the table lock.
    let mut batch: [(CalloutFn, usize); NR_CALLOUTS] = [(nop, 0); NR_CALLOUTS];
    let mut n = 0;
    kernel().callouts.lock().run_expired(|f, arg| {
        if n < NR_CALLOUTS {
            batch[n] = (f, arg);
            n += 1;
        }
    });
    for &(f, arg) in &batch[..n] {
        f(arg);
    }
}

/// Arm a one-shot timer.
pub fn add_callout(f: CalloutFn, arg: usize, ticks: u32) {
    let ok = kernel().callouts.lock().add(f, arg, ticks);
    if !ok {
        crate::println!("WARNING: add_callout(): no more callout slots!");
    }
}

pub fn del_callout(f: CalloutFn, arg: usize) {
    kernel().callouts.lock().del(f, arg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f_a(_: usize) {}
    fn f_b(_: usize) {}
    fn f_c(_: usize) {}

    fn table() -> CalloutTable {
        let mut t = CalloutTable::zero();
        t.init();
        t
    }

    /// Drive `n` ticks, collecting everything that fires.
    fn run_ticks(t: &mut CalloutTable, n: u32, fired: &mut std::vec::Vec<(CalloutFn, usize)>) {
        for _ in 0..n {
            if t.tick() {
                t.run_expired(|f, arg| fired.push((f, arg)));
            }
        }
    }

    #[test]
    fn deltas_encode_absolute_expiries() {
        let mut t = table();
        assert!(t.add(f_a, 1, 10));
        assert!(t.add(f_b, 2, 3));
        assert!(t.add(f_c, 3, 7));
        assert_eq!(t.remaining(f_b, 2), Some(3));
        assert_eq!(t.remaining(f_c, 3), Some(7));
        assert_eq!(t.remaining(f_a, 1), Some(10));
    }

    #[test]
    fn callouts_fire_in_order_at_the_right_tick() {
        let mut t = table();
        t.add(f_a, 0, 5);
        t.add(f_b, 0, 2);
        let mut fired = std::vec::Vec::new();
        run_ticks(&mut t, 2, &mut fired);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].0 == f_b as CalloutFn);
        run_ticks(&mut t, 3, &mut fired);
        assert_eq!(fired.len(), 2);
        assert!(fired[1].0 == f_a as CalloutFn);
    }

    #[test]
    fn same_tick_callouts_all_fire() {
        let mut t = table();
        t.add(f_a, 1, 4);
        t.add(f_b, 2, 4);
        let mut fired = std::vec::Vec::new();
        run_ticks(&mut t, 4, &mut fired);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn delete_gives_delta_to_successor() {
        let mut t = table();
        t.add(f_a, 0, 3);
        t.add(f_b, 0, 9);
        t.del(f_a, 0);
        assert_eq!(t.remaining(f_b, 0), Some(9));
        let mut fired = std::vec::Vec::new();
        run_ticks(&mut t, 9, &mut fired);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].0 == f_b as CalloutFn);
    }

    #[test]
    fn rearming_replaces_previous_registration() {
        let mut t = table();
        t.add(f_a, 7, 100);
        t.add(f_a, 7, 2);
        assert_eq!(t.remaining(f_a, 7), Some(2));
        let mut fired = std::vec::Vec::new();
        run_ticks(&mut t, 2, &mut fired);
        assert_eq!(fired.len(), 1);
        // And nothing remains armed.
        run_ticks(&mut t, 200, &mut fired);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn pool_exhaustion_reports_failure() {
        let mut t = table();
        for i in 0..NR_CALLOUTS {
            assert!(t.add(f_a, i, 10));
        }
        assert!(!t.add(f_b, 999, 10));
    }

    #[test]
    fn load_average_rises_under_load() {
        let mut l = LoadAvg::zero();
        for _ in 0..(LOAD_FREQ * 3) {
            l.tick(2);
        }
        assert!(l.avenrun[0] > 0);
        assert!(l.avenrun[0] >= l.avenrun[2]);
    }
}
