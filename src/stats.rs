//! Per-worker scheduler counters.  Collection is always on (one array
//! slot bump per event); the end-of-run dump is behind the `stats`
//! feature.

#[derive(Copy, Clone)]
pub(crate) struct StatSlot(pub usize);

pub(crate) const ST_G_CREATED: StatSlot = StatSlot(0);
pub(crate) const ST_G_FREED: StatSlot = StatSlot(1);
pub(crate) const ST_READY_CALLS: StatSlot = StatSlot(2);
pub(crate) const ST_PARK_CALLS: StatSlot = StatSlot(3);
pub(crate) const ST_SCHED_SWITCH: StatSlot = StatSlot(4);
pub(crate) const ST_HANDOFF: StatSlot = StatSlot(5);
pub(crate) const ST_M_SPAWNED: StatSlot = StatSlot(6);
pub(crate) const ST_SYSCALL_FAST: StatSlot = StatSlot(7);
pub(crate) const ST_SYSCALL_SLOW: StatSlot = StatSlot(8);
pub(crate) const ST_EXITSYSCALL_FAST: StatSlot = StatSlot(9);
pub(crate) const ST_EXITSYSCALL_SLOW: StatSlot = StatSlot(10);
pub(crate) const ST_STACK_GROW: StatSlot = StatSlot(11);
pub(crate) const ST_STACK_RECORD: StatSlot = StatSlot(12);
pub(crate) const ST_STW_ROUNDS: StatSlot = StatSlot(13);
pub(crate) const ST_PANIC_DEFERS: StatSlot = StatSlot(14);

pub(crate) const STAT_COUNT: usize = 15;

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct StatsLocal {
    pub data: [i64; STAT_COUNT],
}

impl StatsLocal {
    pub(crate) const ZERO: StatsLocal = StatsLocal {
        data: [0; STAT_COUNT],
    };
}

#[inline(always)]
pub(crate) fn stat_inc(slot: &StatSlot) {
    let m = crate::sched::tls_m();
    if m.is_null() {
        return;
    }
    unsafe {
        (*m).stats.data[slot.0] += 1;
    }
}

#[cfg(feature = "stats")]
pub(crate) mod dump {
    use super::*;
    use crate::sys::fd_write_bytes;
    use std::fmt::Write;

    const NAMES: [&str; STAT_COUNT] = [
        "g_created",
        "g_freed",
        "ready_calls",
        "park_calls",
        "sched_switch",
        "handoff",
        "m_spawned",
        "syscall_fast",
        "syscall_slow",
        "exitsyscall_fast",
        "exitsyscall_slow",
        "stack_grow",
        "stack_record",
        "stw_rounds",
        "panic_defers",
    ];

    /// Sum the per-worker slots and print one line per counter.  Must be
    /// called while the worker list is still intact.
    pub(crate) unsafe fn dump_stats() {
        let mut totals = [0i64; STAT_COUNT];
        let mut m = crate::sched::allm_head();
        while !m.is_null() {
            for (i, t) in totals.iter_mut().enumerate() {
                *t += (*m).stats.data[i];
            }
            m = (*m).alllink;
        }
        let mut out = String::new();
        let _ = writeln!(out, "greenrt stats:");
        for (i, name) in NAMES.iter().enumerate() {
            let _ = writeln!(out, "  {:<18} {}", name, totals[i]);
        }
        fd_write_bytes(2, out.as_bytes());
    }
}
