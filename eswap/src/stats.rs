//! Atomic counters, global and per-group (spec §3 supplement, §8 law 6).
//!
//! Field names and the extra `miss_free`/`compr_data_size`/`pages_stored`
//! counters follow `eswap_stats.c` / `eswap_common.h` rather than spec.md's
//! abbreviated "a stats struct", so the counter-conservation law (§8) is
//! actually testable end to end.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Global counters mirroring `struct eswap_stat`.
#[derive(Default)]
pub struct Stats {
    pub zram_stored_pages: AtomicI64,
    pub zram_stored_size: AtomicI64,
    pub stored_pages: AtomicI64,
    pub stored_size: AtomicI64,
    pub compr_data_size: AtomicI64,
    pub pages_stored: AtomicI64,

    pub reclaimin_cnt: AtomicU64,
    pub reclaimin_bytes: AtomicU64,
    pub reclaimin_pages: AtomicU64,
    pub faultout_cnt: AtomicU64,
    pub faultout_bytes: AtomicU64,
    pub faultout_pages: AtomicU64,
    pub reout_pages: AtomicU64,
    pub reout_bytes: AtomicU64,

    pub notify_free: AtomicU64,
    /// Incremented whenever `untrack`/`delete` observe an index already
    /// absent from bookkeeping — a no-op per the idempotence law, but
    /// worth counting.
    pub miss_free: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-group counters mirroring `struct oem_mem_cgroup`'s eswap fields.
#[derive(Default)]
pub struct GroupStats {
    pub zram_stored_size: AtomicI64,
    pub zram_stored_pages: AtomicI64,
    pub eswap_stored_size: AtomicI64,
    pub eswap_stored_pages: AtomicI64,
    pub fault_cnt: AtomicU64,
}

impl GroupStats {
    pub fn new() -> Self {
        Self::default()
    }
}

fn add_i64(counter: &AtomicI64, delta: i64) {
    counter.fetch_add(delta, Ordering::Relaxed);
}

impl Stats {
    pub fn on_track(&self, size: u32) {
        add_i64(&self.zram_stored_size, size as i64);
        add_i64(&self.zram_stored_pages, 1);
    }

    pub fn on_untrack(&self, size: u32) {
        add_i64(&self.zram_stored_size, -(size as i64));
        add_i64(&self.zram_stored_pages, -1);
    }

    pub fn on_spill(&self, size: u32) {
        add_i64(&self.stored_size, size as i64);
        add_i64(&self.stored_pages, 1);
    }

    pub fn on_fault_in(&self, size: u32) {
        add_i64(&self.stored_size, -(size as i64));
        add_i64(&self.stored_pages, -1);
        self.faultout_pages.fetch_add(1, Ordering::Relaxed);
    }

    /// A WB object vanishing without a fault-in (`delete()`'s WB branch):
    /// same `stored_size`/`stored_pages` decrement as `on_fault_in`, but
    /// without counting it as a fault-out.
    pub fn dec_stored(&self, size: u32) {
        add_i64(&self.stored_size, -(size as i64));
        add_i64(&self.stored_pages, -1);
    }
}

impl GroupStats {
    pub fn on_track(&self, size: u32) {
        add_i64(&self.zram_stored_size, size as i64);
        add_i64(&self.zram_stored_pages, 1);
    }

    pub fn on_untrack(&self, size: u32) {
        add_i64(&self.zram_stored_size, -(size as i64));
        add_i64(&self.zram_stored_pages, -1);
    }

    pub fn on_spill(&self, size: u32) {
        add_i64(&self.eswap_stored_size, size as i64);
        add_i64(&self.eswap_stored_pages, 1);
    }

    pub fn on_fault_in(&self, size: u32) {
        add_i64(&self.eswap_stored_size, -(size as i64));
        add_i64(&self.eswap_stored_pages, -1);
        self.fault_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// See `Stats::dec_stored`.
    pub fn dec_stored(&self, size: u32) {
        add_i64(&self.eswap_stored_size, -(size as i64));
        add_i64(&self.eswap_stored_pages, -1);
    }
}
