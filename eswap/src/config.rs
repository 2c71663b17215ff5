//! Configuration knobs (spec §6.6), shared by `Arc` across `Area`,
//! `ExtentManager`, `IOScheduler` and `ReclaimLoop` instead of a single
//! "giant settings struct" (Design Notes §9).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Log level knob mirroring `eswap_loglevel_store`'s 0..4 range. Not wired
/// to the `log` crate's own filter — it is exposed purely because §6.6
/// names it as an operator-visible knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Per-group policy knobs (reclaim ratio, refault threshold, priority
/// score) — the resource-group abstraction itself is an external
/// collaborator (§1); this is the thin slice of it the core reads.
#[derive(Debug, Clone, Copy)]
pub struct GroupPolicy {
    /// Percent of `(zram_stored + eswap_stored)` targeted for the eswap
    /// tier, `0..=100`.
    pub ratio: u32,
    pub refault_threshold: u32,
    pub priority: i32,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        GroupPolicy { ratio: 50, refault_threshold: 0, priority: 0 }
    }
}

/// The shared knob bundle (spec §6.6), constructed once and handed to every
/// top-level component by `Arc`.
pub struct Config {
    master_enable: AtomicBool,
    reclaim_in_enable: AtomicBool,
    log_level: AtomicU32,
    watchdog_enable: AtomicBool,
    watchdog_expire_secs: AtomicU64,
}

impl Config {
    pub fn new() -> Self {
        Config {
            master_enable: AtomicBool::new(false),
            reclaim_in_enable: AtomicBool::new(false),
            log_level: AtomicU32::new(LogLevel::Info as u32),
            watchdog_enable: AtomicBool::new(false),
            watchdog_expire_secs: AtomicU64::new(60),
        }
    }

    pub fn master_enable(&self) -> bool {
        self.master_enable.load(Ordering::Acquire)
    }
    pub fn set_master_enable(&self, on: bool) {
        self.master_enable.store(on, Ordering::Release);
    }

    pub fn reclaim_in_enable(&self) -> bool {
        self.reclaim_in_enable.load(Ordering::Acquire)
    }

    /// Set the reclaim-in flag. Returns true iff this toggled false→true
    /// (callers rearm the watchdog timer on that edge).
    pub fn set_reclaim_in_enable(&self, on: bool) -> bool {
        let prev = self.reclaim_in_enable.swap(on, Ordering::AcqRel);
        on && !prev
    }

    pub fn log_level(&self) -> LogLevel {
        match self.log_level.load(Ordering::Acquire) {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
    pub fn set_log_level(&self, level: LogLevel) {
        self.log_level.store(level as u32, Ordering::Release);
    }

    pub fn watchdog_enable(&self) -> bool {
        self.watchdog_enable.load(Ordering::Acquire)
    }
    pub fn set_watchdog_enable(&self, on: bool) {
        self.watchdog_enable.store(on, Ordering::Release);
    }

    pub fn watchdog_expire(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watchdog_expire_secs.load(Ordering::Acquire))
    }
    pub fn set_watchdog_expire_secs(&self, secs: u64) {
        self.watchdog_expire_secs.store(secs, Ordering::Release);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
