//! Bit-exact numeric constants (spec §6.1).

/// Page size assumed throughout the core. Matches the host's usual 4 KiB
/// anonymous page; the compressor and zram adapter are expected to agree.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of extent size.
pub const EXTENT_SHIFT: u32 = 14;
/// Bytes per extent.
pub const EXTENT_SIZE: usize = 1 << EXTENT_SHIFT;
/// Pages per extent.
pub const EXTENT_PG_CNT: usize = EXTENT_SIZE / PAGE_SIZE;
/// 512-byte sectors per extent.
pub const EXTENT_SECTOR_SIZE: u64 = (EXTENT_PG_CNT as u64) << 3;
/// Upper bound of objects packable into a single extent.
pub const EXTENT_MAX_OBJ_CNT: usize = 30 * EXTENT_PG_CNT;

/// Reclaim granularity: a group is not worth reclaiming below this size.
pub const MIN_RECLAIM_ZRAM_SZ: usize = 1 << 20;
/// I/O back-pressure threshold, in pages.
pub const MAX_INFLIGHT: usize = 256;
/// Max pages per submitted block request (stands in for the platform's
/// block-layer cap, e.g. `BIO_MAX_VECS`).
pub const BIO_MAX_PAGES: usize = 256;
/// Fault-in retry budget against a busy extent.
pub const GET_EXTENT_MAX_TIMES: u32 = 100_000;
/// Back-off between busy-extent retries.
pub const EXTENT_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_micros(50);
/// Back-off used by `untrack`'s wait for a transient object state to clear.
pub const UNTRACK_WAIT_BACKOFF: std::time::Duration = std::time::Duration::from_micros(50);

/// Size of the group-node region absent an externally supplied value.
/// Real deployments pass `nr_mcgs` explicitly to `Area::create`; this is
/// only a convenience default mirroring `MEM_CGROUP_ID_MAX + 1`.
pub const MEM_CGROUP_ID_MAX: u32 = 0xFFFF;

/// Back-pressure poll interval for `ReclaimIn` plugs (§4.4).
pub const INFLIGHT_WAIT_POLL: std::time::Duration = std::time::Duration::from_millis(100);
/// Per-iteration timeout for `FaultOut` plug completion.
pub const FAULT_OUT_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(800);
/// Overall cap on `FaultOut` plug completion before giving up and logging.
pub const FAULT_OUT_WAIT_CAP: std::time::Duration = std::time::Duration::from_millis(5000);
