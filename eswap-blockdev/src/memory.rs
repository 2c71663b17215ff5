use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eswap::{BlockDevice, BlockOp, BlockRequest, Error, IoStatus, Result};
use log::warn;
use parking_lot::Mutex;

/// A `Vec<u8>`-backed device guarded by a mutex, with a dedicated thread
/// spawned per request so callers observe genuinely asynchronous
/// completion (exercising `IOScheduler`'s inflight waiters the way a real
/// block layer would). Latency and a one-shot failure injection are
/// exposed for exercising §7's failure paths.
pub struct MemoryBlockDevice {
    sector_size: u32,
    capacity_sectors: u64,
    data: Arc<Mutex<Vec<u8>>>,
    latency: Mutex<Duration>,
    inject_failure: AtomicBool,
}

impl MemoryBlockDevice {
    pub fn new(sector_size: u32, capacity_sectors: u64) -> Self {
        let bytes = sector_size as usize * capacity_sectors as usize;
        MemoryBlockDevice {
            sector_size,
            capacity_sectors,
            data: Arc::new(Mutex::new(vec![0u8; bytes])),
            latency: Mutex::new(Duration::ZERO),
            inject_failure: AtomicBool::new(false),
        }
    }

    /// Artificial per-request delay before the completion callback fires.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next submitted request completes with `IoStatus::Eio` instead
    /// of touching the backing buffer; the flag then clears itself.
    pub fn inject_next_failure(&self) {
        self.inject_failure.store(true, Ordering::Release);
    }

    fn take_injected_failure(&self) -> bool {
        self.inject_failure.swap(false, Ordering::AcqRel)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn submit(&self, request: BlockRequest) -> Result<()> {
        let data = self.data.clone();
        let byte_offset = request.start_sector as usize * self.sector_size as usize;
        let latency = *self.latency.lock();
        let fail = self.take_injected_failure();

        std::thread::Builder::new()
            .name("eswap-memdev".into())
            .spawn(move || {
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                if fail {
                    warn!("eswap-memdev: injected failure on sector {byte_offset}");
                    (request.on_complete)(request.pages, IoStatus::Eio);
                    return;
                }
                let mut pages = request.pages;
                let mut buf = data.lock();
                let mut off = byte_offset;
                match request.op {
                    BlockOp::Write => {
                        for page in &pages {
                            buf[off..off + page.len()].copy_from_slice(page);
                            off += page.len();
                        }
                    }
                    BlockOp::Read => {
                        for page in pages.iter_mut() {
                            page.copy_from_slice(&buf[off..off + page.len()]);
                            off += page.len();
                        }
                    }
                }
                drop(buf);
                (request.on_complete)(pages, IoStatus::Ok);
            })
            .map_err(|_| Error::IoFailed)?;
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }
}
