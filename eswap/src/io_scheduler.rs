//! Batches extent I/O into merged block requests with inflight limits and
//! completion dispatch (spec §4.4).

use log::{error, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::block_device::{BlockDevice, BlockOp, BlockRequest, IoStatus};
use crate::constants::{
    BIO_MAX_PAGES, EXTENT_PG_CNT, EXTENT_SECTOR_SIZE, FAULT_OUT_WAIT_CAP, FAULT_OUT_WAIT_TIMEOUT,
    INFLIGHT_WAIT_POLL, MAX_INFLIGHT,
};
use crate::error::{Error, Result};

/// Which retry/back-pressure policy a plug's I/O follows (spec §4.4/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    ReclaimIn,
    FaultOut,
}

/// One extent's worth of I/O submitted to a plug. `pages` must have
/// exactly `EXTENT_PG_CNT` entries. `done` fires once, in submission
/// order relative to other entries of the same segment, carrying back the
/// (possibly device-populated, for reads) page buffers.
pub struct IoEntry {
    pub ext_id: u32,
    pub pages: Vec<Vec<u8>>,
    pub done: Box<dyn FnOnce(Vec<Vec<u8>>, IoStatus) + Send>,
}

/// A gate used two ways in this module: the scheduler-wide back-pressure
/// counter (shared across all plugs) and each plug's own "work I
/// submitted is still outstanding" counter (§5's two distinct suspension
/// points).
struct PageGate {
    pages: Mutex<u32>,
    cv: Condvar,
}

impl PageGate {
    fn new() -> Self {
        PageGate { pages: Mutex::new(0), cv: Condvar::new() }
    }

    fn add(&self, n: u32) {
        *self.pages.lock() += n;
    }

    fn sub(&self, n: u32) {
        let mut guard = self.pages.lock();
        *guard = guard.saturating_sub(n);
        self.cv.notify_all();
    }

    fn get(&self) -> u32 {
        *self.pages.lock()
    }

    /// Blocks until `pages < limit`, polling at `poll` intervals (spec
    /// §4.4's "sleep up to 100 ms per wait iteration").
    fn wait_below(&self, limit: u32, poll: Duration) {
        let mut guard = self.pages.lock();
        while *guard >= limit {
            self.cv.wait_for(&mut guard, poll);
        }
    }

    /// Blocks until `pages == 0`, polling at `poll` with an overall `cap`.
    /// Returns `false` if `cap` elapsed first (§4.4's FaultOut timeout).
    fn wait_zero_capped(&self, poll: Duration, cap: Duration) -> bool {
        let deadline = Instant::now() + cap;
        let mut guard = self.pages.lock();
        while *guard != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            self.cv.wait_for(&mut guard, poll);
        }
        true
    }

    /// Blocks until `pages == 0` with no overall cap (ReclaimIn's plug
    /// finish).
    fn wait_zero(&self, poll: Duration) {
        let mut guard = self.pages.lock();
        while *guard != 0 {
            self.cv.wait_for(&mut guard, poll);
        }
    }
}

/// A run of adjacent extents merged into one block request (spec §4.4
/// "Segmenting").
struct Segment {
    start_sector: u64,
    op: BlockOp,
    entries: Vec<IoEntry>,
}

impl Segment {
    fn new(op: BlockOp, entry: IoEntry) -> Self {
        Segment { start_sector: entry.ext_id as u64 * EXTENT_SECTOR_SIZE, op, entries: vec![entry] }
    }

    fn page_count(&self) -> usize {
        self.entries.len() * EXTENT_PG_CNT
    }

    fn end_sector(&self) -> u64 {
        self.start_sector + self.entries.len() as u64 * EXTENT_SECTOR_SIZE
    }

    /// Try to fold `entry` onto the front or back of this segment. `Err`
    /// hands the entry back unmerged.
    fn try_merge(&mut self, entry: IoEntry) -> std::result::Result<(), IoEntry> {
        if self.page_count() + EXTENT_PG_CNT > BIO_MAX_PAGES {
            return Err(entry);
        }
        let entry_start = entry.ext_id as u64 * EXTENT_SECTOR_SIZE;
        if entry_start == self.end_sector() {
            self.entries.push(entry);
            Ok(())
        } else if entry_start + EXTENT_SECTOR_SIZE == self.start_sector {
            self.start_sector = entry_start;
            self.entries.insert(0, entry);
            Ok(())
        } else {
            Err(entry)
        }
    }

    fn flat_pages(&self) -> Vec<Vec<u8>> {
        self.entries.iter().flat_map(|e| e.pages.iter().cloned()).collect()
    }
}

enum CompletionKind {
    Read,
    Write,
}

struct CompletionJob {
    entries: Vec<IoEntry>,
    pages: Vec<Vec<u8>>,
    status: IoStatus,
    global_gate: Arc<PageGate>,
    plug_gate: Arc<PageGate>,
}

fn run_completion(job: CompletionJob) {
    let total_pages = (job.entries.len() * EXTENT_PG_CNT) as u32;
    let mut pages = job.pages;
    for entry in job.entries {
        let chunk: Vec<Vec<u8>> = pages.drain(..EXTENT_PG_CNT.min(pages.len())).collect();
        (entry.done)(chunk, job.status);
    }
    job.global_gate.sub(total_pages);
    job.plug_gate.sub(total_pages);
}

/// Best-effort thread-priority lowering for the write-completion pool
/// (Open Question #3: a no-op where the host exposes no priority syscall;
/// real effect is platform-specific so this is purely advisory).
fn lower_priority_best_effort() {}

/// Owns the two completion worker pools and the scheduler-wide
/// back-pressure counter. One instance is shared by every `Plug`.
pub struct IOScheduler {
    read_tx: crossbeam_channel::Sender<CompletionJob>,
    write_tx: crossbeam_channel::Sender<CompletionJob>,
    global_gate: Arc<PageGate>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl IOScheduler {
    /// Spawns `read_workers` threads for the high-priority/unbound read
    /// pool and `write_workers` for the CPU-intensive write pool (spec
    /// §4.4's two work-queues).
    pub fn new(read_workers: usize, write_workers: usize) -> Self {
        let (read_tx, read_rx) = crossbeam_channel::unbounded::<CompletionJob>();
        let (write_tx, write_rx) = crossbeam_channel::unbounded::<CompletionJob>();
        let mut workers = Vec::with_capacity(read_workers + write_workers);

        for i in 0..read_workers.max(1) {
            let rx = read_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("eswap-io-read-{i}"))
                    .spawn(move || {
                        for job in rx {
                            run_completion(job);
                        }
                    })
                    .expect("spawn read completion worker"),
            );
        }
        for i in 0..write_workers.max(1) {
            let rx = write_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("eswap-io-write-{i}"))
                    .spawn(move || {
                        lower_priority_best_effort();
                        for job in rx {
                            run_completion(job);
                        }
                    })
                    .expect("spawn write completion worker"),
            );
        }

        IOScheduler { read_tx, write_tx, global_gate: Arc::new(PageGate::new()), _workers: workers }
    }

    /// Opens a plug for a batch of extent I/O under one scenario (spec
    /// §4.4's `plug_start`).
    pub fn plug_start(&self, device: Arc<dyn BlockDevice>, scenario: Scenario) -> Plug {
        Plug {
            device,
            scenario,
            segment: Mutex::new(None),
            global_gate: self.global_gate.clone(),
            plug_gate: Arc::new(PageGate::new()),
            read_tx: self.read_tx.clone(),
            write_tx: self.write_tx.clone(),
        }
    }
}

/// A batch of segmented I/O against one block device. Not `Send` across
/// concurrent submitters — spec §5's "one plug, one submitter" — but the
/// `Arc` gates it shares are safely touched from completion workers.
pub struct Plug {
    device: Arc<dyn BlockDevice>,
    scenario: Scenario,
    segment: Mutex<Option<Segment>>,
    global_gate: Arc<PageGate>,
    plug_gate: Arc<PageGate>,
    read_tx: crossbeam_channel::Sender<CompletionJob>,
    write_tx: crossbeam_channel::Sender<CompletionJob>,
}

impl Plug {
    pub fn read_extent(&self, entry: IoEntry) -> Result<()> {
        self.submit_entry(entry, BlockOp::Read)
    }

    pub fn write_extent(&self, entry: IoEntry) -> Result<()> {
        self.submit_entry(entry, BlockOp::Write)
    }

    fn submit_entry(&self, entry: IoEntry, op: BlockOp) -> Result<()> {
        if matches!(self.scenario, Scenario::ReclaimIn) && matches!(op, BlockOp::Write) {
            self.global_gate.wait_below(MAX_INFLIGHT as u32, INFLIGHT_WAIT_POLL);
        }

        let mut guard = self.segment.lock();
        let entry = match guard.as_mut() {
            Some(seg) if seg.op == op => match seg.try_merge(entry) {
                Ok(()) => {
                    if guard.as_ref().unwrap().page_count() >= BIO_MAX_PAGES {
                        let seg = guard.take().unwrap();
                        return self.submit_segment(seg);
                    }
                    return Ok(());
                }
                Err(entry) => entry,
            },
            _ => entry,
        };

        // Not mergeable (different op, full, or no open segment): flush
        // whatever was open, then start a new one with this entry.
        if let Some(seg) = guard.take() {
            self.submit_segment(seg)?;
        }
        *guard = Some(Segment::new(op, entry));
        Ok(())
    }

    fn submit_segment(&self, segment: Segment) -> Result<()> {
        let page_count = segment.page_count() as u32;
        self.global_gate.add(page_count);
        self.plug_gate.add(page_count);

        let global_gate = self.global_gate.clone();
        let plug_gate = self.plug_gate.clone();
        let kind = match segment.op {
            BlockOp::Read => CompletionKind::Read,
            BlockOp::Write => CompletionKind::Write,
        };
        let (read_tx, write_tx) = (self.read_tx.clone(), self.write_tx.clone());
        let entries_len = segment.entries.len();
        let flat_pages = segment.flat_pages();

        let Segment { start_sector, op, entries } = segment;
        let request = BlockRequest {
            start_sector,
            op,
            pages: flat_pages,
            on_complete: Box::new(move |pages, status| {
                let job = CompletionJob { entries, pages, status, global_gate, plug_gate };
                let tx = match kind {
                    CompletionKind::Read => &read_tx,
                    CompletionKind::Write => &write_tx,
                };
                if tx.send(job).is_err() {
                    error!("eswap io scheduler: completion worker pool gone, dropping {entries_len} entries");
                }
            }),
        };

        self.device.submit(request)
    }

    /// Submits any partial segment, then waits for this plug's own
    /// outstanding work to drain (spec §4.4's `plug_finish`).
    pub fn plug_finish(&self) -> Result<()> {
        if let Some(seg) = self.segment.lock().take() {
            self.submit_segment(seg)?;
        }
        match self.scenario {
            Scenario::ReclaimIn => {
                self.plug_gate.wait_zero(INFLIGHT_WAIT_POLL);
                Ok(())
            }
            Scenario::FaultOut => {
                if self.plug_gate.wait_zero_capped(FAULT_OUT_WAIT_TIMEOUT, FAULT_OUT_WAIT_CAP) {
                    Ok(())
                } else {
                    warn!("eswap io scheduler: fault-out plug finish exceeded {FAULT_OUT_WAIT_CAP:?}, giving up");
                    Err(Error::Again)
                }
            }
        }
    }

    /// Snapshot of this plug's own outstanding page count (tests / `eswap-cli stat`).
    pub fn inflight_pages(&self) -> u32 {
        self.plug_gate.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::AtomicUsize;

    /// A device that completes every request synchronously, in-thread,
    /// optionally returning pre-seeded bytes for reads and optionally
    /// failing.
    struct TestDevice {
        fail: bool,
        seeded: PMutex<std::collections::HashMap<u64, Vec<Vec<u8>>>>,
        submits: AtomicUsize,
    }

    impl TestDevice {
        fn new() -> Self {
            TestDevice { fail: false, seeded: PMutex::new(std::collections::HashMap::new()), submits: AtomicUsize::new(0) }
        }

        fn failing() -> Self {
            TestDevice { fail: true, ..TestDevice::new() }
        }

        fn seed(&self, sector: u64, pages: Vec<Vec<u8>>) {
            self.seeded.lock().insert(sector, pages);
        }
    }

    impl BlockDevice for TestDevice {
        fn submit(&self, mut request: BlockRequest) -> Result<()> {
            self.submits.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                (request.on_complete)(request.pages, IoStatus::Eio);
                return Ok(());
            }
            if request.op == BlockOp::Read {
                if let Some(seeded) = self.seeded.lock().get(&request.start_sector) {
                    request.pages = seeded.clone();
                }
            }
            (request.on_complete)(request.pages, IoStatus::Ok);
            Ok(())
        }

        fn sector_size(&self) -> u32 {
            512
        }
        fn capacity_sectors(&self) -> u64 {
            1 << 20
        }
    }

    fn entry(ext_id: u32, tx: crossbeam_channel::Sender<(Vec<Vec<u8>>, IoStatus)>) -> IoEntry {
        IoEntry {
            ext_id,
            pages: (0..EXTENT_PG_CNT).map(|_| vec![0u8; 4096]).collect(),
            done: Box::new(move |pages, status| {
                let _ = tx.send((pages, status));
            }),
        }
    }

    #[test]
    fn single_write_completes_ok() {
        let sched = IOScheduler::new(1, 1);
        let device: Arc<dyn BlockDevice> = Arc::new(TestDevice::new());
        let plug = sched.plug_start(device, Scenario::ReclaimIn);
        let (tx, rx) = crossbeam_channel::unbounded();
        plug.write_extent(entry(0, tx)).unwrap();
        plug.plug_finish().unwrap();
        let (_, status) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(plug.inflight_pages(), 0);
    }

    #[test]
    fn adjacent_extents_merge_into_one_submit() {
        let sched = IOScheduler::new(1, 1);
        let device = Arc::new(TestDevice::new());
        let counter = device.clone();
        let plug = sched.plug_start(device, Scenario::ReclaimIn);
        let (tx, rx) = crossbeam_channel::unbounded();
        plug.write_extent(entry(0, tx.clone())).unwrap();
        plug.write_extent(entry(1, tx)).unwrap();
        plug.plug_finish().unwrap();
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert_eq!(counter.submits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn non_adjacent_extents_submit_separately() {
        let sched = IOScheduler::new(1, 1);
        let device = Arc::new(TestDevice::new());
        let counter = device.clone();
        let plug = sched.plug_start(device, Scenario::ReclaimIn);
        let (tx, rx) = crossbeam_channel::unbounded();
        plug.write_extent(entry(0, tx.clone())).unwrap();
        plug.write_extent(entry(5, tx)).unwrap();
        plug.plug_finish().unwrap();
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert_eq!(counter.submits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn device_failure_reports_eio() {
        let sched = IOScheduler::new(1, 1);
        let device: Arc<dyn BlockDevice> = Arc::new(TestDevice::failing());
        let plug = sched.plug_start(device, Scenario::FaultOut);
        let (tx, rx) = crossbeam_channel::unbounded();
        plug.read_extent(entry(2, tx)).unwrap();
        plug.plug_finish().unwrap();
        let (_, status) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, IoStatus::Eio);
    }

    #[test]
    fn read_returns_seeded_bytes() {
        let sched = IOScheduler::new(1, 1);
        let device = Arc::new(TestDevice::new());
        device.seed(0, (0..EXTENT_PG_CNT).map(|_| vec![0x7Eu8; 4096]).collect());
        let plug = sched.plug_start(device, Scenario::FaultOut);
        let (tx, rx) = crossbeam_channel::unbounded();
        plug.read_extent(entry(0, tx)).unwrap();
        plug.plug_finish().unwrap();
        let (pages, status) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, IoStatus::Ok);
        assert_eq!(pages[0], vec![0x7Eu8; 4096]);
    }
}
