//! The contract the core requires from the external compressed-page store
//! (spec §6.4), plus an in-memory mock used by tests and `eswap-cli`.

use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

bitflags! {
    /// Per-object flag set (spec §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        /// On disk; `handle` encodes an `eswapentry`.
        const WB             = 0b0000_0001;
        /// Being packed into an extent for write-out.
        const UNDER_WB       = 0b0000_0010;
        /// Being read back from an extent.
        const UNDER_FAULTOUT = 0b0000_0100;
        /// Promoted back to zram from the spillover tier.
        const FROM_ESWAP     = 0b0000_1000;
        /// Group id was cleared by a teardown, independent of data state.
        const MCGID_CLEAR    = 0b0001_0000;
        /// Content matches a well-known same-fill pattern; never spilled.
        const SAME           = 0b0010_0000;
        /// Uncompressed object occupying a full page.
        const HUGE           = 0b0100_0000;
    }
}

/// The per-index capability interface the core borrows from zram (§6.4).
///
/// Implementors provide per-slot locking and flag/handle/size storage, plus
/// a compressed-buffer allocator. The core never reaches inside the store;
/// every access goes through this trait under the slot lock the caller
/// already holds (or, for `slot_lock`/`slot_unlock`, is about to hold).
pub trait ZramAdapter: Send + Sync {
    /// Acquire the per-slot lock. Must be released via `slot_unlock`.
    fn slot_lock(&self, index: u32);
    fn slot_unlock(&self, index: u32);

    fn test_flag(&self, index: u32, flag: ObjectFlags) -> bool;
    fn set_flag(&self, index: u32, flag: ObjectFlags);
    fn clear_flag(&self, index: u32, flag: ObjectFlags);

    fn get_handle(&self, index: u32) -> u64;
    fn set_handle(&self, index: u32, value: u64);

    fn get_obj_size(&self, index: u32) -> u32;
    fn set_obj_size(&self, index: u32, bytes: u32);

    fn get_memcg(&self, index: u32) -> u32;
    fn set_memcg(&self, index: u32, mcg_id: u32);

    /// Allocate a fresh compressed buffer of `size` bytes, returning an
    /// opaque handle distinct from any `eswapentry`.
    fn alloc_buf(&self, size: u32) -> u64;
    /// Borrow the buffer's bytes for reading or writing.
    fn map_buf(&self, handle: u64) -> Vec<u8>;
    /// Write back bytes previously obtained from `map_buf`, truncated/padded
    /// to the buffer's allocated size.
    fn write_buf(&self, handle: u64, bytes: &[u8]);
    fn free_buf(&self, handle: u64);

    /// Total slot count (`disksize / PAGE_SIZE`).
    fn nr_objs(&self) -> u32;
}

#[derive(Default, Clone)]
struct Slot {
    flags: ObjectFlags,
    handle: u64,
    obj_size: u32,
    memcg_id: u32,
}

/// A single bit-spinlock guarding one slot's fields, in the same spirit as
/// `node::Node`'s lock bit: `slot_lock`/`slot_unlock` are separate calls
/// (not RAII), matching the external contract real zram exposes.
struct SpinSlot {
    locked: AtomicBool,
    data: UnsafeCell<Slot>,
}

unsafe impl Sync for SpinSlot {}

impl SpinSlot {
    fn new() -> Self {
        SpinSlot { locked: AtomicBool::new(false), data: UnsafeCell::new(Slot::default()) }
    }

    fn lock(&self) {
        while self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Read/write access to the slot's fields. Callers must hold the lock;
    /// the mock trusts its caller exactly as the core trusts real zram.
    #[allow(clippy::mut_from_ref)]
    fn data(&self) -> &mut Slot {
        unsafe { &mut *self.data.get() }
    }
}

/// An in-memory `ZramAdapter` for tests and the CLI demo. Slot locks are a
/// bit-spinlock per slot, the same representation real zram uses; the
/// observable contract — exclusive per-index mutual exclusion — is the
/// same either way.
pub struct MockZram {
    slots: Vec<SpinSlot>,
    bufs: Mutex<HashMap<u64, Vec<u8>>>,
    next_handle: std::sync::atomic::AtomicU64,
}

impl MockZram {
    pub fn new(nr_objs: u32) -> Self {
        MockZram {
            slots: (0..nr_objs).map(|_| SpinSlot::new()).collect(),
            bufs: Mutex::new(HashMap::new()),
            next_handle: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn slot(&self, index: u32) -> &SpinSlot {
        &self.slots[index as usize]
    }
}

impl ZramAdapter for MockZram {
    fn slot_lock(&self, index: u32) {
        self.slot(index).lock();
    }

    fn slot_unlock(&self, index: u32) {
        self.slot(index).unlock();
    }

    fn test_flag(&self, index: u32, flag: ObjectFlags) -> bool {
        self.slot(index).data().flags.contains(flag)
    }

    fn set_flag(&self, index: u32, flag: ObjectFlags) {
        self.slot(index).data().flags.insert(flag);
    }

    fn clear_flag(&self, index: u32, flag: ObjectFlags) {
        self.slot(index).data().flags.remove(flag);
    }

    fn get_handle(&self, index: u32) -> u64 {
        self.slot(index).data().handle
    }

    fn set_handle(&self, index: u32, value: u64) {
        self.slot(index).data().handle = value;
    }

    fn get_obj_size(&self, index: u32) -> u32 {
        self.slot(index).data().obj_size
    }

    fn set_obj_size(&self, index: u32, bytes: u32) {
        self.slot(index).data().obj_size = bytes;
    }

    fn get_memcg(&self, index: u32) -> u32 {
        self.slot(index).data().memcg_id
    }

    fn set_memcg(&self, index: u32, mcg_id: u32) {
        self.slot(index).data().memcg_id = mcg_id;
    }

    fn alloc_buf(&self, size: u32) -> u64 {
        let handle = self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bufs.lock().insert(handle, vec![0u8; size as usize]);
        handle
    }

    fn map_buf(&self, handle: u64) -> Vec<u8> {
        self.bufs.lock().get(&handle).cloned().unwrap_or_default()
    }

    fn write_buf(&self, handle: u64, bytes: &[u8]) {
        if let Some(buf) = self.bufs.lock().get_mut(&handle) {
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
    }

    fn free_buf(&self, handle: u64) {
        self.bufs.lock().remove(&handle);
    }

    fn nr_objs(&self) -> u32 {
        self.slots.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf_roundtrip() {
        let z = MockZram::new(4);
        let h = z.alloc_buf(16);
        z.write_buf(h, &[0xAAu8; 16]);
        assert_eq!(z.map_buf(h), vec![0xAAu8; 16]);
        z.free_buf(h);
        assert!(z.map_buf(h).is_empty());
    }

    #[test]
    fn flags_independent_per_index() {
        let z = MockZram::new(2);
        z.set_flag(0, ObjectFlags::WB);
        assert!(z.test_flag(0, ObjectFlags::WB));
        assert!(!z.test_flag(1, ObjectFlags::WB));
        z.clear_flag(0, ObjectFlags::WB);
        assert!(!z.test_flag(0, ObjectFlags::WB));
    }
}
