//! The bit-packed intrusive-list node (spec §6.3).
//!
//! Layout (MSB to LSB), 64 bits total:
//! `mcg_hi:8 | lock:1 | prev:23 | mcg_lo:8 | priv:1 | next:23`
//!
//! The source this is modeled on casts raw bit fields out of a packed C
//! struct; here the same 8-byte footprint is kept but exposed only
//! through atomic `get`/`compare_exchange` helpers on a `Node` value type,
//! per the Design Notes' re-architecture guidance.

use std::sync::atomic::{AtomicU64, Ordering};

const NEXT_SHIFT: u32 = 0;
const NEXT_BITS: u32 = 23;
const PRIV_SHIFT: u32 = 23;
const MCG_LO_SHIFT: u32 = 24;
const MCG_LO_BITS: u32 = 8;
const PREV_SHIFT: u32 = 32;
const PREV_BITS: u32 = 23;
const LOCK_SHIFT: u32 = 55;
const MCG_HI_SHIFT: u32 = 56;
const MCG_HI_BITS: u32 = 8;

const NEXT_MASK: u64 = ((1u64 << NEXT_BITS) - 1) << NEXT_SHIFT;
const PRIV_MASK: u64 = 1u64 << PRIV_SHIFT;
const MCG_LO_MASK: u64 = ((1u64 << MCG_LO_BITS) - 1) << MCG_LO_SHIFT;
const PREV_MASK: u64 = ((1u64 << PREV_BITS) - 1) << PREV_SHIFT;
const LOCK_MASK: u64 = 1u64 << LOCK_SHIFT;
const MCG_HI_MASK: u64 = ((1u64 << MCG_HI_BITS) - 1) << MCG_HI_SHIFT;

/// Maximum index representable by a 23-bit pointer field.
pub const MAX_PTR: u32 = (1 << PREV_BITS) - 1;
/// Maximum group id representable by the 16-bit mcg field.
pub const MAX_MCGID: u32 = (1 << (MCG_LO_BITS + MCG_HI_BITS)) - 1;

/// The decoded view of a node's fields, used by `Node::get` and the
/// functional update helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fields {
    pub prev: u32,
    pub next: u32,
    pub mcgid: u32,
    pub lock: bool,
    pub priv_bit: bool,
}

fn decode(word: u64) -> Fields {
    let next = ((word & NEXT_MASK) >> NEXT_SHIFT) as u32;
    let prev = ((word & PREV_MASK) >> PREV_SHIFT) as u32;
    let mcg_lo = (word & MCG_LO_MASK) >> MCG_LO_SHIFT;
    let mcg_hi = (word & MCG_HI_MASK) >> MCG_HI_SHIFT;
    let mcgid = ((mcg_hi << MCG_LO_BITS) | mcg_lo) as u32;
    Fields { prev, next, mcgid, lock: word & LOCK_MASK != 0, priv_bit: word & PRIV_MASK != 0 }
}

fn encode(f: Fields) -> u64 {
    let mcg_lo = (f.mcgid as u64) & ((1 << MCG_LO_BITS) - 1);
    let mcg_hi = ((f.mcgid as u64) >> MCG_LO_BITS) & ((1 << MCG_HI_BITS) - 1);
    ((f.prev as u64) << PREV_SHIFT)
        | ((f.next as u64) << NEXT_SHIFT)
        | (mcg_lo << MCG_LO_SHIFT)
        | (mcg_hi << MCG_HI_SHIFT)
        | (if f.lock { LOCK_MASK } else { 0 })
        | (if f.priv_bit { PRIV_MASK } else { 0 })
}

/// One intrusive-list node: an atomic 64-bit word holding two 23-bit
/// pointers, a 16-bit group id, a spin-lock bit and a "priv" bit.
#[derive(Debug)]
pub struct Node(AtomicU64);

impl Node {
    /// A node that is its own empty list (prev == next == own index).
    pub fn self_loop(own_idx: u32) -> Self {
        Node(AtomicU64::new(encode(Fields {
            prev: own_idx,
            next: own_idx,
            mcgid: 0,
            lock: false,
            priv_bit: false,
        })))
    }

    pub fn get(&self) -> Fields {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Atomically mutate just prev/next/mcgid, retrying on contention.
    /// Does not touch lock/priv bits.
    fn update_links<F: Fn(Fields) -> Fields>(&self, f: F) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let decoded = decode(cur);
            let next = f(decoded);
            let new_word = encode(Fields { lock: decoded.lock, priv_bit: decoded.priv_bit, ..next });
            match self.0.compare_exchange_weak(cur, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn set_prev(&self, prev: u32) {
        self.update_links(|f| Fields { prev, ..f });
    }

    pub fn set_next(&self, next: u32) {
        self.update_links(|f| Fields { next, ..f });
    }

    pub fn set_prev_next(&self, prev: u32, next: u32) {
        self.update_links(|f| Fields { prev, next, ..f });
    }

    pub fn mcgid(&self) -> u32 {
        self.get().mcgid
    }

    pub fn set_mcgid(&self, mcgid: u32) {
        self.update_links(|f| Fields { mcgid, ..f });
    }

    /// Acquire the 1-bit spin lock with a test-and-set loop.
    pub fn lock(&self) {
        loop {
            let cur = self.0.load(Ordering::Relaxed);
            if cur & LOCK_MASK == 0 {
                let locked = cur | LOCK_MASK;
                if self
                    .0
                    .compare_exchange_weak(cur, locked, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Release the spin lock.
    pub fn unlock(&self) {
        self.0.fetch_and(!LOCK_MASK, Ordering::Release);
    }

    /// Set the priv bit. Returns true iff it was previously clear.
    pub fn set_priv(&self) -> bool {
        let prev = self.0.fetch_or(PRIV_MASK, Ordering::AcqRel);
        prev & PRIV_MASK == 0
    }

    /// Clear the priv bit.
    pub fn clear_priv(&self) {
        self.0.fetch_and(!PRIV_MASK, Ordering::AcqRel);
    }

    pub fn is_priv(&self) -> bool {
        self.0.load(Ordering::Acquire) & PRIV_MASK != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encoding() {
        let f = Fields { prev: 12345, next: 6789, mcgid: 4242, lock: true, priv_bit: false };
        assert_eq!(decode(encode(f)), f);
    }

    #[test]
    fn self_loop_initial_state() {
        let n = Node::self_loop(7);
        let f = n.get();
        assert_eq!(f.prev, 7);
        assert_eq!(f.next, 7);
        assert_eq!(f.mcgid, 0);
        assert!(!f.lock);
        assert!(!f.priv_bit);
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let n = Node::self_loop(0);
        n.lock();
        assert!(n.get().lock);
        n.unlock();
        assert!(!n.get().lock);
    }

    #[test]
    fn priv_bit_reports_prior_state() {
        let n = Node::self_loop(0);
        assert!(n.set_priv());
        assert!(!n.set_priv());
        n.clear_priv();
        assert!(n.set_priv());
    }

    #[test]
    fn mutating_links_preserves_lock_and_priv() {
        let n = Node::self_loop(3);
        n.lock();
        n.set_priv();
        n.set_prev_next(1, 2);
        let f = n.get();
        assert_eq!((f.prev, f.next), (1, 2));
        assert!(f.lock);
        assert!(f.priv_bit);
    }

    #[test]
    fn max_ptr_fits_in_field() {
        let n = Node::self_loop(0);
        n.set_prev_next(MAX_PTR, MAX_PTR);
        let f = n.get();
        assert_eq!(f.prev, MAX_PTR);
        assert_eq!(f.next, MAX_PTR);
    }
}
