//! The shared `wait_then_reacquire` shape (Design Notes §9): every
//! suspension point that polls a condition while releasing and
//! reacquiring a caller-held lock goes through this one helper, instead of
//! being duplicated inline at each call site (`untrack`'s wait for a
//! transient flag to clear, `find_extent`'s busy-extent retry — the
//! latter has no lock of its own to release, so its `lock`/`unlock`
//! closures are no-ops and `condition` re-polls `acquire_extent` and the
//! caller-supplied validity check instead).

use std::time::Duration;

/// Repeatedly checks `condition`; while true, calls `unlock`, sleeps
/// `backoff`, calls `lock`, and checks again. Returns `true` once
/// `condition` is false. If `max_iters` is `Some`, gives up and returns
/// `false` after that many sleep iterations (leaving the lock held, as if
/// the last `lock()` call had just returned).
pub fn wait_then_reacquire<Cond, Lock, Unlock>(
    mut condition: Cond,
    mut unlock: Unlock,
    mut lock: Lock,
    backoff: Duration,
    max_iters: Option<u32>,
) -> bool
where
    Cond: FnMut() -> bool,
    Lock: FnMut(),
    Unlock: FnMut(),
{
    let mut iters = 0u32;
    while condition() {
        if let Some(max) = max_iters {
            if iters >= max {
                return false;
            }
        }
        unlock();
        std::thread::sleep(backoff);
        lock();
        iters += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn returns_true_once_condition_clears() {
        let remaining = AtomicU32::new(3);
        let unlocks = AtomicU32::new(0);
        let ok = wait_then_reacquire(
            || remaining.load(Ordering::Relaxed) > 0,
            || {
                unlocks.fetch_add(1, Ordering::Relaxed);
                remaining.fetch_sub(1, Ordering::Relaxed);
            },
            || {},
            Duration::from_micros(1),
            None,
        );
        assert!(ok);
        assert_eq!(unlocks.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn gives_up_after_max_iters() {
        let ok = wait_then_reacquire(|| true, || {}, || {}, Duration::from_micros(1), Some(2));
        assert!(!ok);
    }
}
