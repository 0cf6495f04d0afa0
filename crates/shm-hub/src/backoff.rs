//! Tri-phase backoff for every bounded wait in the crate: a short run of
//! spin-loop hints, then `thread::yield_now`, then a capped sleep.

use std::time::{Duration, Instant};

const SPIN_LIMIT: u32 = 16;
const YIELD_LIMIT: u32 = 64;
const MAX_SLEEP: Duration = Duration::from_millis(2);

/// One step of backoff, advancing `attempt` in place. Call in a loop;
/// the caller owns the deadline check.
pub fn step(attempt: &mut u32) {
    if *attempt < SPIN_LIMIT {
        let spins = 1u32 << (*attempt).min(6);
        for _ in 0..spins {
            core::hint::spin_loop();
        }
    } else if *attempt < YIELD_LIMIT {
        std::thread::yield_now();
    } else {
        let backoff_ms = (*attempt - YIELD_LIMIT).min(16);
        std::thread::sleep(Duration::from_micros(100 * u64::from(backoff_ms)).min(MAX_SLEEP));
    }
    *attempt = attempt.saturating_add(1);
}

/// Blocks on `condition` (polled, no wakeup primitive) until it returns
/// `true` or `deadline` passes. Returns `false` on timeout.
pub fn wait_until(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    let mut attempt = 0u32;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        step(&mut attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_observes_condition_becoming_true() {
        let start = Instant::now();
        let deadline = start + Duration::from_secs(1);
        let mut count = 0;
        let ok = wait_until(deadline, || {
            count += 1;
            count >= 3
        });
        assert!(ok);
        assert!(count >= 3);
    }

    #[test]
    fn wait_until_times_out() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let ok = wait_until(deadline, || false);
        assert!(!ok);
    }
}
