//! Header-resident metrics block. Plain relaxed atomic counters, one
//! cache-line-ish block embedded directly in `Header` so any attached
//! process can read them without an extra IPC round trip, exposed as a
//! plain snapshot struct read directly off the mapped header.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sixteen independent counters, all `Relaxed`: they are diagnostics, not
/// synchronization.
#[repr(C)]
pub struct MetricsBlock {
    pub writer_timeouts: AtomicU64,
    pub writer_blocked_total_ns: AtomicU64,
    pub write_lock_contention: AtomicU64,
    pub zombie_reclaims: AtomicU64,
    pub write_generation_wraps: AtomicU64,

    pub reader_not_ready: AtomicU64,
    pub reader_race_aborted: AtomicU64,
    pub reader_generation_mismatch: AtomicU64,
    pub reader_checksum_fail: AtomicU64,
    pub reader_peak_count: AtomicU64,

    pub heartbeat_beats: AtomicU64,
    pub heartbeat_stale_observations: AtomicU64,
    pub recovery_actions: AtomicU64,

    pub total_commits: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<MetricsBlock>() == 16 * 8);

impl MetricsBlock {
    pub(crate) fn reset(&self) {
        self.writer_timeouts.store(0, Ordering::Relaxed);
        self.writer_blocked_total_ns.store(0, Ordering::Relaxed);
        self.write_lock_contention.store(0, Ordering::Relaxed);
        self.zombie_reclaims.store(0, Ordering::Relaxed);
        self.write_generation_wraps.store(0, Ordering::Relaxed);
        self.reader_not_ready.store(0, Ordering::Relaxed);
        self.reader_race_aborted.store(0, Ordering::Relaxed);
        self.reader_generation_mismatch.store(0, Ordering::Relaxed);
        self.reader_checksum_fail.store(0, Ordering::Relaxed);
        self.reader_peak_count.store(0, Ordering::Relaxed);
        self.heartbeat_beats.store(0, Ordering::Relaxed);
        self.heartbeat_stale_observations
            .store(0, Ordering::Relaxed);
        self.recovery_actions.store(0, Ordering::Relaxed);
        self.total_commits.store(0, Ordering::Relaxed);
        self.total_reads.store(0, Ordering::Relaxed);
        self.total_bytes_written.store(0, Ordering::Relaxed);
    }

    /// Best-effort peak tracking: bumps `reader_peak_count` up if the
    /// observed concurrent reader count is a new high. Not linearizable
    /// with the counter it watches, which is fine for a diagnostic.
    pub(crate) fn observe_reader_count(&self, current: u32) {
        let current = current as u64;
        let mut peak = self.reader_peak_count.load(Ordering::Relaxed);
        while current > peak {
            match self.reader_peak_count.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writer_timeouts: self.writer_timeouts.load(Ordering::Relaxed),
            writer_blocked_total_ns: self.writer_blocked_total_ns.load(Ordering::Relaxed),
            write_lock_contention: self.write_lock_contention.load(Ordering::Relaxed),
            zombie_reclaims: self.zombie_reclaims.load(Ordering::Relaxed),
            write_generation_wraps: self.write_generation_wraps.load(Ordering::Relaxed),
            reader_not_ready: self.reader_not_ready.load(Ordering::Relaxed),
            reader_race_aborted: self.reader_race_aborted.load(Ordering::Relaxed),
            reader_generation_mismatch: self.reader_generation_mismatch.load(Ordering::Relaxed),
            reader_checksum_fail: self.reader_checksum_fail.load(Ordering::Relaxed),
            reader_peak_count: self.reader_peak_count.load(Ordering::Relaxed),
            heartbeat_beats: self.heartbeat_beats.load(Ordering::Relaxed),
            heartbeat_stale_observations: self
                .heartbeat_stale_observations
                .load(Ordering::Relaxed),
            recovery_actions: self.recovery_actions.load(Ordering::Relaxed),
            total_commits: self.total_commits.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`MetricsBlock`], safe to pass around and print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub writer_timeouts: u64,
    pub writer_blocked_total_ns: u64,
    pub write_lock_contention: u64,
    pub zombie_reclaims: u64,
    pub write_generation_wraps: u64,
    pub reader_not_ready: u64,
    pub reader_race_aborted: u64,
    pub reader_generation_mismatch: u64,
    pub reader_checksum_fail: u64,
    pub reader_peak_count: u64,
    pub heartbeat_beats: u64,
    pub heartbeat_stale_observations: u64,
    pub recovery_actions: u64,
    pub total_commits: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commits={} reads={} bytes={} timeouts={} contention={} zombie_reclaims={} \
             reader_not_ready={} race_aborted={} gen_mismatch={} checksum_fail={} peak_readers={}",
            self.total_commits,
            self.total_reads,
            self.total_bytes_written,
            self.writer_timeouts,
            self.write_lock_contention,
            self.zombie_reclaims,
            self.reader_not_ready,
            self.reader_race_aborted,
            self.reader_generation_mismatch,
            self.reader_checksum_fail,
            self.reader_peak_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_counter() {
        let block: MetricsBlock = unsafe { core::mem::zeroed() };
        block.total_commits.store(5, Ordering::Relaxed);
        block.reset();
        assert_eq!(block.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn observe_reader_count_only_increases() {
        let block: MetricsBlock = unsafe { core::mem::zeroed() };
        block.observe_reader_count(3);
        block.observe_reader_count(1);
        assert_eq!(block.snapshot().reader_peak_count, 3);
        block.observe_reader_count(7);
        assert_eq!(block.snapshot().reader_peak_count, 7);
    }
}
