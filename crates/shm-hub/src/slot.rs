//! Per-slot coordinator and state machine: generation-guarded atomic state
//! transitions, a CAS-only writer lock that is never unconditionally
//! stolen, and a TOCTTOU-safe double-check reader handshake.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use crate::backoff;
use crate::error::AcquireError;
use crate::liveness::is_process_alive;
use crate::metrics::MetricsBlock;

/// A slot's lifecycle: `Free` only exists implicitly as "never written, or
/// reset by recovery"; in steady state a slot oscillates between `Writing`
/// and `Committed`. `Free` is included for completeness and for
/// `force_reset_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Writing = 1,
    Committed = 2,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Writing,
            _ => Self::Committed,
        }
    }
}

/// One slot's coordination metadata: 64 bytes, one cache line, so no two
/// slots' writer locks ever false-share.
#[repr(C, align(64))]
pub struct SlotEntry {
    /// 0 when unheld; otherwise the PID of the holding writer. Only ever
    /// moved with CAS, never an unconditional store, so a reclaim can never
    /// clobber a writer that grabbed the lock in the meantime.
    writer_lock: AtomicU64,
    reader_count: AtomicU32,
    slot_state: AtomicU8,
    _pad_a: [u8; 3],
    /// Bumped on every commit. Readers capture this at acquire time and
    /// compare it again at release time to detect being overwritten mid-read.
    write_generation: AtomicU64,
    last_transition_ns: AtomicU64,
    _pad_b: [u8; 32],
}

const _: () = assert!(core::mem::size_of::<SlotEntry>() == 64);
const _: () = assert!(core::mem::align_of::<SlotEntry>() == 64);

impl SlotEntry {
    pub(crate) fn init(&self) {
        self.writer_lock.store(0, Ordering::Relaxed);
        self.reader_count.store(0, Ordering::Relaxed);
        self.slot_state.store(SlotState::Free as u8, Ordering::Relaxed);
        self.write_generation.store(0, Ordering::Relaxed);
        self.last_transition_ns
            .store(crate::liveness::monotonic_now_ns(), Ordering::Relaxed);
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.slot_state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.write_generation.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    pub fn writer_lock_holder(&self) -> Option<u64> {
        match self.writer_lock.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn last_transition_ns(&self) -> u64 {
        self.last_transition_ns.load(Ordering::Acquire)
    }

    /// Acquires the writer lock for `pid`, reclaiming it from a dead
    /// holder via CAS if necessary, publishes `Writing` and fences against
    /// concurrent readers, then drains outstanding readers before
    /// returning. Never blocks past `deadline`.
    pub(crate) fn writer_acquire(
        &self,
        pid: u64,
        deadline: Instant,
        metrics: &MetricsBlock,
    ) -> Result<(), AcquireError> {
        let started = Instant::now();
        let record_blocked_time = |metrics: &MetricsBlock| {
            metrics
                .writer_blocked_total_ns
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        };

        let mut attempt = 0u32;
        loop {
            match self
                .writer_lock
                .compare_exchange(0, pid, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(holder) => {
                    if holder != 0 && !is_process_alive(holder) {
                        if self
                            .writer_lock
                            .compare_exchange(holder, pid, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            metrics.zombie_reclaims.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(holder, pid, "reclaimed writer lock from dead process");
                            break;
                        }
                        // Lost the race to another reclaimer or the holder
                        // came back; fall through to contention backoff.
                    }
                    metrics.write_lock_contention.fetch_add(1, Ordering::Relaxed);
                    if Instant::now() >= deadline {
                        metrics.writer_timeouts.fetch_add(1, Ordering::Relaxed);
                        record_blocked_time(metrics);
                        return Err(AcquireError::Timeout);
                    }
                    backoff::step(&mut attempt);
                }
            }
        }

        // Mirror image of reader_acquire's handshake: publish `Writing`,
        // fence, *then* check reader_count. A reader whose increment raced
        // ahead of this store is guaranteed by the paired SeqCst fences to
        // observe `Writing` at its own re-check and abort.
        let original_state = self.slot_state.load(Ordering::Acquire);
        self.slot_state.store(SlotState::Writing as u8, Ordering::Release);
        fence(Ordering::SeqCst);

        attempt = 0;
        let drained = backoff::wait_until(deadline, || {
            self.reader_count.load(Ordering::Acquire) == 0
        });
        if !drained {
            // Nothing was written; restore the state we overwrote and give
            // the lock back. We never enter Writing with readers still
            // attached.
            self.slot_state.store(original_state, Ordering::Release);
            let _ = self
                .writer_lock
                .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed);
            metrics.writer_timeouts.fetch_add(1, Ordering::Relaxed);
            record_blocked_time(metrics);
            return Err(AcquireError::Timeout);
        }
        let _ = attempt;

        self.last_transition_ns
            .store(crate::liveness::monotonic_now_ns(), Ordering::Relaxed);
        record_blocked_time(metrics);
        Ok(())
    }

    /// Publishes the slot: bumps the generation, flips state to
    /// `Committed`, advances `commit_index`, and releases the writer lock.
    /// Panics if the writer lock is not held by `pid` — that is a local
    /// invariant violation, not a recoverable condition.
    pub(crate) fn writer_commit(
        &self,
        slot_index: u32,
        pid: u64,
        commit_index: &AtomicU64,
        metrics: &MetricsBlock,
    ) {
        let new_generation = self.write_generation.fetch_add(1, Ordering::AcqRel) + 1;
        if new_generation == 0 {
            metrics.write_generation_wraps.fetch_add(1, Ordering::Relaxed);
        }
        self.slot_state
            .store(SlotState::Committed as u8, Ordering::Release);
        self.last_transition_ns
            .store(crate::liveness::monotonic_now_ns(), Ordering::Relaxed);
        commit_index.fetch_add(1, Ordering::Release);
        if self
            .writer_lock
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            crate::error::invariant_violation(
                slot_index,
                "writer lock held by unexpected pid at commit",
            );
        }
        metrics.total_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Abandons an acquired-but-uncommitted slot: releases the writer lock
    /// without advancing `commit_index` or bumping the generation, and
    /// restores `Free` state so the slot is eligible for reuse. Used by the
    /// transaction façade's exit contract when a writer guard is dropped
    /// without calling `commit()`.
    pub(crate) fn writer_abandon(&self, slot_index: u32, pid: u64) {
        self.slot_state.store(SlotState::Free as u8, Ordering::Release);
        if self
            .writer_lock
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            crate::error::invariant_violation(
                slot_index,
                "writer lock held by unexpected pid at abandon",
            );
        }
        tracing::warn!(slot_index, pid, "writer abandoned slot without commit");
    }

    /// Acquires a read view: checks `Committed`, bumps `reader_count`, then
    /// re-checks `Committed` behind a `SeqCst` fence to close the window
    /// where a writer re-entered `Writing` between the first check and the
    /// reader registering itself.
    pub(crate) fn reader_acquire(&self, metrics: &MetricsBlock) -> Result<u64, AcquireError> {
        if self.slot_state.load(Ordering::Acquire) != SlotState::Committed as u8 {
            metrics.reader_not_ready.fetch_add(1, Ordering::Relaxed);
            return Err(AcquireError::NotReady);
        }

        let prev = self.reader_count.fetch_add(1, Ordering::AcqRel);
        metrics.observe_reader_count(prev + 1);

        fence(Ordering::SeqCst);

        if self.slot_state.load(Ordering::Acquire) != SlotState::Committed as u8 {
            self.reader_count.fetch_sub(1, Ordering::Release);
            metrics.reader_race_aborted.fetch_add(1, Ordering::Relaxed);
            return Err(AcquireError::NotReady);
        }

        Ok(self.write_generation.load(Ordering::Acquire))
    }

    /// Releases a read view acquired via [`reader_acquire`], validating
    /// that the slot was not overwritten mid-read. Always decrements
    /// `reader_count`, even when the validation fails.
    pub(crate) fn reader_release(
        &self,
        captured_generation: u64,
        checksum_ok: Option<bool>,
        metrics: &MetricsBlock,
    ) -> Result<(), AcquireError> {
        let current_generation = self.write_generation.load(Ordering::Acquire);
        let result = if current_generation != captured_generation {
            metrics
                .reader_generation_mismatch
                .fetch_add(1, Ordering::Relaxed);
            Err(AcquireError::StaleOverwritten)
        } else if checksum_ok == Some(false) {
            metrics.reader_checksum_fail.fetch_add(1, Ordering::Relaxed);
            Err(AcquireError::ChecksumFail)
        } else {
            metrics.total_reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        };
        self.reader_count.fetch_sub(1, Ordering::Release);
        result
    }

    /// Administrative reset: forces the slot back to `Free` regardless of
    /// its current state. Refuses if the writer lock is held by a live
    /// process unless `force` is set and the holder is confirmed dead.
    pub(crate) fn force_reset(&self, force: bool) -> Result<(), crate::error::RecoveryError> {
        let holder = self.writer_lock.load(Ordering::Acquire);
        if holder != 0 && !force && is_process_alive(holder) {
            return Err(crate::error::RecoveryError::WriterAliveRefusesForce);
        }
        self.writer_lock.store(0, Ordering::Release);
        self.reader_count.store(0, Ordering::Release);
        self.slot_state.store(SlotState::Free as u8, Ordering::Release);
        self.last_transition_ns
            .store(crate::liveness::monotonic_now_ns(), Ordering::Relaxed);
        Ok(())
    }
}
