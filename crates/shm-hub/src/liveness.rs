//! Liveness probing, heartbeat bookkeeping and PID-based zombie reclaim.
//! Heartbeats are timestamped with `CLOCK_MONOTONIC` via raw `libc` calls;
//! staleness alone is not enough to reclaim a lock, so a stale heartbeat is
//! cross-checked against a `kill(pid, 0)` liveness probe before anything
//! gets reclaimed.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::MAX_CONSUMERS;
use crate::layout::{ConsumerHeartbeatEntry, Header};

/// Returns the current value of `CLOCK_MONOTONIC` in nanoseconds. Used
/// instead of wall-clock time so heartbeat staleness checks are immune to
/// NTP adjustments — all attached processes share the same boot, so the
/// clock is comparable across them.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, fully-initialized out-parameter.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Probes whether `pid` still names a live process on this host, via
/// `kill(pid, 0)`: delivers no signal, only checks existence/permission.
/// `ESRCH` means the process is gone; any other outcome (including
/// `EPERM`, which means it exists but we don't own it) is treated as
/// alive: a lock is never assumed abandoned just because we can't signal
/// its holder.
pub fn is_process_alive(pid: u64) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 is the portable "does this pid exist" probe; it
    // never actually delivers a signal. i32 truncation matches the PID
    // space every relevant OS uses.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0);
    errno != libc::ESRCH
}

impl ConsumerHeartbeatEntry {
    fn try_claim(&self, consumer_id: u64, pid: u64, now_ns: u64, initial_sequence: u64) -> bool {
        self.consumer_id
            .compare_exchange(0, consumer_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && {
                self.consumer_pid.store(pid, Ordering::Relaxed);
                self.last_heartbeat_ns.store(now_ns, Ordering::Release);
                self.last_read_sequence.store(initial_sequence, Ordering::Release);
                true
            }
    }

    fn release(&self, consumer_id: u64) {
        let _ = self.consumer_id.compare_exchange(
            consumer_id,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.consumer_pid.store(0, Ordering::Relaxed);
        self.last_heartbeat_ns.store(0, Ordering::Relaxed);
        self.last_read_sequence.store(0, Ordering::Relaxed);
    }

    fn touch(&self, now_ns: u64) {
        self.last_heartbeat_ns.store(now_ns, Ordering::Release);
    }

    fn touch_read_sequence(&self, sequence: u64) {
        self.last_read_sequence.store(sequence, Ordering::Release);
    }

    fn is_stale(&self, now_ns: u64, stale: Duration) -> bool {
        let id = self.consumer_id.load(Ordering::Acquire);
        if id == 0 {
            return false;
        }
        let last = self.last_heartbeat_ns.load(Ordering::Acquire);
        let age_ns = now_ns.saturating_sub(last);
        age_ns > stale.as_nanos() as u64
            && !is_process_alive(self.consumer_pid.load(Ordering::Acquire))
    }
}

/// Claims the first free heartbeat slot for `consumer_id`/`pid`, recording
/// `initial_sequence` (the consumer's starting cursor) as its first
/// contribution to the `read_index` floor. Returns the slot index, or
/// `None` if the table (capacity `MAX_CONSUMERS`) is full.
pub(crate) fn claim_heartbeat_slot(
    header: &Header,
    consumer_id: u64,
    pid: u64,
    initial_sequence: u64,
) -> Option<usize> {
    let now = monotonic_now_ns();
    for (i, entry) in header.consumer_heartbeats.iter().enumerate() {
        if entry.try_claim(consumer_id, pid, now, initial_sequence) {
            return Some(i);
        }
    }
    None
}

/// Recomputes `Header::read_index` as the minimum `last_read_sequence`
/// across every currently-claimed heartbeat slot. A segment with no
/// attached consumers leaves `read_index` untouched: RING-BUFFER
/// backpressure should still engage once the ring fills with nobody
/// reading it.
fn recompute_read_index_floor(header: &Header) {
    let floor = header
        .consumer_heartbeats
        .iter()
        .filter(|e| e.consumer_id.load(Ordering::Acquire) != 0)
        .map(|e| e.last_read_sequence.load(Ordering::Acquire))
        .min();
    if let Some(floor) = floor {
        header.read_index.store(floor, Ordering::Release);
    }
}

pub(crate) fn update_consumer_read_sequence(header: &Header, slot: usize, sequence: u64) {
    if let Some(entry) = header.consumer_heartbeats.get(slot) {
        entry.touch_read_sequence(sequence);
    }
    recompute_read_index_floor(header);
}

pub(crate) fn release_heartbeat_slot(header: &Header, slot: usize, consumer_id: u64) {
    if let Some(entry) = header.consumer_heartbeats.get(slot) {
        entry.release(consumer_id);
    }
    recompute_read_index_floor(header);
}

pub(crate) fn touch_heartbeat_slot(header: &Header, slot: usize) {
    if let Some(entry) = header.consumer_heartbeats.get(slot) {
        entry.touch(monotonic_now_ns());
        header.metrics.heartbeat_beats.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn touch_producer_heartbeat(header: &Header) {
    header
        .producer_last_heartbeat_ns
        .store(monotonic_now_ns(), Ordering::Release);
    header.metrics.heartbeat_beats.fetch_add(1, Ordering::Relaxed);
}

/// Scans every claimed heartbeat slot, clearing (and counting) the ones
/// whose owner is both stale and no longer alive. This is the consumer-side
/// half of zombie reclaim; the writer-lock half lives in
/// `slot::SlotEntry::writer_acquire`.
pub(crate) fn reap_dead_consumers(header: &Header, stale: Duration) -> usize {
    let now = monotonic_now_ns();
    let mut reclaimed = 0;
    for entry in &header.consumer_heartbeats {
        let id = entry.consumer_id.load(Ordering::Acquire);
        if id != 0 && entry.is_stale(now, stale) {
            entry.release(id);
            header
                .active_consumer_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                })
                .ok();
            header
                .metrics
                .heartbeat_stale_observations
                .fetch_add(1, Ordering::Relaxed);
            header.metrics.recovery_actions.fetch_add(1, Ordering::Relaxed);
            reclaimed += 1;
        }
    }
    if reclaimed > 0 {
        recompute_read_index_floor(header);
    }
    reclaimed
}

pub(crate) fn active_consumer_entries(header: &Header) -> usize {
    header
        .consumer_heartbeats
        .iter()
        .filter(|e| e.consumer_id.load(Ordering::Acquire) != 0)
        .count()
}

const _: () = assert!(MAX_CONSUMERS > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let pid = std::process::id() as u64;
        assert!(is_process_alive(pid));
    }

    #[test]
    fn an_implausible_pid_is_not_alive() {
        // PID 1 is almost certainly init/systemd and alive everywhere
        // this test runs, but an enormous PID is not a real process.
        assert!(!is_process_alive(u64::from(u32::MAX) - 7));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now_ns();
        std::thread::sleep(Duration::from_millis(1));
        let b = monotonic_now_ns();
        assert!(b > a);
    }

    fn fresh_header() -> Box<Header> {
        // SAFETY: test-only; `Header` is a plain repr(C) struct of atomics
        // and integers, valid when zeroed, and never read before `init`.
        let mut header: Box<Header> = unsafe { Box::new(core::mem::zeroed()) };
        header.commit_index.store(0, Ordering::Relaxed);
        header
    }

    #[test]
    fn read_index_floor_tracks_the_slowest_attached_consumer() {
        let header = fresh_header();
        let slot_a = claim_heartbeat_slot(&header, 1, 100, 0).unwrap();
        let slot_b = claim_heartbeat_slot(&header, 2, 200, 0).unwrap();

        update_consumer_read_sequence(&header, slot_a, 10);
        assert_eq!(header.read_index.load(Ordering::Acquire), 0);

        update_consumer_read_sequence(&header, slot_b, 4);
        assert_eq!(header.read_index.load(Ordering::Acquire), 4);

        release_heartbeat_slot(&header, slot_b, 2);
        assert_eq!(header.read_index.load(Ordering::Acquire), 10);
    }

    #[test]
    fn claiming_a_slot_seeds_the_floor_with_the_attach_time_cursor() {
        let header = fresh_header();
        header.commit_index.store(50, Ordering::Relaxed);
        let slot = claim_heartbeat_slot(&header, 1, 100, 50).unwrap();
        update_consumer_read_sequence(&header, slot, 50);
        assert_eq!(header.read_index.load(Ordering::Acquire), 50);
    }
}
