//! Administrative diagnostic / force-reset surface. This is a third kind of
//! segment attachment alongside [`Producer`](crate::producer::Producer) and
//! [`Consumer`](crate::consumer::Consumer): a tool operator's process that
//! opens a segment purely to inspect or repair it, without presenting a
//! shared secret or a typed schema, distinct from the data-path handles.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SegmentConfig;
use crate::error::{ConfigError, RecoveryError};
use crate::layout::{Header, SegmentMapping, SegmentOffsets};
use crate::liveness;
use crate::metrics::MetricsSnapshot;
use crate::producer::{checksum_entry_at, slot_entry_at};
use crate::slot::SlotState;

/// One slot's point-in-time state as seen by the recovery tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDiagnostic {
    pub slot_index: u32,
    pub state: SlotState,
    pub writer_lock_pid: Option<u64>,
    pub writer_alive: Option<bool>,
    pub reader_count: u32,
    pub age_ns: u64,
    /// `true` when a writer lock is held by a dead PID, or the slot has
    /// been `Writing` long enough that it looks abandoned rather than
    /// merely slow.
    pub stuck: bool,
}

impl std::fmt::Display for SlotDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slot {} state={:?} writer_pid={:?} writer_alive={:?} readers={} age_ns={} stuck={}",
            self.slot_index,
            self.state,
            self.writer_lock_pid,
            self.writer_alive,
            self.reader_count,
            self.age_ns,
            self.stuck
        )
    }
}

/// An administrative attachment to an existing segment. Skips the schema
/// and shared-secret checks `Producer`/`Consumer` perform, since the
/// recovery tool is trusted operator tooling, not a data-path participant.
pub struct SegmentAdmin {
    mapping: Arc<SegmentMapping>,
    offsets: SegmentOffsets,
    config: SegmentConfig,
    path: PathBuf,
}

impl SegmentAdmin {
    /// Opens `path` for administration. Still validates magic and protocol
    /// version — an admin tool pointed at the wrong file or an incompatible
    /// segment should fail loudly, not silently corrupt it.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let mapping = SegmentMapping::open(&path)?;
        // SAFETY: `open` already checked the file is at least one header page.
        let header = unsafe { mapping.header() };
        if header.magic != crate::layout::MAGIC {
            return Err(ConfigError::LayoutMismatch("bad magic"));
        }
        if header.version_major != crate::layout::VERSION_MAJOR {
            return Err(ConfigError::VersionIncompatible {
                expected: (crate::layout::VERSION_MAJOR << 16) | crate::layout::VERSION_MINOR,
                found: (header.version_major << 16) | header.version_minor,
            });
        }
        let config = header.config_snapshot()?;
        let offsets = SegmentOffsets::calculate(&config)?;
        if offsets.total_size != header.total_size {
            return Err(ConfigError::LayoutMismatch(
                "derived offsets do not match stored total_size",
            ));
        }
        Ok(Self {
            mapping: Arc::new(mapping),
            offsets,
            config,
            path,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    fn header(&self) -> &Header {
        // SAFETY: validated in `attach`, mapping outlives every borrow.
        unsafe { self.mapping.header() }
    }

    fn slot_index_in_range(&self, index: usize) -> Result<(), RecoveryError> {
        if index >= self.config.ring_capacity as usize {
            Err(RecoveryError::InvalidSlotIndex)
        } else {
            Ok(())
        }
    }

    /// Reports the current state of one ring slot.
    pub fn diagnose_slot(&self, index: usize) -> Result<SlotDiagnostic, RecoveryError> {
        self.slot_index_in_range(index)?;
        let entry = slot_entry_at(&self.mapping, &self.offsets, index);
        let writer_lock_pid = entry.writer_lock_holder();
        let writer_alive = writer_lock_pid.map(liveness::is_process_alive);
        let now = liveness::monotonic_now_ns();
        let age_ns = now.saturating_sub(entry.last_transition_ns());
        let state = entry.state();
        let stuck = matches!(state, SlotState::Writing)
            && (writer_alive == Some(false) || age_ns > self.config.heartbeat_stale.as_nanos() as u64);
        Ok(SlotDiagnostic {
            slot_index: index as u32,
            state,
            writer_lock_pid,
            writer_alive,
            reader_count: entry.reader_count(),
            age_ns,
            stuck,
        })
    }

    /// Diagnoses every slot in the ring, in index order.
    pub fn diagnose_all_slots(&self) -> Vec<SlotDiagnostic> {
        (0..self.config.ring_capacity as usize)
            .map(|i| self.diagnose_slot(i).expect("index within ring_capacity"))
            .collect()
    }

    /// Forces a slot back to `Free`, refusing unless the writer lock is
    /// unheld or held by a dead process and `force` is set. Increments
    /// `recovery_actions` on success.
    pub fn force_reset_slot(&self, index: usize, force: bool) -> Result<(), RecoveryError> {
        self.slot_index_in_range(index)?;
        let entry = slot_entry_at(&self.mapping, &self.offsets, index);
        entry.force_reset(force)?;
        if let Some(checksum) = checksum_entry_at(&self.mapping, &self.offsets, &self.config, index)
        {
            checksum.clear();
        }
        self.header()
            .metrics
            .recovery_actions
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(slot_index = index, force, "slot force-reset by recovery tool");
        Ok(())
    }

    /// Clears `reader_count` for a slot, but only when every consumer
    /// heartbeat slot with a non-zero ID resolves to a dead PID: a
    /// best-effort scrub, since individual reader identities are not
    /// tracked per-slot.
    pub fn release_zombie_readers(&self, index: usize) -> Result<bool, RecoveryError> {
        self.slot_index_in_range(index)?;
        let any_live_consumer = self.header().consumer_heartbeats.iter().any(|e| {
            let id = e.consumer_id.load(Ordering::Acquire);
            id != 0 && liveness::is_process_alive(e.consumer_pid.load(Ordering::Acquire))
        });
        if any_live_consumer {
            return Ok(false);
        }
        let entry = slot_entry_at(&self.mapping, &self.offsets, index);
        entry.force_reset(true)?;
        self.header()
            .metrics
            .recovery_actions
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(slot_index = index, "zombie readers released by recovery tool");
        Ok(true)
    }

    /// Scrubs heartbeat slots whose PID is dead and whose timestamp is
    /// older than `stale`. Returns the number of slots reclaimed.
    pub fn cleanup_dead_consumers(&self, stale: Duration) -> usize {
        liveness::reap_dead_consumers(self.header(), stale)
    }

    /// Copies every metrics counter in one pass.
    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.header().metrics.snapshot()
    }

    /// Resets every metrics counter to zero.
    pub fn reset_metrics(&self) {
        self.header().metrics.reset();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksumKind;
    use crate::producer::Producer;
    use std::time::Duration as StdDuration;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shm-hub-recovery-test-{}-{tag}.seg", std::process::id()))
    }

    #[test]
    fn diagnose_all_slots_reports_free_for_a_fresh_segment() {
        let path = scratch_path("a");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 3;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        let admin = SegmentAdmin::attach(&path).unwrap();
        let diagnostics = admin.diagnose_all_slots();
        assert_eq!(diagnostics.len(), 3);
        for d in &diagnostics {
            assert_eq!(d.state, SlotState::Free);
            assert_eq!(d.writer_lock_pid, None);
            assert!(!d.stuck);
        }

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn force_reset_slot_reclaims_a_stuck_writer_lock() {
        let path = scratch_path("b");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 4;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        let entry = slot_entry_at(producer.mapping(), producer.offsets(), 3);
        let dead_pid = u64::from(u32::MAX) - 7;
        entry
            .writer_acquire(
                dead_pid,
                std::time::Instant::now() + StdDuration::from_secs(1),
                &producer.header().metrics,
            )
            .unwrap();
        // The lock holder "crashes": the slot stays `Writing` forever
        // without a commit, which is exactly what `force_reset_slot` exists
        // to clean up.

        let admin = SegmentAdmin::attach(&path).unwrap();
        let before = admin.diagnose_slot(3).unwrap();
        assert_eq!(before.writer_lock_pid, Some(dead_pid));
        assert_eq!(before.writer_alive, Some(false));
        assert!(before.stuck);

        assert!(admin.force_reset_slot(3, true).is_ok());
        let after = admin.diagnose_slot(3).unwrap();
        assert_eq!(after.state, SlotState::Free);
        assert_eq!(after.writer_lock_pid, None);
        assert_eq!(admin.get_metrics_snapshot().recovery_actions, 1);

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn force_reset_slot_refuses_a_live_writer_without_force() {
        let path = scratch_path("c");
        let config = SegmentConfig::default();
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        let entry = slot_entry_at(producer.mapping(), producer.offsets(), 0);
        entry
            .writer_acquire(
                std::process::id() as u64,
                std::time::Instant::now() + StdDuration::from_secs(1),
                &producer.header().metrics,
            )
            .unwrap();

        let admin = SegmentAdmin::attach(&path).unwrap();
        let result = admin.force_reset_slot(0, false);
        assert_eq!(result, Err(RecoveryError::WriterAliveRefusesForce));

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn metrics_snapshot_and_reset_roundtrip() {
        let path = scratch_path("d");
        let mut config = SegmentConfig::default();
        config.checksum_kind = ChecksumKind::Blake2b256;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();
        producer
            .with_raw_writer_slot(StdDuration::from_secs(1), |buf| buf.fill(1))
            .unwrap();

        let admin = SegmentAdmin::attach(&path).unwrap();
        assert_eq!(admin.get_metrics_snapshot().total_commits, 1);
        admin.reset_metrics();
        assert_eq!(admin.get_metrics_snapshot().total_commits, 0);

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_slot_index_is_rejected() {
        let path = scratch_path("e");
        let config = SegmentConfig::default();
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        let admin = SegmentAdmin::attach(&path).unwrap();
        assert_eq!(
            admin.diagnose_slot(999),
            Err(RecoveryError::InvalidSlotIndex)
        );

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }
}
