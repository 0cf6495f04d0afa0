//! Producer handle. Owns segment creation, the flex zone's
//! writer-side access, and the raw (non-typed) slot write path that
//! `transaction.rs` builds the typed façade on top of.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checksum::{self, ChecksumEntry};
use crate::config::{ChecksumKind, ChecksumPolicy, SegmentConfig};
use crate::error::{AcquireError, ConfigError};
use crate::layout::{Header, SegmentMapping, SegmentOffsets, FLAG_PRODUCER_DROPPED};
use crate::liveness;
use crate::ring;
use crate::slot::SlotEntry;

/// A writer's handle on a segment. There is exactly one producer per
/// segment by construction: `create` always makes a new file, there is no
/// "attach as producer" path — a hub is single-producer.
pub struct Producer {
    mapping: Arc<SegmentMapping>,
    offsets: SegmentOffsets,
    config: SegmentConfig,
    producer_id: u64,
    path: PathBuf,
    pid: u64,
}

impl Producer {
    /// Creates a brand-new segment at `path`, owned by this process. The
    /// two schema hashes are whatever the caller's flex-zone and payload
    /// types derive (the typed façade in `transaction.rs` computes these
    /// automatically; raw callers must supply them).
    ///
    /// `producer_id` is stored verbatim as the segment's identifying label
    /// (`Header::producer_id`); this crate never generates one itself. Pass
    /// a value you already have good entropy for (a random-at-startup
    /// value, a restart counter, or similar) — it is not the `writer_lock`
    /// PID that the zombie-reclaim CAS protocol depends on, so it is never
    /// load-bearing for liveness, only for telling segments' producer
    /// history apart in diagnostics.
    pub fn create(
        path: impl AsRef<Path>,
        config: SegmentConfig,
        producer_id: u64,
        flexzone_schema_hash: [u8; 32],
        datablock_schema_hash: [u8; 32],
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let offsets = SegmentOffsets::calculate(&config)?;
        let path = path.as_ref().to_path_buf();
        let mapping = SegmentMapping::create(&path, offsets.total_size)?;

        // SAFETY: this process just created the mapping; nothing else has
        // a reference into it yet.
        let header = unsafe { &mut *mapping.as_ptr().cast::<Header>() };
        header.init(
            &config,
            offsets.total_size,
            producer_id,
            flexzone_schema_hash,
            datablock_schema_hash,
        );

        for index in 0..config.ring_capacity as usize {
            slot_entry_at(&mapping, &offsets, index).init();
            if let Some(entry) = checksum_entry_at(&mapping, &offsets, &config, index) {
                entry.clear();
            }
        }

        tracing::info!(
            producer_id,
            ring_capacity = config.ring_capacity,
            total_size = offsets.total_size,
            "segment created"
        );

        Ok(Self {
            mapping: Arc::new(mapping),
            offsets,
            config,
            producer_id,
            path,
            pid: std::process::id() as u64,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    pub(crate) fn header(&self) -> &Header {
        // SAFETY: initialized in `create`, mapping outlives all borrows.
        unsafe { self.mapping.header() }
    }

    pub(crate) fn mapping(&self) -> &Arc<SegmentMapping> {
        &self.mapping
    }

    pub(crate) fn offsets(&self) -> &SegmentOffsets {
        &self.offsets
    }

    /// Mutable access to the flex zone. The producer is the flex zone's
    /// sole writer; consumers only ever read it.
    pub fn flex_zone_bytes_mut(&self) -> &mut [u8] {
        // SAFETY: only the producer calls this, and there is exactly one
        // producer per segment, so no other writer can alias this slice.
        // Concurrent consumer reads are why `update_flex_zone_checksum`
        // exists as a distinct, explicit publish step.
        unsafe {
            self.mapping
                .slice_mut(self.offsets.flex_zone, self.config.flex_zone_size as usize)
        }
    }

    /// Publishes a fresh checksum over the flex zone's current contents.
    /// Call after finishing a round of flex zone writes, before any
    /// consumer is expected to observe them as consistent.
    pub fn update_flex_zone_checksum(&self) {
        let digest = checksum::hash(self.flex_zone_bytes_mut());
        self.header().flex_zone_checksum.store(digest);
    }

    /// Verifies the flex zone against its last published checksum. Returns
    /// `None` if no checksum has ever been published.
    pub fn verify_flex_zone_checksum(&self) -> Option<bool> {
        self.header()
            .flex_zone_checksum
            .verify(self.flex_zone_bytes_mut())
    }

    pub fn update_heartbeat(&self) {
        liveness::touch_producer_heartbeat(self.header());
    }

    fn slot_entry(&self, index: usize) -> &SlotEntry {
        slot_entry_at(&self.mapping, &self.offsets, index)
    }

    fn checksum_entry(&self, index: usize) -> Option<&ChecksumEntry> {
        checksum_entry_at(&self.mapping, &self.offsets, &self.config, index)
    }

    pub(crate) fn payload_bytes_mut(&self, index: usize) -> &mut [u8] {
        let offset = self.offsets.ring + (index as u64) * u64::from(self.config.logical_slot_size);
        // SAFETY: `index < ring_capacity`, checked by every caller; the
        // writer lock on `index` excludes any other writer from this
        // range, and readers only read through `payload_bytes` (shared
        // ref) after observing `Committed`, never while `Writing`.
        unsafe {
            self.mapping
                .slice_mut(offset, self.config.logical_slot_size as usize)
        }
    }

    /// Claims the next slot in sequence order, waiting (subject to
    /// `timeout`) on RING-BUFFER backpressure and on the slot's own
    /// writer-lock/reader-drain handshake. Returns the claimed sequence
    /// number and slot index.
    pub(crate) fn acquire_write_slot(&self, timeout: Duration) -> Result<(u64, usize), AcquireError> {
        let deadline = Instant::now() + timeout;
        let header = self.header();

        let sequence = loop {
            let write_index = header.write_index.load(Ordering::Acquire);
            let read_index = header.read_index.load(Ordering::Acquire);
            if !ring::would_block(self.config.policy, write_index, read_index, self.config.ring_capacity)
            {
                break write_index;
            }
            if Instant::now() >= deadline {
                header.metrics.writer_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(AcquireError::QueueFull);
            }
            crate::backoff::wait_until(deadline, || {
                !ring::would_block(
                    self.config.policy,
                    header.write_index.load(Ordering::Acquire),
                    header.read_index.load(Ordering::Acquire),
                    self.config.ring_capacity,
                )
            });
        };

        let index = ring::slot_for_sequence(sequence, self.config.ring_capacity);
        self.slot_entry(index)
            .writer_acquire(self.pid, deadline, &header.metrics)?;
        header.write_index.fetch_add(1, Ordering::Release);
        Ok((sequence, index))
    }

    /// Writes `payload` into the slot claimed at `index` and commits it.
    /// Low-level entry point for tests and the raw (non-typed) path; the
    /// typed façade builds `commit()` on `WriteSlotGuard` from the same
    /// pieces. Under `ChecksumPolicy::Enforced` the digest is computed and
    /// stored here, under the writer lock, before the slot becomes visible
    /// to readers; under `Manual` the caller must reach for
    /// [`update_slot_checksum`](Self::update_slot_checksum) explicitly.
    pub(crate) fn commit_slot(&self, index: usize, payload: &[u8]) {
        let header = self.header();
        if matches!(self.config.checksum_kind, ChecksumKind::Blake2b256)
            && matches!(self.config.checksum_policy, ChecksumPolicy::Enforced)
        {
            if let Some(entry) = self.checksum_entry(index) {
                entry.store(checksum::hash(payload));
            }
        }
        header
            .metrics
            .total_bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.slot_entry(index)
            .writer_commit(index as u32, self.pid, &header.commit_index, &header.metrics);
    }

    /// Publishes a fresh digest over `payload` for the slot at `index`,
    /// for `ChecksumPolicy::Manual` callers who want a checksum on record
    /// without the crate enforcing one on every commit. A no-op if
    /// checksums are disabled for this segment.
    pub fn update_slot_checksum(&self, index: usize, payload: &[u8]) {
        if let Some(entry) = self.checksum_entry(index) {
            entry.store(checksum::hash(payload));
        }
    }

    pub(crate) fn abandon_slot(&self, index: usize) {
        self.slot_entry(index).writer_abandon(index as u32, self.pid);
    }

    /// Convenience used by raw (non-typed) tests and simple producers that
    /// don't need the full transaction façade: claims the next slot, lets
    /// `fill` write into it, and commits.
    pub fn with_raw_writer_slot(
        &self,
        timeout: Duration,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<u64, AcquireError> {
        let (sequence, index) = self.acquire_write_slot(timeout)?;
        fill(self.payload_bytes_mut(index));
        let payload = self.payload_bytes_mut(index).to_vec();
        self.commit_slot(index, &payload);
        Ok(sequence)
    }
}

pub(crate) fn slot_entry_at<'a>(mapping: &'a SegmentMapping, offsets: &SegmentOffsets, index: usize) -> &'a SlotEntry {
    let offset = offsets.slot_state + (index as u64) * core::mem::size_of::<SlotEntry>() as u64;
    // SAFETY: the slot-state region is sized for exactly `ring_capacity`
    // entries and `index` is always checked by the caller against that
    // same capacity.
    unsafe { &*mapping.as_ptr().add(offset as usize).cast::<SlotEntry>() }
}

pub(crate) fn checksum_entry_at<'a>(
    mapping: &'a SegmentMapping,
    offsets: &SegmentOffsets,
    config: &SegmentConfig,
    index: usize,
) -> Option<&'a ChecksumEntry> {
    if matches!(config.checksum_kind, ChecksumKind::None) {
        return None;
    }
    let offset = offsets.slot_checksum + (index as u64) * core::mem::size_of::<ChecksumEntry>() as u64;
    // SAFETY: same reasoning as `slot_entry_at`, sized by the same call.
    Some(unsafe { &*mapping.as_ptr().add(offset as usize).cast::<ChecksumEntry>() })
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.header().flags.fetch_or(FLAG_PRODUCER_DROPPED, Ordering::Release);
        if self.header().active_consumer_count.load(Ordering::Acquire) == 0 {
            tracing::info!(path = %self.path.display(), "producer dropped with no attached consumers, unlinking segment");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shm-hub-producer-test-{}-{tag}.seg", std::process::id()))
    }

    #[test]
    fn create_initializes_every_slot_to_free() {
        let path = scratch_path("a");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 4;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        for i in 0..4 {
            assert_eq!(producer.slot_entry(i).state(), crate::slot::SlotState::Free);
        }
        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_commit_advances_commit_index_and_sets_committed() {
        let path = scratch_path("b");
        let config = SegmentConfig::default();
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        let sequence = producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| buf.fill(0x42))
            .unwrap();
        assert_eq!(sequence, 0);
        assert_eq!(producer.header().commit_index.load(Ordering::Acquire), 1);
        assert_eq!(
            producer.slot_entry(0).state(),
            crate::slot::SlotState::Committed
        );
        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ring_buffer_blocks_writer_once_full_until_timeout() {
        let path = scratch_path("c");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 2;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| buf.fill(1))
            .unwrap();
        producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| buf.fill(2))
            .unwrap();

        let start = Instant::now();
        let result = producer.with_raw_writer_slot(Duration::from_millis(20), |buf| buf.fill(3));
        assert_eq!(result, Err(AcquireError::QueueFull));
        assert!(start.elapsed() >= Duration::from_millis(15));

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn checksum_is_published_automatically_under_enforced_policy() {
        let path = scratch_path("d");
        let mut config = SegmentConfig::default();
        config.checksum_kind = ChecksumKind::Blake2b256;
        config.checksum_policy = ChecksumPolicy::Enforced;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| buf.fill(0x99))
            .unwrap();
        let payload = producer.payload_bytes_mut(0).to_vec();
        let entry = producer.checksum_entry(0).unwrap();
        assert_eq!(entry.verify(&payload), Some(true));

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn manual_policy_does_not_auto_publish_but_explicit_update_does() {
        let path = scratch_path("f");
        let mut config = SegmentConfig::default();
        config.checksum_kind = ChecksumKind::Blake2b256;
        config.checksum_policy = ChecksumPolicy::Manual;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| buf.fill(0x99))
            .unwrap();
        let entry = producer.checksum_entry(0).unwrap();
        assert_eq!(entry.load(), None);

        let payload = producer.payload_bytes_mut(0).to_vec();
        producer.update_slot_checksum(0, &payload);
        assert_eq!(entry.verify(&payload), Some(true));

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flex_zone_checksum_roundtrip() {
        let path = scratch_path("e");
        let mut config = SegmentConfig::default();
        config.flex_zone_size = 4096;
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();

        assert_eq!(producer.verify_flex_zone_checksum(), None);
        producer.flex_zone_bytes_mut()[0] = 0xFF;
        producer.update_flex_zone_checksum();
        assert_eq!(producer.verify_flex_zone_checksum(), Some(true));
        producer.flex_zone_bytes_mut()[0] = 0x00;
        assert_eq!(producer.verify_flex_zone_checksum(), Some(false));

        drop(producer);
        let _ = std::fs::remove_file(&path);
    }
}
