//! Consumer handle. Attaches to an existing segment, claims a heartbeat
//! slot, and walks committed slots via a private cursor — the cursor lives
//! in the handle itself, not the shared header, so independently-attached
//! consumers make independent progress.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backoff;
use crate::checksum::ChecksumEntry;
use crate::config::{ChecksumKind, ChecksumPolicy, SegmentConfig};
use crate::error::{AcquireError, ConfigError};
use crate::iterator::{RawSlotGuard, SlotIter};
use crate::layout::{Header, SegmentMapping, SegmentOffsets};
use crate::liveness;
use crate::ring;
use crate::slot::SlotEntry;

/// A single attached reader. Not `Clone`: each process/thread that wants
/// independent cursor progress attaches its own `Consumer`.
pub struct Consumer {
    mapping: Arc<SegmentMapping>,
    offsets: SegmentOffsets,
    config: SegmentConfig,
    consumer_id: u64,
    heartbeat_slot: usize,
    cursor: Cell<u64>,
    path: PathBuf,
}

impl Consumer {
    /// Attaches to the segment at `path`. Validates the header's magic,
    /// version, shared secret and both schema hashes before claiming a
    /// heartbeat slot.
    pub fn attach(
        path: impl AsRef<Path>,
        consumer_id: u64,
        shared_secret: &[u8; 64],
        flexzone_schema_hash: &[u8; 32],
        datablock_schema_hash: &[u8; 32],
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let mapping = SegmentMapping::open(&path)?;
        // SAFETY: `open` already checked the file is at least one page.
        let header = unsafe { mapping.header() };
        header.validate_for_attach(shared_secret, flexzone_schema_hash, datablock_schema_hash)?;
        let config = header.config_snapshot()?;
        let offsets = SegmentOffsets::calculate(&config)?;
        if offsets.total_size != header.total_size {
            return Err(ConfigError::LayoutMismatch(
                "derived offsets do not match stored total_size",
            ));
        }

        let pid = std::process::id() as u64;
        let cursor = header.commit_index.load(Ordering::Acquire);
        let heartbeat_slot = liveness::claim_heartbeat_slot(header, consumer_id, pid, cursor)
            .ok_or(ConfigError::InvalidConfig("consumer heartbeat table is full"))?;
        header.active_consumer_count.fetch_add(1, Ordering::AcqRel);
        liveness::update_consumer_read_sequence(header, heartbeat_slot, cursor);
        tracing::info!(consumer_id, cursor, "consumer attached");

        Ok(Self {
            mapping: Arc::new(mapping),
            offsets,
            config,
            consumer_id,
            heartbeat_slot,
            cursor: Cell::new(cursor),
            path,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    pub(crate) fn header(&self) -> &Header {
        // SAFETY: the header was validated in `attach` and the mapping
        // outlives every reference derived from it.
        unsafe { self.mapping.header() }
    }

    fn slot_entry(&self, index: usize) -> &SlotEntry {
        let offset = self.offsets.slot_state
            + (index as u64) * core::mem::size_of::<SlotEntry>() as u64;
        // SAFETY: `index < ring_capacity` is checked by every caller, and
        // the slot-state region was sized for exactly `ring_capacity`
        // entries by `SegmentOffsets::calculate`.
        unsafe { &*self.mapping.as_ptr().add(offset as usize).cast::<SlotEntry>() }
    }

    fn checksum_entry(&self, index: usize) -> Option<&ChecksumEntry> {
        if matches!(self.config.checksum_kind, ChecksumKind::None) {
            return None;
        }
        let offset = self.offsets.slot_checksum
            + (index as u64) * core::mem::size_of::<ChecksumEntry>() as u64;
        // SAFETY: same reasoning as `slot_entry`, sized by the same call.
        Some(unsafe { &*self.mapping.as_ptr().add(offset as usize).cast::<ChecksumEntry>() })
    }

    pub(crate) fn payload_bytes(&self, index: usize) -> &[u8] {
        let offset = self.offsets.ring + (index as u64) * u64::from(self.config.logical_slot_size);
        // SAFETY: same index bound as above; the ring region is sized for
        // exactly `ring_capacity * logical_slot_size` bytes.
        unsafe { self.mapping.slice(offset, self.config.logical_slot_size as usize) }
    }

    pub(crate) fn mapping(&self) -> &Arc<SegmentMapping> {
        &self.mapping
    }

    pub(crate) fn flex_zone_bytes(&self) -> &[u8] {
        // SAFETY: the flex zone region is `flex_zone_size` bytes starting
        // at `offsets.flex_zone`, set up identically by creator and
        // attacher from the same validated config.
        unsafe { self.mapping.slice(self.offsets.flex_zone, self.config.flex_zone_size as usize) }
    }

    /// Acquires a read view of a specific sequence number, bypassing the
    /// cursor. Used by the transaction façade and available directly for
    /// callers that track their own position.
    pub fn acquire_read(&self, sequence: u64) -> Result<RawSlotGuard<'_>, AcquireError> {
        let commit_index = self.header().commit_index.load(Ordering::Acquire);
        if sequence >= commit_index {
            return Err(AcquireError::NotReady);
        }
        let index = ring::slot_for_sequence(sequence, self.config.ring_capacity);
        let generation = self.slot_entry(index).reader_acquire(&self.header().metrics)?;
        Ok(RawSlotGuard::new(self, index, sequence, generation))
    }

    /// Advances the cursor and returns the next committed slot, blocking
    /// (with the standard tri-phase backoff) up to `timeout`. Skips ahead
    /// and returns `StaleOverwritten` once if the cursor fell far enough
    /// behind that the slot it wanted has already been overwritten.
    pub fn try_next(&self, timeout: Duration) -> Result<RawSlotGuard<'_>, AcquireError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            let seq = self.cursor.get();
            let commit_index = self.header().commit_index.load(Ordering::Acquire);
            let capacity = u64::from(self.config.ring_capacity);

            if commit_index.saturating_sub(seq) > capacity {
                let caught_up = commit_index - capacity;
                tracing::warn!(
                    consumer_id = self.consumer_id,
                    lost = caught_up - seq,
                    "consumer cursor fell behind ring capacity, skipping ahead"
                );
                self.cursor.set(caught_up);
                liveness::update_consumer_read_sequence(self.header(), self.heartbeat_slot, caught_up);
                return Err(AcquireError::StaleOverwritten);
            }

            if seq < commit_index {
                match self.acquire_read(seq) {
                    Ok(guard) => {
                        self.cursor.set(seq + 1);
                        liveness::update_consumer_read_sequence(
                            self.header(),
                            self.heartbeat_slot,
                            seq + 1,
                        );
                        return Ok(guard);
                    }
                    Err(AcquireError::NotReady) => {
                        // Lost a race with a writer re-entering `Writing`
                        // on this slot; retry the same sequence.
                    }
                    Err(e) => return Err(e),
                }
            }

            if Instant::now() >= deadline {
                return Err(AcquireError::Timeout);
            }
            backoff::step(&mut attempt);
        }
    }

    /// Returns a non-terminating iterator over committed slots, each item
    /// a bounded wait of up to `per_item_timeout`.
    pub fn slots(&self, per_item_timeout: Duration) -> SlotIter<'_> {
        SlotIter::new(self, per_item_timeout)
    }

    pub fn seek_latest(&self) {
        let sequence = self.header().commit_index.load(Ordering::Acquire);
        self.cursor.set(sequence);
        liveness::update_consumer_read_sequence(self.header(), self.heartbeat_slot, sequence);
    }

    pub fn seek_to(&self, sequence: u64) {
        self.cursor.set(sequence);
        liveness::update_consumer_read_sequence(self.header(), self.heartbeat_slot, sequence);
    }

    pub fn current_sequence(&self) -> u64 {
        self.cursor.get()
    }

    pub(crate) fn verify_checksum(&self, index: usize, payload: &[u8]) -> Option<bool> {
        if matches!(self.config.checksum_policy, ChecksumPolicy::Enforced) {
            self.checksum_entry(index).and_then(|c| c.verify(payload))
        } else {
            None
        }
    }

    pub(crate) fn release_slot(
        &self,
        index: usize,
        generation: u64,
        checksum_ok: Option<bool>,
    ) -> Result<(), AcquireError> {
        self.slot_entry(index)
            .reader_release(generation, checksum_ok, &self.header().metrics)
    }

    pub fn update_heartbeat(&self) {
        liveness::touch_heartbeat_slot(self.header(), self.heartbeat_slot);
    }

    /// Releases this consumer's heartbeat slot and decrements the active
    /// consumer count. Also happens automatically on `Drop`; calling it
    /// explicitly lets a caller distinguish an orderly detach from a crash.
    pub fn detach(self) {
        // Drop does the actual work; this exists so callers can express
        // intent without relying on scope-exit.
        drop(self);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        liveness::release_heartbeat_slot(self.header(), self.heartbeat_slot, self.consumer_id);
        let remaining = self
            .header()
            .active_consumer_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);
        let producer_dropped =
            self.header().flags.load(Ordering::Acquire) & crate::layout::FLAG_PRODUCER_DROPPED != 0;
        if remaining == 0 && producer_dropped {
            tracing::info!(path = %self.path.display(), "last consumer detached after producer exit, unlinking segment");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::Producer;

    fn test_secret() -> [u8; 64] {
        [7u8; 64]
    }

    fn hashes() -> ([u8; 32], [u8; 32]) {
        ([1u8; 32], [2u8; 32])
    }

    #[test]
    fn attach_fails_on_schema_mismatch() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("shm-hub-consumer-test-{}-a.seg", std::process::id()));
        let (flex_hash, data_hash) = hashes();

        let mut config = SegmentConfig::default();
        config.shared_secret = test_secret();
        let _producer = Producer::create(&path, config, 1, flex_hash, data_hash).unwrap();

        let wrong_hash = [9u8; 32];
        let result = Consumer::attach(&path, 1, &test_secret(), &wrong_hash, &data_hash);
        assert!(matches!(result, Err(ConfigError::SchemaMismatch { .. })));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn attach_fails_on_secret_mismatch() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("shm-hub-consumer-test-{}-b.seg", std::process::id()));
        let (flex_hash, data_hash) = hashes();

        let mut config = SegmentConfig::default();
        config.shared_secret = test_secret();
        let _producer = Producer::create(&path, config, 1, flex_hash, data_hash).unwrap();

        let result = Consumer::attach(&path, 1, &[0u8; 64], &flex_hash, &data_hash);
        assert!(matches!(result, Err(ConfigError::SecretMismatch)));

        let _ = std::fs::remove_file(&path);
    }
}
