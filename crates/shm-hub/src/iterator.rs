//! Non-terminating lazy slot sequence: every item is a `Result`, and
//! `Timeout`/`NotReady` are ordinary values the caller breaks out on
//! explicitly, rather than the sequence itself terminating. `SlotIter` is
//! a plain, infinite `std::iter::Iterator` that never returns `None`.

use crate::consumer::Consumer;
use crate::error::AcquireError;
use std::time::Duration;

/// An acquired read view into one committed slot. Borrowed from its
/// `Consumer`, so it cannot outlive the handle that produced it.
/// `reader_count` is released automatically on drop if the caller never
/// calls [`validate`](Self::validate) explicitly (the façade's exit
/// contract relies on this).
pub struct RawSlotGuard<'c> {
    consumer: &'c Consumer,
    slot_index: usize,
    sequence: u64,
    generation: u64,
    released: bool,
}

impl<'c> RawSlotGuard<'c> {
    pub(crate) fn new(consumer: &'c Consumer, slot_index: usize, sequence: u64, generation: u64) -> Self {
        Self {
            consumer,
            slot_index,
            sequence,
            generation,
            released: false,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw payload bytes for this slot, exactly `logical_slot_size` long.
    /// Only meaningful until [`validate`](Self::validate) is called or the
    /// guard drops — after release the bytes may belong to a different
    /// generation.
    pub fn payload(&self) -> &[u8] {
        self.consumer.payload_bytes(self.slot_index)
    }

    /// Validates that the slot was not overwritten while this guard was
    /// held and, under `ChecksumPolicy::Enforced`, that the payload
    /// matches its stored digest. Always releases `reader_count`, even on
    /// failure. Calling this is optional; [`Drop`] performs an equivalent
    /// release (without the checksum check) if the caller never calls it.
    pub fn validate(&mut self) -> Result<(), AcquireError> {
        if self.released {
            return Err(AcquireError::UseAfterRelease);
        }
        self.released = true;
        let checksum_ok = self.consumer.verify_checksum(self.slot_index, self.payload());
        self.consumer
            .release_slot(self.slot_index, self.generation, checksum_ok)
    }
}

impl Drop for RawSlotGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort release with no checksum re-check; the caller
            // chose not to call `validate()` (e.g. an early `?` return or
            // a panic unwinding through the transaction façade).
            let _ = self.consumer.release_slot(self.slot_index, self.generation, None);
        }
    }
}

/// A non-terminating iterator over committed slots. `next()` always
/// returns `Some`; a `Timeout`/`NotReady`/`StaleOverwritten` item is an
/// ordinary value, not end-of-sequence — callers loop and `break`
/// explicitly on whichever outcomes they consider final.
pub struct SlotIter<'c> {
    consumer: &'c Consumer,
    per_item_timeout: Duration,
}

impl<'c> SlotIter<'c> {
    pub(crate) fn new(consumer: &'c Consumer, per_item_timeout: Duration) -> Self {
        Self {
            consumer,
            per_item_timeout,
        }
    }
}

impl<'c> Iterator for SlotIter<'c> {
    type Item = Result<RawSlotGuard<'c>, AcquireError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.consumer.try_next(self.per_item_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::producer::Producer;
    use std::time::Instant;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "shm-hub-iterator-test-{}-{tag}.seg",
            std::process::id()
        ))
    }

    #[test]
    fn slot_iter_never_returns_none_even_on_timeout() {
        let path = scratch_path("a");
        let config = SegmentConfig::default();
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();
        let consumer =
            crate::consumer::Consumer::attach(&path, 1, &[0; 64], &[0; 32], &[0; 32]).unwrap();

        let mut iter = consumer.slots(Duration::from_millis(5));
        let start = Instant::now();
        for _ in 0..3 {
            let item = iter.next();
            assert!(item.is_some());
            assert!(matches!(item.unwrap(), Err(AcquireError::Timeout)));
        }
        assert!(start.elapsed() >= Duration::from_millis(15));

        drop(producer);
        drop(consumer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn raw_slot_guard_releases_reader_count_on_drop_without_validate() {
        let path = scratch_path("b");
        let config = SegmentConfig::default();
        let producer = Producer::create(&path, config, 1, [0; 32], [0; 32]).unwrap();
        producer
            .with_raw_writer_slot(Duration::from_secs(1), |buf| {
                buf.fill(0xAB);
            })
            .unwrap();

        let consumer =
            crate::consumer::Consumer::attach(&path, 1, &[0; 64], &[0; 32], &[0; 32]).unwrap();
        {
            let guard = consumer.acquire_read(0).unwrap();
            assert_eq!(guard.payload()[0], 0xAB);
            // Dropped without calling `validate()`.
        }
        let guard_again = consumer.acquire_read(0);
        assert!(guard_again.is_ok());

        drop(producer);
        drop(consumer);
        let _ = std::fs::remove_file(&path);
    }
}
