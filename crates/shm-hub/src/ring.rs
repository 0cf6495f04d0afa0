//! Ring index arithmetic. `write_index`/`commit_index` are
//! advanced by the producer; `read_index` is an advisory watermark used
//! only for RING-BUFFER backpressure, not for correctness — a slow reader
//! under SINGLE-LATEST/DOUBLE-BUFFER is expected to observe
//! `AcquireError::StaleOverwritten` rather than block the writer.

use crate::config::Policy;

/// Maps a monotonic sequence number to its slot, wrapping at
/// `ring_capacity`.
pub fn slot_for_sequence(sequence: u64, ring_capacity: u32) -> usize {
    (sequence % u64::from(ring_capacity)) as usize
}

/// Number of committed-but-unread slots under RING-BUFFER accounting.
pub fn queue_len(write_index: u64, read_index: u64) -> u64 {
    write_index.saturating_sub(read_index)
}

/// Whether a producer under RING-BUFFER policy must block before claiming
/// the next slot. SINGLE-LATEST and DOUBLE-BUFFER never block here: their
/// backpressure is the slot-level reader-drain wait in
/// `SlotEntry::writer_acquire`, not a ring-full check.
pub fn would_block(policy: Policy, write_index: u64, read_index: u64, ring_capacity: u32) -> bool {
    matches!(policy, Policy::RingBuffer) && queue_len(write_index, read_index) >= u64::from(ring_capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_for_sequence_wraps() {
        assert_eq!(slot_for_sequence(0, 4), 0);
        assert_eq!(slot_for_sequence(3, 4), 3);
        assert_eq!(slot_for_sequence(4, 4), 0);
        assert_eq!(slot_for_sequence(9, 4), 1);
    }

    #[test]
    fn ring_buffer_blocks_when_full() {
        assert!(!would_block(Policy::RingBuffer, 4, 0, 4));
        assert!(would_block(Policy::RingBuffer, 5, 1, 4));
        assert!(!would_block(Policy::RingBuffer, 5, 2, 4));
    }

    #[test]
    fn single_latest_and_double_buffer_never_block_on_queue_length() {
        assert!(!would_block(Policy::SingleLatest, 1_000_000, 0, 1));
        assert!(!would_block(Policy::DoubleBuffer, 1_000_000, 0, 2));
    }
}
