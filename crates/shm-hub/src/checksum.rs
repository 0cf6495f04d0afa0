//! BLAKE2b-256 checksum engine. A fixed-size digest plus an atomic validity
//! flag, written once under the writer lock and read many times; see
//! `DESIGN.md` for why `blake2` was picked over other hashing crates.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// Hashes `data` with BLAKE2b-256.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// One checksum slot: a 32-byte digest guarded by an atomic validity flag.
/// The digest itself lives in an `UnsafeCell` because only the writer
/// mutates it (under the slot's writer lock) and the happens-before edge
/// to readers is the `valid` flag's release/acquire pair, not the digest
/// bytes themselves.
#[repr(C)]
pub struct ChecksumEntry {
    digest: UnsafeCell<[u8; 32]>,
    valid: AtomicU8,
    _pad: [u8; 7],
}

const _: () = assert!(core::mem::size_of::<ChecksumEntry>() == 40);

// SAFETY: `digest` is only ever written by the slot's writer lock holder,
// and only ever read after observing `valid == 1` via Acquire, which
// synchronizes with the Release store that follows the write.
unsafe impl Sync for ChecksumEntry {}

impl ChecksumEntry {
    pub(crate) fn clear(&self) {
        self.valid.store(0, Ordering::Release);
    }

    /// Writes a fresh digest and publishes it. Caller must hold the slot's
    /// writer lock; this is not safe to call concurrently with itself.
    pub(crate) fn store(&self, digest: [u8; 32]) {
        // SAFETY: exclusive writer access guaranteed by the caller.
        unsafe {
            *self.digest.get() = digest;
        }
        self.valid.store(1, Ordering::Release);
    }

    /// Returns the published digest, if any has been written since the
    /// last `clear()`.
    pub(crate) fn load(&self) -> Option<[u8; 32]> {
        if self.valid.load(Ordering::Acquire) == 1 {
            // SAFETY: Acquire here synchronizes with the Release in
            // `store`, so the digest bytes are visible.
            Some(unsafe { *self.digest.get() })
        } else {
            None
        }
    }

    /// Verifies `payload` against the stored digest. `None` means no
    /// digest has been published (checksums disabled or not yet written).
    pub(crate) fn verify(&self, payload: &[u8]) -> Option<bool> {
        self.load().map(|expected| expected == hash(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_forty_bytes() {
        assert_eq!(core::mem::size_of::<ChecksumEntry>(), 40);
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_input() {
        let a = hash(b"hello world");
        let b = hash(b"hello world");
        let c = hash(b"hello world!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn verify_roundtrip() {
        let entry = ChecksumEntry {
            digest: UnsafeCell::new([0; 32]),
            valid: AtomicU8::new(0),
            _pad: [0; 7],
        };
        assert_eq!(entry.verify(b"payload"), None);
        entry.store(hash(b"payload"));
        assert_eq!(entry.verify(b"payload"), Some(true));
        assert_eq!(entry.verify(b"not the payload"), Some(false));
    }
}
