//! Error taxonomy for the hub. Four independent enums, one per failure
//! domain, matching the manual `Display` + `std::error::Error` style used
//! throughout the hub layout/session modules rather than a derive-macro
//! error crate.

use std::fmt;
use std::io;

/// Errors that abort `create`/`attach` outright.
#[derive(Debug)]
pub enum ConfigError {
    /// A config field violates a layout constraint (flex zone alignment,
    /// slot size vs. page size, zero ring capacity, ...).
    InvalidConfig(&'static str),
    /// Major protocol version mismatch between creator and attacher.
    VersionIncompatible { expected: u32, found: u32 },
    /// Flex-zone or payload schema hash stored in the header does not match
    /// the hash derived from the caller's type.
    SchemaMismatch { field: &'static str },
    /// `shared_secret` presented at attach does not match the header.
    SecretMismatch,
    /// Derived offsets do not line up with what the header claims.
    LayoutMismatch(&'static str),
    /// Underlying file / mmap operation failed.
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid segment config: {msg}"),
            Self::VersionIncompatible { expected, found } => write!(
                f,
                "incompatible version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::SchemaMismatch { field } => write!(f, "schema hash mismatch on {field}"),
            Self::SecretMismatch => write!(f, "shared secret mismatch"),
            Self::LayoutMismatch(msg) => write!(f, "layout mismatch: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors surfaced through acquire calls and the slot iterator. None of
/// these are fatal: the caller is expected to treat them as "try again" or
/// "discard this read".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The caller-supplied deadline elapsed before the lock/condition was
    /// satisfied.
    Timeout,
    /// A reader asked for a slot sequence that has not been committed yet.
    NotReady,
    /// RING-BUFFER policy: the ring is full (backpressure).
    QueueFull,
    /// The writer overwrote this slot between acquire and release.
    StaleOverwritten,
    /// Stored checksum did not match the payload bytes.
    ChecksumFail,
    /// Informational: a dead writer's lock was reclaimed during this call.
    ZombieReclaimed,
    /// Usage error: `commit()` called twice on the same writer slot.
    DoubleCommit,
    /// Usage error: operation attempted on a guard that already released.
    UseAfterRelease,
    /// Usage error: a null/absent handle was used.
    NullHandle,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "timed out waiting for slot",
            Self::NotReady => "slot not ready",
            Self::QueueFull => "ring buffer full",
            Self::StaleOverwritten => "slot overwritten before read completed",
            Self::ChecksumFail => "checksum verification failed",
            Self::ZombieReclaimed => "writer lock reclaimed from a dead process",
            Self::DoubleCommit => "slot already committed",
            Self::UseAfterRelease => "slot handle used after release",
            Self::NullHandle => "operation on a null handle",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for AcquireError {}

/// Errors from the administrative recovery surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryError {
    /// Slot index out of range for the segment's ring capacity.
    InvalidSlotIndex,
    /// `force_reset_slot` refused because the writer lock is held by a
    /// live process and `force` was not set, or was set but the holder is
    /// still alive.
    WriterAliveRefusesForce,
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSlotIndex => write!(f, "slot index out of range"),
            Self::WriterAliveRefusesForce => {
                write!(f, "writer lock is held by a live process")
            }
        }
    }
}

impl std::error::Error for RecoveryError {}

/// A fatal, local state-machine invariant violation. This type is never
/// returned from a `Result`: a corrupted slot state machine means the
/// segment is shared across processes and self-recovery could corrupt
/// another peer's state, so the only safe response is to abort rather
/// than guess at a fix. It exists only to carry a structured message into
/// the `panic!` payload.
#[derive(Debug, Clone)]
pub struct StateInvariantViolation {
    pub slot: u32,
    pub message: &'static str,
}

impl fmt::Display for StateInvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state invariant violated on slot {}: {}",
            self.slot, self.message
        )
    }
}

impl std::error::Error for StateInvariantViolation {}

/// Aborts the process with a diagnostic identifying the slot and the
/// illegal transition observed. See [`StateInvariantViolation`] for why
/// this is a panic, not a recoverable error.
#[track_caller]
pub(crate) fn invariant_violation(slot: u32, message: &'static str) -> ! {
    let violation = StateInvariantViolation { slot, message };
    tracing::error!(slot, message, "state invariant violated");
    panic!("{violation}");
}
