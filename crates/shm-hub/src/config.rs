//! Segment configuration surface. One `Copy` struct handed to
//! `Producer::create`; `Consumer::attach` re-derives the same fields from
//! the stored header and compares, it never takes a config of its own.

use std::time::Duration;

use crate::error::ConfigError;

/// Maximum number of concurrently attached consumer heartbeat slots. Fixed
/// at compile time because the heartbeat table lives inside the header
/// (one OS page) alongside everything else.
pub const MAX_CONSUMERS: usize = 32;

/// Default staleness threshold before a consumer heartbeat is considered
/// abandoned. 5 seconds.
pub const DEFAULT_HEARTBEAT_STALE: Duration = Duration::from_secs(5);

/// Physical OS page size the segment is built on top of. `logical_slot_size`
/// must be a multiple of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PhysicalPageSize {
    P256 = 256,
    P512 = 512,
    P1024 = 1024,
    P2048 = 2048,
    P4096 = 4096,
}

impl PhysicalPageSize {
    pub const fn bytes(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            256 => Some(Self::P256),
            512 => Some(Self::P512),
            1024 => Some(Self::P1024),
            2048 => Some(Self::P2048),
            4096 => Some(Self::P4096),
            _ => None,
        }
    }
}

/// Overwrite/backpressure policy for the slot ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Policy {
    /// Exactly one slot; every commit overwrites the previous value.
    SingleLatest = 0,
    /// Two slots; producer always writes to the slot readers are not on.
    DoubleBuffer = 1,
    /// N slots; producer blocks (subject to the caller's timeout) once the
    /// ring is full rather than overwrite an unread slot.
    RingBuffer = 2,
}

impl Policy {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::SingleLatest),
            1 => Some(Self::DoubleBuffer),
            2 => Some(Self::RingBuffer),
            _ => None,
        }
    }
}

/// Whether the segment supports one or many simultaneously attached
/// consumers; sizes the heartbeat table and gates reclaim semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConsumerSync {
    SingleReader = 0,
    MultiReader = 1,
}

impl ConsumerSync {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::SingleReader),
            1 => Some(Self::MultiReader),
            _ => None,
        }
    }
}

/// Which checksum algorithm, if any, covers committed payloads and the
/// flex zone. Only BLAKE2b-256 is supported when a checksum is requested
/// at all; `None` means no checksum entries are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChecksumKind {
    None = 0,
    Blake2b256 = 1,
}

impl ChecksumKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Blake2b256),
            _ => None,
        }
    }
}

/// Whether checksum mismatches are merely observable (`Manual`, caller must
/// call `validate()`) or enforced automatically on every release
/// (`Enforced`, a failing checksum turns into `AcquireError::ChecksumFail`
/// without the caller asking).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChecksumPolicy {
    Manual = 0,
    Enforced = 1,
}

impl ChecksumPolicy {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Manual),
            1 => Some(Self::Enforced),
            _ => None,
        }
    }
}

/// Everything needed to lay out and initialize a fresh segment: a plain,
/// `Copy`, validated-on-use struct rather than a builder.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    pub physical_page_size: PhysicalPageSize,
    pub logical_slot_size: u32,
    pub ring_capacity: u32,
    pub flex_zone_size: u64,
    pub policy: Policy,
    pub consumer_sync: ConsumerSync,
    pub checksum_kind: ChecksumKind,
    pub checksum_policy: ChecksumPolicy,
    pub shared_secret: [u8; 64],
    pub heartbeat_stale: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            physical_page_size: PhysicalPageSize::P4096,
            logical_slot_size: 4096,
            ring_capacity: 8,
            flex_zone_size: 0,
            policy: Policy::RingBuffer,
            consumer_sync: ConsumerSync::MultiReader,
            checksum_kind: ChecksumKind::None,
            checksum_policy: ChecksumPolicy::Manual,
            shared_secret: [0u8; 64],
            heartbeat_stale: DEFAULT_HEARTBEAT_STALE,
        }
    }
}

impl SegmentConfig {
    /// Validates field invariants before any bytes are written to a fresh
    /// segment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity == 0 {
            return Err(ConfigError::InvalidConfig("ring_capacity must be >= 1"));
        }
        if matches!(self.policy, Policy::SingleLatest) && self.ring_capacity != 1 {
            return Err(ConfigError::InvalidConfig(
                "SINGLE-LATEST policy requires ring_capacity == 1",
            ));
        }
        if matches!(self.policy, Policy::DoubleBuffer) && self.ring_capacity != 2 {
            return Err(ConfigError::InvalidConfig(
                "DOUBLE-BUFFER policy requires ring_capacity == 2",
            ));
        }
        if self.ring_capacity as usize > MAX_CONSUMERS * 8 {
            // Sanity cap so a bad config can't request a multi-gigabyte segment.
            return Err(ConfigError::InvalidConfig("ring_capacity unreasonably large"));
        }
        if self.logical_slot_size == 0
            || self.logical_slot_size % self.physical_page_size.bytes() != 0
        {
            return Err(ConfigError::InvalidConfig(
                "logical_slot_size must be a nonzero multiple of physical_page_size",
            ));
        }
        if self.flex_zone_size != 0 && self.flex_zone_size % 4096 != 0 {
            return Err(ConfigError::InvalidConfig(
                "flex_zone_size must be zero or a multiple of 4096",
            ));
        }
        if matches!(self.checksum_kind, ChecksumKind::None)
            && matches!(self.checksum_policy, ChecksumPolicy::Enforced)
        {
            return Err(ConfigError::InvalidConfig(
                "checksum_policy ENFORCED requires a non-NONE checksum_kind",
            ));
        }
        Ok(())
    }
}
