//! Segment header and offset arithmetic: a fixed-size `repr(C)` header
//! validated with a compile-time size assertion, and a pure offset
//! calculator that checks its arithmetic before committing to a layout.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{
    ChecksumKind, ChecksumPolicy, ConsumerSync, Policy, SegmentConfig, MAX_CONSUMERS,
};
use crate::error::ConfigError;
use crate::metrics::MetricsBlock;

/// `b"SHMH"` as a little-endian u32. Written first so a stray file of the
/// wrong shape is rejected before any other field is trusted.
pub const MAGIC: u32 = 0x484D_4853;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

/// Set in `Header::flags` once the producer has dropped. The last consumer
/// to detach after observing this bit unlinks the backing file.
pub const FLAG_PRODUCER_DROPPED: u32 = 1 << 0;

/// One heartbeat slot per potentially-attached consumer.
#[repr(C)]
pub struct ConsumerHeartbeatEntry {
    /// 0 when the slot is free; otherwise a caller-assigned consumer id.
    pub consumer_id: AtomicU64,
    pub consumer_pid: AtomicU64,
    pub last_heartbeat_ns: AtomicU64,
    /// This consumer's last-advanced cursor. Feeds `Header::read_index`,
    /// the minimum cursor across every attached consumer, so a slow
    /// consumer among several attached ones is the one that throttles a
    /// RING-BUFFER producer, not the fastest.
    pub last_read_sequence: AtomicU64,
    _pad: [u8; 32],
}

const _: () = assert!(core::mem::size_of::<ConsumerHeartbeatEntry>() == 64);

impl ConsumerHeartbeatEntry {
    const fn zeroed() -> Self {
        Self {
            consumer_id: AtomicU64::new(0),
            consumer_pid: AtomicU64::new(0),
            last_heartbeat_ns: AtomicU64::new(0),
            last_read_sequence: AtomicU64::new(0),
            _pad: [0; 32],
        }
    }
}

/// The segment's single control page. Always exactly 4096 bytes and
/// page-aligned: slot state, the flex zone and the ring all start on a
/// 4096-byte boundary after it.
#[repr(C, align(4096))]
pub struct Header {
    pub magic: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub flags: AtomicU32,

    pub total_size: u64,

    pub physical_page_size: u32,
    pub logical_slot_size: u32,
    pub ring_capacity: u32,
    pub policy: u32,
    pub consumer_sync: u32,
    pub checksum_kind: u32,
    pub checksum_policy: u32,
    _pad1: u32,

    pub flex_zone_size: u64,

    pub shared_secret: [u8; 64],
    pub flexzone_schema_hash: [u8; 32],
    pub datablock_schema_hash: [u8; 32],

    pub write_index: AtomicU64,
    pub commit_index: AtomicU64,
    pub read_index: AtomicU64,

    pub producer_id: u64,
    pub producer_last_heartbeat_ns: AtomicU64,

    pub active_consumer_count: AtomicU32,
    _pad2: u32,

    pub metrics: MetricsBlock,

    pub consumer_heartbeats: [ConsumerHeartbeatEntry; MAX_CONSUMERS],

    /// Digest covering the flex zone's current contents. Separate from the
    /// per-slot checksum array: the flex zone is a single shared region,
    /// not a ring of independent payloads, so it gets one checksum entry
    /// of its own, updated by `update_flex_zone_checksum` and checked by
    /// `verify_flex_zone_checksum`.
    pub flex_zone_checksum: crate::checksum::ChecksumEntry,

    _reserved: [u8; 1640],
}

const _: () = assert!(core::mem::size_of::<Header>() == 4096);
const _: () = assert!(core::mem::align_of::<Header>() == 4096);

impl Header {
    /// Writes every field of a freshly `mmap`'d page. Caller guarantees
    /// exclusive access (this runs once, inside `Producer::create`, before
    /// the file is published to any other process).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init(
        &mut self,
        config: &SegmentConfig,
        total_size: u64,
        producer_id: u64,
        flexzone_schema_hash: [u8; 32],
        datablock_schema_hash: [u8; 32],
    ) {
        self.magic = MAGIC;
        self.version_major = VERSION_MAJOR;
        self.version_minor = VERSION_MINOR;
        self.flags = AtomicU32::new(0);
        self.total_size = total_size;
        self.physical_page_size = config.physical_page_size.bytes();
        self.logical_slot_size = config.logical_slot_size;
        self.ring_capacity = config.ring_capacity;
        self.policy = config.policy as u32;
        self.consumer_sync = config.consumer_sync as u32;
        self.checksum_kind = config.checksum_kind as u32;
        self.checksum_policy = config.checksum_policy as u32;
        self._pad1 = 0;
        self.flex_zone_size = config.flex_zone_size;
        self.shared_secret = config.shared_secret;
        self.flexzone_schema_hash = flexzone_schema_hash;
        self.datablock_schema_hash = datablock_schema_hash;
        self.write_index = AtomicU64::new(0);
        self.commit_index = AtomicU64::new(0);
        self.read_index = AtomicU64::new(0);
        self.producer_id = producer_id;
        self.producer_last_heartbeat_ns = AtomicU64::new(0);
        self.active_consumer_count = AtomicU32::new(0);
        self._pad2 = 0;
        self.metrics.reset();
        for entry in &self.consumer_heartbeats {
            entry.consumer_id.store(0, Ordering::Relaxed);
            entry.consumer_pid.store(0, Ordering::Relaxed);
            entry.last_heartbeat_ns.store(0, Ordering::Relaxed);
            entry.last_read_sequence.store(0, Ordering::Relaxed);
        }
        self.flex_zone_checksum.clear();
        self._reserved = [0; 1640];
    }

    /// Validates a header an attacher just mapped against its expected
    /// config and type-derived schema hashes.
    pub(crate) fn validate_for_attach(
        &self,
        shared_secret: &[u8; 64],
        flexzone_schema_hash: &[u8; 32],
        datablock_schema_hash: &[u8; 32],
    ) -> Result<(), ConfigError> {
        if self.magic != MAGIC {
            return Err(ConfigError::LayoutMismatch("bad magic"));
        }
        if self.version_major != VERSION_MAJOR {
            return Err(ConfigError::VersionIncompatible {
                expected: (VERSION_MAJOR << 16) | VERSION_MINOR,
                found: (self.version_major << 16) | self.version_minor,
            });
        }
        if &self.shared_secret != shared_secret {
            return Err(ConfigError::SecretMismatch);
        }
        if &self.flexzone_schema_hash != flexzone_schema_hash {
            return Err(ConfigError::SchemaMismatch {
                field: "flexzone_schema_hash",
            });
        }
        if &self.datablock_schema_hash != datablock_schema_hash {
            return Err(ConfigError::SchemaMismatch {
                field: "datablock_schema_hash",
            });
        }
        Ok(())
    }

    pub(crate) fn config_snapshot(&self) -> Result<SegmentConfig, ConfigError> {
        Ok(SegmentConfig {
            physical_page_size: crate::config::PhysicalPageSize::from_raw(self.physical_page_size)
                .ok_or(ConfigError::LayoutMismatch("unknown physical_page_size"))?,
            logical_slot_size: self.logical_slot_size,
            ring_capacity: self.ring_capacity,
            flex_zone_size: self.flex_zone_size,
            policy: Policy::from_raw(self.policy)
                .ok_or(ConfigError::LayoutMismatch("unknown policy"))?,
            consumer_sync: ConsumerSync::from_raw(self.consumer_sync)
                .ok_or(ConfigError::LayoutMismatch("unknown consumer_sync"))?,
            checksum_kind: ChecksumKind::from_raw(self.checksum_kind)
                .ok_or(ConfigError::LayoutMismatch("unknown checksum_kind"))?,
            checksum_policy: ChecksumPolicy::from_raw(self.checksum_policy)
                .ok_or(ConfigError::LayoutMismatch("unknown checksum_policy"))?,
            shared_secret: self.shared_secret,
            heartbeat_stale: crate::config::DEFAULT_HEARTBEAT_STALE,
        })
    }
}

fn round_up_4096(n: u64) -> u64 {
    (n + 4095) & !4095
}

/// Byte offsets of every region in the segment, derived once from a
/// validated config. Mirrors `HubOffsets::calculate`: checked arithmetic,
/// no silent wraparound.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOffsets {
    pub header: u64,
    pub slot_state: u64,
    pub slot_checksum: u64,
    pub flex_zone: u64,
    pub ring: u64,
    pub total_size: u64,
}

impl SegmentOffsets {
    pub fn calculate(config: &SegmentConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let header_size = core::mem::size_of::<Header>() as u64;
        let slot_entry_size = core::mem::size_of::<crate::slot::SlotEntry>() as u64;
        let checksum_entry_size = core::mem::size_of::<crate::checksum::ChecksumEntry>() as u64;

        let slot_state_offset = header_size;
        let slot_state_bytes = slot_entry_size
            .checked_mul(config.ring_capacity as u64)
            .ok_or(ConfigError::InvalidConfig("slot state region overflows"))?;

        let slot_checksum_offset = slot_state_offset
            .checked_add(slot_state_bytes)
            .ok_or(ConfigError::InvalidConfig("layout overflows"))?;
        let slot_checksum_bytes = if matches!(config.checksum_kind, ChecksumKind::None) {
            0
        } else {
            checksum_entry_size
                .checked_mul(config.ring_capacity as u64)
                .ok_or(ConfigError::InvalidConfig("checksum region overflows"))?
        };

        let control_end = slot_checksum_offset
            .checked_add(slot_checksum_bytes)
            .ok_or(ConfigError::InvalidConfig("layout overflows"))?;
        let flex_zone_offset = round_up_4096(control_end);

        let ring_offset = flex_zone_offset
            .checked_add(config.flex_zone_size)
            .ok_or(ConfigError::InvalidConfig("layout overflows"))?;

        let ring_bytes = (config.ring_capacity as u64)
            .checked_mul(config.logical_slot_size as u64)
            .ok_or(ConfigError::InvalidConfig("ring region overflows"))?;
        let total_size = ring_offset
            .checked_add(ring_bytes)
            .ok_or(ConfigError::InvalidConfig("layout overflows"))?;

        Ok(Self {
            header: 0,
            slot_state: slot_state_offset,
            slot_checksum: slot_checksum_offset,
            flex_zone: flex_zone_offset,
            ring: ring_offset,
            total_size,
        })
    }
}

/// Owns the `mmap`'d region backing a segment. Both `Producer` and
/// `Consumer` hold one behind an `Arc`, so the mapping survives as long as
/// any handle into the segment does and is unmapped exactly once: a raw
/// pointer plus a `Drop` calling `libc::munmap`, `unsafe impl Send + Sync`
/// because the pointer is only ever used to reach `repr(C)` atomics
/// designed for concurrent access.
pub struct SegmentMapping {
    base: *mut u8,
    len: usize,
    _file: std::fs::File,
}

// SAFETY: every access through `base` goes through atomics or types with
// well-defined concurrent-access semantics (`Header`, `SlotEntry`,
// `ChecksumEntry`); the mapping itself is never mutated in a way that
// requires exclusive access from this process's perspective.
unsafe impl Send for SegmentMapping {}
unsafe impl Sync for SegmentMapping {}

impl SegmentMapping {
    /// Creates a fresh segment file of `total_size` bytes at `path` and
    /// maps it `MAP_SHARED`. Truncates/overwrites any existing file, same
    /// as `HubHost::create`.
    pub(crate) fn create(path: &std::path::Path, total_size: u64) -> Result<Self, ConfigError> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;
        Self::map(file, total_size as usize, true)
    }

    /// Opens an existing segment file at `path` and maps it `MAP_SHARED`,
    /// without truncating or resizing it.
    pub(crate) fn open(path: &std::path::Path) -> Result<Self, ConfigError> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if (len as usize) < core::mem::size_of::<Header>() {
            return Err(ConfigError::LayoutMismatch("segment file smaller than one header page"));
        }
        Self::map(file, len as usize, false)
    }

    fn map(file: std::fs::File, len: usize, zero_fill: bool) -> Result<Self, ConfigError> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: `len` matches the file's actual size (just set or just
        // read), `fd` is a valid open file descriptor, and the resulting
        // pointer is only handed out through `header()`/`bytes()` which
        // return references with lifetimes tied to `self`.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ConfigError::Io(std::io::Error::last_os_error()));
        }
        let _ = zero_fill; // a freshly `set_len`'d file is already zero-filled by the OS
        Ok(Self {
            base: addr.cast::<u8>(),
            len,
            _file: file,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// The caller must not create overlapping `&mut Header` references and
    /// must only call this after the header has been initialized (for a
    /// freshly created segment, after `Header::init`).
    pub(crate) unsafe fn header(&self) -> &Header {
        &*self.base.cast::<Header>()
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// # Safety
    /// `offset..offset+len` must lie within the mapping and not alias a
    /// `&mut` reference held elsewhere.
    pub(crate) unsafe fn slice(&self, offset: u64, len: usize) -> &[u8] {
        core::slice::from_raw_parts(self.base.add(offset as usize), len)
    }

    /// # Safety
    /// Same requirements as [`slice`](Self::slice), plus exclusivity.
    pub(crate) unsafe fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base.add(offset as usize), len)
    }
}

impl Drop for SegmentMapping {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` are exactly the pointer/length pair
        // returned by the matching `mmap` call in `map`.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumKind, ChecksumPolicy, Policy};

    #[test]
    fn header_is_exactly_one_page() {
        assert_eq!(core::mem::size_of::<Header>(), 4096);
        assert_eq!(core::mem::align_of::<Header>(), 4096);
    }

    #[test]
    fn heartbeat_entry_is_one_cache_line() {
        assert_eq!(core::mem::size_of::<ConsumerHeartbeatEntry>(), 64);
    }

    #[test]
    fn offsets_are_page_aligned_and_monotonic() {
        let mut config = SegmentConfig::default();
        config.ring_capacity = 4;
        config.flex_zone_size = 4096;
        config.checksum_kind = ChecksumKind::Blake2b256;
        config.checksum_policy = ChecksumPolicy::Enforced;
        let offsets = SegmentOffsets::calculate(&config).unwrap();

        assert_eq!(offsets.header, 0);
        assert!(offsets.slot_state >= 4096);
        assert!(offsets.slot_checksum >= offsets.slot_state);
        assert_eq!(offsets.flex_zone % 4096, 0);
        assert_eq!(offsets.ring, offsets.flex_zone + config.flex_zone_size);
        assert_eq!(
            offsets.total_size,
            offsets.ring + config.ring_capacity as u64 * config.logical_slot_size as u64
        );
    }

    #[test]
    fn zero_flex_zone_is_allowed() {
        let mut config = SegmentConfig::default();
        config.flex_zone_size = 0;
        let offsets = SegmentOffsets::calculate(&config).unwrap();
        assert_eq!(offsets.ring, offsets.flex_zone);
    }

    #[test]
    fn misaligned_flex_zone_is_rejected() {
        let mut config = SegmentConfig::default();
        config.flex_zone_size = 100;
        assert!(matches!(
            SegmentOffsets::calculate(&config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn slot_size_not_a_multiple_of_page_size_is_rejected() {
        let mut config = SegmentConfig::default();
        config.physical_page_size = crate::config::PhysicalPageSize::P4096;
        config.logical_slot_size = 100;
        assert!(matches!(
            SegmentOffsets::calculate(&config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn single_latest_ring_capacity_must_be_one() {
        let mut config = SegmentConfig::default();
        config.policy = Policy::SingleLatest;
        config.ring_capacity = 1;
        assert!(SegmentOffsets::calculate(&config).is_ok());
        config.ring_capacity = 2;
        assert!(SegmentOffsets::calculate(&config).is_err());
    }

    #[test]
    fn ring_buffer_with_capacity_one_has_identical_layout_to_single_latest() {
        let mut ring_one = SegmentConfig::default();
        ring_one.policy = Policy::RingBuffer;
        ring_one.ring_capacity = 1;

        let mut single = SegmentConfig::default();
        single.policy = Policy::SingleLatest;
        single.ring_capacity = 1;

        let ring_offsets = SegmentOffsets::calculate(&ring_one).unwrap();
        let single_offsets = SegmentOffsets::calculate(&single).unwrap();
        assert_eq!(ring_offsets.total_size, single_offsets.total_size);
        assert_eq!(ring_offsets.ring, single_offsets.ring);
    }

    #[test]
    fn segment_mapping_create_then_open_roundtrips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("shm-hub-test-{}.seg", std::process::id()));

        let config = SegmentConfig::default();
        let offsets = SegmentOffsets::calculate(&config).unwrap();
        let mapping = SegmentMapping::create(&path, offsets.total_size).unwrap();
        assert_eq!(mapping.len(), offsets.total_size as usize);

        // SAFETY: nothing else has written to this freshly mapped page yet.
        unsafe {
            let header = &*(mapping.as_ptr().cast::<Header>());
            assert_eq!(header.magic, 0);
        }
        drop(mapping);

        let reopened = SegmentMapping::open(&path).unwrap();
        assert_eq!(reopened.len(), offsets.total_size as usize);
        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
