//! Typed RAII transaction façade. Wraps the raw [`Producer`]/[`Consumer`]
//! handles and the untyped iterator so a caller works entirely in terms of
//! `&FlexZoneT` / `&PayloadT` once, rather than re-deriving offsets or
//! re-comparing schema hashes on every slot.
//!
//! A validated mapping is taken ownership of once at construction, and
//! typed views are handed out afterwards: entry-time validation happens
//! exactly once, in [`ProducerSession::create`]/[`ConsumerSession::attach`],
//! not on every slot.

use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use crate::checksum;
use crate::config::SegmentConfig;
use crate::consumer::Consumer;
use crate::error::{AcquireError, ConfigError};
use crate::iterator::RawSlotGuard;
use crate::producer::Producer;

/// Supplies a stable, compile-time or reflection-produced byte string
/// identifying a flex-zone or payload type's wire layout. [`schema_hash`]
/// feeds it through the same BLAKE2b-256 engine the checksum module uses
/// to get the 32-byte value stored in `flexzone_schema_hash` /
/// `datablock_schema_hash`.
pub trait TypedSchema {
    /// A stable byte string identifying this type's wire layout. Two
    /// processes compiled from the same type definition must produce the
    /// same bytes; processes built against an incompatible definition
    /// must not.
    fn schema_bytes() -> &'static [u8];
}

impl TypedSchema for () {
    fn schema_bytes() -> &'static [u8] {
        b"()"
    }
}

/// Hashes `T::schema_bytes()` with the crate's BLAKE2b-256 engine.
pub fn schema_hash<T: TypedSchema>() -> [u8; 32] {
    checksum::hash(T::schema_bytes())
}

/// Marks a type the façade may read and write directly as raw segment
/// bytes: statically known to be plain data, with no heap pointers, no
/// interior references, and a trivially-copyable byte layout.
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or a primitive/array of one), free
/// of padding that would expose uninitialized bytes as meaningful state,
/// and own no heap allocation or reference: every bit pattern the type's
/// layout admits must remain valid after an arbitrary-process `memcpy` of
/// its bytes, since that is exactly what crossing the segment does to it.
pub unsafe trait PlainData: Copy + Sized + 'static {}

unsafe impl PlainData for () {}

macro_rules! impl_plain_data_for_ints {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl PlainData for $t {})*
    };
}
impl_plain_data_for_ints!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64, bool);

unsafe impl<const N: usize, T: PlainData> PlainData for [T; N] {}

/// Entry-time size validation shared by `ProducerSession::create` and
/// `ConsumerSession::attach`.
fn validate_sizes<F: PlainData, P: PlainData>(
    flex_zone_size: u64,
    logical_slot_size: u32,
) -> Result<(), ConfigError> {
    let flex_len = core::mem::size_of::<F>() as u64;
    if flex_len > flex_zone_size {
        return Err(ConfigError::LayoutMismatch(
            "FlexZoneT is larger than the segment's flex_zone_size",
        ));
    }
    let payload_len = core::mem::size_of::<P>() as u64;
    if payload_len > u64::from(logical_slot_size) {
        return Err(ConfigError::LayoutMismatch(
            "PayloadT is larger than logical_slot_size",
        ));
    }
    Ok(())
}

/// A typed, read-write view over the flex zone, valid for as long as the
/// owning [`ProducerSession`] is. The producer is the flex zone's sole
/// writer; readers use [`TypedFlexZoneRef`] instead.
pub struct TypedFlexZoneMut<'p, F> {
    producer: &'p Producer,
    _marker: PhantomData<F>,
}

impl<'p, F: PlainData> TypedFlexZoneMut<'p, F> {
    pub fn get(&self) -> &F {
        let bytes = self.producer.flex_zone_bytes_mut();
        // SAFETY: entry validation confirmed `size_of::<F>() <=
        // flex_zone_size`, and `F: PlainData` guarantees any bit pattern
        // at this address is valid to read as `F`.
        unsafe { &*bytes.as_ptr().cast::<F>() }
    }

    pub fn get_mut(&mut self) -> &mut F {
        let bytes = self.producer.flex_zone_bytes_mut();
        // SAFETY: same reasoning as `get`, plus exclusivity: taking
        // `&mut self` here, combined with `ProducerTxn::flexzone` handing
        // out a uniquely-borrowed `TypedFlexZoneMut`, means the borrow
        // checker rejects any two live `&mut F`/`&F` views over the same
        // bytes.
        unsafe { &mut *bytes.as_mut_ptr().cast::<F>() }
    }

    /// Publishes a fresh checksum over the flex zone's current bytes.
    /// Always an explicit, manual call — the flex zone has no commit-time
    /// checksum gate the way a ring slot does.
    pub fn publish_checksum(&self) {
        self.producer.update_flex_zone_checksum();
    }

    pub fn verify_checksum(&self) -> Option<bool> {
        self.producer.verify_flex_zone_checksum()
    }
}

/// A typed, read-only view over the flex zone for a consumer.
pub struct TypedFlexZoneRef<'c, F> {
    consumer: &'c Consumer,
    _marker: PhantomData<F>,
}

impl<'c, F: PlainData> TypedFlexZoneRef<'c, F> {
    pub fn get(&self) -> &F {
        let bytes = self.consumer.flex_zone_bytes();
        // SAFETY: see `TypedFlexZoneMut::get`; this side never mutates.
        unsafe { &*bytes.as_ptr().cast::<F>() }
    }
}

/// Which way an acquired-but-not-yet-released write slot was left: the
/// caller's explicit disposition, not the underlying `SlotEntry`'s own
/// state machine (module B already tracks that separately).
enum WriteDisposition {
    Pending,
    Committed,
    Abandoned,
}

/// A writer's typed view into one claimed-but-uncommitted ring slot.
/// Dropping the guard without calling [`commit`](Self::commit) abandons the
/// slot: it releases without advancing `commit_index`, and
/// `SlotEntry::writer_abandon` records it as a warning, not a silent loss.
pub struct WriteSlotGuard<'p, P> {
    producer: &'p Producer,
    index: usize,
    sequence: u64,
    disposition: WriteDisposition,
    _marker: PhantomData<P>,
}

impl<'p, P: PlainData> WriteSlotGuard<'p, P> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload_mut(&mut self) -> &mut P {
        let bytes = self.producer.payload_bytes_mut(self.index);
        // SAFETY: entry validation confirmed `size_of::<P>() <=
        // logical_slot_size`; this slot's writer lock is held for the
        // duration of the guard, so no other writer can alias it.
        unsafe { &mut *bytes.as_mut_ptr().cast::<P>() }
    }

    /// Commits the slot: zeroes any bytes beyond `size_of::<P>()` so
    /// ENFORCED-mode checksums never cover uninitialized padding, then
    /// performs the commit as one conceptual step — checksum, generation
    /// bump, state transition, `commit_index` advance, writer-lock release.
    ///
    /// Idempotent: a second call is a no-op in release builds and a
    /// debug-mode usage-error assertion, since double-commit is a program
    /// error.
    pub fn commit(&mut self) {
        match self.disposition {
            WriteDisposition::Committed => {
                debug_assert!(false, "double commit on a write slot guard");
            }
            WriteDisposition::Abandoned => {
                debug_assert!(false, "commit() called on an already-abandoned slot");
            }
            WriteDisposition::Pending => {
                let payload_len = core::mem::size_of::<P>();
                {
                    let bytes = self.producer.payload_bytes_mut(self.index);
                    for b in &mut bytes[payload_len..] {
                        *b = 0;
                    }
                }
                let bytes = self.producer.payload_bytes_mut(self.index);
                self.producer.commit_slot(self.index, bytes);
                self.disposition = WriteDisposition::Committed;
            }
        }
    }

    /// Explicitly abandons the slot without committing. Equivalent to
    /// dropping the guard uncommitted, but makes the intent visible at the
    /// call site.
    pub fn abandon(mut self) {
        self.disposition = WriteDisposition::Abandoned;
        self.producer.abandon_slot(self.index);
    }
}

impl<'p, P> Drop for WriteSlotGuard<'p, P> {
    fn drop(&mut self) {
        if matches!(self.disposition, WriteDisposition::Pending) {
            self.producer.abandon_slot(self.index);
        }
    }
}

/// A reader's typed view into one committed ring slot. Thin wrapper over
/// [`RawSlotGuard`] that casts the raw payload bytes to `&PayloadT`.
pub struct ReadSlotGuard<'c, P> {
    raw: RawSlotGuard<'c>,
    _marker: PhantomData<P>,
}

impl<'c, P: PlainData> ReadSlotGuard<'c, P> {
    pub fn sequence(&self) -> u64 {
        self.raw.sequence()
    }

    pub fn payload(&self) -> &P {
        let bytes = self.raw.payload();
        // SAFETY: entry validation confirmed `size_of::<P>() <=
        // logical_slot_size`, and the bytes came from a slot this
        // session's own writer populated with the same `P`.
        unsafe { &*bytes.as_ptr().cast::<P>() }
    }

    /// Validates the read against overwrite and, under
    /// `ChecksumPolicy::Enforced`, against the stored digest. Always
    /// releases `reader_count`.
    pub fn validate(&mut self) -> Result<(), AcquireError> {
        self.raw.validate()
    }
}

/// Non-terminating sequence of writer slots, the same shape as
/// [`crate::iterator::SlotIter`] specialized to a typed payload. `next()`
/// always returns `Some`; the caller loops and breaks explicitly on
/// whichever `AcquireError` variants it treats as final.
pub struct TypedWriterSlots<'p, P> {
    producer: &'p Producer,
    per_slot_timeout: Duration,
    _marker: PhantomData<P>,
}

impl<'p, P: PlainData> Iterator for TypedWriterSlots<'p, P> {
    type Item = Result<WriteSlotGuard<'p, P>, AcquireError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self
            .producer
            .acquire_write_slot(self.per_slot_timeout)
            .map(|(sequence, index)| WriteSlotGuard {
                producer: self.producer,
                index,
                sequence,
                disposition: WriteDisposition::Pending,
                _marker: PhantomData,
            });
        Some(result)
    }
}

/// Non-terminating sequence of reader slots.
pub struct TypedReaderSlots<'c, P> {
    consumer: &'c Consumer,
    per_item_timeout: Duration,
    _marker: PhantomData<P>,
}

impl<'c, P: PlainData> Iterator for TypedReaderSlots<'c, P> {
    type Item = Result<ReadSlotGuard<'c, P>, AcquireError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self
            .consumer
            .try_next(self.per_item_timeout)
            .map(|raw| ReadSlotGuard {
                raw,
                _marker: PhantomData,
            });
        Some(result)
    }
}

/// The scope object handed to a producer's `with_transaction` closure.
pub struct ProducerTxn<'p, F, P> {
    session: &'p ProducerSession<F, P>,
}

impl<'p, F: PlainData, P: PlainData> ProducerTxn<'p, F, P> {
    /// Hands out a uniquely-borrowed flex-zone view: taking `&mut self`
    /// means the borrow checker rejects a second overlapping call while
    /// the first view is still alive, closing the aliasing window that
    /// `TypedFlexZoneMut::get_mut` alone cannot.
    pub fn flexzone(&mut self) -> TypedFlexZoneMut<'_, F> {
        TypedFlexZoneMut {
            producer: &self.session.producer,
            _marker: PhantomData,
        }
    }

    pub fn slots(&self, per_slot_timeout: Duration) -> TypedWriterSlots<'p, P> {
        TypedWriterSlots {
            producer: &self.session.producer,
            per_slot_timeout,
            _marker: PhantomData,
        }
    }
}

/// The scope object handed to a consumer's `with_transaction` closure.
pub struct ConsumerTxn<'c, F, P> {
    session: &'c ConsumerSession<F, P>,
}

impl<'c, F: PlainData, P: PlainData> ConsumerTxn<'c, F, P> {
    pub fn flexzone(&self) -> TypedFlexZoneRef<'c, F> {
        TypedFlexZoneRef {
            consumer: &self.session.consumer,
            _marker: PhantomData,
        }
    }

    pub fn slots(&self, per_slot_timeout: Duration) -> TypedReaderSlots<'c, P> {
        TypedReaderSlots {
            consumer: &self.session.consumer,
            per_item_timeout: per_slot_timeout,
            _marker: PhantomData,
        }
    }
}

/// Typed, validated-once producer handle. Construction runs entry-time
/// validation; every `with_transaction` call thereafter only touches the
/// heartbeat, never re-derives offsets or re-hashes a schema.
pub struct ProducerSession<F, P> {
    producer: Producer,
    _flex: PhantomData<F>,
    _payload: PhantomData<P>,
}

impl<F: PlainData + TypedSchema, P: PlainData + TypedSchema> ProducerSession<F, P> {
    /// See [`Producer::create`] for the `producer_id` contract: this crate
    /// stores it as an opaque label and never generates one on the
    /// caller's behalf.
    pub fn create(
        path: impl AsRef<Path>,
        config: SegmentConfig,
        producer_id: u64,
    ) -> Result<Self, ConfigError> {
        validate_sizes::<F, P>(config.flex_zone_size, config.logical_slot_size)?;
        let producer = Producer::create(
            path,
            config,
            producer_id,
            schema_hash::<F>(),
            schema_hash::<P>(),
        )?;
        Ok(Self {
            producer,
            _flex: PhantomData,
            _payload: PhantomData,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        self.producer.config()
    }

    pub fn producer_id(&self) -> u64 {
        self.producer.producer_id()
    }

    /// Runs `scope` once, touching the heartbeat both before and after. Any
    /// value or panic from `scope` propagates outward unchanged; cleanup
    /// never consumes it (the heartbeat touch below is infallible).
    pub fn with_transaction<R>(&self, scope: impl FnOnce(&mut ProducerTxn<'_, F, P>) -> R) -> R {
        self.producer.update_heartbeat();
        let mut txn = ProducerTxn { session: self };
        let result = scope(&mut txn);
        self.producer.update_heartbeat();
        result
    }
}

/// Typed, validated-once consumer handle.
pub struct ConsumerSession<F, P> {
    consumer: Consumer,
    _flex: PhantomData<F>,
    _payload: PhantomData<P>,
}

impl<F: PlainData + TypedSchema, P: PlainData + TypedSchema> ConsumerSession<F, P> {
    pub fn attach(
        path: impl AsRef<Path>,
        consumer_id: u64,
        shared_secret: &[u8; 64],
    ) -> Result<Self, ConfigError> {
        let consumer = Consumer::attach(
            path,
            consumer_id,
            shared_secret,
            &schema_hash::<F>(),
            &schema_hash::<P>(),
        )?;
        validate_sizes::<F, P>(
            consumer.config().flex_zone_size,
            consumer.config().logical_slot_size,
        )?;
        Ok(Self {
            consumer,
            _flex: PhantomData,
            _payload: PhantomData,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        self.consumer.config()
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer.consumer_id()
    }

    pub fn seek_latest(&self) {
        self.consumer.seek_latest();
    }

    pub fn seek_to(&self, sequence: u64) {
        self.consumer.seek_to(sequence);
    }

    pub fn current_sequence(&self) -> u64 {
        self.consumer.current_sequence()
    }

    pub fn with_transaction<R>(&self, scope: impl FnOnce(&ConsumerTxn<'_, F, P>) -> R) -> R {
        self.consumer.update_heartbeat();
        let txn = ConsumerTxn { session: self };
        let result = scope(&txn);
        self.consumer.update_heartbeat();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumKind, ChecksumPolicy};

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Sample {
        a: u64,
        b: u32,
    }
    unsafe impl PlainData for Sample {}
    impl TypedSchema for Sample {
        fn schema_bytes() -> &'static [u8] {
            b"Sample{a:u64,b:u32}"
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Coord {
        x: u32,
        y: u32,
    }
    unsafe impl PlainData for Coord {}
    impl TypedSchema for Coord {
        fn schema_bytes() -> &'static [u8] {
            b"Coord{x:u32,y:u32}"
        }
    }

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("shm-hub-txn-test-{}-{tag}.seg", std::process::id()))
    }

    #[test]
    fn smoke_roundtrip_through_typed_facade() {
        let path = scratch_path("a");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 4;
        config.logical_slot_size = 4096;
        config.flex_zone_size = 4096;

        let producer = ProducerSession::<Coord, Sample>::create(&path, config, 1).unwrap();
        producer.with_transaction(|txn| {
            txn.flexzone().get_mut().x = 7;
            let mut slots = txn.slots(Duration::from_millis(50));
            for i in 0..4u64 {
                let mut guard = slots.next().unwrap().unwrap();
                guard.payload_mut().a = i;
                guard.payload_mut().b = i as u32 * 10;
                guard.commit();
            }
        });

        let consumer =
            ConsumerSession::<Coord, Sample>::attach(&path, 1, &config.shared_secret).unwrap();
        consumer.with_transaction(|txn| {
            assert_eq!(txn.flexzone().get().x, 7);
            let mut slots = txn.slots(Duration::from_millis(50));
            for i in 0..4u64 {
                let mut guard = slots.next().unwrap().unwrap();
                assert_eq!(guard.payload().a, i);
                assert_eq!(guard.payload().b, i as u32 * 10);
                guard.validate().unwrap();
            }
            assert!(matches!(slots.next().unwrap(), Err(AcquireError::Timeout)));
        });

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn uncommitted_writer_guard_abandons_on_drop() {
        let path = scratch_path("b");
        let mut config = SegmentConfig::default();
        config.ring_capacity = 2;
        let producer = ProducerSession::<(), Sample>::create(&path, config, 1).unwrap();

        producer.with_transaction(|txn| {
            let mut slots = txn.slots(Duration::from_millis(50));
            {
                let mut guard = slots.next().unwrap().unwrap();
                guard.payload_mut().a = 1;
                // Dropped without calling commit().
            }
            // The slot is free again, so acquiring it a second time succeeds
            // rather than timing out on a stuck writer lock.
            let guard = slots.next().unwrap();
            assert!(guard.is_ok());
        });

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flex_zone_too_small_for_type_is_rejected_at_entry() {
        let path = scratch_path("c");
        let mut config = SegmentConfig::default();
        config.flex_zone_size = 0;
        let result = ProducerSession::<Coord, Sample>::create(&path, config, 1);
        assert!(matches!(result, Err(ConfigError::LayoutMismatch(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn schema_mismatch_is_rejected_before_any_flexzone_bytes_are_mapped() {
        let path = scratch_path("d");
        let mut config = SegmentConfig::default();
        config.flex_zone_size = 4096;
        let producer = ProducerSession::<Coord, Sample>::create(&path, config, 1).unwrap();
        drop(producer);

        #[repr(C)]
        #[derive(Clone, Copy)]
        struct DifferentFlexZone {
            x: u32,
            y: u64,
        }
        unsafe impl PlainData for DifferentFlexZone {}
        impl TypedSchema for DifferentFlexZone {
            fn schema_bytes() -> &'static [u8] {
                b"DifferentFlexZone{x:u32,y:u64}"
            }
        }

        let result = ConsumerSession::<DifferentFlexZone, Sample>::attach(
            &path,
            1,
            &config.shared_secret,
        );
        assert!(matches!(result, Err(ConfigError::SchemaMismatch { .. })));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn checksum_enforced_end_to_end() {
        let path = scratch_path("e");
        let mut config = SegmentConfig::default();
        config.checksum_kind = ChecksumKind::Blake2b256;
        config.checksum_policy = ChecksumPolicy::Enforced;
        let producer = ProducerSession::<(), Sample>::create(&path, config, 1).unwrap();
        producer.with_transaction(|txn| {
            let mut slots = txn.slots(Duration::from_millis(50));
            let mut guard = slots.next().unwrap().unwrap();
            guard.payload_mut().a = 42;
            guard.commit();
        });

        let consumer =
            ConsumerSession::<(), Sample>::attach(&path, 1, &config.shared_secret).unwrap();
        consumer.with_transaction(|txn| {
            let mut slots = txn.slots(Duration::from_millis(50));
            let mut guard = slots.next().unwrap().unwrap();
            assert_eq!(guard.payload().a, 42);
            assert!(guard.validate().is_ok());
        });

        let _ = std::fs::remove_file(&path);
    }
}
