//! A shared-memory data-exchange hub: one producer and any number of
//! readers exchange fixed-size payloads through an `mmap`'d ring buffer,
//! with no syscalls on the hot path. The crate provides the control layer —
//! segment layout, the slot state machine, cross-process liveness and
//! zombie-writer reclaim, checksum discipline, and a typed RAII transaction
//! façade over the raw primitives — plus an administrative recovery tool
//! for operators.
//!
//! Directory lookup (resolving a channel name to a segment path) and
//! notification transport (waking a blocked consumer instead of polling)
//! are external collaborators: this crate only defines the traits
//! ([`directory::DirectoryClient`], [`directory::NotificationTransport`])
//! a host process wires up, the same way it never installs its own
//! `tracing` subscriber.
//!
//! # Typical usage
//!
//! ```no_run
//! use shm_hub::config::SegmentConfig;
//! use shm_hub::transaction::{PlainData, ProducerSession, TypedSchema};
//! use std::time::Duration;
//!
//! #[repr(C)]
//! #[derive(Clone, Copy)]
//! struct Tick { price: u64, qty: u32 }
//! unsafe impl PlainData for Tick {}
//! impl TypedSchema for Tick {
//!     fn schema_bytes() -> &'static [u8] { b"Tick{price:u64,qty:u32}" }
//! }
//!
//! let session = ProducerSession::<(), Tick>::create("/tmp/ticks.shm", SegmentConfig::default(), 1)?;
//! session.with_transaction(|txn| {
//!     let mut slots = txn.slots(Duration::from_millis(50));
//!     let mut slot = slots.next().unwrap()?;
//!     slot.payload_mut().price = 100;
//!     slot.commit();
//!     Ok::<(), shm_hub::error::AcquireError>(())
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backoff;
pub mod checksum;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod error;
pub mod iterator;
pub mod layout;
pub mod liveness;
pub mod metrics;
pub mod producer;
pub mod recovery;
pub mod ring;
pub mod slot;
pub mod transaction;

pub use config::SegmentConfig;
pub use consumer::Consumer;
pub use error::{AcquireError, ConfigError, RecoveryError};
pub use iterator::{RawSlotGuard, SlotIter};
pub use metrics::MetricsSnapshot;
pub use producer::Producer;
pub use recovery::{SegmentAdmin, SlotDiagnostic};
pub use transaction::{ConsumerSession, PlainData, ProducerSession, TypedSchema};
