//! BlockVault Engine - local block storage for a clustered block device
//!
//! One engine instance manages a data device, a metadata device and a
//! journal device (possibly one physical device at different offsets) and
//! exposes an asynchronous, versioned, object-addressable block store:
//! - writes are journaled ahead of their final location and become durable
//!   through an explicit three-phase SYNC,
//! - STABLE/ROLLBACK move versions between the unstable and stable worlds,
//! - a background flusher promotes stabilized writes into the flat
//!   clean-entry metadata array and trims the journal tail.
//!
//! Everything runs on one cooperative loop over an io_uring instance; the
//! host drives it by calling [`BlockStore::loop_once`] and
//! [`BlockStore::wait_for_events`].

pub mod allocator;
pub mod journal;
pub mod layout;
pub mod ops;
pub mod raw_io;
pub mod ring;
pub mod store;

// Re-exports
pub use blockvault_common::{Config, Error, ObjectId, ObjectVersion, Result, VERSION_ANY};
pub use ops::{ListFilter, ListResult, OpCallback, OpCode, OpRequest, OpResult};
pub use store::{BlockStore, Durability, WriteKind};
