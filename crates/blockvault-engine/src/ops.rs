//! Client-facing operation types
//!
//! Every engine operation is an [`OpRequest`] plus a completion callback.
//! Results are negative errno codes on failure; success is zero, or the byte
//! count for reads. Reads hand their data back through [`OpResult::data`],
//! lists through [`OpResult::list`].

use blockvault_common::{ObjectId, ObjectVersion};

/// Engine opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// Read bytes of (object, requested version or latest)
    Read,
    /// Create a dirty entry at the next version of an object
    Write,
    /// Same as WRITE but the entry is stabilized implicitly once durable
    WriteStable,
    /// Tombstone the object
    Delete,
    /// Durability barrier over everything written so far
    Sync,
    /// Promote a list of (object, version) pairs to the clean DB
    Stable,
    /// Discard a list of unstable (object, version) pairs
    Rollback,
    /// SYNC, then STABLE over every currently unstable write
    SyncStabAll,
    /// Enumerate objects matching an inode-range / placement-group filter
    List,
}

/// Placement-group filter for LIST
#[derive(Clone, Copy, Debug, Default)]
pub struct ListFilter {
    /// Lowest inode to include (0 = unbounded together with `max_inode`)
    pub min_inode: u64,
    /// Highest inode to include
    pub max_inode: u64,
    /// Number of placement-group shards; 0 disables PG filtering
    pub pg_count: u32,
    /// Stripe size used to map objects onto shards
    pub pg_stripe: u64,
    /// Shard to list
    pub list_pg: u32,
}

/// LIST result: a stable prefix followed by an unstable suffix
#[derive(Clone, Debug, Default)]
pub struct ListResult {
    pub entries: Vec<ObjectVersion>,
    /// Entries before this index are stable
    pub stable_count: usize,
}

/// Outcome delivered to the operation callback
#[derive(Debug, Default)]
pub struct OpResult {
    /// Negative errno, or 0 / byte count on success
    pub retval: i64,
    /// Version the operation acted on (assigned version for writes)
    pub version: u64,
    /// Read payload
    pub data: Option<Vec<u8>>,
    /// List payload
    pub list: Option<ListResult>,
}

/// Completion callback fired exactly once per enqueued operation
pub type OpCallback = Box<dyn FnOnce(OpResult)>;

/// A client operation to enqueue
#[derive(Clone, Debug)]
pub struct OpRequest {
    pub opcode: OpCode,
    pub oid: ObjectId,
    /// Write: 0 auto-assigns the next version. Read: `VERSION_ANY` for latest.
    pub version: u64,
    /// Byte offset within the object's block
    pub offset: u32,
    /// Byte length
    pub len: u32,
    /// Write payload (must be exactly `len` bytes)
    pub data: Vec<u8>,
    /// STABLE / ROLLBACK target versions
    pub versions: Vec<ObjectVersion>,
    /// LIST filter
    pub filter: ListFilter,
}

impl OpRequest {
    fn base(opcode: OpCode) -> Self {
        Self {
            opcode,
            oid: ObjectId::default(),
            version: 0,
            offset: 0,
            len: 0,
            data: Vec::new(),
            versions: Vec::new(),
            filter: ListFilter::default(),
        }
    }

    /// Read `len` bytes at `offset` of the given version
    #[must_use]
    pub fn read(oid: ObjectId, version: u64, offset: u32, len: u32) -> Self {
        Self {
            oid,
            version,
            offset,
            len,
            ..Self::base(OpCode::Read)
        }
    }

    /// Write `data` at `offset`, auto-assigning the next version
    #[must_use]
    pub fn write(oid: ObjectId, offset: u32, data: Vec<u8>) -> Self {
        Self {
            oid,
            offset,
            len: data.len() as u32,
            data,
            ..Self::base(OpCode::Write)
        }
    }

    /// Write that is stabilized implicitly once durable
    #[must_use]
    pub fn write_stable(oid: ObjectId, offset: u32, data: Vec<u8>) -> Self {
        Self {
            oid,
            offset,
            len: data.len() as u32,
            data,
            ..Self::base(OpCode::WriteStable)
        }
    }

    /// Tombstone the object
    #[must_use]
    pub fn delete(oid: ObjectId) -> Self {
        Self {
            oid,
            ..Self::base(OpCode::Delete)
        }
    }

    /// Durability barrier
    #[must_use]
    pub fn sync() -> Self {
        Self::base(OpCode::Sync)
    }

    /// Promote the listed versions to the clean DB
    #[must_use]
    pub fn stable(versions: Vec<ObjectVersion>) -> Self {
        Self {
            versions,
            ..Self::base(OpCode::Stable)
        }
    }

    /// Discard the listed unstable versions
    #[must_use]
    pub fn rollback(versions: Vec<ObjectVersion>) -> Self {
        Self {
            versions,
            ..Self::base(OpCode::Rollback)
        }
    }

    /// SYNC followed by STABLE over everything unstable
    #[must_use]
    pub fn sync_stab_all() -> Self {
        Self::base(OpCode::SyncStabAll)
    }

    /// Enumerate objects matching `filter`
    #[must_use]
    pub fn list(filter: ListFilter) -> Self {
        Self {
            filter,
            ..Self::base(OpCode::List)
        }
    }
}
