//! Core type definitions for BlockVault
//!
//! Object identity and version types used throughout the engine. Objects are
//! totally ordered by (inode, stripe); versions within one object are totally
//! ordered and independent across objects.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Number of high bits of an inode number that select the pool
pub const POOL_ID_BITS: u32 = 16;

/// Identity of a stored object: one stripe of one inode
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display,
)]
#[display("{inode:x}:{stripe:x}")]
pub struct ObjectId {
    /// Inode number; the high [`POOL_ID_BITS`] bits select the pool
    pub inode: u64,
    /// Stripe number within the inode
    pub stripe: u64,
}

impl ObjectId {
    /// Create a new object id
    #[must_use]
    pub const fn new(inode: u64, stripe: u64) -> Self {
        Self { inode, stripe }
    }

    /// Pool the object belongs to (high bits of the inode number)
    #[must_use]
    pub const fn pool_id(&self) -> u64 {
        self.inode >> (64 - POOL_ID_BITS)
    }

    /// Smallest object id of the given inode
    #[must_use]
    pub const fn inode_start(inode: u64) -> Self {
        Self { inode, stripe: 0 }
    }

    /// Largest object id of the given inode
    #[must_use]
    pub const fn inode_end(inode: u64) -> Self {
        Self {
            inode,
            stripe: u64::MAX,
        }
    }
}

/// A specific version of a specific object
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display,
)]
#[display("{oid}:v{version}")]
pub struct ObjectVersion {
    pub oid: ObjectId,
    pub version: u64,
}

impl ObjectVersion {
    /// Create a new (object, version) pair
    #[must_use]
    pub const fn new(oid: ObjectId, version: u64) -> Self {
        Self { oid, version }
    }
}

/// Version argument meaning "the most recent version available"
pub const VERSION_ANY: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ordering() {
        let a = ObjectId::new(1, 0);
        let b = ObjectId::new(1, 5);
        let c = ObjectId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(ObjectVersion::new(a, 1) < ObjectVersion::new(a, 2));
        assert!(ObjectVersion::new(a, u64::MAX) < ObjectVersion::new(b, 0));
    }

    #[test]
    fn test_pool_id() {
        let oid = ObjectId::new(0x0002_0000_0000_1234, 7);
        assert_eq!(oid.pool_id(), 2);
    }
}
