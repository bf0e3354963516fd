//! Object enumeration
//!
//! LIST reads only the in-memory databases and never blocks on I/O. The
//! result is one vector: stable versions first (clean entries, overridden in
//! place when a stable dirty version supersedes them, with deletions zeroing
//! both halves), then the unstable versions in object order.

use super::{BlockStore, Operation, WriteKind};
use blockvault_common::{ObjectId, ObjectVersion};

/// Replace the version of `oid` inside `list[search_start..search_end]`
/// (sorted by object) if it is present
fn replace_stable(
    list: &mut [ObjectVersion],
    search_start: usize,
    search_end: usize,
    oid: ObjectId,
    version: u64,
) -> bool {
    let mut lo = search_start;
    let mut hi = search_end;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match oid.cmp(&list[mid].oid) {
            std::cmp::Ordering::Less => hi = mid,
            std::cmp::Ordering::Greater => lo = mid + 1,
            std::cmp::Ordering::Equal => {
                list[mid].version = version;
                return true;
            }
        }
    }
    false
}

impl BlockStore {
    pub(crate) fn process_list(&mut self, op: &mut Operation) {
        let f = op.filter;
        // a stripe shorter than a data block cannot map objects onto shards
        if f.pg_count != 0 && (f.pg_stripe < self.geo.block_size || f.list_pg >= f.pg_count) {
            op.retval = -(libc::EINVAL as i64);
            return;
        }
        let in_pg = |oid: &ObjectId| {
            f.pg_count == 0
                || (oid.inode.wrapping_add(oid.stripe / f.pg_stripe)) % u64::from(f.pg_count)
                    == u64::from(f.list_pg)
        };
        let bounded = (f.min_inode != 0 || f.max_inode != 0) && f.min_inode <= f.max_inode;
        let (clean_lo, clean_hi) = if bounded {
            (
                ObjectId::inode_start(f.min_inode),
                ObjectId::inode_end(f.max_inode),
            )
        } else {
            (ObjectId::new(0, 0), ObjectId::new(u64::MAX, u64::MAX))
        };

        // stable prefix from the clean DB, already object-ordered
        let mut stable: Vec<ObjectVersion> = self
            .clean_db
            .range(clean_lo..=clean_hi)
            .filter(|(oid, _)| in_pg(oid))
            .map(|(oid, c)| ObjectVersion::new(*oid, c.version))
            .collect();
        let clean_stable_count = stable.len();

        let mut unstable: Vec<ObjectVersion> = Vec::new();
        let dirty_lo = ObjectVersion::new(clean_lo, 0);
        let dirty_hi = ObjectVersion::new(clean_hi, u64::MAX);
        for (ov, e) in self.dirty_db.range(dirty_lo..=dirty_hi) {
            if !in_pg(&ov.oid) {
                continue;
            }
            if e.kind == WriteKind::Delete {
                // deletions are always stable: zero out both possible entries
                let n = stable.len();
                if !replace_stable(&mut stable, 0, clean_stable_count, ov.oid, 0) {
                    replace_stable(&mut stable, clean_stable_count, n, ov.oid, 0);
                }
            } else if e.stable {
                // prefer overriding the clean version in the first half,
                // then the latest dirty stable version in the second
                let n = stable.len();
                if !replace_stable(&mut stable, 0, clean_stable_count, ov.oid, ov.version) {
                    if n > clean_stable_count && stable[n - 1].oid == ov.oid {
                        stable[n - 1].version = ov.version;
                    } else {
                        stable.push(*ov);
                    }
                }
            } else {
                unstable.push(*ov);
            }
        }

        // drop the entries deletions zeroed out
        stable.retain(|v| v.version != 0);
        let stable_count = stable.len();
        stable.extend(unstable);

        op.retval = stable.len() as i64;
        op.result_list = Some(crate::ops::ListResult {
            entries: stable,
            stable_count,
        });
    }
}
