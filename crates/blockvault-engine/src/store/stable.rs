//! Stabilize and rollback
//!
//! Both opcodes append version-list journal entries and seal them with a
//! journal fsync; their in-memory effect applies once that fsync completes.
//! STABLE promotes dirty entries to flush-eligible; ROLLBACK discards
//! top-of-stack unstable versions, returning their resources.

use super::{BlockStore, Durability, Operation, SubmitResult, WaitFor};
use crate::journal::{je_version_list_cap, je_version_list_size, JournalEntry, SpaceCheck};
use crate::ops::OpCode;
use crate::ring::IoTarget;
use blockvault_common::{ObjectId, ObjectVersion};
use std::collections::BTreeMap;
use tracing::trace;

impl BlockStore {
    pub(crate) fn dequeue_stable(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        // validate before touching the journal
        let mut todo: Vec<ObjectVersion> = Vec::new();
        for &ov in &op.versions {
            match self.dirty_db.get(&ov) {
                Some(e) if e.stable => {} // already stable: no-op
                Some(e) if e.dur < Durability::Synced => {
                    // stabilizing an unsynced write would let the flusher
                    // outrun durability
                    op.retval = -(libc::EBUSY as i64);
                    return SubmitResult::Done;
                }
                Some(_) => todo.push(ov),
                None => {
                    let already = self
                        .clean_db
                        .get(&ov.oid)
                        .is_some_and(|c| c.version >= ov.version);
                    if !already {
                        op.retval = -(libc::ENOENT as i64);
                        return SubmitResult::Done;
                    }
                }
            }
        }
        if todo.is_empty() {
            op.retval = 0;
            return SubmitResult::Done;
        }

        op.versions = todo;
        self.submit_version_list(op_id, op, OpCode::Stable)
    }

    pub(crate) fn dequeue_rollback(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        // group targets per object to check they form the top of its stack
        let mut per_object: BTreeMap<ObjectId, Vec<u64>> = BTreeMap::new();
        for &ov in &op.versions {
            match self.dirty_db.get(&ov) {
                None => {
                    op.retval = -(libc::ENOENT as i64);
                    return SubmitResult::Done;
                }
                Some(e) if e.stable => {
                    op.retval = -(libc::EBUSY as i64);
                    return SubmitResult::Done;
                }
                Some(e) if e.dur < Durability::Written => {
                    // journal I/O still in flight; retry next pass
                    return SubmitResult::CantSubmit;
                }
                Some(_) => per_object.entry(ov.oid).or_default().push(ov.version),
            }
        }
        for (oid, versions) in &per_object {
            let min = versions.iter().copied().min().expect("nonempty");
            let above: Vec<u64> = self
                .dirty_db
                .range(ObjectVersion::new(*oid, min)..=ObjectVersion::new(*oid, u64::MAX))
                .map(|(ov, _)| ov.version)
                .collect();
            // every dirty version at or above the rollback point must be listed
            if above.iter().any(|v| !versions.contains(v)) {
                op.retval = -(libc::EINVAL as i64);
                return SubmitResult::Done;
            }
        }
        if op.versions.is_empty() {
            op.retval = 0;
            return SubmitResult::Done;
        }

        self.submit_version_list(op_id, op, OpCode::Rollback)
    }

    /// Append chunked STABLE/ROLLBACK entries plus the sealing fsync
    fn submit_version_list(
        &mut self,
        op_id: usize,
        op: &mut Operation,
        opcode: OpCode,
    ) -> SubmitResult {
        let cap = je_version_list_cap(self.geo.meta_block_size as usize);
        let chunks: Vec<&[ObjectVersion]> = op.versions.chunks(cap).collect();
        let sizes: Vec<usize> = chunks.iter().map(|c| je_version_list_size(c.len())).collect();

        match self.journal.check_available(&sizes, &[]) {
            SpaceCheck::Ok => {}
            SpaceCheck::WaitJournal { used_start } => {
                op.wait_for = WaitFor::Journal(used_start);
                self.flusher.trim_wanted = true;
                return SubmitResult::CantSubmit;
            }
            SpaceCheck::WaitBuffer => {
                op.wait_for = WaitFor::JournalBuffer;
                return SubmitResult::CantSubmit;
            }
        }
        let sectors_required = self.journal.count_entry_sectors(&sizes);
        if self.ring.space_left() < sectors_required + 1 {
            op.wait_for = WaitFor::Sqe(sectors_required + 1);
            return SubmitResult::CantSubmit;
        }

        let mut touched: Vec<u64> = Vec::new();
        op.entry_sectors.clear();
        for chunk in chunks {
            let entry = if opcode == OpCode::Stable {
                JournalEntry::Stable {
                    versions: chunk.to_vec(),
                }
            } else {
                JournalEntry::Rollback {
                    versions: chunk.to_vec(),
                }
            };
            let appended = self.journal.append(&entry, None);
            op.entry_sectors.push(appended.sector);
            if touched.last() != Some(&appended.sector) {
                touched.push(appended.sector);
            }
        }
        for &sector in &touched {
            let (ptr, dev_off) = self.journal.begin_sector_flush(sector);
            self.ring.prep_write(
                self.journal_file.fd(),
                dev_off,
                ptr,
                self.geo.meta_block_size as u32,
                IoTarget::OpJournalSector { op: op_id, sector },
            );
        }
        self.ring
            .prep_fsync(self.journal_file.fd(), IoTarget::Op(op_id));
        op.pending_ops = (touched.len() + 1) as u32;
        trace!(
            count = op.versions.len(),
            rollback = (opcode == OpCode::Rollback),
            "version-list journal entries submitted"
        );
        SubmitResult::InProgress
    }

    /// Journal fsync for a STABLE/ROLLBACK arrived: apply the in-memory
    /// effect and release the list entries' sector references
    pub(crate) fn handle_stable_event(&mut self, op: &mut Operation) -> bool {
        for sector in std::mem::take(&mut op.entry_sectors) {
            self.journal.release_entry(sector);
        }
        if op.opcode == OpCode::Stable {
            for ov in op.versions.clone() {
                self.mark_stable(ov);
            }
        } else {
            // roll back newest-first so each erase target is top-of-stack
            let mut versions = op.versions.clone();
            versions.sort();
            for ov in versions.into_iter().rev() {
                self.apply_rollback(ov);
            }
        }
        op.retval = 0;
        true
    }

    fn mark_stable(&mut self, ov: ObjectVersion) {
        let Some(e) = self.dirty_db.get_mut(&ov) else {
            return; // rolled back while the STABLE was in flight
        };
        e.stable = true;
        let synced = e.dur == Durability::Synced;
        if synced {
            self.flusher.enqueue(ov);
        }
        if self
            .unstable_writes
            .get(&ov.oid)
            .is_some_and(|&v| v <= ov.version)
        {
            self.unstable_writes.remove(&ov.oid);
        }
    }

    fn apply_rollback(&mut self, ov: ObjectVersion) {
        self.erase_dirty_entry(ov, true);
        // recompute the object's newest acknowledged unstable version
        let remaining = self
            .dirty_db
            .range(ObjectVersion::new(ov.oid, 0)..=ObjectVersion::new(ov.oid, u64::MAX))
            .rev()
            .find(|(_, e)| !e.stable && e.dur >= Durability::Written)
            .map(|(v, _)| v.version);
        match remaining {
            Some(version) => {
                self.unstable_writes.insert(ov.oid, version);
            }
            None => {
                self.unstable_writes.remove(&ov.oid);
            }
        }
    }
}
