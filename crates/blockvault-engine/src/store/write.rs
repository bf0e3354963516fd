//! Write, write-stable and delete paths
//!
//! Small writes (anything short of a full block) are journal-inline: the
//! entry and its payload go into journal sectors and no data-device I/O
//! happens until the flusher moves the payload to its final home. Full-block
//! writes go straight to a freshly allocated data block; only their metadata
//! transits the journal, during the sync that makes them durable.

use super::{BlockStore, DirtyEntry, Durability, Operation, SubmitResult, WaitFor, WriteKind};
use crate::journal::{JournalEntry, JE_DELETE_SIZE, JE_SMALL_WRITE_SIZE};
use crate::ops::OpCode;
use crate::raw_io::AlignedBuffer;
use crate::ring::IoTarget;
use blockvault_common::ObjectVersion;
use tracing::trace;

impl BlockStore {
    /// Version assignment and dirty-entry creation, run at enqueue time so
    /// later enqueues observe this write
    pub(crate) fn enqueue_write(&mut self, op: &mut Operation) -> std::result::Result<(), i64> {
        let latest = self.latest_version(op.oid);
        if op.version == 0 {
            op.version = latest + 1;
        } else if op.version != latest + 1 {
            // versions must be dense and strictly increasing per object
            return Err(-(libc::EINVAL as i64));
        }

        let kind = if op.opcode == OpCode::Delete {
            WriteKind::Delete
        } else if op.offset == 0 && u64::from(op.len) == self.geo.block_size {
            WriteKind::Big
        } else {
            WriteKind::Small
        };
        if kind == WriteKind::Small {
            // a payload that can never fit the journal must fail upfront
            let run = self.journal.payload_run_len(op.len);
            if run + 3 * self.geo.meta_block_size > self.geo.journal_len {
                return Err(-(libc::EINVAL as i64));
            }
        }

        self.dirty_db.insert(
            ObjectVersion::new(op.oid, op.version),
            DirtyEntry {
                kind,
                dur: Durability::Queued,
                // deletions are always stable; WRITE_STABLE is stable by contract
                stable: kind == WriteKind::Delete || op.opcode == OpCode::WriteStable,
                location: 0,
                offset: op.offset,
                len: op.len,
                journal_sector: None,
                pending_buf: None,
            },
        );
        Ok(())
    }

    pub(crate) fn dequeue_write(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        let ov = ObjectVersion::new(op.oid, op.version);
        let kind = self.dirty_db.get(&ov).map(|e| e.kind);
        match kind {
            Some(WriteKind::Big) => self.submit_big_write(op_id, op, ov),
            Some(WriteKind::Small) | Some(WriteKind::Delete) => {
                self.submit_journal_write(op_id, op, ov)
            }
            None => {
                // rolled back while queued
                op.retval = -(libc::ENOENT as i64);
                SubmitResult::Done
            }
        }
    }

    fn submit_big_write(
        &mut self,
        op_id: usize,
        op: &mut Operation,
        ov: ObjectVersion,
    ) -> SubmitResult {
        let Some(location) = self.alloc.allocate() else {
            if self.flusher_is_active() || !self.dirty_db.is_empty() {
                // flushing can supersede clean blocks and free space
                op.wait_for = WaitFor::Free;
                return SubmitResult::CantSubmit;
            }
            op.retval = -(libc::ENOSPC as i64);
            self.dirty_db.remove(&ov);
            return SubmitResult::Done;
        };
        if self.ring.space_left() < 1 {
            self.alloc.free(location);
            op.wait_for = WaitFor::Sqe(1);
            return SubmitResult::CantSubmit;
        }

        let buf = AlignedBuffer::from_slice(&op.data);
        self.ring.prep_write(
            self.data_file.fd(),
            self.geo.block_offset(location) + u64::from(op.offset),
            buf.as_ptr(),
            op.len,
            IoTarget::Op(op_id),
        );

        let e = self.dirty_db.get_mut(&ov).expect("dirty entry exists");
        e.location = location;
        e.dur = Durability::Submitted;
        e.pending_buf = Some(buf);
        op.pending_ops = 1;
        self.unsynced_big.push(ov);
        trace!(%ov, location, "big write submitted");
        SubmitResult::InProgress
    }

    fn submit_journal_write(
        &mut self,
        op_id: usize,
        op: &mut Operation,
        ov: ObjectVersion,
    ) -> SubmitResult {
        let is_delete = op.opcode == OpCode::Delete;
        let entry_size = if is_delete {
            JE_DELETE_SIZE
        } else {
            JE_SMALL_WRITE_SIZE
        };
        let payload_run = if is_delete {
            0
        } else {
            self.journal.payload_run_len(op.len)
        };

        match self
            .journal
            .check_available(&[entry_size], &[payload_run])
        {
            crate::journal::SpaceCheck::Ok => {}
            crate::journal::SpaceCheck::WaitJournal { used_start } => {
                op.wait_for = WaitFor::Journal(used_start);
                self.flusher.trim_wanted = true;
                return SubmitResult::CantSubmit;
            }
            crate::journal::SpaceCheck::WaitBuffer => {
                op.wait_for = WaitFor::JournalBuffer;
                return SubmitResult::CantSubmit;
            }
        }
        let sqes = 1 + usize::from(payload_run > 0);
        if self.ring.space_left() < sqes {
            op.wait_for = WaitFor::Sqe(sqes);
            return SubmitResult::CantSubmit;
        }

        let entry = if is_delete {
            JournalEntry::Delete { ov }
        } else {
            JournalEntry::SmallWrite {
                ov,
                offset: op.offset,
                len: op.len,
                data_offset: 0, // assigned by the journal
            }
        };
        let payload = (!is_delete && op.len > 0).then_some(&op.data[..]);
        let appended = self.journal.append(&entry, payload);

        let (ptr, dev_off) = self.journal.begin_sector_flush(appended.sector);
        self.ring.prep_write(
            self.journal_file.fd(),
            dev_off,
            ptr,
            self.geo.meta_block_size as u32,
            IoTarget::OpJournalSector {
                op: op_id,
                sector: appended.sector,
            },
        );
        if let Some(data_offset) = appended.data_offset {
            let (ptr, dev_off) = self.journal.begin_range_flush(data_offset, payload_run);
            self.ring.prep_write(
                self.journal_file.fd(),
                dev_off,
                ptr,
                payload_run as u32,
                IoTarget::OpJournalData {
                    op: op_id,
                    offset: data_offset,
                    len: payload_run,
                },
            );
        }

        let e = self.dirty_db.get_mut(&ov).expect("dirty entry exists");
        e.dur = Durability::Submitted;
        e.location = appended.data_offset.unwrap_or(0);
        e.journal_sector = Some(appended.sector);
        op.pending_ops = sqes as u32;
        self.unsynced_small.push(ov);
        trace!(%ov, sector = appended.sector, delete = is_delete, "journal write submitted");
        SubmitResult::InProgress
    }

    /// All of a write's I/O completed: the entry is WRITTEN and the client
    /// is acknowledged (durability still requires a SYNC)
    pub(crate) fn handle_write_event(&mut self, op: &mut Operation) -> bool {
        let ov = ObjectVersion::new(op.oid, op.version);
        if let Some(e) = self.dirty_db.get_mut(&ov) {
            e.dur = Durability::Written;
            e.pending_buf = None;
        }
        match op.opcode {
            OpCode::Write => {
                let latest = self.unstable_writes.entry(op.oid).or_insert(0);
                *latest = (*latest).max(op.version);
            }
            OpCode::Delete => {
                self.unstable_writes.remove(&op.oid);
            }
            OpCode::WriteStable => {}
            _ => unreachable!(),
        }
        op.retval = 0;
        true
    }
}
