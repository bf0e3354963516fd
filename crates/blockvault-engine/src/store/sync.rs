//! The three-phase sync protocol
//!
//! A SYNC captures every unsynced write at dispatch, then walks
//! data-fsync -> journal-write -> journal-fsync. Captured big writes get
//! their BIG_WRITE journal entries only after the data device fsync proved
//! their payloads durable; small writes already live in journal sectors and
//! only need the final journal fsync. Acknowledgments are chained: a sync
//! fires its callback only after every earlier sync fired, so clients see
//! sync completions in submission order.

use super::{BlockStore, Durability, Operation, SubmitResult, WaitFor};
use crate::journal::{JournalEntry, SpaceCheck, JE_BIG_WRITE_SIZE};
use crate::ops::OpCode;
use crate::ring::IoTarget;
use blockvault_common::ObjectVersion;
use tracing::trace;

/// Sync state machine stages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncStage {
    HasBig,
    HasSmall,
    DataSyncSent,
    DataSyncDone,
    JournalSyncSent,
    Done,
}

/// Per-sync private state: the captured writes and the current stage
pub(crate) struct SyncState {
    pub stage: SyncStage,
    pub big: Vec<ObjectVersion>,
    pub small: Vec<ObjectVersion>,
}

/// Entry in the insertion-ordered chain of in-flight syncs
pub(crate) struct SyncSlot {
    pub op_id: usize,
    /// Earlier syncs that have not acknowledged yet
    pub prev_sync_count: usize,
    pub done: bool,
}

impl BlockStore {
    pub(crate) fn dequeue_sync(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        if op.sync.is_none() {
            // capture: everything unsynced right now belongs to this sync
            let big = std::mem::take(&mut self.unsynced_big);
            let small = std::mem::take(&mut self.unsynced_small);
            let stage = if !big.is_empty() {
                SyncStage::HasBig
            } else if !small.is_empty() {
                SyncStage::HasSmall
            } else {
                SyncStage::Done
            };
            let done = stage == SyncStage::Done;
            trace!(big = big.len(), small = small.len(), "sync dispatched");
            op.sync = Some(Box::new(SyncState { stage, big, small }));
            self.in_progress_syncs.push(SyncSlot {
                op_id,
                prev_sync_count: self.in_progress_syncs.len(),
                done,
            });
            if done {
                self.try_ack_syncs();
            }
        }

        if self.sync_acked(op_id) {
            if op.stab_all {
                op.stab_all = false;
                if !self.unstable_writes.is_empty() {
                    // second half of SYNC_STAB_ALL: stabilize everything the
                    // sync just made durable
                    op.versions = self
                        .unstable_writes
                        .iter()
                        .map(|(&oid, &version)| ObjectVersion::new(oid, version))
                        .collect();
                    self.unstable_writes.clear();
                    op.opcode = OpCode::Stable;
                    op.sync = None;
                    return SubmitResult::Stay;
                }
            }
            op.retval = 0;
            return SubmitResult::Done;
        }

        let stage = op.sync.as_ref().expect("sync state present").stage;
        match stage {
            SyncStage::HasSmall => {
                // payloads are already in journal sectors; one fsync seals them
                if self.ring.space_left() < 1 {
                    op.wait_for = WaitFor::Sqe(1);
                    return SubmitResult::CantSubmit;
                }
                self.ring
                    .prep_fsync(self.journal_file.fd(), IoTarget::Op(op_id));
                op.pending_ops = 1;
                op.sync.as_mut().expect("sync state present").stage = SyncStage::JournalSyncSent;
                SubmitResult::Stay
            }
            SyncStage::HasBig => {
                if self.ring.space_left() < 1 {
                    op.wait_for = WaitFor::Sqe(1);
                    return SubmitResult::CantSubmit;
                }
                self.ring
                    .prep_fsync(self.data_file.fd(), IoTarget::Op(op_id));
                op.pending_ops = 1;
                op.sync.as_mut().expect("sync state present").stage = SyncStage::DataSyncSent;
                SubmitResult::Stay
            }
            SyncStage::DataSyncDone => self.submit_sync_journal_writes(op_id, op),
            SyncStage::DataSyncSent | SyncStage::JournalSyncSent | SyncStage::Done => {
                SubmitResult::Stay
            }
        }
    }

    /// Data device is synced: record each captured big write in the journal,
    /// then seal the batch with a journal fsync
    fn submit_sync_journal_writes(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        let sync = op.sync.as_mut().expect("sync state present");
        let sizes = vec![JE_BIG_WRITE_SIZE; sync.big.len()];
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
        for &ov in &sync.big {
            // an entry may have been rolled back between capture and now
            let Some(location) = self.dirty_db.get(&ov).map(|e| e.location) else {
                continue;
            };
            let appended = self
                .journal
                .append(&JournalEntry::BigWrite { ov, location }, None);
            self.dirty_db
                .get_mut(&ov)
                .expect("entry just looked up")
                .journal_sector = Some(appended.sector);
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
        sync.stage = SyncStage::JournalSyncSent;
        SubmitResult::Stay
    }

    /// All I/O of the current sync phase completed
    pub(crate) fn handle_sync_event(&mut self, op_id: usize, op: &mut Operation) {
        let sync = op.sync.as_mut().expect("sync state present");
        match sync.stage {
            SyncStage::DataSyncSent => {
                for &ov in &sync.big {
                    if let Some(e) = self.dirty_db.get_mut(&ov) {
                        e.dur = Durability::DevSynced;
                    }
                }
                sync.stage = SyncStage::DataSyncDone;
                self.ring.wakeup();
            }
            SyncStage::JournalSyncSent => {
                let big = std::mem::take(&mut sync.big);
                let small = std::mem::take(&mut sync.small);
                for ov in big.into_iter().chain(small) {
                    self.mark_synced(ov);
                }
                sync.stage = SyncStage::Done;
                for slot in &mut self.in_progress_syncs {
                    if slot.op_id == op_id {
                        slot.done = true;
                    }
                }
                self.try_ack_syncs();
            }
            _ => unreachable!("BUG: sync completion in unexpected stage"),
        }
    }

    fn mark_synced(&mut self, ov: ObjectVersion) {
        if let Some(e) = self.dirty_db.get_mut(&ov) {
            e.dur = Durability::Synced;
            if e.stable {
                self.flusher.enqueue(ov);
            }
        }
    }

    /// A sync is acknowledged once the chain has dropped it
    pub(crate) fn sync_acked(&self, op_id: usize) -> bool {
        !self.in_progress_syncs.iter().any(|s| s.op_id == op_id)
    }

    /// Acknowledge every completed sync at the head of the chain, cascading
    /// the predecessor counts
    pub(crate) fn try_ack_syncs(&mut self) {
        while let Some(front) = self.in_progress_syncs.first() {
            if !front.done || front.prev_sync_count != 0 {
                break;
            }
            self.in_progress_syncs.remove(0);
            for slot in &mut self.in_progress_syncs {
                slot.prev_sync_count -= 1;
            }
        }
    }
}
