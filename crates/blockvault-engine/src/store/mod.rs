//! The block store aggregate
//!
//! One [`BlockStore`] owns every subsystem: the ring driver, the allocator,
//! the journal, the dirty and clean databases and the flusher. All state
//! transitions happen on the loop thread; the only concurrency is the kernel
//! executing ring submissions. Client operations enter through
//! [`BlockStore::enqueue`] and are driven by [`BlockStore::loop_once`], one
//! cooperative scheduler pass per call.

mod flusher;
mod init;
mod list;
mod read;
mod stable;
mod sync;
mod write;

use crate::allocator::Allocator;
use crate::journal::Journal;
use crate::layout::{Geometry, MetaFormat, Superblock};
use crate::ops::{ListFilter, ListResult, OpCallback, OpCode, OpRequest, OpResult};
use crate::raw_io::{AlignedBuffer, RawFile};
use crate::ring::{CompletionEvent, IoTarget, Ring, DEFAULT_RING_DEPTH};
use blockvault_common::{Config, ObjectId, ObjectVersion, Result};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, info, trace};

pub(crate) use flusher::Flusher;
pub(crate) use sync::{SyncSlot, SyncState};

/// Durability rung of a dirty entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Durability {
    /// Enqueued, no I/O issued yet
    Queued,
    /// Device I/O issued
    Submitted,
    /// Device acknowledged the write
    Written,
    /// Data device fsync'd (big writes, mid-sync)
    DevSynced,
    /// Journal metadata about the write is fsync'd; eligible for flushing
    Synced,
}

/// What kind of mutation a dirty entry records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Payload lives in journal sectors until flushed
    Small,
    /// Payload lives on the data device
    Big,
    Delete,
}

/// In-memory record of a write that has not been promoted to the clean DB
pub(crate) struct DirtyEntry {
    pub kind: WriteKind,
    pub dur: Durability,
    pub stable: bool,
    /// Big: data block index. Small: in-region journal offset of the payload.
    pub location: u64,
    pub offset: u32,
    pub len: u32,
    /// In-region offset of the sector holding this entry's journal record
    pub journal_sector: Option<u64>,
    /// Keeps an in-flight big write's payload alive and readable
    pub pending_buf: Option<AlignedBuffer>,
}

/// Most recently stabilized version of an object, mirrored from metadata
pub(crate) struct CleanEntry {
    pub version: u64,
    pub location: u64,
    pub bitmap: Vec<u8>,
    pub ext_bitmap: Vec<u8>,
}

/// Why a queued operation is parked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitFor {
    None,
    /// Needs this many free submission slots
    Sqe(usize),
    /// Journal tail must be trimmed past the recorded `used_start`
    Journal(u64),
    /// A journal sector we need still has a write in flight
    JournalBuffer,
    /// Needs a free data block
    Free,
}

/// What a per-opcode handler did with an operation this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubmitResult {
    /// Could not submit; staged SQEs are rolled back and the op stays queued
    CantSubmit,
    /// I/O submitted; the op leaves the queue and completions finish it
    InProgress,
    /// Finished right now (`retval` is set)
    Done,
    /// Multi-phase op staying in the queue (SYNC)
    Stay,
}

/// Internal operation state
pub(crate) struct Operation {
    pub opcode: OpCode,
    pub oid: ObjectId,
    pub version: u64,
    pub offset: u32,
    pub len: u32,
    pub data: Vec<u8>,
    pub versions: Vec<ObjectVersion>,
    pub filter: ListFilter,
    pub callback: Option<OpCallback>,
    pub retval: i64,
    pub result_data: Option<Vec<u8>>,
    pub result_list: Option<ListResult>,
    pub wait_for: WaitFor,
    pub pending_ops: u32,
    /// SYNC_STAB_ALL: run an internal STABLE after the sync acknowledges
    pub stab_all: bool,
    pub read: Option<Box<read::ReadState>>,
    pub sync: Option<Box<SyncState>>,
    /// Journal sectors whose usage this op releases when its I/O completes
    /// (STABLE / ROLLBACK entries)
    pub entry_sectors: Vec<u64>,
}

impl Operation {
    fn new(req: OpRequest, callback: OpCallback) -> Self {
        Self {
            opcode: req.opcode,
            oid: req.oid,
            version: req.version,
            offset: req.offset,
            len: req.len,
            data: req.data,
            versions: req.versions,
            filter: req.filter,
            callback: Some(callback),
            retval: 0,
            result_data: None,
            result_list: None,
            wait_for: WaitFor::None,
            pending_ops: 0,
            stab_all: false,
            read: None,
            sync: None,
            entry_sectors: Vec::new(),
        }
    }
}

/// Arena of in-flight operations; completion records index into it
pub(crate) struct OpTable {
    slots: Vec<Option<Operation>>,
    free: Vec<usize>,
}

impl OpTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, op: Operation) -> usize {
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(op);
            id
        } else {
            self.slots.push(Some(op));
            self.slots.len() - 1
        }
    }

    /// Temporarily move an operation out so the engine can be borrowed
    /// alongside it; pair with `put_back` or `remove`
    pub(crate) fn take(&mut self, id: usize) -> Operation {
        self.slots[id].take().expect("BUG: operation slot empty")
    }

    pub(crate) fn put_back(&mut self, id: usize, op: Operation) {
        debug_assert!(self.slots[id].is_none());
        self.slots[id] = Some(op);
    }

    /// Release a slot whose operation was taken
    fn release(&mut self, id: usize) {
        debug_assert!(self.slots[id].is_none());
        self.free.push(id);
    }
}

/// The write-ahead-journaled block store
pub struct BlockStore {
    pub(crate) cfg: Config,
    pub(crate) geo: Geometry,
    pub(crate) data_file: RawFile,
    pub(crate) meta_file: RawFile,
    pub(crate) journal_file: RawFile,
    pub(crate) ring: Ring,
    pub(crate) alloc: Allocator,
    pub(crate) journal: Journal,
    pub(crate) dirty_db: BTreeMap<ObjectVersion, DirtyEntry>,
    pub(crate) clean_db: BTreeMap<ObjectId, CleanEntry>,
    pub(crate) unsynced_big: Vec<ObjectVersion>,
    pub(crate) unsynced_small: Vec<ObjectVersion>,
    /// Acknowledged but not yet stabilized writes, per object
    pub(crate) unstable_writes: BTreeMap<ObjectId, u64>,
    pub(crate) in_progress_syncs: Vec<SyncSlot>,
    pub(crate) ops: OpTable,
    pub(crate) submit_queue: VecDeque<usize>,
    pub(crate) flusher: Flusher,
    /// Whole metadata entry region, when `inmemory_metadata` is on
    pub(crate) meta_cache: Option<AlignedBuffer>,
    live: bool,
    queue_stall: bool,
    stop_sync_submitted: bool,
    events_scratch: Vec<CompletionEvent>,
}

impl BlockStore {
    /// One-shot initializer: write the superblock, zero the clean-entry
    /// region and plant the journal anchor. Devices must already exist with
    /// their final sizes.
    pub fn format(cfg: &Config) -> Result<()> {
        cfg.validate()?;
        let data = RawFile::open(&cfg.data_device, cfg.direct_io, false)?;
        let meta = RawFile::open(cfg.meta_device_path(), cfg.direct_io, false)?;
        let journal_dev = RawFile::open(cfg.journal_device_path(), cfg.direct_io, false)?;

        let geo = Geometry::compute(
            cfg,
            data.size(),
            meta.size(),
            journal_dev.size(),
            MetaFormat::Current,
        )?;

        // superblock + zeroed entry blocks
        let block_len = geo.meta_block_size as usize;
        let mut block = AlignedBuffer::new(block_len);
        Superblock::new(cfg).write_to(block.as_mut_slice());
        meta.write_at(geo.meta_offset, &block.as_slice()[..block_len])?;
        block.zero();
        for i in 0..geo.meta_entry_blocks() {
            meta.write_at(
                geo.meta_entries_start() + i * geo.meta_block_size,
                &block.as_slice()[..block_len],
            )?;
        }
        meta.sync()?;

        // journal anchor: replay starts right after the anchor sector
        let mut journal = Journal::new(geo.journal_offset, geo.journal_len, geo.meta_block_size);
        journal.build_start_anchor(geo.meta_block_size);
        journal_dev.write_at(geo.journal_offset, &journal.buffer()[..geo.meta_block_size as usize])?;
        journal_dev.sync()?;
        data.sync()?;

        info!(
            data = %cfg.data_device.display(),
            blocks = geo.block_count,
            block_size = geo.block_size,
            journal = geo.journal_len,
            "formatted block store"
        );
        Ok(())
    }

    /// Open a store: read the superblock, rebuild the clean DB from
    /// metadata, replay the journal into the dirty DB
    pub fn open(cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let data_file = RawFile::open(&cfg.data_device, cfg.direct_io, false)?;
        let meta_file = RawFile::open(cfg.meta_device_path(), cfg.direct_io, cfg.readonly)?;
        let journal_file = RawFile::open(cfg.journal_device_path(), cfg.direct_io, cfg.readonly)?;

        // probe the first metadata block for the superblock
        let probe_geo = Geometry::compute(
            cfg,
            data_file.size(),
            meta_file.size(),
            journal_file.size(),
            MetaFormat::Current,
        )?;
        let mut block = AlignedBuffer::new(probe_geo.meta_block_size as usize);
        meta_file.read_at(probe_geo.meta_offset, block.as_mut_slice())?;
        let meta_format = match Superblock::read_from(block.as_slice())? {
            Some(sb) => {
                sb.check_config(cfg)?;
                MetaFormat::Current
            }
            None => {
                debug!("no superblock found, using the legacy metadata layout");
                MetaFormat::Legacy
            }
        };
        let geo = Geometry::compute(
            cfg,
            data_file.size(),
            meta_file.size(),
            journal_file.size(),
            meta_format,
        )?;

        let mut store = Self {
            alloc: Allocator::new(geo.block_count),
            journal: Journal::new(geo.journal_offset, geo.journal_len, geo.meta_block_size),
            ring: Ring::new(DEFAULT_RING_DEPTH)?,
            flusher: Flusher::new(cfg.flusher_count),
            dirty_db: BTreeMap::new(),
            clean_db: BTreeMap::new(),
            unsynced_big: Vec::new(),
            unsynced_small: Vec::new(),
            unstable_writes: BTreeMap::new(),
            in_progress_syncs: Vec::new(),
            ops: OpTable::new(),
            submit_queue: VecDeque::new(),
            meta_cache: None,
            live: false,
            queue_stall: false,
            stop_sync_submitted: false,
            events_scratch: Vec::new(),
            cfg: cfg.clone(),
            geo,
            data_file,
            meta_file,
            journal_file,
        };
        store.init_metadata()?;
        store.replay_journal()?;
        info!(
            clean = store.clean_db.len(),
            dirty = store.dirty_db.len(),
            free_blocks = store.alloc.get_free_count(),
            "block store opened"
        );
        Ok(store)
    }

    /// Enqueue a client operation. Invalid arguments fail the callback with
    /// `-EINVAL` immediately; everything else is queued for the loop.
    pub fn enqueue(&mut self, req: OpRequest, callback: OpCallback) {
        let mut op = Operation::new(req, callback);
        if let Err(code) = self.validate_op(&op) {
            op.retval = code;
            Self::fire_callback(op);
            return;
        }
        if op.opcode == OpCode::SyncStabAll {
            op.opcode = OpCode::Sync;
            op.stab_all = true;
        }
        if matches!(
            op.opcode,
            OpCode::Write | OpCode::WriteStable | OpCode::Delete
        ) {
            if let Err(code) = self.enqueue_write(&mut op) {
                op.retval = code;
                Self::fire_callback(op);
                return;
            }
        }
        let id = self.ops.insert(op);
        self.submit_queue.push_back(id);
        self.ring.wakeup();
    }

    fn validate_op(&self, op: &Operation) -> std::result::Result<(), i64> {
        let block_size = self.geo.block_size;
        let align = self.geo.disk_alignment;
        match op.opcode {
            OpCode::Read | OpCode::Write | OpCode::WriteStable => {
                let bad_range = u64::from(op.offset) >= block_size
                    || u64::from(op.len) > block_size - u64::from(op.offset)
                    || u64::from(op.offset) % align != 0
                    || u64::from(op.len) % align != 0;
                if bad_range || (op.opcode == OpCode::Read && op.len == 0) {
                    return Err(-libc::EINVAL as i64);
                }
                if op.opcode != OpCode::Read && op.data.len() != op.len as usize {
                    return Err(-libc::EINVAL as i64);
                }
            }
            _ => {}
        }
        if self.cfg.readonly && !matches!(op.opcode, OpCode::Read | OpCode::List) {
            return Err(-libc::EINVAL as i64);
        }
        Ok(())
    }

    /// One cooperative scheduler iteration
    pub fn loop_once(&mut self) -> Result<()> {
        // 1. reap and dispatch completions
        let mut events = std::mem::take(&mut self.events_scratch);
        events.clear();
        self.ring.drain_completions(&mut events);
        for ev in events.drain(..) {
            self.handle_event(ev);
        }
        self.events_scratch = events;

        // 2. walk the submit queue
        // has_writes: 0 = none seen, 1 = submitted, 2 = one could not submit
        let mut has_writes = 0u8;
        let mut i = 0;
        let mut stop = false;
        while i < self.submit_queue.len() && !stop {
            let op_id = self.submit_queue[i];
            let mut op = self.ops.take(op_id);

            if op.wait_for != WaitFor::None && !self.check_wait(&mut op) {
                let wait_sqe = matches!(op.wait_for, WaitFor::Sqe(_));
                if matches!(
                    op.opcode,
                    OpCode::Write | OpCode::WriteStable | OpCode::Delete
                ) {
                    has_writes = 2;
                }
                self.ops.put_back(op_id, op);
                if wait_sqe {
                    // the ring is full: nothing later can submit either
                    break;
                }
                i += 1;
                continue;
            }

            let prev_sqe = self.ring.save();
            let result = match op.opcode {
                OpCode::Read => self.dequeue_read(op_id, &mut op),
                OpCode::Write | OpCode::WriteStable | OpCode::Delete => {
                    if has_writes == 2 {
                        // an earlier write could not submit; keep order
                        self.ops.put_back(op_id, op);
                        i += 1;
                        continue;
                    }
                    let r = self.dequeue_write(op_id, &mut op);
                    has_writes = if r == SubmitResult::CantSubmit { 2 } else { 1 };
                    r
                }
                OpCode::Sync => {
                    if has_writes != 0 {
                        // capture a well-defined set: wait for a pass with no
                        // writes in front of us
                        self.ops.put_back(op_id, op);
                        i += 1;
                        continue;
                    }
                    self.dequeue_sync(op_id, &mut op)
                }
                OpCode::Stable => self.dequeue_stable(op_id, &mut op),
                OpCode::Rollback => self.dequeue_rollback(op_id, &mut op),
                OpCode::List => {
                    self.process_list(&mut op);
                    SubmitResult::Done
                }
                OpCode::SyncStabAll => unreachable!("rewritten to SYNC at enqueue"),
            };

            match result {
                SubmitResult::CantSubmit => {
                    self.ring.restore(prev_sqe);
                    if matches!(op.wait_for, WaitFor::Sqe(_)) {
                        stop = true;
                    }
                    self.ops.put_back(op_id, op);
                    i += 1;
                }
                SubmitResult::InProgress => {
                    self.submit_queue.remove(i);
                    self.ops.put_back(op_id, op);
                }
                SubmitResult::Done => {
                    self.submit_queue.remove(i);
                    self.ops.release(op_id);
                    Self::fire_callback(op);
                }
                SubmitResult::Stay => {
                    self.ops.put_back(op_id, op);
                    i += 1;
                }
            }
        }

        // 3. background flushing, then hand everything to the kernel
        if !self.cfg.readonly {
            self.flusher_tick();
        }
        let submitted = self.ring.submit()?;
        if submitted > 0 {
            self.live = true;
        }
        self.queue_stall =
            !self.live && self.ring.in_flight() == 0 && !self.submit_queue.is_empty();
        self.live = false;
        Ok(())
    }

    /// Block until at least one completion is pending (host idle point)
    pub fn wait_for_events(&mut self) -> Result<()> {
        self.ring.wait(1)
    }

    /// True when the loop made no progress and nothing is in flight
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.queue_stall
    }

    /// Whether the store can be stopped without losing acknowledged state.
    /// The first call injects a final SYNC if unsynced writes remain.
    pub fn is_safe_to_stop(&mut self) -> bool {
        if !self.submit_queue.is_empty() || (!self.cfg.readonly && self.flusher_is_active()) {
            return false;
        }
        if !self.unsynced_big.is_empty() || !self.unsynced_small.is_empty() {
            if !self.cfg.readonly && !self.stop_sync_submitted {
                self.enqueue(OpRequest::sync(), Box::new(|_| {}));
                self.stop_sync_submitted = true;
            }
            return false;
        }
        !self.ring.has_work()
    }

    fn check_wait(&mut self, op: &mut Operation) -> bool {
        match op.wait_for {
            WaitFor::None => true,
            WaitFor::Sqe(need) => {
                if self.ring.space_left() < need {
                    return false;
                }
                op.wait_for = WaitFor::None;
                true
            }
            WaitFor::Journal(used_start) => {
                if self.journal.used_start == used_start {
                    trace!(used_start, "still waiting for journal trim");
                    self.flusher.trim_wanted = true;
                    return false;
                }
                op.wait_for = WaitFor::None;
                true
            }
            WaitFor::JournalBuffer | WaitFor::Free => {
                if op.wait_for == WaitFor::Free
                    && self.alloc.get_free_count() == 0
                    && (self.flusher_is_active() || !self.dirty_db.is_empty())
                {
                    trace!("still waiting for a free data block");
                    return false;
                }
                // re-run the handler's own check
                op.wait_for = WaitFor::None;
                true
            }
        }
    }

    fn handle_event(&mut self, ev: CompletionEvent) {
        match ev.target {
            IoTarget::Op(op_id) => self.handle_op_event(op_id, ev.result),
            IoTarget::OpJournalSector { op, sector } => {
                self.journal.end_sector_flush(sector);
                self.handle_op_event(op, ev.result);
            }
            IoTarget::OpJournalData { op, offset, len } => {
                self.journal.end_range_flush(offset, len);
                self.handle_op_event(op, ev.result);
            }
            IoTarget::Flusher(worker) => self.flusher_handle_event(worker, ev.result),
            IoTarget::Trim => self.trim_handle_event(ev.result),
        }
    }

    fn handle_op_event(&mut self, op_id: usize, result: i32) {
        if result < 0 {
            self.fatal_io_error("operation I/O", result);
        }
        let mut op = self.ops.take(op_id);
        debug_assert!(op.pending_ops > 0);
        op.pending_ops -= 1;
        let finished = if op.pending_ops > 0 {
            false
        } else {
            match op.opcode {
                OpCode::Read => self.handle_read_event(&mut op),
                OpCode::Write | OpCode::WriteStable | OpCode::Delete => {
                    self.handle_write_event(&mut op)
                }
                OpCode::Sync => {
                    self.handle_sync_event(op_id, &mut op);
                    // syncs stay queued until acknowledged in order
                    false
                }
                OpCode::Stable | OpCode::Rollback => self.handle_stable_event(&mut op),
                _ => unreachable!("no I/O completions for this opcode"),
            }
        };
        if finished {
            self.ops.release(op_id);
            Self::fire_callback(op);
        } else {
            self.ops.put_back(op_id, op);
        }
    }

    pub(crate) fn fire_callback(mut op: Operation) {
        let callback = op.callback.take().expect("BUG: callback fired twice");
        callback(OpResult {
            retval: op.retval,
            version: op.version,
            data: op.result_data.take(),
            list: op.result_list.take(),
        });
    }

    /// Remove a dirty entry, returning its resources. `free_block` controls
    /// whether a big write's data block goes back to the allocator (a flushed
    /// entry's block lives on as the clean location).
    pub(crate) fn erase_dirty_entry(&mut self, ov: ObjectVersion, free_block: bool) {
        let Some(e) = self.dirty_db.remove(&ov) else {
            return;
        };
        if let Some(sector) = e.journal_sector {
            self.journal.release_entry(sector);
        }
        if e.kind == WriteKind::Small && e.len > 0 && e.dur >= Durability::Submitted {
            self.journal.release_range(e.location, e.len);
        }
        if e.kind == WriteKind::Big && e.dur >= Durability::Submitted && free_block {
            self.alloc.free(e.location);
        }
        self.unsynced_big.retain(|v| *v != ov);
        self.unsynced_small.retain(|v| *v != ov);
    }

    /// Latest version of an object across the dirty and clean DBs
    pub(crate) fn latest_version(&self, oid: ObjectId) -> u64 {
        let dirty_last = self
            .dirty_db
            .range(
                ObjectVersion::new(oid, 0)..=ObjectVersion::new(oid, u64::MAX),
            )
            .next_back()
            .map(|(ov, _)| ov.version);
        dirty_last.unwrap_or_else(|| self.clean_db.get(&oid).map_or(0, |c| c.version))
    }

    fn fatal_io_error(&self, what: &str, result: i32) -> ! {
        error!(
            what,
            errno = -result,
            "device error; in-memory state may no longer match disk"
        );
        panic!(
            "fatal device error during {} (errno {}); aborting to avoid corrupting the store",
            what, -result
        );
    }

    // --- host introspection ---

    /// Free data blocks
    #[must_use]
    pub fn get_free_count(&self) -> u64 {
        self.alloc.get_free_count()
    }

    /// Total data blocks
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.geo.block_count
    }

    /// Writes not yet covered by a completed SYNC
    #[must_use]
    pub fn unsynced_write_count(&self) -> usize {
        self.unsynced_big.len() + self.unsynced_small.len()
    }

    /// Queued operations
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.submit_queue.len()
    }

    /// Durability of a specific dirty entry, if present
    #[must_use]
    pub fn dirty_durability(&self, ov: ObjectVersion) -> Option<Durability> {
        self.dirty_db.get(&ov).map(|e| e.dur)
    }

    /// Dirty versions of an object with their stable flags
    #[must_use]
    pub fn dirty_versions(&self, oid: ObjectId) -> Vec<(u64, bool)> {
        self.dirty_db
            .range(ObjectVersion::new(oid, 0)..=ObjectVersion::new(oid, u64::MAX))
            .map(|(ov, e)| (ov.version, e.stable))
            .collect()
    }

    /// Stabilized version of an object, if any
    #[must_use]
    pub fn clean_version(&self, oid: ObjectId) -> Option<u64> {
        self.clean_db.get(&oid).map(|c| c.version)
    }

    /// Whether the flusher has work in progress or pending
    #[must_use]
    pub fn flusher_is_active(&self) -> bool {
        self.flusher.is_active()
    }
}
