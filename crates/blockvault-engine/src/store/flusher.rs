//! Background flusher
//!
//! A pool of cooperative workers moves stabilized, synced dirty entries to
//! their final home: data goes to its block on the data device (small writes
//! copy out of the journal first), the clean entry is rewritten in its
//! metadata block, metadata is fsync'd, superseded blocks are freed and the
//! journal references are released. A separate trim worker advances
//! `used_start` and rewrites the START anchor once the tail drains.

use super::{BlockStore, CleanEntry, Durability, WriteKind};
use crate::layout::{encode_clean_entry, CleanEntryRecord};
use crate::raw_io::AlignedBuffer;
use crate::ring::IoTarget;
use blockvault_common::{ObjectId, ObjectVersion};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// What a worker is doing; every phase except `Finish` issues one I/O
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushPhase {
    /// Read the old block range for a partial-granule merge
    ReadData,
    WriteData,
    SyncData,
    /// Acquire the metadata-block lock (no I/O; retried each tick)
    LockMeta,
    ReadMeta,
    WriteMeta,
    SyncMeta,
    Finish,
}

/// One journal-resident payload to lay over the base content
struct Overlay {
    offset: u64,
    len: u64,
    /// In-region journal offset of the payload
    location: u64,
}

/// One in-progress flush
struct FlushJob {
    phase: FlushPhase,
    /// An I/O for the current phase is in flight
    waiting: bool,
    ov: ObjectVersion,
    kind: WriteKind,
    /// Block receiving the data / holding the clean entry (for deletes, the
    /// block whose entry is being zeroed)
    dest_block: u64,
    /// Superseded clean block to free after the metadata fsync
    free_after: Option<u64>,
    /// Rounded data-device write range (small writes)
    write_off: u64,
    write_len: u64,
    /// Composed payload (bounding range of all overlays)
    staging: Option<AlignedBuffer>,
    /// Small-write payloads of the flushed chain, oldest first
    overlays: Vec<Overlay>,
    /// Granule bits of the base content (merge input); empty means legacy
    /// metadata, every granule valid
    old_bitmap: Vec<u8>,
    /// New clean entry content
    bitmap: Vec<u8>,
    ext_bitmap: Vec<u8>,
    meta_block_off: u64,
    slot_off: usize,
    meta_buf: Option<AlignedBuffer>,
    meta_locked: bool,
}

/// Journal trim state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrimState {
    Idle,
    WriteAnchor { new_start: u64 },
    NeedFsync { new_start: u64 },
    SyncAnchor { new_start: u64 },
}

/// Flusher pool state
pub(crate) struct Flusher {
    queue: VecDeque<ObjectVersion>,
    active_objects: HashSet<ObjectId>,
    active_meta_blocks: HashSet<u64>,
    workers: Vec<Option<FlushJob>>,
    pub trim_wanted: bool,
    trim: TrimState,
}

impl Flusher {
    pub fn new(worker_count: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active_objects: HashSet::new(),
            active_meta_blocks: HashSet::new(),
            workers: (0..worker_count).map(|_| None).collect(),
            trim_wanted: false,
            trim: TrimState::Idle,
        }
    }

    /// Queue a stabilized, synced dirty entry for flushing
    pub fn enqueue(&mut self, ov: ObjectVersion) {
        if !self.queue.contains(&ov) {
            self.queue.push_back(ov);
        }
    }

    /// Whether any flushing or trimming is in progress or pending
    pub fn is_active(&self) -> bool {
        !self.queue.is_empty()
            || self.workers.iter().any(Option::is_some)
            || self.trim != TrimState::Idle
    }
}

impl BlockStore {
    /// One flusher pass, called at the end of every loop iteration
    pub(crate) fn flusher_tick(&mut self) {
        for w in 0..self.flusher.workers.len() {
            if self.flusher.workers[w].is_none() {
                let Some(ov) = self.pick_flush_target() else {
                    break;
                };
                self.begin_flush(w, ov);
            }
        }
        for w in 0..self.flusher.workers.len() {
            if self.flusher.workers[w].is_some() {
                self.advance_flush_worker(w);
            }
        }
        self.trim_tick();
    }

    /// Oldest queued entry whose object no peer is flushing
    fn pick_flush_target(&mut self) -> Option<ObjectVersion> {
        let mut i = 0;
        while i < self.flusher.queue.len() {
            let ov = self.flusher.queue[i];
            let eligible = self
                .dirty_db
                .get(&ov)
                .is_some_and(|e| e.stable && e.dur == Durability::Synced);
            if !eligible {
                // rolled back or superseded by an earlier flush
                self.flusher.queue.remove(i);
                continue;
            }
            if self.flusher.active_objects.contains(&ov.oid) {
                i += 1;
                continue;
            }
            self.flusher.queue.remove(i);
            return Some(ov);
        }
        None
    }

    fn begin_flush(&mut self, w: usize, ov: ObjectVersion) {
        let e = self.dirty_db.get(&ov).expect("picked entry exists");
        let kind = e.kind;
        let e_location = e.location;
        let clean = self.clean_db.get(&ov.oid);
        let bitmap_bytes = self.geo.clean_entry_bitmap_size;
        let gran = self.geo.bitmap_granularity;
        let ext = clean.map_or_else(|| vec![0; bitmap_bytes], |c| c.ext_bitmap.clone());

        let job = match kind {
            WriteKind::Big => {
                let free_after = clean
                    .map(|c| c.location)
                    .filter(|&loc| loc != e_location);
                let (meta_block_off, slot_off) = self.geo.meta_slot(e_location);
                FlushJob {
                    phase: FlushPhase::LockMeta,
                    waiting: false,
                    ov,
                    kind,
                    dest_block: e_location,
                    free_after,
                    write_off: 0,
                    write_len: 0,
                    staging: None,
                    overlays: Vec::new(),
                    old_bitmap: Vec::new(),
                    bitmap: vec![0xFF; bitmap_bytes],
                    ext_bitmap: ext,
                    meta_block_off,
                    slot_off,
                    meta_buf: None,
                    meta_locked: false,
                }
            }
            WriteKind::Delete => {
                let Some(c) = clean else {
                    // nothing stabilized on disk: erasing the dirty chain is
                    // the whole flush
                    self.finalize_flush_dbs(ov, kind, 0, None, Vec::new(), Vec::new());
                    return;
                };
                let (meta_block_off, slot_off) = self.geo.meta_slot(c.location);
                self.flusher.active_objects.insert(ov.oid);
                self.flusher.workers[w] = Some(FlushJob {
                    phase: FlushPhase::LockMeta,
                    waiting: false,
                    ov,
                    kind,
                    dest_block: c.location,
                    free_after: Some(c.location),
                    write_off: 0,
                    write_len: 0,
                    staging: None,
                    overlays: Vec::new(),
                    old_bitmap: Vec::new(),
                    bitmap: Vec::new(),
                    ext_bitmap: Vec::new(),
                    meta_block_off,
                    slot_off,
                    meta_buf: None,
                    meta_locked: false,
                });
                return;
            }
            WriteKind::Small => {
                // the flush covers the whole dirty chain up to `ov`: base
                // content is the newest big write below it (or the clean
                // block), every small write above the base overlays it
                let chain: Vec<(WriteKind, u64, u64, u64)> = self
                    .dirty_db
                    .range(ObjectVersion::new(ov.oid, 0)..=ov)
                    .map(|(_, e)| (e.kind, e.location, u64::from(e.offset), u64::from(e.len)))
                    .collect();
                let cut = chain
                    .iter()
                    .rposition(|(k, ..)| *k == WriteKind::Delete)
                    .map_or(0, |i| i + 1);
                let effective = &chain[cut..];
                let base_big = effective
                    .iter()
                    .rposition(|(k, ..)| *k == WriteKind::Big);
                let overlays: Vec<Overlay> = effective[base_big.map_or(0, |i| i + 1)..]
                    .iter()
                    .filter(|(_, _, _, len)| *len > 0)
                    .map(|(_, location, offset, len)| Overlay {
                        offset: *offset,
                        len: *len,
                        location: *location,
                    })
                    .collect();

                // base and destination selection
                let (dest_block, free_after, old_bitmap, zero_base) = if let Some(i) = base_big {
                    let big_block = effective[i].1;
                    let free = clean.map(|c| c.location).filter(|&loc| loc != big_block);
                    (big_block, free, vec![0xFF; bitmap_bytes], false)
                } else if let Some(c) = clean {
                    // a delete below the chain invalidates the old content
                    // but the block itself is reusable
                    (c.location, None, c.bitmap.clone(), cut > 0)
                } else {
                    match self.alloc.allocate() {
                        Some(b) => (b, None, vec![0; bitmap_bytes], true),
                        None => {
                            // no block to land on yet; retry once deletes or
                            // superseding flushes free space
                            self.flusher.queue.push_back(ov);
                            return;
                        }
                    }
                };

                let mut bitmap = if base_big.is_some() {
                    vec![0xFF; bitmap_bytes]
                } else if zero_base {
                    vec![0; bitmap_bytes]
                } else {
                    old_bitmap.clone()
                };
                for o in &overlays {
                    if bitmap.is_empty() {
                        break; // legacy metadata carries no bitmaps
                    }
                    for g in o.offset / gran..=(o.offset + o.len - 1) / gran {
                        bitmap[(g / 8) as usize] |= 1 << (g % 8);
                    }
                }

                let (meta_block_off, slot_off) = self.geo.meta_slot(dest_block);
                let (phase, write_off, write_len, staging) = if overlays.is_empty() {
                    // a bare version marker: metadata update only
                    (FlushPhase::LockMeta, 0, 0, None)
                } else {
                    let gstart = overlays.iter().map(|o| o.offset / gran * gran).min()
                        .expect("overlays nonempty");
                    let gend = overlays
                        .iter()
                        .map(|o| (o.offset + o.len).div_ceil(gran) * gran)
                        .max()
                        .expect("overlays nonempty");
                    let staging = AlignedBuffer::new((gend - gstart) as usize);
                    let phase = if zero_base {
                        FlushPhase::WriteData // composed below, no read needed
                    } else {
                        FlushPhase::ReadData
                    };
                    (phase, gstart, gend - gstart, Some(staging))
                };

                let mut job = FlushJob {
                    phase,
                    waiting: false,
                    ov,
                    kind,
                    dest_block,
                    free_after,
                    write_off,
                    write_len,
                    staging,
                    overlays,
                    old_bitmap,
                    bitmap,
                    ext_bitmap: ext,
                    meta_block_off,
                    slot_off,
                    meta_buf: None,
                    meta_locked: false,
                };
                if job.phase == FlushPhase::WriteData {
                    self.compose_staging(&mut job, true);
                }
                job
            }
        };
        self.flusher.active_objects.insert(ov.oid);
        self.flusher.workers[w] = Some(job);
        trace!(%ov, ?kind, worker = w, "flush started");
    }

    /// Lay the chain's payloads over the staging buffer; `zero_base` means
    /// the buffer starts from zeros instead of block content read earlier
    fn compose_staging(&self, job: &mut FlushJob, zero_base: bool) {
        let gran = self.geo.bitmap_granularity;
        let staging = job.staging.as_mut().expect("staging present");
        if !zero_base {
            // granules the base never wrote read as zeros
            for g in job.write_off / gran..(job.write_off + job.write_len) / gran {
                let set = job.old_bitmap.is_empty()
                    || job.old_bitmap[(g / 8) as usize] >> (g % 8) & 1 == 1;
                if !set {
                    let at = ((g * gran) - job.write_off) as usize;
                    staging.as_mut_slice()[at..at + gran as usize].fill(0);
                }
            }
        }
        for o in &job.overlays {
            let payload =
                &self.journal.buffer()[o.location as usize..(o.location + o.len) as usize];
            let at = (o.offset - job.write_off) as usize;
            staging.as_mut_slice()[at..at + o.len as usize].copy_from_slice(payload);
        }
    }

    /// Issue the current phase's I/O if possible
    fn advance_flush_worker(&mut self, w: usize) {
        let mut job = self.flusher.workers[w].take().expect("worker busy");
        loop {
            if job.waiting {
                break;
            }
            match job.phase {
                FlushPhase::ReadData => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    let staging = job.staging.as_mut().expect("merge staging present");
                    self.ring.prep_read(
                        self.data_file.fd(),
                        self.geo.block_offset(job.dest_block) + job.write_off,
                        staging.as_mut_ptr(),
                        job.write_len as u32,
                        IoTarget::Flusher(w),
                    );
                    job.waiting = true;
                }
                FlushPhase::WriteData => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    let staging = job.staging.as_ref().expect("staging present");
                    self.ring.prep_write(
                        self.data_file.fd(),
                        self.geo.block_offset(job.dest_block) + job.write_off,
                        staging.as_ptr(),
                        job.write_len as u32,
                        IoTarget::Flusher(w),
                    );
                    job.waiting = true;
                }
                FlushPhase::SyncData => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    self.ring.prep_fsync(self.data_file.fd(), IoTarget::Flusher(w));
                    job.waiting = true;
                }
                FlushPhase::LockMeta => {
                    if self.flusher.active_meta_blocks.contains(&job.meta_block_off) {
                        break; // a peer owns the block; retry next tick
                    }
                    self.flusher.active_meta_blocks.insert(job.meta_block_off);
                    job.meta_locked = true;
                    job.phase = if self.meta_cache.is_some() {
                        FlushPhase::WriteMeta
                    } else {
                        FlushPhase::ReadMeta
                    };
                }
                FlushPhase::ReadMeta => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    let buf = job
                        .meta_buf
                        .get_or_insert_with(|| AlignedBuffer::new(self.geo.meta_block_size as usize));
                    self.ring.prep_read(
                        self.meta_file.fd(),
                        job.meta_block_off,
                        buf.as_mut_ptr(),
                        self.geo.meta_block_size as u32,
                        IoTarget::Flusher(w),
                    );
                    job.waiting = true;
                }
                FlushPhase::WriteMeta => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    let record = (job.kind != WriteKind::Delete).then(|| CleanEntryRecord {
                        oid: job.ov.oid,
                        version: job.ov.version,
                        bitmap: job.bitmap.clone(),
                        ext_bitmap: job.ext_bitmap.clone(),
                    });
                    let ptr = if let Some(cache) = self.meta_cache.as_mut() {
                        let base = (job.meta_block_off - self.geo.meta_entries_start()) as usize;
                        let slot = &mut cache.as_mut_slice()[base + job.slot_off..];
                        match &record {
                            Some(rec) => encode_clean_entry(slot, rec, &self.geo),
                            None => slot[..self.geo.clean_entry_size].fill(0),
                        }
                        unsafe { cache.as_ptr().add(base) }
                    } else {
                        let buf = job.meta_buf.as_mut().expect("meta block read first");
                        let slot = &mut buf.as_mut_slice()[job.slot_off..];
                        match &record {
                            Some(rec) => encode_clean_entry(slot, rec, &self.geo),
                            None => slot[..self.geo.clean_entry_size].fill(0),
                        }
                        buf.as_ptr()
                    };
                    self.ring.prep_write(
                        self.meta_file.fd(),
                        job.meta_block_off,
                        ptr,
                        self.geo.meta_block_size as u32,
                        IoTarget::Flusher(w),
                    );
                    job.waiting = true;
                }
                FlushPhase::SyncMeta => {
                    if self.ring.space_left() == 0 {
                        break;
                    }
                    self.ring.prep_fsync(self.meta_file.fd(), IoTarget::Flusher(w));
                    job.waiting = true;
                }
                FlushPhase::Finish => {
                    if job.meta_locked {
                        self.flusher.active_meta_blocks.remove(&job.meta_block_off);
                    }
                    self.flusher.active_objects.remove(&job.ov.oid);
                    self.finalize_flush_dbs(
                        job.ov,
                        job.kind,
                        job.dest_block,
                        job.free_after,
                        std::mem::take(&mut job.bitmap),
                        std::mem::take(&mut job.ext_bitmap),
                    );
                    trace!(ov = %job.ov, worker = w, "flush finished");
                    return; // worker back to idle
                }
            }
        }
        self.flusher.workers[w] = Some(job);
    }

    /// A flusher I/O completed: post-process and move to the next phase
    pub(crate) fn flusher_handle_event(&mut self, w: usize, result: i32) {
        if result < 0 {
            self.fatal_io_error("flush I/O", result);
        }
        let mut job = self.flusher.workers[w].take().expect("worker busy");
        debug_assert!(job.waiting);
        job.waiting = false;
        job.phase = match job.phase {
            FlushPhase::ReadData => {
                self.compose_staging(&mut job, false);
                FlushPhase::WriteData
            }
            FlushPhase::WriteData => FlushPhase::SyncData,
            FlushPhase::SyncData => FlushPhase::LockMeta,
            FlushPhase::ReadMeta => FlushPhase::WriteMeta,
            FlushPhase::WriteMeta => FlushPhase::SyncMeta,
            FlushPhase::SyncMeta => FlushPhase::Finish,
            FlushPhase::LockMeta | FlushPhase::Finish => {
                unreachable!("BUG: no I/O in flight for this phase")
            }
        };
        self.flusher.workers[w] = Some(job);
        self.advance_flush_worker(w);
    }

    /// Metadata is durable: apply the promotion to the in-memory DBs and
    /// release everything the flushed chain held
    fn finalize_flush_dbs(
        &mut self,
        ov: ObjectVersion,
        kind: WriteKind,
        dest_block: u64,
        free_after: Option<u64>,
        bitmap: Vec<u8>,
        ext_bitmap: Vec<u8>,
    ) {
        match kind {
            WriteKind::Delete => {
                self.clean_db.remove(&ov.oid);
            }
            WriteKind::Big | WriteKind::Small => {
                self.clean_db.insert(
                    ov.oid,
                    CleanEntry {
                        version: ov.version,
                        location: dest_block,
                        bitmap,
                        ext_bitmap,
                    },
                );
            }
        }
        if let Some(block) = free_after {
            self.alloc.free(block);
        }

        // the flushed version and everything below it leaves the dirty DB;
        // the big write whose block became the clean location keeps it
        let superseded: Vec<ObjectVersion> = self
            .dirty_db
            .range(ObjectVersion::new(ov.oid, 0)..=ov)
            .map(|(v, _)| *v)
            .collect();
        for old in superseded {
            let keep_block = kind != WriteKind::Delete
                && self
                    .dirty_db
                    .get(&old)
                    .is_some_and(|e| e.kind == WriteKind::Big && e.location == dest_block);
            self.erase_dirty_entry(old, !keep_block);
        }
        self.flusher.trim_wanted = true;
        debug!(%ov, ?kind, "dirty entry promoted");
    }

    /// Start or continue the journal trim state machine
    fn trim_tick(&mut self) {
        match self.flusher.trim {
            TrimState::Idle => {
                if !self.flusher.trim_wanted || self.ring.space_left() == 0 {
                    return;
                }
                self.flusher.trim_wanted = false;
                let Some(new_start) = self.journal.trim_target() else {
                    return;
                };
                self.journal.build_start_anchor(new_start);
                let (ptr, dev_off) = self.journal.begin_sector_flush(0);
                self.ring.prep_write(
                    self.journal_file.fd(),
                    dev_off,
                    ptr,
                    self.geo.meta_block_size as u32,
                    IoTarget::Trim,
                );
                self.flusher.trim = TrimState::WriteAnchor { new_start };
            }
            TrimState::NeedFsync { new_start } => {
                if self.ring.space_left() == 0 {
                    return;
                }
                self.ring.prep_fsync(self.journal_file.fd(), IoTarget::Trim);
                self.flusher.trim = TrimState::SyncAnchor { new_start };
            }
            _ => {}
        }
    }

    pub(crate) fn trim_handle_event(&mut self, result: i32) {
        if result < 0 {
            self.fatal_io_error("journal trim", result);
        }
        match self.flusher.trim {
            TrimState::WriteAnchor { new_start } => {
                self.journal.end_sector_flush(0);
                self.flusher.trim = TrimState::NeedFsync { new_start };
                self.trim_tick();
            }
            TrimState::SyncAnchor { new_start } => {
                self.journal.apply_trim(new_start);
                self.flusher.trim = TrimState::Idle;
                debug!(new_start, "journal trimmed");
            }
            _ => unreachable!("BUG: trim completion in unexpected state"),
        }
    }
}
