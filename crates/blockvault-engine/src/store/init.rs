//! One-shot recovery readers
//!
//! Opening a store runs two passes: a metadata scan that rebuilds the clean
//! DB and allocator (duplicate entries for one object resolve to the highest
//! version, the loser's block stays free), then a journal replay that
//! rebuilds the dirty DB. Replay walks the CRC chain from the anchor's
//! start position and truncates at the first mismatch; everything that
//! verifies replays at durability SYNCED, with later STABLE/ROLLBACK
//! entries applied on top.

use super::{BlockStore, DirtyEntry, Durability, WriteKind};
use crate::journal::{decode_entry, Decoded, JournalEntry, JE_HEADER_SIZE};
use crate::layout::decode_clean_entry;
use crate::raw_io::AlignedBuffer;
use blockvault_common::{Error, ObjectVersion, Result};
use tracing::{debug, warn};

impl BlockStore {
    /// Rebuild the clean DB and allocator from the metadata region
    pub(crate) fn init_metadata(&mut self) -> Result<()> {
        let entry_blocks = self.geo.meta_entry_blocks();
        let block_size = self.geo.meta_block_size as usize;
        let region_start = self.geo.meta_entries_start();

        // read granularity: everything at once when caching, chunks otherwise
        let blocks_per_chunk = if self.cfg.inmemory_metadata {
            entry_blocks
        } else {
            256.min(entry_blocks)
        };
        let mut chunk = AlignedBuffer::new(blocks_per_chunk as usize * block_size);

        let mut block_no = 0;
        while block_no < entry_blocks {
            let count = blocks_per_chunk.min(entry_blocks - block_no);
            let bytes = count as usize * block_size;
            self.meta_file.read_at(
                region_start + block_no * self.geo.meta_block_size,
                &mut chunk.as_mut_slice()[..bytes],
            )?;
            for i in 0..count {
                let block = &chunk.as_slice()[i as usize * block_size..][..block_size];
                self.load_meta_block(block_no + i, block);
            }
            block_no += count;
        }
        if self.cfg.inmemory_metadata {
            self.meta_cache = Some(chunk);
        }
        debug!(
            entries = self.clean_db.len(),
            used = self.geo.block_count - self.alloc.get_free_count(),
            "metadata scan complete"
        );
        Ok(())
    }

    fn load_meta_block(&mut self, block_no: u64, block: &[u8]) {
        for slot in 0..self.geo.entries_per_block {
            let block_idx = block_no * self.geo.entries_per_block + slot;
            if block_idx >= self.geo.block_count {
                return;
            }
            let at = (slot as usize) * self.geo.clean_entry_size;
            let Some(rec) = decode_clean_entry(&block[at..], &self.geo) else {
                continue;
            };
            let existing = self.clean_db.get(&rec.oid).map(|c| (c.version, c.location));
            match existing {
                Some((version, _)) if version >= rec.version => {
                    // stale record left behind by a flush; its block is free
                    warn!(oid = %rec.oid, version = rec.version, "dropping stale metadata entry");
                }
                other => {
                    if let Some((_, location)) = other {
                        self.alloc.free(location);
                    }
                    self.alloc.mark_used(block_idx);
                    self.clean_db.insert(
                        rec.oid,
                        super::CleanEntry {
                            version: rec.version,
                            location: block_idx,
                            bitmap: rec.bitmap,
                            ext_bitmap: rec.ext_bitmap,
                        },
                    );
                }
            }
        }
    }

    /// Replay the journal into the dirty DB
    pub(crate) fn replay_journal(&mut self) -> Result<()> {
        let ss = self.geo.meta_block_size;
        let journal_len = self.geo.journal_len;
        let region = journal_len as usize;
        {
            let buf = self.journal.buffer_mut();
            // mirror the whole region so in-flight reads and the CRC chain
            // work off the same bytes the writer will extend
            let (head, _) = buf.split_at_mut(region);
            self.journal_file.read_at(self.geo.journal_offset, head)?;
        }

        let anchor = match decode_entry(&self.journal.buffer()[..ss as usize]) {
            Decoded::Entry(de) => de,
            _ => {
                return Err(Error::JournalCorrupt(
                    "missing or corrupt START anchor".into(),
                ))
            }
        };
        let JournalEntry::Start {
            journal_start,
            seq,
            crc32_begin,
        } = anchor.entry
        else {
            return Err(Error::JournalCorrupt(
                "first journal block is not a START anchor".into(),
            ));
        };
        if journal_start < ss || journal_start >= journal_len || journal_start % ss != 0 {
            return Err(Error::JournalCorrupt(format!(
                "anchor points outside the journal: {journal_start:#x}"
            )));
        }

        let ring_len = journal_len - ss;
        let rel = |p: u64| (p + ring_len - journal_start) % ring_len;
        let wrap = |p: u64| if p >= journal_len { ss } else { p };

        let mut crc32_last = crc32_begin;
        let mut pos = journal_start;
        let mut next_free = journal_start;
        let mut cur_sector = None;
        let mut in_sector_pos = 0usize;
        let mut replayed = 0usize;
        let mut done = false;

        while !done {
            let sector = self.journal.buffer()[pos as usize..(pos + ss) as usize].to_vec();
            let mut spos = 0usize;
            let mut entries_here = 0usize;
            let mut candidates = vec![wrap(pos + ss)];

            while spos + JE_HEADER_SIZE <= ss as usize {
                match decode_entry(&sector[spos..]) {
                    Decoded::End => break,
                    Decoded::BadCrc => {
                        warn!(pos, spos, "journal truncated at CRC mismatch");
                        done = true;
                        break;
                    }
                    Decoded::Entry(de) => {
                        if de.crc32_prev != crc32_last {
                            warn!(pos, spos, "journal truncated at broken CRC chain");
                            done = true;
                            break;
                        }
                        crc32_last = de.crc32;
                        self.replay_entry(pos, &de.entry, &mut candidates, wrap)?;
                        spos += de.size;
                        entries_here += 1;
                        replayed += 1;
                    }
                }
            }

            if entries_here > 0 {
                cur_sector = Some(pos);
                in_sector_pos = spos;
                let next = candidates
                    .into_iter()
                    .max_by_key(|&c| rel(c))
                    .expect("at least one candidate");
                next_free = next;
                if !done {
                    if next == journal_start {
                        // a full lap would mean the chain ate its own tail
                        done = true;
                    } else {
                        pos = next;
                    }
                }
            } else {
                next_free = pos;
                done = true;
            }
        }

        self.journal
            .restore_state(journal_start, next_free, cur_sector, in_sector_pos, crc32_last, seq);
        if let Some(cur) = cur_sector {
            // stale bytes after the last valid entry must read as padding
            let from = (cur as usize) + in_sector_pos;
            let to = (cur + ss) as usize;
            self.journal.buffer_mut()[from..to].fill(0);
        }

        // feed the flusher and rebuild the unstable map
        let eligible: Vec<ObjectVersion> = self
            .dirty_db
            .iter()
            .filter(|(_, e)| e.stable && e.dur == Durability::Synced)
            .map(|(ov, _)| *ov)
            .collect();
        for ov in eligible {
            self.flusher.enqueue(ov);
        }
        for (ov, e) in &self.dirty_db {
            if !e.stable {
                let latest = self.unstable_writes.entry(ov.oid).or_insert(0);
                *latest = (*latest).max(ov.version);
            }
        }
        debug!(
            replayed,
            dirty = self.dirty_db.len(),
            used_start = journal_start,
            next_free,
            "journal replay complete"
        );
        Ok(())
    }

    fn replay_entry(
        &mut self,
        sector_pos: u64,
        entry: &JournalEntry,
        candidates: &mut Vec<u64>,
        wrap: impl Fn(u64) -> u64,
    ) -> Result<()> {
        let ss = self.geo.meta_block_size;
        match entry {
            JournalEntry::SmallWrite {
                ov,
                offset,
                len,
                data_offset,
            } => {
                let run = self.journal.payload_run_len(*len);
                if *len > 0 {
                    if *data_offset < ss
                        || *data_offset % ss != 0
                        || *data_offset + run > self.geo.journal_len
                    {
                        return Err(Error::JournalCorrupt(format!(
                            "small write payload outside the journal: {data_offset:#x}"
                        )));
                    }
                    candidates.push(wrap(*data_offset + run));
                }
                if self.replay_superseded(ov) {
                    return Ok(());
                }
                self.dirty_db.insert(
                    *ov,
                    DirtyEntry {
                        kind: WriteKind::Small,
                        dur: Durability::Synced,
                        stable: false,
                        location: *data_offset,
                        offset: *offset,
                        len: *len,
                        journal_sector: Some(sector_pos),
                        pending_buf: None,
                    },
                );
                self.journal.restore_usage(sector_pos);
                for i in 0..run / ss {
                    self.journal.restore_usage(*data_offset + i * ss);
                }
            }
            JournalEntry::BigWrite { ov, location } => {
                if *location >= self.geo.block_count {
                    return Err(Error::JournalCorrupt(format!(
                        "big write beyond the data device: block {location}"
                    )));
                }
                if self.replay_superseded(ov) {
                    return Ok(());
                }
                self.dirty_db.insert(
                    *ov,
                    DirtyEntry {
                        kind: WriteKind::Big,
                        dur: Durability::Synced,
                        stable: false,
                        location: *location,
                        offset: 0,
                        len: self.geo.block_size as u32,
                        journal_sector: Some(sector_pos),
                        pending_buf: None,
                    },
                );
                self.journal.restore_usage(sector_pos);
                self.alloc.mark_used(*location);
            }
            JournalEntry::Delete { ov } => {
                let shadows_clean = self
                    .clean_db
                    .get(&ov.oid)
                    .is_some_and(|c| c.version < ov.version);
                let shadows_dirty = self
                    .dirty_db
                    .range(ObjectVersion::new(ov.oid, 0)..*ov)
                    .next()
                    .is_some();
                if shadows_clean || shadows_dirty {
                    self.dirty_db.insert(
                        *ov,
                        DirtyEntry {
                            kind: WriteKind::Delete,
                            dur: Durability::Synced,
                            stable: true,
                            location: 0,
                            offset: 0,
                            len: 0,
                            journal_sector: Some(sector_pos),
                            pending_buf: None,
                        },
                    );
                    self.journal.restore_usage(sector_pos);
                }
            }
            JournalEntry::Stable { versions } => {
                for ov in versions {
                    if let Some(e) = self.dirty_db.get_mut(ov) {
                        e.stable = true;
                    }
                }
            }
            JournalEntry::Rollback { versions } => {
                let mut sorted = versions.clone();
                sorted.sort();
                for ov in sorted.into_iter().rev() {
                    self.erase_dirty_entry(ov, true);
                }
            }
            JournalEntry::Start { .. } => {
                return Err(Error::JournalCorrupt(
                    "START anchor inside the journal stream".into(),
                ));
            }
        }
        Ok(())
    }

    /// A journal record whose version the clean DB already covers was
    /// flushed before the crash; it replays as a no-op
    fn replay_superseded(&self, ov: &ObjectVersion) -> bool {
        self.clean_db
            .get(&ov.oid)
            .is_some_and(|c| c.version >= ov.version)
    }
}
