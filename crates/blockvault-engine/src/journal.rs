//! Circular write-ahead journal
//!
//! The journal region is a ring of fixed-size sectors, mirrored completely in
//! memory. Sector 0 is reserved for the START anchor; entries are packed into
//! sectors from `used_start` forward, each entry chained to its predecessor
//! by CRC32C. Small-write payloads claim whole sectors of their own right
//! after the sector holding their entry, so payload data is always
//! sector-aligned on disk and can straddle sector boundaries.
//!
//! Entry format:
//! ```text
//! +-------+------+------+------------+--------+------+
//! | Magic | Type | Size | CRC32 prev | CRC32  | Body |
//! | 2B    | 2B   | 4B   | 4B         | 4B     | var  |
//! +-------+------+------+------------+--------+------+
//! ```
//!
//! In-memory bookkeeping per sector: `usage_count` (entries or payload
//! resident in the sector that a dirty entry still depends on; the sector
//! cannot be reused while nonzero), `dirty` (buffer differs from disk) and
//! `flush_count` (write SQEs in flight against the sector).

use crate::raw_io::AlignedBuffer;
use blockvault_common::{ObjectId, ObjectVersion};
use bytes::{Buf, BufMut};

/// Journal entry magic ("eJ" little-endian)
pub const JE_MAGIC: u16 = 0x4A65;

/// Fixed entry header length
pub const JE_HEADER_SIZE: usize = 16;

/// Encoded size of a START entry
pub const JE_START_SIZE: usize = JE_HEADER_SIZE + 20;

/// Encoded size of a SMALL_WRITE entry (payload lives in its own sectors)
pub const JE_SMALL_WRITE_SIZE: usize = JE_HEADER_SIZE + 40;

/// Encoded size of a BIG_WRITE entry
pub const JE_BIG_WRITE_SIZE: usize = JE_HEADER_SIZE + 32;

/// Encoded size of a DELETE entry
pub const JE_DELETE_SIZE: usize = JE_HEADER_SIZE + 24;

/// Entry type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum EntryType {
    Start = 1,
    SmallWrite = 2,
    BigWrite = 3,
    Delete = 4,
    Stable = 5,
    Rollback = 6,
}

impl EntryType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::SmallWrite),
            3 => Some(Self::BigWrite),
            4 => Some(Self::Delete),
            5 => Some(Self::Stable),
            6 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// A decoded journal entry body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// Recovery anchor: where replay starts and which CRC opens the chain
    Start {
        journal_start: u64,
        seq: u64,
        crc32_begin: u32,
    },
    /// Write whose payload lives in journal sectors at `data_offset`
    SmallWrite {
        ov: ObjectVersion,
        offset: u32,
        len: u32,
        data_offset: u64,
    },
    /// Write whose payload is already on the data device
    BigWrite { ov: ObjectVersion, location: u64 },
    Delete { ov: ObjectVersion },
    Stable { versions: Vec<ObjectVersion> },
    Rollback { versions: Vec<ObjectVersion> },
}

impl JournalEntry {
    /// Encoded size including the header
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Start { .. } => JE_START_SIZE,
            Self::SmallWrite { .. } => JE_SMALL_WRITE_SIZE,
            Self::BigWrite { .. } => JE_BIG_WRITE_SIZE,
            Self::Delete { .. } => JE_DELETE_SIZE,
            Self::Stable { versions } | Self::Rollback { versions } => {
                JE_HEADER_SIZE + 8 + 24 * versions.len()
            }
        }
    }

    fn entry_type(&self) -> EntryType {
        match self {
            Self::Start { .. } => EntryType::Start,
            Self::SmallWrite { .. } => EntryType::SmallWrite,
            Self::BigWrite { .. } => EntryType::BigWrite,
            Self::Delete { .. } => EntryType::Delete,
            Self::Stable { .. } => EntryType::Stable,
            Self::Rollback { .. } => EntryType::Rollback,
        }
    }
}

/// Encoded size of a STABLE/ROLLBACK entry carrying `n` versions
#[must_use]
pub const fn je_version_list_size(n: usize) -> usize {
    JE_HEADER_SIZE + 8 + 24 * n
}

/// Most versions one STABLE/ROLLBACK entry can carry within one sector
#[must_use]
pub const fn je_version_list_cap(sector_size: usize) -> usize {
    (sector_size - JE_HEADER_SIZE - 8) / 24
}

/// Serialize `entry` into `buf`, chaining from `crc32_prev`; returns the
/// entry's own CRC
pub fn encode_entry(buf: &mut [u8], entry: &JournalEntry, crc32_prev: u32) -> u32 {
    let size = entry.encoded_size();
    debug_assert!(buf.len() >= size);
    {
        let mut w = &mut buf[..size];
        w.put_u16_le(JE_MAGIC);
        w.put_u16_le(entry.entry_type() as u16);
        w.put_u32_le(size as u32);
        w.put_u32_le(crc32_prev);
        w.put_u32_le(0); // crc placeholder
        match entry {
            JournalEntry::Start {
                journal_start,
                seq,
                crc32_begin,
            } => {
                w.put_u64_le(*journal_start);
                w.put_u64_le(*seq);
                w.put_u32_le(*crc32_begin);
            }
            JournalEntry::SmallWrite {
                ov,
                offset,
                len,
                data_offset,
            } => {
                w.put_u64_le(ov.oid.inode);
                w.put_u64_le(ov.oid.stripe);
                w.put_u64_le(ov.version);
                w.put_u32_le(*offset);
                w.put_u32_le(*len);
                w.put_u64_le(*data_offset);
            }
            JournalEntry::BigWrite { ov, location } => {
                w.put_u64_le(ov.oid.inode);
                w.put_u64_le(ov.oid.stripe);
                w.put_u64_le(ov.version);
                w.put_u64_le(*location);
            }
            JournalEntry::Delete { ov } => {
                w.put_u64_le(ov.oid.inode);
                w.put_u64_le(ov.oid.stripe);
                w.put_u64_le(ov.version);
            }
            JournalEntry::Stable { versions } | JournalEntry::Rollback { versions } => {
                w.put_u32_le(versions.len() as u32);
                w.put_u32_le(0);
                for v in versions {
                    w.put_u64_le(v.oid.inode);
                    w.put_u64_le(v.oid.stripe);
                    w.put_u64_le(v.version);
                }
            }
        }
    }
    let crc = crc32c::crc32c(&buf[..size]);
    buf[12..16].copy_from_slice(&crc.to_le_bytes());
    crc
}

/// A successfully decoded entry with its chain metadata
#[derive(Clone, Debug)]
pub struct DecodedEntry {
    pub entry: JournalEntry,
    pub size: usize,
    pub crc32: u32,
    pub crc32_prev: u32,
}

/// Outcome of decoding one position in a sector
#[derive(Debug)]
pub enum Decoded {
    /// Valid entry
    Entry(DecodedEntry),
    /// Zero padding or a malformed header: end of entries in this sector
    End,
    /// Well-formed header whose checksum does not match: truncation point
    BadCrc,
}

/// Decode the entry at the head of `buf`
#[must_use]
pub fn decode_entry(buf: &[u8]) -> Decoded {
    if buf.len() < JE_HEADER_SIZE {
        return Decoded::End;
    }
    let mut r = &buf[..];
    let magic = r.get_u16_le();
    let etype = r.get_u16_le();
    let size = r.get_u32_le() as usize;
    let crc32_prev = r.get_u32_le();
    let crc32 = r.get_u32_le();

    let Some(etype) = EntryType::from_u16(etype) else {
        return Decoded::End;
    };
    if magic != JE_MAGIC || size < JE_HEADER_SIZE || size > buf.len() {
        return Decoded::End;
    }

    // verify the CRC over the entry with its own crc field zeroed
    let mut check = buf[..size].to_vec();
    check[12..16].fill(0);
    if crc32c::crc32c(&check) != crc32 {
        return Decoded::BadCrc;
    }

    let mut r = &buf[JE_HEADER_SIZE..size];
    let entry = match etype {
        EntryType::Start => {
            if size != JE_START_SIZE {
                return Decoded::End;
            }
            JournalEntry::Start {
                journal_start: r.get_u64_le(),
                seq: r.get_u64_le(),
                crc32_begin: r.get_u32_le(),
            }
        }
        EntryType::SmallWrite => {
            if size != JE_SMALL_WRITE_SIZE {
                return Decoded::End;
            }
            JournalEntry::SmallWrite {
                ov: ObjectVersion::new(
                    ObjectId::new(r.get_u64_le(), r.get_u64_le()),
                    r.get_u64_le(),
                ),
                offset: r.get_u32_le(),
                len: r.get_u32_le(),
                data_offset: r.get_u64_le(),
            }
        }
        EntryType::BigWrite => {
            if size != JE_BIG_WRITE_SIZE {
                return Decoded::End;
            }
            JournalEntry::BigWrite {
                ov: ObjectVersion::new(
                    ObjectId::new(r.get_u64_le(), r.get_u64_le()),
                    r.get_u64_le(),
                ),
                location: r.get_u64_le(),
            }
        }
        EntryType::Delete => {
            if size != JE_DELETE_SIZE {
                return Decoded::End;
            }
            JournalEntry::Delete {
                ov: ObjectVersion::new(
                    ObjectId::new(r.get_u64_le(), r.get_u64_le()),
                    r.get_u64_le(),
                ),
            }
        }
        EntryType::Stable | EntryType::Rollback => {
            let count = r.get_u32_le() as usize;
            let _reserved = r.get_u32_le();
            if size != je_version_list_size(count) {
                return Decoded::End;
            }
            let mut versions = Vec::with_capacity(count);
            for _ in 0..count {
                versions.push(ObjectVersion::new(
                    ObjectId::new(r.get_u64_le(), r.get_u64_le()),
                    r.get_u64_le(),
                ));
            }
            if etype == EntryType::Stable {
                JournalEntry::Stable { versions }
            } else {
                JournalEntry::Rollback { versions }
            }
        }
    };
    Decoded::Entry(DecodedEntry {
        entry,
        size,
        crc32,
        crc32_prev,
    })
}

/// In-memory bookkeeping for one journal sector
#[derive(Clone, Copy, Debug, Default)]
pub struct SectorInfo {
    pub usage_count: u32,
    pub dirty: bool,
    pub flush_count: u32,
}

/// Result of a journal space check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceCheck {
    Ok,
    /// The tail has not been trimmed past the sectors we need; wait until
    /// `used_start` moves off the recorded value
    WaitJournal { used_start: u64 },
    /// A sector we need to reuse still has a write in flight
    WaitBuffer,
}

/// Where an appended entry landed
#[derive(Clone, Copy, Debug)]
pub struct AppendedEntry {
    /// In-region offset of the sector holding the entry
    pub sector: u64,
    /// In-region offset of the payload run, when one was claimed
    pub data_offset: Option<u64>,
}

/// The journal ring and its in-memory mirror
pub struct Journal {
    /// Byte offset of the journal region on the journal device
    pub device_offset: u64,
    /// Region length in bytes
    pub len: u64,
    /// Sector size (one metadata block)
    pub sector_size: u64,
    buffer: AlignedBuffer,
    sectors: Vec<SectorInfo>,
    /// Oldest in-region offset still needed by an unflushed entry
    pub used_start: u64,
    /// Next in-region offset handed to a new allocation
    pub next_free: u64,
    /// Sector currently accumulating entries
    cur_sector: Option<u64>,
    in_sector_pos: usize,
    /// CRC of the most recently appended entry
    pub crc32_last: u32,
    /// Sequence number of the current START anchor
    pub start_seq: u64,
    total_usage: u64,
}

impl Journal {
    /// Create an empty journal mirror for a region of `len` bytes
    #[must_use]
    pub fn new(device_offset: u64, len: u64, sector_size: u64) -> Self {
        let sector_count = (len / sector_size) as usize;
        Self {
            device_offset,
            len,
            sector_size,
            buffer: AlignedBuffer::new(len as usize),
            sectors: vec![SectorInfo::default(); sector_count],
            used_start: sector_size,
            next_free: sector_size,
            cur_sector: None,
            in_sector_pos: 0,
            crc32_last: 0,
            start_seq: 0,
            total_usage: 0,
        }
    }

    /// Length of the circulating part of the ring (everything but the anchor)
    #[must_use]
    fn ring_len(&self) -> u64 {
        self.len - self.sector_size
    }

    fn sector_idx(&self, pos: u64) -> usize {
        (pos / self.sector_size) as usize
    }

    /// Sector bookkeeping at an in-region offset
    #[must_use]
    pub fn sector(&self, pos: u64) -> &SectorInfo {
        &self.sectors[self.sector_idx(pos)]
    }

    /// Next sector position in ring order
    #[must_use]
    pub fn advance(&self, pos: u64) -> u64 {
        let next = pos + self.sector_size;
        if next >= self.len {
            self.sector_size
        } else {
            next
        }
    }

    /// Bytes available for new allocations
    fn free_space(&self) -> u64 {
        if self.next_free == self.used_start {
            self.ring_len()
        } else {
            (self.used_start + self.ring_len() - self.next_free) % self.ring_len()
        }
    }

    /// Mutable view of the full journal mirror (init replay fills it)
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Read-only view of the journal mirror
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Total usage references across all sectors
    #[must_use]
    pub fn total_usage(&self) -> u64 {
        self.total_usage
    }

    /// Simulate the allocations `entry_sizes` + `payload_lens` would make and
    /// report whether they fit right now
    #[must_use]
    pub fn check_available(&self, entry_sizes: &[usize], payload_lens: &[u64]) -> SpaceCheck {
        let mut sim_free = self.next_free;
        let mut sim_pos = match self.cur_sector {
            Some(_) => self.in_sector_pos as u64,
            None => self.sector_size,
        };
        let mut need = 0u64;
        let mut positions = Vec::new();

        let mut take_run = |sim_free: &mut u64, need: &mut u64, positions: &mut Vec<u64>, n: u64| {
            if *sim_free + n * self.sector_size > self.len {
                // wrap; the tail sectors are wasted
                *need += self.len - *sim_free;
                *sim_free = self.sector_size;
            }
            for i in 0..n {
                positions.push(*sim_free + i * self.sector_size);
            }
            *need += n * self.sector_size;
            *sim_free += n * self.sector_size;
            if *sim_free >= self.len {
                *sim_free = self.sector_size;
            }
        };

        for &esize in entry_sizes {
            if sim_pos + esize as u64 > self.sector_size {
                take_run(&mut sim_free, &mut need, &mut positions, 1);
                sim_pos = 0;
            }
            sim_pos += esize as u64;
        }
        for &plen in payload_lens {
            if plen > 0 {
                let sectors = plen.div_ceil(self.sector_size);
                take_run(&mut sim_free, &mut need, &mut positions, sectors);
            }
        }

        // keep a one-sector gap so a full ring is distinguishable from empty
        if need + self.sector_size > self.free_space() {
            return SpaceCheck::WaitJournal {
                used_start: self.used_start,
            };
        }
        for pos in positions {
            let s = self.sector(pos % self.len);
            if s.usage_count > 0 {
                return SpaceCheck::WaitJournal {
                    used_start: self.used_start,
                };
            }
            if s.flush_count > 0 {
                return SpaceCheck::WaitBuffer;
            }
        }
        SpaceCheck::Ok
    }

    /// Number of sector writes needed to land the given entries (counting
    /// the partially-filled current sector once)
    #[must_use]
    pub fn count_entry_sectors(&self, entry_sizes: &[usize]) -> usize {
        let mut sectors = 0;
        let mut pos = match self.cur_sector {
            Some(_) => self.in_sector_pos as u64,
            None => self.sector_size,
        };
        let mut counted_current = false;
        for &esize in entry_sizes {
            if pos + esize as u64 > self.sector_size {
                sectors += 1;
                pos = 0;
                counted_current = true;
            } else if !counted_current {
                sectors += 1;
                counted_current = true;
            }
            pos += esize as u64;
        }
        sectors
    }

    fn alloc_run(&mut self, sectors: u64) -> u64 {
        if self.next_free + sectors * self.sector_size > self.len {
            self.next_free = self.sector_size;
        }
        let start = self.next_free;
        self.next_free += sectors * self.sector_size;
        if self.next_free >= self.len {
            self.next_free = self.sector_size;
        }
        start
    }

    fn open_entry_sector(&mut self) {
        let pos = self.alloc_run(1);
        let idx = self.sector_idx(pos);
        debug_assert_eq!(self.sectors[idx].usage_count, 0);
        let range = pos as usize..(pos + self.sector_size) as usize;
        self.buffer.as_mut_slice()[range].fill(0);
        self.cur_sector = Some(pos);
        self.in_sector_pos = 0;
    }

    /// Append an entry (and its payload, for small writes), updating the CRC
    /// chain and sector usage counts. The caller must have passed
    /// [`Journal::check_available`] for the same shape first.
    pub fn append(&mut self, entry: &JournalEntry, payload: Option<&[u8]>) -> AppendedEntry {
        let esize = entry.encoded_size();
        debug_assert!(esize as u64 <= self.sector_size);
        if self.cur_sector.is_none() || self.in_sector_pos + esize > self.sector_size as usize {
            self.open_entry_sector();
        }
        let sector = self.cur_sector.expect("entry sector just opened");

        // claim payload sectors before encoding so the entry can record them
        let data_offset = match payload {
            Some(data) if !data.is_empty() => {
                let sectors = (data.len() as u64).div_ceil(self.sector_size);
                let off = self.alloc_run(sectors);
                let region =
                    &mut self.buffer.as_mut_slice()[off as usize..(off + sectors * self.sector_size) as usize];
                region[..data.len()].copy_from_slice(data);
                region[data.len()..].fill(0);
                for i in 0..sectors {
                    let idx = self.sector_idx(off + i * self.sector_size);
                    self.sectors[idx].usage_count += 1;
                    self.total_usage += 1;
                }
                Some(off)
            }
            _ => None,
        };

        let entry = match (entry, data_offset) {
            (
                JournalEntry::SmallWrite {
                    ov, offset, len, ..
                },
                Some(off),
            ) => JournalEntry::SmallWrite {
                ov: *ov,
                offset: *offset,
                len: *len,
                data_offset: off,
            },
            _ => entry.clone(),
        };

        let at = sector as usize + self.in_sector_pos;
        let crc = encode_entry(
            &mut self.buffer.as_mut_slice()[at..at + esize],
            &entry,
            self.crc32_last,
        );
        self.crc32_last = crc;
        self.in_sector_pos += esize;

        let idx = self.sector_idx(sector);
        self.sectors[idx].usage_count += 1;
        self.sectors[idx].dirty = true;
        self.total_usage += 1;

        AppendedEntry {
            sector,
            data_offset,
        }
    }

    /// Mark a sector write about to be submitted; returns the buffer pointer
    /// and device offset for the SQE
    pub fn begin_sector_flush(&mut self, pos: u64) -> (*const u8, u64) {
        let idx = self.sector_idx(pos);
        self.sectors[idx].dirty = false;
        self.sectors[idx].flush_count += 1;
        (
            unsafe { self.buffer.as_ptr().add(pos as usize) },
            self.device_offset + pos,
        )
    }

    /// A sector write completed
    pub fn end_sector_flush(&mut self, pos: u64) {
        let idx = self.sector_idx(pos);
        debug_assert!(self.sectors[idx].flush_count > 0);
        self.sectors[idx].flush_count -= 1;
    }

    /// Mark a payload-range write about to be submitted
    pub fn begin_range_flush(&mut self, offset: u64, len: u64) -> (*const u8, u64) {
        let sectors = len.div_ceil(self.sector_size);
        for i in 0..sectors {
            let idx = self.sector_idx(offset + i * self.sector_size);
            self.sectors[idx].flush_count += 1;
        }
        (
            unsafe { self.buffer.as_ptr().add(offset as usize) },
            self.device_offset + offset,
        )
    }

    /// A payload-range write completed
    pub fn end_range_flush(&mut self, offset: u64, len: u64) {
        let sectors = len.div_ceil(self.sector_size);
        for i in 0..sectors {
            let idx = self.sector_idx(offset + i * self.sector_size);
            debug_assert!(self.sectors[idx].flush_count > 0);
            self.sectors[idx].flush_count -= 1;
        }
    }

    /// Aligned length of a payload run
    #[must_use]
    pub fn payload_run_len(&self, len: u32) -> u64 {
        u64::from(len).div_ceil(self.sector_size) * self.sector_size
    }

    /// Drop a usage reference held by an entry in the sector at `pos`
    pub fn release_entry(&mut self, pos: u64) {
        let idx = self.sector_idx(pos);
        debug_assert!(self.sectors[idx].usage_count > 0);
        self.sectors[idx].usage_count -= 1;
        self.total_usage -= 1;
    }

    /// Drop the usage references held by a payload run
    pub fn release_range(&mut self, offset: u64, len: u32) {
        let sectors = u64::from(len).div_ceil(self.sector_size);
        for i in 0..sectors {
            self.release_entry(offset + i * self.sector_size);
        }
    }

    /// Compute where `used_start` could advance to, or `None` when it cannot
    /// move
    #[must_use]
    pub fn trim_target(&self) -> Option<u64> {
        let new_start = if self.total_usage == 0 {
            self.cur_sector.unwrap_or(self.next_free)
        } else {
            let mut pos = self.used_start;
            while self.sector(pos).usage_count == 0 {
                pos = self.advance(pos);
            }
            pos
        };
        (new_start != self.used_start).then_some(new_start)
    }

    /// Build the new START anchor in sector 0's buffer for the given trim
    /// target; returns nothing, the caller flushes sector 0
    pub fn build_start_anchor(&mut self, new_start: u64) {
        let crc32_begin = self.chain_crc_at(new_start);
        let entry = JournalEntry::Start {
            journal_start: new_start,
            seq: self.start_seq + 1,
            crc32_begin,
        };
        let range = 0..self.sector_size as usize;
        self.buffer.as_mut_slice()[range].fill(0);
        encode_entry(
            &mut self.buffer.as_mut_slice()[..JE_START_SIZE],
            &entry,
            0,
        );
    }

    /// Apply a trim whose anchor is durable
    pub fn apply_trim(&mut self, new_start: u64) {
        self.used_start = new_start;
        self.start_seq += 1;
    }

    /// The CRC the chain has at `pos`: the `crc32_prev` of the entry stored
    /// there, or the running CRC when the position has no entry yet
    fn chain_crc_at(&self, pos: u64) -> u32 {
        let at = pos as usize;
        let buf = self.buffer.as_slice();
        if let Decoded::Entry(de) = decode_entry(&buf[at..at + self.sector_size as usize]) {
            de.crc32_prev
        } else {
            self.crc32_last
        }
    }

    /// Restore writer state after replay
    pub(crate) fn restore_state(
        &mut self,
        used_start: u64,
        next_free: u64,
        cur_sector: Option<u64>,
        in_sector_pos: usize,
        crc32_last: u32,
        start_seq: u64,
    ) {
        self.used_start = used_start;
        self.next_free = next_free;
        self.cur_sector = cur_sector;
        self.in_sector_pos = in_sector_pos;
        self.crc32_last = crc32_last;
        self.start_seq = start_seq;
    }

    /// Add a usage reference during replay for an entry found at `pos`
    pub(crate) fn restore_usage(&mut self, pos: u64) {
        let idx = self.sector_idx(pos);
        self.sectors[idx].usage_count += 1;
        self.total_usage += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ov(inode: u64, stripe: u64, version: u64) -> ObjectVersion {
        ObjectVersion::new(ObjectId::new(inode, stripe), version)
    }

    #[test]
    fn test_entry_roundtrip_chain() {
        let entries = [
            JournalEntry::BigWrite {
                ov: ov(1, 0, 3),
                location: 99,
            },
            JournalEntry::SmallWrite {
                ov: ov(2, 1, 1),
                offset: 4096,
                len: 8192,
                data_offset: 12288,
            },
            JournalEntry::Delete { ov: ov(3, 0, 5) },
            JournalEntry::Stable {
                versions: vec![ov(1, 0, 3), ov(2, 1, 1)],
            },
        ];

        let mut buf = vec![0u8; 4096];
        let mut pos = 0;
        let mut crc = 0u32;
        for e in &entries {
            crc = encode_entry(&mut buf[pos..], e, crc);
            pos += e.encoded_size();
        }

        let mut pos = 0;
        let mut prev = 0u32;
        for e in &entries {
            match decode_entry(&buf[pos..]) {
                Decoded::Entry(de) => {
                    assert_eq!(&de.entry, e);
                    assert_eq!(de.crc32_prev, prev);
                    prev = de.crc32;
                    pos += de.size;
                }
                other => panic!("expected entry, got {:?}", other),
            }
        }
        // padding after the last entry reads as end-of-entries
        assert!(matches!(decode_entry(&buf[pos..]), Decoded::End));
    }

    #[test]
    fn test_corrupt_entry_detected() {
        let mut buf = vec![0u8; 512];
        encode_entry(
            &mut buf,
            &JournalEntry::Delete { ov: ov(9, 9, 9) },
            0,
        );
        buf[JE_HEADER_SIZE + 2] ^= 0x40;
        assert!(matches!(decode_entry(&buf), Decoded::BadCrc));
    }

    #[test]
    fn test_append_tracks_usage_and_payload() {
        // 16 sectors of 512 bytes
        let mut j = Journal::new(0, 16 * 512, 512);
        let data = vec![0xAB; 700];
        let appended = j.append(
            &JournalEntry::SmallWrite {
                ov: ov(1, 0, 1),
                offset: 0,
                len: 700,
                data_offset: 0,
            },
            Some(&data),
        );

        assert_eq!(appended.sector, 512);
        let data_offset = appended.data_offset.unwrap();
        assert_eq!(data_offset, 1024);
        assert_eq!(j.sector(512).usage_count, 1);
        assert_eq!(j.sector(1024).usage_count, 1);
        assert_eq!(j.sector(1536).usage_count, 1);
        assert!(j.sector(512).dirty);
        assert_eq!(&j.buffer()[1024..1024 + 700], &data[..]);

        // the recorded data_offset survives a decode
        match decode_entry(&j.buffer()[512..1024]) {
            Decoded::Entry(de) => match de.entry {
                JournalEntry::SmallWrite { data_offset: d, .. } => assert_eq!(d, 1024),
                other => panic!("unexpected entry {:?}", other),
            },
            other => panic!("expected entry, got {:?}", other),
        }

        j.release_entry(512);
        j.release_range(data_offset, 700);
        assert_eq!(j.total_usage(), 0);
    }

    #[test]
    fn test_space_check_wait_journal() {
        let mut j = Journal::new(0, 8 * 512, 512);
        // fill most of the ring with payload-bearing writes
        for i in 0..2 {
            let data = vec![1u8; 512];
            let check = j.check_available(&[JE_SMALL_WRITE_SIZE], &[512]);
            assert_eq!(check, SpaceCheck::Ok);
            j.append(
                &JournalEntry::SmallWrite {
                    ov: ov(1, 0, i + 1),
                    offset: 0,
                    len: 512,
                    data_offset: 0,
                },
                Some(&data),
            );
        }
        // 1 anchor + 1 entry sector + 2 payload sectors used, 4 sectors left,
        // minus the full-ring gap: a 4-sector payload cannot fit
        let check = j.check_available(&[JE_SMALL_WRITE_SIZE], &[4 * 512]);
        assert_eq!(
            check,
            SpaceCheck::WaitJournal {
                used_start: j.used_start
            }
        );
    }

    #[test]
    fn test_trim_advances_past_released_sectors() {
        let mut j = Journal::new(0, 8 * 512, 512);
        // 13 delete entries: 12 fill the first entry sector, the 13th opens
        // the next one
        let appended: Vec<_> = (1..=13)
            .map(|v| j.append(&JournalEntry::Delete { ov: ov(1, 0, v) }, None))
            .collect();
        assert_eq!(appended[11].sector, 512);
        assert_eq!(appended[12].sector, 1024);
        assert_eq!(j.trim_target(), None);

        for a in &appended[..12] {
            j.release_entry(a.sector);
        }
        // the first sector is drained; used_start can advance to the second
        let target = j.trim_target().unwrap();
        assert_eq!(target, 1024);
        j.build_start_anchor(target);
        j.apply_trim(target);
        assert_eq!(j.used_start, target);
        assert_eq!(j.start_seq, 1);

        match decode_entry(&j.buffer()[..JE_START_SIZE]) {
            Decoded::Entry(de) => match de.entry {
                JournalEntry::Start { journal_start, seq, .. } => {
                    assert_eq!(journal_start, target);
                    assert_eq!(seq, 1);
                }
                other => panic!("unexpected entry {:?}", other),
            },
            other => panic!("expected anchor, got {:?}", other),
        }
    }
}
