//! On-disk layout
//!
//! Region geometry and the metadata-device format:
//!
//! ```text
//! metadata device, from meta_offset:
//! +-----------------+  block 0
//! |   Superblock    |  zero, magic, version, geometry parameters
//! +-----------------+  block 1 ..
//! |  Clean entries  |  one fixed-size record per data block, holding the
//! |                 |  object that was last stabilized into that block
//! +-----------------+
//! ```
//!
//! A legacy layout without a superblock (entries from block 0, no bitmaps)
//! is still accepted when opening old stores.

use blockvault_common::{Config, Error, ObjectId, Result};
use bytes::{Buf, BufMut};

/// Metadata superblock magic ("BVLTSTOR")
pub const META_MAGIC: u64 = 0x4256_4c54_5354_4f52;

/// Current metadata format version
pub const META_FORMAT_VERSION: u32 = 1;

/// Serialized superblock length (the rest of its block is zero)
pub const SUPERBLOCK_SIZE: usize = 36;

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Metadata entry layout in effect for a store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaFormat {
    /// Superblock at block 0, entries carry allocation + external bitmaps
    Current,
    /// No superblock, entries are object id + version only
    Legacy,
}

/// Superblock stored in the first metadata block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub meta_block_size: u32,
    pub data_block_size: u32,
    pub bitmap_granularity: u32,
    pub checksum: u32,
}

impl Superblock {
    /// Build a superblock for the given configuration
    #[must_use]
    pub fn new(cfg: &Config) -> Self {
        let mut sb = Self {
            magic: META_MAGIC,
            version: META_FORMAT_VERSION,
            meta_block_size: cfg.meta_block_size,
            data_block_size: cfg.data_block_size,
            bitmap_granularity: cfg.bitmap_granularity,
            checksum: 0,
        };
        sb.checksum = sb.compute_checksum();
        sb
    }

    /// Serialize into the head of a metadata block
    pub fn write_to(&self, block: &mut [u8]) {
        let mut buf = &mut block[..SUPERBLOCK_SIZE];
        buf.put_u64_le(0);
        buf.put_u64_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.meta_block_size);
        buf.put_u32_le(self.data_block_size);
        buf.put_u32_le(self.bitmap_granularity);
        buf.put_u32_le(self.checksum);
    }

    /// Parse the first metadata block; `Ok(None)` means the legacy layout
    pub fn read_from(block: &[u8]) -> Result<Option<Self>> {
        if block.len() < SUPERBLOCK_SIZE {
            return Err(Error::Superblock("metadata block too small".into()));
        }
        let mut buf = &block[..SUPERBLOCK_SIZE];
        let zero = buf.get_u64_le();
        let magic = buf.get_u64_le();
        if zero != 0 || magic != META_MAGIC {
            // no superblock: a store formatted by the pre-bitmap layout
            return Ok(None);
        }
        let sb = Self {
            magic,
            version: buf.get_u32_le(),
            meta_block_size: buf.get_u32_le(),
            data_block_size: buf.get_u32_le(),
            bitmap_granularity: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };
        if sb.version != META_FORMAT_VERSION {
            return Err(Error::Superblock(format!(
                "unsupported metadata format version {}",
                sb.version
            )));
        }
        if sb.compute_checksum() != sb.checksum {
            return Err(Error::Superblock("superblock checksum mismatch".into()));
        }
        Ok(Some(sb))
    }

    /// Check the recorded parameters against the runtime configuration
    pub fn check_config(&self, cfg: &Config) -> Result<()> {
        if self.meta_block_size != cfg.meta_block_size
            || self.data_block_size != cfg.data_block_size
            || self.bitmap_granularity != cfg.bitmap_granularity
        {
            return Err(Error::Superblock(format!(
                "on-disk geometry ({}/{}/{}) does not match configuration ({}/{}/{})",
                self.meta_block_size,
                self.data_block_size,
                self.bitmap_granularity,
                cfg.meta_block_size,
                cfg.data_block_size,
                cfg.bitmap_granularity
            )));
        }
        Ok(())
    }

    fn compute_checksum(&self) -> u32 {
        let mut head = [0u8; SUPERBLOCK_SIZE - 4];
        {
            let mut buf = &mut head[..];
            buf.put_u64_le(0);
            buf.put_u64_le(self.magic);
            buf.put_u32_le(self.version);
            buf.put_u32_le(self.meta_block_size);
            buf.put_u32_le(self.data_block_size);
            buf.put_u32_le(self.bitmap_granularity);
        }
        crc32c::crc32c(&head)
    }
}

/// Resolved region geometry for one store instance
#[derive(Clone, Debug)]
pub struct Geometry {
    pub data_offset: u64,
    pub meta_offset: u64,
    pub journal_offset: u64,
    pub journal_len: u64,
    pub block_size: u64,
    pub meta_block_size: u64,
    pub bitmap_granularity: u64,
    pub disk_alignment: u64,
    pub block_count: u64,
    /// Bytes in each half of a clean entry's bitmap
    pub clean_entry_bitmap_size: usize,
    pub clean_entry_size: usize,
    pub entries_per_block: u64,
    pub meta_format: MetaFormat,
}

impl Geometry {
    /// Compute the geometry from configuration and device sizes
    pub fn compute(
        cfg: &Config,
        data_size: u64,
        meta_size: u64,
        journal_size: u64,
        meta_format: MetaFormat,
    ) -> Result<Self> {
        let block_size = u64::from(cfg.data_block_size);
        let meta_block_size = u64::from(cfg.meta_block_size);

        if cfg.data_offset >= data_size {
            return Err(Error::config("data_offset beyond the end of the data device"));
        }
        let block_count = (data_size - cfg.data_offset) / block_size;
        if block_count == 0 {
            return Err(Error::config("data region smaller than one block"));
        }

        let clean_entry_bitmap_size = match meta_format {
            MetaFormat::Current => {
                (cfg.data_block_size / cfg.bitmap_granularity / 8).max(1) as usize
            }
            MetaFormat::Legacy => 0,
        };
        let clean_entry_size = 24 + 2 * clean_entry_bitmap_size;
        let entries_per_block = meta_block_size / clean_entry_size as u64;
        if entries_per_block == 0 {
            return Err(Error::config("clean entry does not fit in a metadata block"));
        }

        let header_blocks = match meta_format {
            MetaFormat::Current => 1,
            MetaFormat::Legacy => 0,
        };
        let meta_len = (header_blocks + block_count.div_ceil(entries_per_block)) * meta_block_size;
        if cfg.meta_offset + meta_len > meta_size {
            return Err(Error::Config(format!(
                "metadata region needs {} bytes at offset {} but the device has {}",
                meta_len, cfg.meta_offset, meta_size
            )));
        }

        if cfg.journal_offset + cfg.journal_size > journal_size {
            return Err(Error::config("journal region beyond the end of the journal device"));
        }

        Ok(Self {
            data_offset: cfg.data_offset,
            meta_offset: cfg.meta_offset,
            journal_offset: cfg.journal_offset,
            journal_len: cfg.journal_size,
            block_size,
            meta_block_size,
            bitmap_granularity: u64::from(cfg.bitmap_granularity),
            disk_alignment: u64::from(cfg.disk_alignment),
            block_count,
            clean_entry_bitmap_size,
            clean_entry_size,
            entries_per_block,
            meta_format,
        })
    }

    /// First metadata block holding clean entries
    #[must_use]
    pub fn meta_entries_start(&self) -> u64 {
        match self.meta_format {
            MetaFormat::Current => self.meta_offset + self.meta_block_size,
            MetaFormat::Legacy => self.meta_offset,
        }
    }

    /// Number of metadata blocks holding clean entries
    #[must_use]
    pub fn meta_entry_blocks(&self) -> u64 {
        self.block_count.div_ceil(self.entries_per_block)
    }

    /// Device offset of the metadata block holding `block_idx`'s entry, and
    /// the entry's byte offset within that block
    #[must_use]
    pub fn meta_slot(&self, block_idx: u64) -> (u64, usize) {
        let block_no = block_idx / self.entries_per_block;
        let slot = block_idx % self.entries_per_block;
        (
            self.meta_entries_start() + block_no * self.meta_block_size,
            (slot * self.clean_entry_size as u64) as usize,
        )
    }

    /// Byte offset of a data block on the data device
    #[must_use]
    pub fn block_offset(&self, block_idx: u64) -> u64 {
        self.data_offset + block_idx * self.block_size
    }
}

/// One decoded clean entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanEntryRecord {
    pub oid: ObjectId,
    pub version: u64,
    pub bitmap: Vec<u8>,
    pub ext_bitmap: Vec<u8>,
}

/// Serialize a clean entry into its metadata slot
pub fn encode_clean_entry(slot: &mut [u8], rec: &CleanEntryRecord, geo: &Geometry) {
    let mut buf = &mut slot[..geo.clean_entry_size];
    buf.put_u64_le(rec.oid.inode);
    buf.put_u64_le(rec.oid.stripe);
    buf.put_u64_le(rec.version);
    if geo.meta_format == MetaFormat::Current {
        debug_assert_eq!(rec.bitmap.len(), geo.clean_entry_bitmap_size);
        buf.put_slice(&rec.bitmap);
        buf.put_slice(&rec.ext_bitmap);
    }
}

/// Parse a metadata slot; `None` when the slot is unused (version 0)
#[must_use]
pub fn decode_clean_entry(slot: &[u8], geo: &Geometry) -> Option<CleanEntryRecord> {
    let mut buf = &slot[..geo.clean_entry_size];
    let inode = buf.get_u64_le();
    let stripe = buf.get_u64_le();
    let version = buf.get_u64_le();
    if version == 0 {
        return None;
    }
    let (bitmap, ext_bitmap) = if geo.meta_format == MetaFormat::Current {
        let mut bitmap = vec![0u8; geo.clean_entry_bitmap_size];
        let mut ext = vec![0u8; geo.clean_entry_bitmap_size];
        buf.copy_to_slice(&mut bitmap);
        buf.copy_to_slice(&mut ext);
        (bitmap, ext)
    } else {
        (Vec::new(), Vec::new())
    };
    Some(CleanEntryRecord {
        oid: ObjectId::new(inode, stripe),
        version,
        bitmap,
        ext_bitmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::with_data_device("/dev/null");
        cfg.data_block_size = 128 * 1024;
        cfg.meta_block_size = 4096;
        cfg.bitmap_granularity = 4096;
        cfg
    }

    #[test]
    fn test_superblock_roundtrip() {
        let cfg = test_config();
        let sb = Superblock::new(&cfg);
        let mut block = vec![0u8; 4096];
        sb.write_to(&mut block);

        let parsed = Superblock::read_from(&block).unwrap().unwrap();
        assert_eq!(parsed, sb);
        parsed.check_config(&cfg).unwrap();
    }

    #[test]
    fn test_superblock_legacy_detection() {
        let block = vec![0u8; 4096];
        assert!(Superblock::read_from(&block).unwrap().is_none());

        let mut garbage = vec![0u8; 4096];
        garbage[0] = 7; // nonzero first word: legacy entry data
        assert!(Superblock::read_from(&garbage).unwrap().is_none());
    }

    #[test]
    fn test_superblock_checksum_mismatch() {
        let sb = Superblock::new(&test_config());
        let mut block = vec![0u8; 4096];
        sb.write_to(&mut block);
        block[20] ^= 0xFF; // corrupt data_block_size
        assert!(Superblock::read_from(&block).is_err());
    }

    #[test]
    fn test_geometry() {
        let cfg = test_config();
        // 1024 data blocks of 128 KiB
        let data_size = 1024u64 * 128 * 1024;
        let geo = Geometry::compute(&cfg, data_size, 1 << 20, 16 << 20, MetaFormat::Current).unwrap();

        assert_eq!(geo.block_count, 1024);
        // 128 KiB / 4 KiB granules = 32 bits = 4 bytes per half
        assert_eq!(geo.clean_entry_bitmap_size, 4);
        assert_eq!(geo.clean_entry_size, 32);
        assert_eq!(geo.entries_per_block, 128);
        assert_eq!(geo.meta_entry_blocks(), 8);

        let (block_off, slot) = geo.meta_slot(129);
        assert_eq!(block_off, geo.meta_offset + 2 * 4096);
        assert_eq!(slot, 32);
    }

    #[test]
    fn test_clean_entry_roundtrip() {
        let cfg = test_config();
        let geo =
            Geometry::compute(&cfg, 1024 * 128 * 1024, 1 << 20, 16 << 20, MetaFormat::Current)
                .unwrap();

        let rec = CleanEntryRecord {
            oid: ObjectId::new(42, 7),
            version: 3,
            bitmap: vec![0xFF, 0xFF, 0xFF, 0xFF],
            ext_bitmap: vec![0, 0, 0, 0],
        };
        let mut slot = vec![0u8; geo.clean_entry_size];
        encode_clean_entry(&mut slot, &rec, &geo);
        assert_eq!(decode_clean_entry(&slot, &geo), Some(rec));

        let empty = vec![0u8; geo.clean_entry_size];
        assert!(decode_clean_entry(&empty, &geo).is_none());
    }
}
