//! Configuration for the BlockVault engine
//!
//! One engine instance manages one data device, one metadata device and one
//! journal device; the metadata and journal regions may live on the data
//! device at different offsets. Unknown keys are rejected during
//! deserialization so that a typo in a deployment file fails loudly instead
//! of silently falling back to a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data block size (128 KiB)
pub const DEFAULT_DATA_BLOCK_SIZE: u32 = 128 * 1024;

/// Default metadata block size, also the journal sector size (4 KiB)
pub const DEFAULT_META_BLOCK_SIZE: u32 = 4096;

/// Default journal region size (16 MiB)
pub const DEFAULT_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

/// Default allocation bitmap granularity (4 KiB)
pub const DEFAULT_BITMAP_GRANULARITY: u32 = 4096;

/// Default direct-I/O alignment requirement (512 bytes)
pub const DEFAULT_DISK_ALIGNMENT: u32 = 512;

/// Default number of flusher workers
pub const DEFAULT_FLUSHER_COUNT: usize = 8;

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Data device path (required)
    pub data_device: PathBuf,
    /// Metadata device path; the data device is used when absent
    pub meta_device: Option<PathBuf>,
    /// Journal device path; the metadata device is used when absent
    pub journal_device: Option<PathBuf>,

    /// Byte offset of the data region on the data device
    pub data_offset: u64,
    /// Byte offset of the metadata region on the metadata device
    pub meta_offset: u64,
    /// Byte offset of the journal region on the journal device
    pub journal_offset: u64,
    /// Journal region size in bytes
    pub journal_size: u64,

    /// Data block size; the unit of allocation and versioning
    pub data_block_size: u32,
    /// Metadata block size; also the journal sector size
    pub meta_block_size: u32,
    /// Sub-block granularity tracked by clean-entry bitmaps
    pub bitmap_granularity: u32,
    /// Alignment required of client offsets/lengths and device I/O
    pub disk_alignment: u32,

    /// Number of background flusher workers
    pub flusher_count: usize,
    /// Refuse writes, deletes and syncs; serve reads and lists only
    pub readonly: bool,
    /// Cache the whole metadata region in memory
    pub inmemory_metadata: bool,
    /// Open devices with O_DIRECT (disable on filesystems without support)
    pub direct_io: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_device: PathBuf::new(),
            meta_device: None,
            journal_device: None,
            data_offset: 0,
            meta_offset: 0,
            journal_offset: 0,
            journal_size: DEFAULT_JOURNAL_SIZE,
            data_block_size: DEFAULT_DATA_BLOCK_SIZE,
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            bitmap_granularity: DEFAULT_BITMAP_GRANULARITY,
            disk_alignment: DEFAULT_DISK_ALIGNMENT,
            flusher_count: DEFAULT_FLUSHER_COUNT,
            readonly: false,
            inmemory_metadata: false,
            direct_io: true,
        }
    }
}

impl Config {
    /// Create a configuration for a single-device layout
    pub fn with_data_device(path: impl AsRef<Path>) -> Self {
        Self {
            data_device: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Effective metadata device path
    #[must_use]
    pub fn meta_device_path(&self) -> &Path {
        self.meta_device.as_deref().unwrap_or(&self.data_device)
    }

    /// Effective journal device path
    #[must_use]
    pub fn journal_device_path(&self) -> &Path {
        self.journal_device
            .as_deref()
            .unwrap_or_else(|| self.meta_device_path())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_device.as_os_str().is_empty() {
            return Err(Error::config("data_device is required"));
        }
        if !self.disk_alignment.is_power_of_two() {
            return Err(Error::config("disk_alignment must be a power of two"));
        }
        if !self.data_block_size.is_power_of_two() {
            return Err(Error::config("data_block_size must be a power of two"));
        }
        if self.data_block_size < 4096 || self.data_block_size > 128 * 1024 * 1024 {
            return Err(Error::config(
                "data_block_size must be between 4 KiB and 128 MiB",
            ));
        }
        if self.data_block_size % self.disk_alignment != 0 {
            return Err(Error::config(
                "data_block_size must be a multiple of disk_alignment",
            ));
        }
        if !self.meta_block_size.is_power_of_two() || self.meta_block_size < 512 {
            return Err(Error::config(
                "meta_block_size must be a power of two of at least 512 bytes",
            ));
        }
        if !self.bitmap_granularity.is_power_of_two()
            || self.data_block_size % self.bitmap_granularity != 0
        {
            return Err(Error::config(
                "bitmap_granularity must be a power of two dividing data_block_size",
            ));
        }
        if self.journal_size % u64::from(self.meta_block_size) != 0
            || self.journal_size < 4 * u64::from(self.meta_block_size)
        {
            return Err(Error::config(
                "journal_size must be a multiple of meta_block_size and at least 4 sectors",
            ));
        }
        for (name, offset) in [
            ("data_offset", self.data_offset),
            ("meta_offset", self.meta_offset),
            ("journal_offset", self.journal_offset),
        ] {
            if offset % u64::from(self.disk_alignment) != 0 {
                return Err(Error::Config(format!(
                    "{name} must be aligned to disk_alignment"
                )));
            }
        }
        if self.flusher_count == 0 {
            return Err(Error::config("flusher_count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = Config::with_data_device("/dev/vdb");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_missing_data_device() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_block_size() {
        let mut cfg = Config::with_data_device("/dev/vdb");
        cfg.data_block_size = 100_000; // not a power of two
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_device_fallbacks() {
        let mut cfg = Config::with_data_device("/dev/vdb");
        assert_eq!(cfg.meta_device_path(), Path::new("/dev/vdb"));
        assert_eq!(cfg.journal_device_path(), Path::new("/dev/vdb"));

        cfg.meta_device = Some(PathBuf::from("/dev/vdc"));
        assert_eq!(cfg.journal_device_path(), Path::new("/dev/vdc"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let parsed: std::result::Result<Config, _> =
            serde_json::from_str(r#"{"data_device": "/dev/vdb", "journal_sise": 1}"#);
        assert!(parsed.is_err());
    }
}
