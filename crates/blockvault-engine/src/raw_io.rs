//! Raw device I/O
//!
//! Direct disk access for the three engine regions. Devices are opened with
//! O_DIRECT by default so writes bypass the page cache and an fsync is a real
//! barrier; buffered mode exists for filesystems without O_DIRECT support.
//! All device I/O goes through [`AlignedBuffer`], which guarantees the buffer
//! address alignment O_DIRECT requires.

use blockvault_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Buffer address alignment used for all device I/O (covers any sane
/// logical-block size)
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Raw device handle
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct: bool,
}

impl RawFile {
    /// Open a device or regular file for engine I/O
    pub fn open(path: impl AsRef<Path>, direct: bool, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path_str, e)))?;

        let size = device_size(&file, &path_str)?;

        Ok(Self {
            file,
            path: path_str,
            size,
            direct,
        })
    }

    /// Device or file size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path the device was opened from
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw file descriptor for ring submissions
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Whether the device was opened with O_DIRECT
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Synchronous read at the given offset, filling the whole buffer
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {}", self.path, e)))
    }

    /// Synchronous write at the given offset
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.path, e)))
    }

    /// Flush device write caches
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {}", self.path, e)))
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % BUFFER_ALIGNMENT as u64 != 0 || len % BUFFER_ALIGNMENT != 0 {
            return Err(Error::Storage(format!(
                "unaligned I/O on {}: offset {} len {}",
                self.path, offset, len
            )));
        }
        Ok(())
    }
}

fn device_size(file: &File, path: &str) -> Result<u64> {
    let meta = file
        .metadata()
        .map_err(|e| Error::Storage(format!("failed to stat {}: {}", path, e)))?;
    if meta.file_type().is_block_device() {
        block_device_size(file, path)
    } else {
        Ok(meta.len())
    }
}

fn block_device_size(file: &File, path: &str) -> Result<u64> {
    // BLKGETSIZE64
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret == -1 {
        return Err(Error::Storage(format!(
            "failed to get block device size for {}: {}",
            path,
            std::io::Error::last_os_error()
        )));
    }
    Ok(size)
}

/// Heap buffer aligned for O_DIRECT and stable across moves of its owner
///
/// The backing allocation never moves, so a raw pointer taken from the buffer
/// stays valid while the buffer is alive even if the owning struct is moved
/// (e.g. inside a growing operation table).
pub struct AlignedBuffer {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of the given size, rounded up to the I/O
    /// alignment
    #[must_use]
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT;
        let layout = std::alloc::Layout::from_size_align(len.max(BUFFER_ALIGNMENT), BUFFER_ALIGNMENT)
            .expect("invalid aligned buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned buffer allocation failed");
        Self {
            ptr,
            len: len.max(BUFFER_ALIGNMENT),
            layout,
        }
    }

    /// Allocate a buffer and fill its head from `src`
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new(src.len());
        buf.as_mut_slice()[..src.len()].copy_from_slice(src);
        buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Zero the whole buffer
    pub fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr, 0, self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

// The buffer owns its allocation exclusively.
unsafe impl Send for AlignedBuffer {}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), BUFFER_ALIGNMENT);
        assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        buf.zero();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_raw_file_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(64 * 1024).unwrap();

        let file = RawFile::open(temp.path(), false, false).unwrap();
        assert_eq!(file.size(), 64 * 1024);

        let mut buf = AlignedBuffer::new(4096);
        buf.as_mut_slice()[..9].copy_from_slice(b"test data");
        file.write_at(4096, buf.as_slice()).unwrap();
        file.sync().unwrap();

        let mut rbuf = AlignedBuffer::new(4096);
        file.read_at(4096, rbuf.as_mut_slice()).unwrap();
        assert_eq!(&rbuf.as_slice()[..9], b"test data");
    }
}
