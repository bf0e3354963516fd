//! Completion-ring driver
//!
//! Wraps an io_uring instance behind the submission discipline the engine
//! needs: SQEs are staged in user space first, so a handler that discovers
//! mid-preparation that it cannot proceed can roll back everything it staged
//! with [`Ring::save`] / [`Ring::restore`] before anything reaches the
//! kernel. Each submission carries a completion record identifying the state
//! machine that owns it; completions are drained into plain events and
//! dispatched by the engine loop, so no callback ever borrows the engine.
//!
//! The driver never blocks on submission: when no slot is left,
//! `space_left()` reports zero and the caller parks on a wait-sqe condition.

use blockvault_common::{Error, Result};
use io_uring::{opcode, squeue, types, IoUring};
use std::os::unix::io::RawFd;

/// Default submission queue depth
pub const DEFAULT_RING_DEPTH: u32 = 512;

/// Owner of one in-flight submission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoTarget {
    /// Generic operation I/O (data read/write, fsync)
    Op(usize),
    /// Journal sector write on behalf of an operation
    OpJournalSector { op: usize, sector: u64 },
    /// Journal payload-range write on behalf of an operation
    OpJournalData { op: usize, offset: u64, len: u64 },
    /// Flusher worker I/O
    Flusher(usize),
    /// Journal trim anchor write or fsync
    Trim,
}

/// A reaped completion, ready for dispatch
#[derive(Clone, Copy, Debug)]
pub struct CompletionEvent {
    pub target: IoTarget,
    pub result: i32,
}

/// io_uring wrapper with staged submission and completion records
pub struct Ring {
    ring: IoUring,
    /// SQEs prepared this loop iteration, not yet pushed to the kernel
    staged: Vec<(squeue::Entry, usize)>,
    /// Completion records; slot index is the SQE user_data
    records: Vec<Option<IoTarget>>,
    free_slots: Vec<usize>,
    in_flight: usize,
    depth: usize,
    want_loop: bool,
}

impl Ring {
    /// Create a ring with the given queue depth
    pub fn new(depth: u32) -> Result<Self> {
        let ring = IoUring::new(depth)
            .map_err(|e| Error::Ring(format!("io_uring setup failed: {}", e)))?;
        Ok(Self {
            ring,
            staged: Vec::with_capacity(depth as usize),
            records: Vec::with_capacity(depth as usize),
            free_slots: Vec::new(),
            in_flight: 0,
            depth: depth as usize,
            want_loop: false,
        })
    }

    /// Number of submission slots still available this iteration
    #[must_use]
    pub fn space_left(&self) -> usize {
        self.depth - self.in_flight - self.staged.len()
    }

    /// Number of submissions the kernel has not completed yet
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether any I/O is staged or in flight
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.in_flight > 0 || !self.staged.is_empty()
    }

    /// Save the staging cursor before a multi-SQE preparation
    #[must_use]
    pub fn save(&self) -> usize {
        self.staged.len()
    }

    /// Drop every SQE staged after `pos`, releasing their records
    pub fn restore(&mut self, pos: usize) {
        for (_, slot) in self.staged.drain(pos..) {
            self.records[slot] = None;
            self.free_slots.push(slot);
        }
    }

    /// Request another loop iteration even if no completion arrives
    pub fn wakeup(&mut self) {
        self.want_loop = true;
    }

    /// Consume the wakeup request
    pub fn take_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.want_loop)
    }

    fn alloc_slot(&mut self, target: IoTarget) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            self.records[slot] = Some(target);
            slot
        } else {
            self.records.push(Some(target));
            self.records.len() - 1
        }
    }

    fn stage(&mut self, entry: squeue::Entry, target: IoTarget) {
        assert!(self.space_left() > 0, "BUG: ring staged beyond capacity");
        let slot = self.alloc_slot(target);
        self.staged.push((entry.user_data(slot as u64), slot));
    }

    /// Stage a read into `buf` (must stay valid until the completion arrives)
    pub fn prep_read(&mut self, fd: RawFd, offset: u64, buf: *mut u8, len: u32, target: IoTarget) {
        let entry = opcode::Read::new(types::Fd(fd), buf, len).offset(offset).build();
        self.stage(entry, target);
    }

    /// Stage a write from `buf` (must stay valid until the completion arrives)
    pub fn prep_write(&mut self, fd: RawFd, offset: u64, buf: *const u8, len: u32, target: IoTarget) {
        let entry = opcode::Write::new(types::Fd(fd), buf, len).offset(offset).build();
        self.stage(entry, target);
    }

    /// Stage an fsync ordered after everything staged or in flight
    pub fn prep_fsync(&mut self, fd: RawFd, target: IoTarget) {
        let entry = opcode::Fsync::new(types::Fd(fd))
            .build()
            .flags(squeue::Flags::IO_DRAIN);
        self.stage(entry, target);
    }

    /// Push staged SQEs to the kernel and submit; returns how many were
    /// handed over
    pub fn submit(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let count = self.staged.len();
        {
            let mut sq = self.ring.submission();
            for (entry, _) in self.staged.drain(..) {
                // space_left() keeps staged + in_flight within the queue depth
                unsafe {
                    sq.push(&entry)
                        .map_err(|_| Error::Ring("submission queue overflow".into()))?;
                }
            }
        }
        self.ring
            .submit()
            .map_err(|e| Error::Ring(format!("io_uring submit failed: {}", e)))?;
        self.in_flight += count;
        Ok(count)
    }

    /// Block until at least `want` completions are available (no-op when
    /// nothing is in flight)
    pub fn wait(&mut self, want: usize) -> Result<()> {
        if self.in_flight == 0 {
            return Ok(());
        }
        self.ring
            .submit_and_wait(want.min(self.in_flight))
            .map_err(|e| Error::Ring(format!("io_uring wait failed: {}", e)))?;
        Ok(())
    }

    /// Drain available completions into `out` without blocking
    pub fn drain_completions(&mut self, out: &mut Vec<CompletionEvent>) {
        let mut reaped = 0;
        for cqe in self.ring.completion() {
            let slot = cqe.user_data() as usize;
            let target = self.records[slot]
                .take()
                .expect("BUG: completion for unknown record");
            self.free_slots.push(slot);
            out.push(CompletionEvent {
                target,
                result: cqe.result(),
            });
            reaped += 1;
        }
        self.in_flight -= reaped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::AlignedBuffer;
    use std::os::unix::io::AsRawFd;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_restore_drops_staged() {
        let mut ring = Ring::new(8).unwrap();
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(8192).unwrap();
        let fd = temp.as_file().as_raw_fd();

        let buf = AlignedBuffer::new(4096);
        let pos = ring.save();
        ring.prep_write(fd, 0, buf.as_ptr(), 4096, IoTarget::Op(1));
        ring.prep_fsync(fd, IoTarget::Op(1));
        assert_eq!(ring.space_left(), 6);

        ring.restore(pos);
        assert_eq!(ring.space_left(), 8);
        assert_eq!(ring.submit().unwrap(), 0);
    }

    #[test]
    fn test_write_fsync_completion_order() {
        let mut ring = Ring::new(8).unwrap();
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(8192).unwrap();
        let fd = temp.as_file().as_raw_fd();

        let mut buf = AlignedBuffer::new(4096);
        buf.as_mut_slice()[..4].copy_from_slice(b"ring");
        ring.prep_write(fd, 0, buf.as_ptr(), 4096, IoTarget::Op(7));
        ring.prep_fsync(fd, IoTarget::Trim);
        assert_eq!(ring.submit().unwrap(), 2);

        let mut events = Vec::new();
        while events.len() < 2 {
            ring.wait(1).unwrap();
            ring.drain_completions(&mut events);
        }
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.result >= 0));
        assert_eq!(events[0].target, IoTarget::Op(7));
        assert_eq!(events[1].target, IoTarget::Trim);
        assert_eq!(ring.in_flight(), 0);
    }
}
