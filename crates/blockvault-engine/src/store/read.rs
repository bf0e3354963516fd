//! Read path
//!
//! A read serves the object state at the requested version (or the latest
//! when `VERSION_ANY` is passed) by layering dirty entries newest-first over
//! the clean entry. Journal-resident payloads and still-in-flight big-write
//! buffers are copied synchronously from memory; only stable data-device
//! ranges become ring reads. Granules the clean bitmap never saw written
//! read as zeros.

use super::{BlockStore, CleanEntry, Durability, Operation, SubmitResult, WaitFor, WriteKind};
use crate::raw_io::AlignedBuffer;
use crate::ring::IoTarget;
use blockvault_common::ObjectVersion;

/// Per-read scratch: the aligned destination buffer
pub(crate) struct ReadState {
    pub buf: AlignedBuffer,
}

/// One planned data-device read
struct PlannedRead {
    dev_off: u64,
    buf_off: u64,
    len: u32,
}

impl BlockStore {
    pub(crate) fn dequeue_read(&mut self, op_id: usize, op: &mut Operation) -> SubmitResult {
        let oid = op.oid;
        let target = op.version;
        let start = u64::from(op.offset);
        let end = start + u64::from(op.len);

        let mut buf = match op.read.take() {
            Some(st) => st.buf,
            None => AlignedBuffer::new(op.len as usize),
        };
        buf.zero();

        let mut remaining: Vec<(u64, u64)> = vec![(start, end)];
        let mut plan: Vec<PlannedRead> = Vec::new();
        let mut found = false;
        let mut fulfilled_any = false;
        let mut deleted = false;

        for (_, e) in self
            .dirty_db
            .range(ObjectVersion::new(oid, 0)..=ObjectVersion::new(oid, target))
            .rev()
        {
            if remaining.is_empty() {
                break;
            }
            if e.dur == Durability::Queued {
                // the write has not materialized anywhere yet; retry after
                // the submit pass ahead of us ran
                op.read = Some(Box::new(ReadState { buf }));
                return SubmitResult::CantSubmit;
            }
            found = true;
            if e.kind == WriteKind::Delete {
                deleted = true;
                break;
            }
            let wstart = u64::from(e.offset);
            let wend = wstart + u64::from(e.len);
            let mut next_remaining = Vec::with_capacity(remaining.len() + 1);
            for &(s, r_end) in &remaining {
                let o_s = s.max(wstart);
                let o_e = r_end.min(wend);
                if o_s >= o_e {
                    next_remaining.push((s, r_end));
                    continue;
                }
                fulfilled_any = true;
                let dst = (o_s - start) as usize;
                let piece = (o_e - o_s) as usize;
                match e.kind {
                    WriteKind::Small => {
                        let src = (e.location + (o_s - wstart)) as usize;
                        buf.as_mut_slice()[dst..dst + piece]
                            .copy_from_slice(&self.journal.buffer()[src..src + piece]);
                    }
                    WriteKind::Big => {
                        if let Some(pending) = &e.pending_buf {
                            let src = (o_s - wstart) as usize;
                            buf.as_mut_slice()[dst..dst + piece]
                                .copy_from_slice(&pending.as_slice()[src..src + piece]);
                        } else {
                            plan.push(PlannedRead {
                                dev_off: self.geo.block_offset(e.location) + o_s,
                                buf_off: o_s - start,
                                len: piece as u32,
                            });
                        }
                    }
                    WriteKind::Delete => unreachable!(),
                }
                if s < o_s {
                    next_remaining.push((s, o_s));
                }
                if o_e < r_end {
                    next_remaining.push((o_e, r_end));
                }
            }
            remaining = next_remaining;
        }

        if deleted && !fulfilled_any {
            op.retval = -(libc::ENOENT as i64);
            return SubmitResult::Done;
        }
        if !deleted && !remaining.is_empty() {
            if let Some(clean) = self.clean_db.get(&oid) {
                if clean.version <= target {
                    found = true;
                    for &(s, r_end) in &remaining {
                        plan_clean_reads(clean, &self.geo, start, s, r_end, &mut plan);
                    }
                }
            }
        }
        if !found {
            op.retval = -(libc::ENOENT as i64);
            return SubmitResult::Done;
        }

        if plan.is_empty() {
            op.result_data = Some(buf.as_slice()[..op.len as usize].to_vec());
            op.retval = i64::from(op.len);
            return SubmitResult::Done;
        }
        if self.ring.space_left() < plan.len() {
            op.wait_for = WaitFor::Sqe(plan.len());
            op.read = Some(Box::new(ReadState { buf }));
            return SubmitResult::CantSubmit;
        }
        for p in &plan {
            // SAFETY: the buffer lives in the operation table until every
            // read completion arrived
            let ptr = unsafe { buf.as_mut_ptr().add(p.buf_off as usize) };
            self.ring.prep_read(
                self.data_file.fd(),
                p.dev_off,
                ptr,
                p.len,
                IoTarget::Op(op_id),
            );
        }
        op.pending_ops = plan.len() as u32;
        op.read = Some(Box::new(ReadState { buf }));
        SubmitResult::InProgress
    }

    pub(crate) fn handle_read_event(&mut self, op: &mut Operation) -> bool {
        let st = op.read.take().expect("read state present");
        op.result_data = Some(st.buf.as_slice()[..op.len as usize].to_vec());
        op.retval = i64::from(op.len);
        true
    }
}

/// Plan reads for `[s, end)` out of a clean entry, skipping granules its
/// bitmap never saw written (they stay zero in the destination buffer)
fn plan_clean_reads(
    clean: &CleanEntry,
    geo: &crate::layout::Geometry,
    buf_base: u64,
    s: u64,
    end: u64,
    plan: &mut Vec<PlannedRead>,
) {
    let gran = geo.bitmap_granularity;
    let mut run: Option<(u64, u64)> = None;
    let first = s / gran;
    let last = (end - 1) / gran;
    for g in first..=last {
        let set = clean.bitmap.is_empty()
            || clean.bitmap[(g / 8) as usize] >> (g % 8) & 1 == 1;
        let seg_s = s.max(g * gran);
        let seg_e = end.min((g + 1) * gran);
        if set {
            run = match run {
                Some((rs, re)) if re == seg_s => Some((rs, seg_e)),
                Some(done) => {
                    push_run(clean, geo, buf_base, done, plan);
                    Some((seg_s, seg_e))
                }
                None => Some((seg_s, seg_e)),
            };
        } else if let Some(done) = run.take() {
            push_run(clean, geo, buf_base, done, plan);
        }
    }
    if let Some(done) = run {
        push_run(clean, geo, buf_base, done, plan);
    }
}

fn push_run(
    clean: &CleanEntry,
    geo: &crate::layout::Geometry,
    buf_base: u64,
    (rs, re): (u64, u64),
    plan: &mut Vec<PlannedRead>,
) {
    plan.push(PlannedRead {
        dev_off: geo.block_offset(clean.location) + rs,
        buf_off: rs - buf_base,
        len: (re - rs) as u32,
    });
}
