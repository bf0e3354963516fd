//! End-to-end engine tests
//!
//! Every test builds a real store on temporary files (buffered I/O so the
//! suite runs on any filesystem) and drives the cooperative loop until the
//! operation callbacks fire.

use blockvault_engine::{
    BlockStore, Config, Durability, ListFilter, ObjectId, ObjectVersion, OpRequest, OpResult,
    VERSION_ANY,
};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

const BLOCK_SIZE: u32 = 128 * 1024;

fn test_config(dir: &TempDir, block_count: u64) -> Config {
    let data = dir.path().join("data.bin");
    let meta = dir.path().join("meta.bin");
    let journal = dir.path().join("journal.bin");

    let entry_blocks = block_count.div_ceil(128) + 1;
    std::fs::File::create(&data)
        .unwrap()
        .set_len(block_count * u64::from(BLOCK_SIZE))
        .unwrap();
    std::fs::File::create(&meta)
        .unwrap()
        .set_len((entry_blocks + 4) * 4096)
        .unwrap();
    std::fs::File::create(&journal)
        .unwrap()
        .set_len(4 * 1024 * 1024)
        .unwrap();

    let mut cfg = Config::with_data_device(&data);
    cfg.meta_device = Some(meta);
    cfg.journal_device = Some(journal);
    cfg.data_block_size = BLOCK_SIZE;
    cfg.bitmap_granularity = 4096;
    cfg.journal_size = 4 * 1024 * 1024;
    cfg.direct_io = false;
    cfg
}

fn new_store(dir: &TempDir, block_count: u64) -> (Config, BlockStore) {
    let cfg = test_config(dir, block_count);
    BlockStore::format(&cfg).unwrap();
    let bs = BlockStore::open(&cfg).unwrap();
    (cfg, bs)
}

fn drive(bs: &mut BlockStore, mut done: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        bs.loop_once().unwrap();
        bs.wait_for_events().unwrap();
    }
    panic!("engine made no progress");
}

fn enqueue_capture(bs: &mut BlockStore, req: OpRequest) -> Rc<RefCell<Option<OpResult>>> {
    let slot: Rc<RefCell<Option<OpResult>>> = Rc::new(RefCell::new(None));
    let inner = slot.clone();
    bs.enqueue(
        req,
        Box::new(move |r| {
            *inner.borrow_mut() = Some(r);
        }),
    );
    slot
}

fn run_op(bs: &mut BlockStore, req: OpRequest) -> OpResult {
    let slot = enqueue_capture(bs, req);
    drive(bs, || slot.borrow().is_some());
    let r = slot.borrow_mut().take().unwrap();
    r
}

fn drain_flusher(bs: &mut BlockStore) {
    for _ in 0..100_000 {
        if !bs.flusher_is_active() && bs.queue_len() == 0 {
            return;
        }
        bs.loop_once().unwrap();
        bs.wait_for_events().unwrap();
    }
    panic!("flusher made no progress");
}

#[test]
fn test_write_sync_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 1024);
    let oid = ObjectId::new(1, 0);

    let w = run_op(&mut bs, OpRequest::write(oid, 0, vec![0xAA; 4096]));
    assert_eq!(w.retval, 0);
    assert_eq!(w.version, 1);

    let s = run_op(&mut bs, OpRequest::sync());
    assert_eq!(s.retval, 0);

    let r = run_op(&mut bs, OpRequest::read(oid, 1, 0, 4096));
    assert_eq!(r.retval, 4096);
    assert_eq!(r.data.unwrap(), vec![0xAA; 4096]);
}

#[test]
fn test_crash_replay_recovers_synced_writes() {
    let dir = TempDir::new().unwrap();
    let (cfg, mut bs) = new_store(&dir, 64);
    let small = ObjectId::new(1, 0);
    let big = ObjectId::new(2, 0);

    assert_eq!(
        run_op(&mut bs, OpRequest::write(small, 0, vec![0x5A; 4096])).retval,
        0
    );
    assert_eq!(
        run_op(
            &mut bs,
            OpRequest::write(big, 0, vec![0xC3; BLOCK_SIZE as usize])
        )
        .retval,
        0
    );
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
    drop(bs); // crash: nothing was flushed to its final location

    let mut bs = BlockStore::open(&cfg).unwrap();
    assert_eq!(bs.unsynced_write_count(), 0);
    assert_eq!(
        bs.dirty_durability(ObjectVersion::new(small, 1)),
        Some(Durability::Synced)
    );
    assert_eq!(
        bs.dirty_durability(ObjectVersion::new(big, 1)),
        Some(Durability::Synced)
    );

    let r = run_op(&mut bs, OpRequest::read(small, 1, 0, 4096));
    assert_eq!(r.retval, 4096);
    assert_eq!(r.data.unwrap(), vec![0x5A; 4096]);

    let r = run_op(&mut bs, OpRequest::read(big, 1, 0, BLOCK_SIZE));
    assert_eq!(r.retval, i64::from(BLOCK_SIZE));
    assert_eq!(r.data.unwrap(), vec![0xC3; BLOCK_SIZE as usize]);
}

#[test]
fn test_rollback_discards_version() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    let oid = ObjectId::new(1, 0);

    assert_eq!(run_op(&mut bs, OpRequest::write(oid, 0, vec![0x11; 4096])).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::write(oid, 0, vec![0x22; 4096])).retval, 0);

    let rb = run_op(
        &mut bs,
        OpRequest::rollback(vec![ObjectVersion::new(oid, 2)]),
    );
    assert_eq!(rb.retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);

    let r = run_op(&mut bs, OpRequest::read(oid, VERSION_ANY, 0, 4096));
    assert_eq!(r.retval, 4096);
    assert_eq!(r.data.unwrap(), vec![0x11; 4096]);
    assert_eq!(bs.dirty_versions(oid), vec![(1, false)]);
}

#[test]
fn test_rollback_missing_version_is_enoent() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    let r = run_op(
        &mut bs,
        OpRequest::rollback(vec![ObjectVersion::new(ObjectId::new(9, 9), 1)]),
    );
    assert_eq!(r.retval, -(libc::ENOENT as i64));
}

#[test]
fn test_full_allocator_waits_for_freed_blocks() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 16);

    // round 1: 8 objects stabilized onto 8 blocks
    for i in 1..=8u64 {
        let oid = ObjectId::new(i, 0);
        assert_eq!(
            run_op(&mut bs, OpRequest::write(oid, 0, vec![i as u8; BLOCK_SIZE as usize])).retval,
            0
        );
    }
    assert_eq!(run_op(&mut bs, OpRequest::sync_stab_all()).retval, 0);
    drain_flusher(&mut bs);
    assert_eq!(bs.get_free_count(), 8);

    // round 2: superseding versions consume the rest
    for i in 1..=8u64 {
        let oid = ObjectId::new(i, 0);
        assert_eq!(
            run_op(&mut bs, OpRequest::write(oid, 0, vec![0xB0 | i as u8; BLOCK_SIZE as usize]))
                .retval,
            0
        );
    }
    assert_eq!(bs.get_free_count(), 0);

    // the sync must be queued before the overflowing write so it is not
    // ordered behind it
    let sync_slot = enqueue_capture(&mut bs, OpRequest::sync_stab_all());
    let write_slot = enqueue_capture(
        &mut bs,
        OpRequest::write(ObjectId::new(1, 0), 0, vec![0xEE; BLOCK_SIZE as usize]),
    );
    drive(&mut bs, || write_slot.borrow().is_some());

    assert_eq!(sync_slot.borrow().as_ref().unwrap().retval, 0);
    let w = write_slot.borrow_mut().take().unwrap();
    assert_eq!(w.retval, 0);
    assert_eq!(w.version, 3);

    let r = run_op(&mut bs, OpRequest::read(ObjectId::new(1, 0), VERSION_ANY, 0, BLOCK_SIZE));
    assert_eq!(r.data.unwrap(), vec![0xEE; BLOCK_SIZE as usize]);
}

#[test]
fn test_sync_acks_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    const N: usize = 40;
    for i in 0..N {
        bs.enqueue(
            OpRequest::write(ObjectId::new(1, 0), 0, vec![i as u8; 4096]),
            Box::new(|r| assert_eq!(r.retval, 0)),
        );
        let order = order.clone();
        bs.enqueue(
            OpRequest::sync(),
            Box::new(move |r| {
                assert_eq!(r.retval, 0);
                order.borrow_mut().push(i);
            }),
        );
    }
    drive(&mut bs, || order.borrow().len() == N);
    assert_eq!(*order.borrow(), (0..N).collect::<Vec<_>>());
}

#[test]
fn test_safe_to_stop_injects_final_sync() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);

    assert_eq!(
        run_op(&mut bs, OpRequest::write(ObjectId::new(1, 0), 0, vec![1; 4096])).retval,
        0
    );
    assert!(!bs.is_safe_to_stop());

    for _ in 0..100_000 {
        if bs.is_safe_to_stop() {
            break;
        }
        bs.loop_once().unwrap();
        bs.wait_for_events().unwrap();
    }
    assert!(bs.is_safe_to_stop());
    assert_eq!(bs.unsynced_write_count(), 0);
}

#[test]
fn test_flush_promotes_to_clean_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (cfg, mut bs) = new_store(&dir, 64);
    let oid = ObjectId::new(7, 3);

    assert_eq!(run_op(&mut bs, OpRequest::write(oid, 4096, vec![0x77; 8192])).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync_stab_all()).retval, 0);
    drain_flusher(&mut bs);
    assert_eq!(bs.clean_version(oid), Some(1));
    assert!(bs.dirty_versions(oid).is_empty());
    drop(bs);

    let mut bs = BlockStore::open(&cfg).unwrap();
    assert_eq!(bs.clean_version(oid), Some(1));
    assert!(bs.dirty_versions(oid).is_empty());

    let r = run_op(&mut bs, OpRequest::read(oid, VERSION_ANY, 4096, 8192));
    assert_eq!(r.retval, 8192);
    assert_eq!(r.data.unwrap(), vec![0x77; 8192]);

    // untouched granules read as zeros
    let r = run_op(&mut bs, OpRequest::read(oid, VERSION_ANY, 0, 4096));
    assert_eq!(r.data.unwrap(), vec![0; 4096]);
}

#[test]
fn test_write_stable_flushes_without_stable_op() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    let oid = ObjectId::new(3, 0);

    assert_eq!(
        run_op(&mut bs, OpRequest::write_stable(oid, 0, vec![9; 4096])).retval,
        0
    );
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
    drain_flusher(&mut bs);
    assert_eq!(bs.clean_version(oid), Some(1));
}

#[test]
fn test_delete_removes_object() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 16);
    let oid = ObjectId::new(4, 0);

    assert_eq!(
        run_op(&mut bs, OpRequest::write(oid, 0, vec![6; BLOCK_SIZE as usize])).retval,
        0
    );
    assert_eq!(run_op(&mut bs, OpRequest::sync_stab_all()).retval, 0);
    drain_flusher(&mut bs);
    assert_eq!(bs.get_free_count(), 15);

    assert_eq!(run_op(&mut bs, OpRequest::delete(oid)).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
    drain_flusher(&mut bs);

    assert_eq!(bs.clean_version(oid), None);
    assert_eq!(bs.get_free_count(), 16);
    let r = run_op(&mut bs, OpRequest::read(oid, VERSION_ANY, 0, 4096));
    assert_eq!(r.retval, -(libc::ENOENT as i64));
}

#[test]
fn test_sync_without_writes_acks_immediately() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 16);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
}

#[test]
fn test_stable_is_idempotent_and_checks_versions() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 16);
    let oid = ObjectId::new(1, 0);

    assert_eq!(run_op(&mut bs, OpRequest::write(oid, 0, vec![1; 4096])).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);

    let vers = vec![ObjectVersion::new(oid, 1)];
    assert_eq!(run_op(&mut bs, OpRequest::stable(vers.clone())).retval, 0);
    // a second STABLE of the same (or an already flushed) version is a no-op
    assert_eq!(run_op(&mut bs, OpRequest::stable(vers)).retval, 0);

    let missing = vec![ObjectVersion::new(ObjectId::new(8, 8), 1)];
    assert_eq!(
        run_op(&mut bs, OpRequest::stable(missing)).retval,
        -(libc::ENOENT as i64)
    );
}

#[test]
fn test_invalid_arguments_fail_before_enqueue() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 16);
    let oid = ObjectId::new(1, 0);

    // unaligned length
    let r = run_op_immediate(&mut bs, OpRequest::write(oid, 0, vec![0; 100]));
    assert_eq!(r.retval, -(libc::EINVAL as i64));
    // offset beyond the block
    let r = run_op_immediate(&mut bs, OpRequest::read(oid, 1, BLOCK_SIZE, 4096));
    assert_eq!(r.retval, -(libc::EINVAL as i64));
    // version regression
    assert_eq!(run_op(&mut bs, OpRequest::write(oid, 0, vec![0; 4096])).retval, 0);
    let mut req = OpRequest::write(oid, 0, vec![0; 4096]);
    req.version = 1; // already taken
    let r = run_op_immediate(&mut bs, req);
    assert_eq!(r.retval, -(libc::EINVAL as i64));
}

#[test]
fn test_readonly_store_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let (mut cfg, bs) = new_store(&dir, 16);
    drop(bs);

    cfg.readonly = true;
    let mut bs = BlockStore::open(&cfg).unwrap();
    let r = run_op_immediate(&mut bs, OpRequest::write(ObjectId::new(1, 0), 0, vec![0; 4096]));
    assert_eq!(r.retval, -(libc::EINVAL as i64));
    let r = run_op_immediate(&mut bs, OpRequest::sync());
    assert_eq!(r.retval, -(libc::EINVAL as i64));
}

#[test]
fn test_list_splits_stable_and_unstable() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    let stable_oid = ObjectId::new(1, 0);
    let unstable_oid = ObjectId::new(2, 0);

    assert_eq!(run_op(&mut bs, OpRequest::write(stable_oid, 0, vec![1; 4096])).retval, 0);
    assert_eq!(run_op(&mut bs, OpRequest::sync()).retval, 0);
    assert_eq!(
        run_op(&mut bs, OpRequest::stable(vec![ObjectVersion::new(stable_oid, 1)])).retval,
        0
    );
    assert_eq!(run_op(&mut bs, OpRequest::write(unstable_oid, 0, vec![2; 4096])).retval, 0);

    let r = run_op(&mut bs, OpRequest::list(ListFilter::default()));
    assert_eq!(r.retval, 2);
    let list = r.list.unwrap();
    assert_eq!(list.stable_count, 1);
    assert_eq!(list.entries[0], ObjectVersion::new(stable_oid, 1));
    assert_eq!(list.entries[1], ObjectVersion::new(unstable_oid, 1));
}

#[test]
fn test_list_placement_group_filter() {
    let dir = TempDir::new().unwrap();
    let (_cfg, mut bs) = new_store(&dir, 64);
    for inode in 1..=4u64 {
        assert_eq!(
            run_op(&mut bs, OpRequest::write(ObjectId::new(inode, 0), 0, vec![1; 4096])).retval,
            0
        );
    }
    let filter = ListFilter {
        min_inode: 0,
        max_inode: 0,
        pg_count: 2,
        pg_stripe: u64::from(BLOCK_SIZE),
        list_pg: 0,
    };
    let r = run_op(&mut bs, OpRequest::list(filter));
    // inodes 2 and 4 hash to shard 0
    assert_eq!(r.retval, 2);
    let list = r.list.unwrap();
    assert!(list.entries.iter().all(|ov| ov.oid.inode % 2 == 0));

    // a stripe shorter than a data block cannot shard objects
    let bad = ListFilter {
        pg_stripe: 1,
        ..filter
    };
    let r = run_op(&mut bs, OpRequest::list(bad));
    assert_eq!(r.retval, -(libc::EINVAL as i64));
}

/// Enqueue an operation whose callback must fire synchronously (validation
/// failures never reach the queue)
fn run_op_immediate(bs: &mut BlockStore, req: OpRequest) -> OpResult {
    let slot = enqueue_capture(bs, req);
    let r = slot.borrow_mut().take().expect("callback fired at enqueue");
    r
}
