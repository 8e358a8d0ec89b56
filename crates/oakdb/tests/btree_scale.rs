//! Tree-shape correctness at scale: splits on the way up, merges on the
//! way down, ordered scans throughout.

mod common;

use common::*;
use oakdb::internals::btree::{page, BtreeIndex};
use oakdb::internals::mtr::Mtr;
use oakdb::internals::pager::LatchMode;
use oakdb::types::limits::FIL_NULL;
use oakdb::types::{IsolationLevel, PageId, PageNo, SpaceId};
use oakdb::ShutdownMode;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

const N: u32 = 10_000;
/// ~140 byte payloads put roughly a hundred records on a 16 KiB leaf.
const PAYLOAD: [u8; 140] = [0x5A; 140];

/// Walk the whole tree, checking page invariants, sibling chains, and
/// the fill factor of non-root leaves. Returns (root level, leaf count).
fn audit_tree(db: &Db, check_fill: bool) -> (u16, usize) {
    let index = BtreeIndex::open(SpaceId::SYSTEM, CLUSTERED, db.root, true, None);
    let _tl = index.latch_read();
    let mut mtr = Mtr::start(Arc::clone(db.engine.pool()));
    let root_h = mtr
        .get_page(PageId::new(SpaceId::SYSTEM, db.root), LatchMode::Shared)
        .unwrap();
    let height = page::level(mtr.page_data(root_h));

    let mut level_first = db.root;
    let mut leaves = 0usize;
    loop {
        let mut page_no = level_first;
        let mut next_level_first = None;
        loop {
            let h = mtr
                .get_page(PageId::new(SpaceId::SYSTEM, page_no), LatchMode::Shared)
                .unwrap();
            let data = mtr.page_data(h);
            page::validate(data).unwrap_or_else(|e| panic!("page {page_no} invalid: {e}"));
            if next_level_first.is_none() && !page::is_leaf(data) {
                let first = page::first_user_rec(data).expect("internal pages are never empty");
                next_level_first = Some(BtreeIndex::node_ptr_child(data, first));
            }
            if page::is_leaf(data) {
                leaves += 1;
                if check_fill && page_no != db.root {
                    assert!(
                        !page::is_underfull(data),
                        "leaf {page_no} below half fill after merges"
                    );
                }
            }
            let next = page::next_page(data);
            mtr.release_page(h);
            if next == FIL_NULL {
                break;
            }
            page_no = PageNo(next);
        }
        match next_level_first {
            Some(n) => level_first = n,
            None => break,
        }
    }
    mtr.commit().unwrap();
    (height, leaves)
}

fn scan_all(db: &Db) -> Vec<u32> {
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let mut cursor = db.engine.cursor(CLUSTERED).unwrap();
    let mut keys = Vec::new();
    if cursor.first().unwrap() {
        loop {
            if let Some((key, payload)) = cursor.read(&mut trx).unwrap() {
                assert_eq!(payload, PAYLOAD);
                keys.push(u32::from_be_bytes(key.try_into().unwrap()));
            }
            if !cursor.next().unwrap() {
                break;
            }
        }
    }
    db.engine.commit(&mut trx).unwrap();
    keys
}

#[test]
fn ten_thousand_keys_split_scan_delete_merge() {
    let db = create_db();

    // Batched transactions keep the undo logs small.
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    for k in 0..N {
        put(&db.engine, &mut trx, k, &PAYLOAD);
        if k % 500 == 499 {
            db.engine.commit(&mut trx).unwrap();
            trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
        }
    }
    db.engine.commit(&mut trx).unwrap();

    // Full scan returns every key in order; the tree has three levels.
    let keys = scan_all(&db);
    assert_eq!(keys.len(), N as usize);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    let (height, leaves) = audit_tree(&db, false);
    assert!(height >= 2, "expected ≥ 3 tree levels, root level {height}");
    assert!(leaves >= 64);

    // Random-order delete of 30% of the keys, then drain purge so the
    // removals are physical and merges run.
    let mut doomed: Vec<u32> = (0..N).collect();
    doomed.shuffle(&mut StdRng::seed_from_u64(42));
    doomed.truncate((N as usize) * 3 / 10);
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    for (i, k) in doomed.iter().enumerate() {
        db.engine
            .delete_row(&mut trx, TABLE, &k.to_be_bytes(), &[])
            .unwrap();
        if i % 500 == 499 {
            db.engine.commit(&mut trx).unwrap();
            trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
        }
    }
    db.engine.commit(&mut trx).unwrap();
    while db.engine.purge_step(usize::MAX).unwrap() > 0 {}

    let keys = scan_all(&db);
    assert_eq!(keys.len(), N as usize - doomed.len());
    let doomed_set: std::collections::HashSet<u32> = doomed.into_iter().collect();
    assert!(keys.iter().all(|k| !doomed_set.contains(k)));
    audit_tree(&db, true);

    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn descending_inserts_also_balance() {
    let db = create_db();
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    for k in (0..2000u32).rev() {
        put(&db.engine, &mut trx, k, &PAYLOAD);
        if k % 500 == 0 {
            db.engine.commit(&mut trx).unwrap();
            trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
        }
    }
    db.engine.commit(&mut trx).unwrap();
    let keys = scan_all(&db);
    assert_eq!(keys.len(), 2000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    audit_tree(&db, false);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}
