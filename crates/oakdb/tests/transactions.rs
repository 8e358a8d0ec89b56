//! Transaction round trips: commit, rollback, savepoints, cursors.

mod common;

use common::*;
use oakdb::types::IsolationLevel;
use oakdb::{OakError, SearchMode, ShutdownMode};

#[test]
fn insert_read_round_trip() {
    let db = create_db();
    put_commit(&db.engine, 1, b"hello");
    assert_eq!(get_committed(&db.engine, 1).as_deref(), Some(&b"hello"[..]));
    assert_eq!(get_committed(&db.engine, 2), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn insert_then_delete_reads_nothing() {
    let db = create_db();
    put_commit(&db.engine, 5, b"v");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .delete_row(&mut trx, TABLE, &5u32.to_be_bytes(), &[])
        .unwrap();
    // The deleter sees its own delete.
    assert_eq!(get(&db.engine, &mut trx, 5), None);
    db.engine.commit(&mut trx).unwrap();
    assert_eq!(get_committed(&db.engine, 5), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn duplicate_key_leaves_transaction_usable() {
    let db = create_db();
    put_commit(&db.engine, 9, b"v");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let err = db
        .engine
        .insert_row(&mut trx, TABLE, &9u32.to_be_bytes(), b"again", &[])
        .unwrap_err();
    assert!(matches!(err, OakError::DuplicateKey { .. }));
    // The logical error is atomic for its row operation: the transaction
    // keeps working.
    put(&db.engine, &mut trx, 10, b"next");
    db.engine.commit(&mut trx).unwrap();
    assert_eq!(get_committed(&db.engine, 10).as_deref(), Some(&b"next"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn rollback_undoes_everything() {
    let db = create_db();
    put_commit(&db.engine, 1, b"keep");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    put(&db.engine, &mut trx, 2, b"drop-me");
    db.engine
        .update_row(&mut trx, TABLE, &1u32.to_be_bytes(), b"dirty")
        .unwrap();
    db.engine.rollback(&mut trx).unwrap();

    assert_eq!(get_committed(&db.engine, 1).as_deref(), Some(&b"keep"[..]));
    assert_eq!(get_committed(&db.engine, 2), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn update_rollback_restores_old_value() {
    let db = create_db();
    put_commit(&db.engine, 3, b"v1");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .update_row(&mut trx, TABLE, &3u32.to_be_bytes(), b"v2")
        .unwrap();
    assert_eq!(get(&db.engine, &mut trx, 3).as_deref(), Some(&b"v2"[..]));
    db.engine.rollback(&mut trx).unwrap();
    assert_eq!(get_committed(&db.engine, 3).as_deref(), Some(&b"v1"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn update_changing_size_round_trips() {
    let db = create_db();
    put_commit(&db.engine, 4, b"short");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .update_row(&mut trx, TABLE, &4u32.to_be_bytes(), b"a considerably longer payload")
        .unwrap();
    db.engine.commit(&mut trx).unwrap();
    assert_eq!(
        get_committed(&db.engine, 4).as_deref(),
        Some(&b"a considerably longer payload"[..])
    );
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn savepoint_partial_rollback() {
    let db = create_db();
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    put(&db.engine, &mut trx, 1, b"before");
    let sp = db.engine.savepoint(&trx);
    put(&db.engine, &mut trx, 2, b"after");
    db.engine
        .update_row(&mut trx, TABLE, &1u32.to_be_bytes(), b"mutated")
        .unwrap();
    db.engine.rollback_to(&mut trx, sp).unwrap();

    // Work before the savepoint survives; work after it is gone.
    assert_eq!(get(&db.engine, &mut trx, 1).as_deref(), Some(&b"before"[..]));
    assert_eq!(get(&db.engine, &mut trx, 2), None);
    db.engine.commit(&mut trx).unwrap();
    assert_eq!(get_committed(&db.engine, 1).as_deref(), Some(&b"before"[..]));
    assert_eq!(get_committed(&db.engine, 2), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn delete_then_reinsert_same_key() {
    let db = create_db();
    put_commit(&db.engine, 8, b"first");
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .delete_row(&mut trx, TABLE, &8u32.to_be_bytes(), &[])
        .unwrap();
    db.engine.commit(&mut trx).unwrap();

    // The delete-marked slot is reused.
    put_commit(&db.engine, 8, b"second");
    assert_eq!(get_committed(&db.engine, 8).as_deref(), Some(&b"second"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn cursor_scans_in_order() {
    let db = create_db();
    for k in [30u32, 10, 20, 40] {
        put_commit(&db.engine, k, format!("p{k}").as_bytes());
    }
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let mut cursor = db.engine.cursor(CLUSTERED).unwrap();
    assert!(cursor.first().unwrap());
    let mut seen = Vec::new();
    loop {
        if let Some((key, payload)) = cursor.read(&mut trx).unwrap() {
            let k = u32::from_be_bytes(key.try_into().unwrap());
            assert_eq!(payload, format!("p{k}").into_bytes());
            seen.push(k);
        }
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(seen, vec![10, 20, 30, 40]);

    // Search modes.
    assert!(cursor.search(&20u32.to_be_bytes(), SearchMode::Exact).unwrap());
    assert!(!cursor.search(&25u32.to_be_bytes(), SearchMode::Exact).unwrap());
    assert!(cursor
        .search(&25u32.to_be_bytes(), SearchMode::GreaterEqual)
        .unwrap());
    assert_eq!(cursor.current_key(), Some(&30u32.to_be_bytes()[..]));
    assert!(cursor
        .search(&25u32.to_be_bytes(), SearchMode::LessEqual)
        .unwrap());
    assert_eq!(cursor.current_key(), Some(&20u32.to_be_bytes()[..]));

    db.engine.commit(&mut trx).unwrap();
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

#[test]
fn secondary_index_round_trip() {
    use oakdb::types::{IndexId, SpaceId};
    use oakdb::IndexDef;

    let db = create_db();
    let sec_id = IndexId(2);
    let sec_root = db.engine.create_index(sec_id, false).unwrap();
    db.dict.register(IndexDef {
        index_id: sec_id,
        table_id: TABLE,
        space: SpaceId::SYSTEM,
        root: sec_root,
        clustered: false,
    });

    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .insert_row(
            &mut trx,
            TABLE,
            &100u32.to_be_bytes(),
            b"row-payload",
            &[(sec_id, b"alpha".to_vec())],
        )
        .unwrap();
    db.engine.commit(&mut trx).unwrap();

    // Secondary entry: "alpha" + primary key.
    let mut full = b"alpha".to_vec();
    full.extend_from_slice(&100u32.to_be_bytes());
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let pk = db
        .engine
        .secondary_lookup(&mut trx, sec_id, &full, 4)
        .unwrap();
    assert_eq!(pk.as_deref(), Some(&100u32.to_be_bytes()[..]));
    db.engine.commit(&mut trx).unwrap();

    // Deleting the row hides the secondary entry.
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .delete_row(
            &mut trx,
            TABLE,
            &100u32.to_be_bytes(),
            &[(sec_id, b"alpha".to_vec())],
        )
        .unwrap();
    db.engine.commit(&mut trx).unwrap();
    let mut trx = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(
        db.engine
            .secondary_lookup(&mut trx, sec_id, &full, 4)
            .unwrap(),
        None
    );
    db.engine.commit(&mut trx).unwrap();
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}
