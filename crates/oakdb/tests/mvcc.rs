//! MVCC snapshot isolation scenarios.

mod common;

use common::*;
use oakdb::types::IsolationLevel;
use oakdb::ShutdownMode;

/// Repeatable read: a transaction keeps seeing its snapshot regardless of
/// concurrent committed writes; later transactions see the new state.
#[test]
fn repeatable_read_snapshot() {
    let db = create_db();
    put_commit(&db.engine, 1, b"a");

    let mut t1 = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(get(&db.engine, &mut t1, 1).as_deref(), Some(&b"a"[..]));

    // T2 updates and commits.
    let mut t2 = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .update_row(&mut t2, TABLE, &1u32.to_be_bytes(), b"b")
        .unwrap();
    db.engine.commit(&mut t2).unwrap();

    // T1 still sees the old version through the undo chain.
    assert_eq!(get(&db.engine, &mut t1, 1).as_deref(), Some(&b"a"[..]));
    db.engine.commit(&mut t1).unwrap();

    // T3 starts fresh and sees the update.
    assert_eq!(get_committed(&db.engine, 1).as_deref(), Some(&b"b"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Two reads of the same key inside one transaction are identical even
/// across several concurrent committed updates.
#[test]
fn repeated_reads_identical() {
    let db = create_db();
    put_commit(&db.engine, 5, b"v0");
    let mut reader = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let first = get(&db.engine, &mut reader, 5);
    for i in 1..4u32 {
        put_commit(&db.engine, 100 + i, b"noise");
        let mut w = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
        db.engine
            .update_row(&mut w, TABLE, &5u32.to_be_bytes(), format!("v{i}").as_bytes())
            .unwrap();
        db.engine.commit(&mut w).unwrap();
        assert_eq!(get(&db.engine, &mut reader, 5), first);
    }
    db.engine.commit(&mut reader).unwrap();
    assert_eq!(get_committed(&db.engine, 5).as_deref(), Some(&b"v3"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Read committed sees each committed change at the next statement.
#[test]
fn read_committed_moves_forward() {
    let db = create_db();
    put_commit(&db.engine, 1, b"a");
    let mut rc = db.engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(get(&db.engine, &mut rc, 1).as_deref(), Some(&b"a"[..]));

    let mut w = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .update_row(&mut w, TABLE, &1u32.to_be_bytes(), b"b")
        .unwrap();
    db.engine.commit(&mut w).unwrap();

    assert_eq!(get(&db.engine, &mut rc, 1).as_deref(), Some(&b"b"[..]));
    db.engine.commit(&mut rc).unwrap();
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// A row deleted and committed stays visible to an older snapshot.
#[test]
fn snapshot_sees_deleted_row() {
    let db = create_db();
    put_commit(&db.engine, 9, b"still-here");
    let mut old = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert!(get(&db.engine, &mut old, 9).is_some());

    let mut deleter = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .delete_row(&mut deleter, TABLE, &9u32.to_be_bytes(), &[])
        .unwrap();
    db.engine.commit(&mut deleter).unwrap();

    assert_eq!(
        get(&db.engine, &mut old, 9).as_deref(),
        Some(&b"still-here"[..])
    );
    db.engine.commit(&mut old).unwrap();
    assert_eq!(get_committed(&db.engine, 9), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// An uncommitted write is invisible to everyone but its own transaction.
#[test]
fn uncommitted_writes_stay_private() {
    let db = create_db();
    let mut writer = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    put(&db.engine, &mut writer, 3, b"mine");
    assert_eq!(get(&db.engine, &mut writer, 3).as_deref(), Some(&b"mine"[..]));

    let mut other = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(get(&db.engine, &mut other, 3), None);
    db.engine.commit(&mut other).unwrap();
    db.engine.commit(&mut writer).unwrap();
    assert_eq!(get_committed(&db.engine, 3).as_deref(), Some(&b"mine"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Purge reclaims history once no view needs it, without changing what
/// current readers see.
#[test]
fn purge_reclaims_history() {
    let db = create_db();
    put_commit(&db.engine, 1, b"v1");
    for i in 2..8u32 {
        let mut w = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
        db.engine
            .update_row(&mut w, TABLE, &1u32.to_be_bytes(), format!("v{i}").as_bytes())
            .unwrap();
        db.engine.commit(&mut w).unwrap();
    }
    let mut del = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .delete_row(&mut del, TABLE, &1u32.to_be_bytes(), &[])
        .unwrap();
    db.engine.commit(&mut del).unwrap();

    // Drain purge manually (no views are open).
    while db.engine.purge_step(usize::MAX).unwrap() > 0 {}
    assert_eq!(db.engine.stats().history_list_length, 0);
    assert_eq!(get_committed(&db.engine, 1), None);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}
