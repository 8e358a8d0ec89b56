//! Lock conflicts, deadlock resolution, and phantom prevention.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use oakdb::types::IsolationLevel;
use oakdb::{OakError, ShutdownMode};

/// Two transactions cross-lock two rows; exactly one becomes the
/// deadlock victim, and the survivor retries to completion.
#[test]
fn deadlock_picks_exactly_one_victim() {
    let db = create_db_with({
        let mut c = test_config();
        c.lock_wait_timeout = Duration::from_secs(10);
        c
    });
    put_commit(&db.engine, 1, b"r1");
    put_commit(&db.engine, 2, b"r2");

    let e1 = Arc::clone(&db.engine);
    let t1 = std::thread::spawn(move || {
        let mut trx = e1.begin(IsolationLevel::RepeatableRead).unwrap();
        e1.read_row_locking(&mut trx, TABLE, &1u32.to_be_bytes(), true)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let second = e1.read_row_locking(&mut trx, TABLE, &2u32.to_be_bytes(), true);
        match second {
            Ok(_) => {
                e1.commit(&mut trx).unwrap();
                Ok(())
            }
            Err(err) => {
                e1.rollback(&mut trx).unwrap();
                Err(err)
            }
        }
    });
    let e2 = Arc::clone(&db.engine);
    let t2 = std::thread::spawn(move || {
        let mut trx = e2.begin(IsolationLevel::RepeatableRead).unwrap();
        e2.read_row_locking(&mut trx, TABLE, &2u32.to_be_bytes(), true)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let second = e2.read_row_locking(&mut trx, TABLE, &1u32.to_be_bytes(), true);
        match second {
            Ok(_) => {
                e2.commit(&mut trx).unwrap();
                Ok(())
            }
            Err(err) => {
                e2.rollback(&mut trx).unwrap();
                Err(err)
            }
        }
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();
    let deadlocks = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Err(OakError::Deadlock)))
        .count();
    assert_eq!(deadlocks, 1, "one victim expected: {r1:?} / {r2:?}");

    // The victim's retry succeeds now that the survivor finished.
    let mut retry = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .read_row_locking(&mut retry, TABLE, &1u32.to_be_bytes(), true)
        .unwrap();
    db.engine
        .read_row_locking(&mut retry, TABLE, &2u32.to_be_bytes(), true)
        .unwrap();
    db.engine.commit(&mut retry).unwrap();
    assert!(db.engine.stats().deadlocks >= 1);
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// A write lock blocks a second writer until commit.
#[test]
fn writer_blocks_writer() {
    let db = create_db_with({
        let mut c = test_config();
        c.lock_wait_timeout = Duration::from_secs(10);
        c
    });
    put_commit(&db.engine, 1, b"base");

    let mut holder = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .update_row(&mut holder, TABLE, &1u32.to_be_bytes(), b"held")
        .unwrap();

    let e = Arc::clone(&db.engine);
    let waiter = std::thread::spawn(move || {
        let mut trx = e.begin(IsolationLevel::RepeatableRead).unwrap();
        e.update_row(&mut trx, TABLE, &1u32.to_be_bytes(), b"second")
            .unwrap();
        e.commit(&mut trx).unwrap();
    });
    std::thread::sleep(Duration::from_millis(150));
    assert!(!waiter.is_finished(), "second writer must wait");
    db.engine.commit(&mut holder).unwrap();
    waiter.join().unwrap();
    assert_eq!(get_committed(&db.engine, 1).as_deref(), Some(&b"second"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Lock waits time out with the transaction marked rollback-only.
#[test]
fn lock_wait_times_out() {
    let db = create_db();
    put_commit(&db.engine, 1, b"v");
    let mut holder = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .read_row_locking(&mut holder, TABLE, &1u32.to_be_bytes(), true)
        .unwrap();

    let mut waiter = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let err = db
        .engine
        .read_row_locking(&mut waiter, TABLE, &1u32.to_be_bytes(), true)
        .unwrap_err();
    assert!(matches!(err, OakError::LockWaitTimeout));
    // Rollback-only state: further work is refused until rollback.
    assert!(db
        .engine
        .read_row_locking(&mut waiter, TABLE, &1u32.to_be_bytes(), true)
        .is_err());
    db.engine.rollback(&mut waiter).unwrap();
    db.engine.commit(&mut holder).unwrap();
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Shared locks coexist; an exclusive request after them waits.
#[test]
fn shared_locks_coexist() {
    let db = create_db();
    put_commit(&db.engine, 1, b"v");
    let mut r1 = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let mut r2 = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert!(db
        .engine
        .read_row_locking(&mut r1, TABLE, &1u32.to_be_bytes(), false)
        .unwrap()
        .is_some());
    assert!(db
        .engine
        .read_row_locking(&mut r2, TABLE, &1u32.to_be_bytes(), false)
        .unwrap()
        .is_some());

    let mut w = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let err = db
        .engine
        .read_row_locking(&mut w, TABLE, &1u32.to_be_bytes(), true)
        .unwrap_err();
    assert!(matches!(err, OakError::LockWaitTimeout));
    db.engine.rollback(&mut w).unwrap();
    db.engine.commit(&mut r1).unwrap();
    db.engine.commit(&mut r2).unwrap();
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Next-key range locking prevents phantoms: a scanner holding the range
/// blocks an insert into it; the re-scan is unchanged.
#[test]
fn no_phantoms_under_range_lock() {
    let db = create_db();
    for k in [5u32, 15, 25] {
        put_commit(&db.engine, k, b"row");
    }

    let mut scanner = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let rows = db
        .engine
        .lock_range(
            &mut scanner,
            TABLE,
            &10u32.to_be_bytes(),
            &20u32.to_be_bytes(),
            true,
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, 15u32.to_be_bytes());

    // A concurrent insert into the locked range times out on the gap.
    let e = Arc::clone(&db.engine);
    let insert = std::thread::spawn(move || {
        let mut trx = e.begin(IsolationLevel::RepeatableRead).unwrap();
        let r = e.insert_row(&mut trx, TABLE, &17u32.to_be_bytes(), b"phantom", &[]);
        match r {
            Ok(()) => {
                e.commit(&mut trx).unwrap();
                Ok(())
            }
            Err(err) => {
                e.rollback(&mut trx).unwrap();
                Err(err)
            }
        }
    });
    let blocked = insert.join().unwrap();
    assert!(
        matches!(blocked, Err(OakError::LockWaitTimeout)),
        "insert into a locked range must block: {blocked:?}"
    );

    // Re-scan: still exactly one row.
    let rows = db
        .engine
        .lock_range(
            &mut scanner,
            TABLE,
            &10u32.to_be_bytes(),
            &20u32.to_be_bytes(),
            true,
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    db.engine.commit(&mut scanner).unwrap();

    // After the scanner commits, the insert goes through.
    put_commit(&db.engine, 17, b"now-ok");
    assert_eq!(get_committed(&db.engine, 17).as_deref(), Some(&b"now-ok"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}

/// Inserts into gaps not covered by any lock proceed concurrently.
#[test]
fn inserts_outside_locked_range_proceed() {
    let db = create_db();
    for k in [5u32, 15, 25] {
        put_commit(&db.engine, k, b"row");
    }
    let mut scanner = db.engine.begin(IsolationLevel::RepeatableRead).unwrap();
    db.engine
        .lock_range(
            &mut scanner,
            TABLE,
            &10u32.to_be_bytes(),
            &20u32.to_be_bytes(),
            true,
        )
        .unwrap();
    // Key 3 is left of the range (and of its guarding gap): no conflict.
    put_commit(&db.engine, 3, b"outside");
    db.engine.commit(&mut scanner).unwrap();
    assert_eq!(get_committed(&db.engine, 3).as_deref(), Some(&b"outside"[..]));
    db.engine.shutdown(ShutdownMode::Normal).unwrap();
}
