//! Lock manager.
//!
//! Two granularities: table locks (IS/IX/S/X) and record locks keyed by
//! (space, page, heap-no) with gap, next-key, and insert-intention
//! flavors. Conflicting requests enqueue FIFO and suspend the requesting
//! transaction; deadlocks are found by bounded DFS over the waits-for
//! graph and resolved by rolling back the lightest cycle member.

mod deadlock;
pub mod modes;
pub mod sys;

pub use modes::{rec_has_to_wait, RecLockKind, RecLockMode, TableLockMode};
pub use sys::{LockStats, LockSys};

#[cfg(test)]
mod tests {
    use super::modes::RecLockKind::{Gap, InsertIntention, NextKey, NotGap};
    use super::*;
    use oakdb_error::OakError;
    use oakdb_types::{HeapNo, PageId, PageNo, SpaceId, TableId, TrxId};
    use std::sync::Arc;
    use std::time::Duration;

    fn page(no: u32) -> PageId {
        PageId::new(SpaceId(0), PageNo(no))
    }

    fn sys() -> Arc<LockSys> {
        Arc::new(LockSys::new(Duration::from_millis(200)))
    }

    #[test]
    fn shared_locks_grant_concurrently() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(4), HeapNo(2), RecLockMode::shared(NotGap))
            .unwrap();
        locks
            .lock_record(TrxId(2), page(4), HeapNo(2), RecLockMode::shared(NotGap))
            .unwrap();
        assert!(locks.holds_record_lock(TrxId(1), page(4), HeapNo(2), RecLockMode::shared(NotGap)));
        assert!(locks.holds_record_lock(TrxId(2), page(4), HeapNo(2), RecLockMode::shared(NotGap)));
    }

    #[test]
    fn exclusive_conflict_waits_until_release() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(4), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap();

        let locks2 = Arc::clone(&locks);
        let waiter = std::thread::spawn(move || {
            locks2.lock_record(TrxId(2), page(4), HeapNo(2), RecLockMode::exclusive(NotGap))
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished(), "conflicting lock must wait");
        locks.release_all(TrxId(1));
        waiter.join().unwrap().unwrap();
        assert!(locks.holds_record_lock(
            TrxId(2),
            page(4),
            HeapNo(2),
            RecLockMode::exclusive(NotGap)
        ));
    }

    #[test]
    fn wait_times_out() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(4), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap();
        let err = locks
            .lock_record(TrxId(2), page(4), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap_err();
        assert!(matches!(err, OakError::LockWaitTimeout));
        // The waiter's entry is gone; a later request by trx 1 still works.
        locks
            .lock_record(TrxId(1), page(4), HeapNo(3), RecLockMode::exclusive(NotGap))
            .unwrap();
    }

    #[test]
    fn deadlock_kills_exactly_one() {
        let locks = Arc::new(LockSys::new(Duration::from_secs(5)));
        locks
            .lock_record(TrxId(1), page(1), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap();
        locks
            .lock_record(TrxId(2), page(2), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap();

        let l1 = Arc::clone(&locks);
        let t1 = std::thread::spawn(move || {
            let r = l1.lock_record(TrxId(1), page(2), HeapNo(2), RecLockMode::exclusive(NotGap));
            if r.is_err() {
                l1.release_all(TrxId(1));
            }
            r
        });
        std::thread::sleep(Duration::from_millis(50));
        let l2 = Arc::clone(&locks);
        let t2 = std::thread::spawn(move || {
            let r = l2.lock_record(TrxId(2), page(1), HeapNo(2), RecLockMode::exclusive(NotGap));
            if r.is_err() {
                l2.release_all(TrxId(2));
            }
            r
        });

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        let deadlocks = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(OakError::Deadlock)))
            .count();
        assert_eq!(deadlocks, 1, "exactly one victim: {r1:?} / {r2:?}");
        assert!(locks.stats.deadlocks.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[test]
    fn insert_intention_blocked_by_gap_lock() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(9), HeapNo(5), RecLockMode::exclusive(NextKey))
            .unwrap();
        let err = locks
            .lock_record(
                TrxId(2),
                page(9),
                HeapNo(5),
                RecLockMode::exclusive(InsertIntention),
            )
            .unwrap_err();
        assert!(matches!(err, OakError::LockWaitTimeout));

        // Two insert intentions in the same gap coexist.
        locks
            .lock_record(
                TrxId(3),
                page(9),
                HeapNo(6),
                RecLockMode::exclusive(InsertIntention),
            )
            .unwrap();
        locks
            .lock_record(
                TrxId(4),
                page(9),
                HeapNo(6),
                RecLockMode::exclusive(InsertIntention),
            )
            .unwrap();
    }

    #[test]
    fn gap_locks_coexist_across_transactions() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(9), HeapNo(5), RecLockMode::exclusive(Gap))
            .unwrap();
        locks
            .lock_record(TrxId(2), page(9), HeapNo(5), RecLockMode::exclusive(Gap))
            .unwrap();
    }

    #[test]
    fn supremum_locks_degrade_to_gap() {
        let locks = sys();
        locks
            .lock_record(
                TrxId(1),
                page(9),
                HeapNo::SUPREMUM,
                RecLockMode::exclusive(NextKey),
            )
            .unwrap();
        // A second next-key "record" lock on the supremum also becomes a
        // gap lock, so it does not conflict.
        locks
            .lock_record(
                TrxId(2),
                page(9),
                HeapNo::SUPREMUM,
                RecLockMode::exclusive(NextKey),
            )
            .unwrap();
        // But an insert intention into that gap blocks.
        let err = locks
            .lock_record(
                TrxId(3),
                page(9),
                HeapNo::SUPREMUM,
                RecLockMode::exclusive(InsertIntention),
            )
            .unwrap_err();
        assert!(matches!(err, OakError::LockWaitTimeout));
    }

    #[test]
    fn table_intention_locks() {
        let locks = sys();
        locks.lock_table(TrxId(1), TableId(3), TableLockMode::IX).unwrap();
        locks.lock_table(TrxId(2), TableId(3), TableLockMode::IX).unwrap();
        locks.lock_table(TrxId(3), TableId(3), TableLockMode::IS).unwrap();
        let err = locks
            .lock_table(TrxId(4), TableId(3), TableLockMode::X)
            .unwrap_err();
        assert!(matches!(err, OakError::LockWaitTimeout));
    }

    #[test]
    fn release_grants_fifo() {
        let locks = Arc::new(LockSys::new(Duration::from_secs(5)));
        locks
            .lock_record(TrxId(1), page(2), HeapNo(2), RecLockMode::exclusive(NotGap))
            .unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut threads = Vec::new();
        for t in [2u64, 3] {
            let l = Arc::clone(&locks);
            let o = Arc::clone(&order);
            threads.push(std::thread::spawn(move || {
                l.lock_record(TrxId(t), page(2), HeapNo(2), RecLockMode::exclusive(NotGap))
                    .unwrap();
                o.lock().push(t);
                std::thread::sleep(Duration::from_millis(20));
                l.release_all(TrxId(t));
            }));
            // Stagger arrival so the queue order is deterministic.
            std::thread::sleep(Duration::from_millis(30));
        }
        locks.release_all(TrxId(1));
        for th in threads {
            th.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3]);
    }

    #[test]
    fn moved_record_carries_its_locks() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(5), HeapNo(4), RecLockMode::exclusive(NotGap))
            .unwrap();
        locks.rec_moved(page(5), HeapNo(4), page(6), HeapNo(2));
        assert!(!locks.holds_record_lock(
            TrxId(1),
            page(5),
            HeapNo(4),
            RecLockMode::exclusive(NotGap)
        ));
        assert!(locks.holds_record_lock(
            TrxId(1),
            page(6),
            HeapNo(2),
            RecLockMode::exclusive(NotGap)
        ));
    }

    #[test]
    fn removed_record_inherits_as_gap() {
        let locks = sys();
        locks
            .lock_record(TrxId(1), page(5), HeapNo(4), RecLockMode::exclusive(NextKey))
            .unwrap();
        locks.rec_removed(page(5), HeapNo(4), page(5), HeapNo(5));
        assert!(locks.holds_record_lock(
            TrxId(1),
            page(5),
            HeapNo(5),
            RecLockMode::exclusive(Gap)
        ));
        // The inherited lock still stops insertions into the gap.
        let err = locks
            .lock_record(
                TrxId(2),
                page(5),
                HeapNo(5),
                RecLockMode::exclusive(InsertIntention),
            )
            .unwrap_err();
        assert!(matches!(err, OakError::LockWaitTimeout));
    }
}
