//! The lock system: per-target FIFO queues, wait slots, grant and release.
//!
//! One mutex guards all queues (critical sections are short and never do
//! I/O). Waiting transactions park on a per-wait condvar slot; grants,
//! deadlock-victim kills, and timeouts are delivered through the slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oakdb_error::{OakError, Result};
use oakdb_types::{HeapNo, PageId, TableId, TrxId};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::deadlock;
use crate::modes::{rec_has_to_wait, RecLockKind, RecLockMode, TableLockMode};

pub(crate) type LockId = u64;

/// Bit per heap number on one page.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeapBitmap(SmallVec<[u8; 16]>);

impl HeapBitmap {
    pub fn set(&mut self, heap: HeapNo) {
        let byte = usize::from(heap.0) / 8;
        if self.0.len() <= byte {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (heap.0 % 8);
    }

    pub fn clear(&mut self, heap: HeapNo) {
        let byte = usize::from(heap.0) / 8;
        if byte < self.0.len() {
            self.0[byte] &= !(1 << (heap.0 % 8));
        }
    }

    #[must_use]
    pub fn get(&self, heap: HeapNo) -> bool {
        let byte = usize::from(heap.0) / 8;
        byte < self.0.len() && self.0[byte] & (1 << (heap.0 % 8)) != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn heaps(&self) -> impl Iterator<Item = HeapNo> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &b)| {
            (0..8u16)
                .filter(move |bit| b & (1 << bit) != 0)
                .map(move |bit| HeapNo(i as u16 * 8 + bit))
        })
    }
}

#[derive(Debug)]
pub(crate) enum Target {
    Table {
        table: TableId,
        mode: TableLockMode,
    },
    Rec {
        page: PageId,
        mode: RecLockMode,
        bitmap: HeapBitmap,
    },
}

#[derive(Debug)]
pub(crate) struct Lock {
    pub trx: TrxId,
    pub granted: bool,
    pub target: Target,
}

/// Outcome delivered to a parked waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Granted,
    DeadlockVictim,
}

struct WaitSlot {
    state: Mutex<Option<WaitOutcome>>,
    cond: Condvar,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn deliver(&self, outcome: WaitOutcome) {
        let mut st = self.state.lock();
        if st.is_none() {
            *st = Some(outcome);
        }
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<WaitOutcome> {
        let mut st = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while st.is_none() {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        *st
    }
}

pub(crate) struct TrxLocks {
    pub locks: Vec<LockId>,
    pub weight: u64,
    /// The lock id this transaction is currently waiting on, if any.
    pub waiting_on: Option<LockId>,
    wait_slot: Option<Arc<WaitSlot>>,
}

pub(crate) struct LockState {
    pub locks: HashMap<LockId, Lock>,
    pub table_queues: HashMap<TableId, Vec<LockId>>,
    pub rec_queues: HashMap<PageId, Vec<LockId>>,
    pub trxs: HashMap<TrxId, TrxLocks>,
    next_id: LockId,
}

impl LockState {
    fn trx_entry(&mut self, trx: TrxId) -> &mut TrxLocks {
        self.trxs.entry(trx).or_insert_with(|| TrxLocks {
            locks: Vec::new(),
            weight: 0,
            waiting_on: None,
            wait_slot: None,
        })
    }

    fn new_lock(&mut self, lock: Lock) -> LockId {
        let id = self.next_id;
        self.next_id += 1;
        let trx = lock.trx;
        self.locks.insert(id, lock);
        self.trx_entry(trx).locks.push(id);
        id
    }

    /// Whether the waiting lock `id` still has a conflict with any lock
    /// ahead of it in its queue.
    pub(crate) fn must_keep_waiting(&self, id: LockId) -> bool {
        self.blockers_of(id).next().is_some()
    }

    /// Transactions holding (or queued ahead with) conflicting locks.
    pub(crate) fn blockers_of(&self, id: LockId) -> impl Iterator<Item = TrxId> + '_ {
        let lock = &self.locks[&id];
        let queue: &[LockId] = match &lock.target {
            Target::Table { table, .. } => self.table_queues.get(table).map_or(&[], Vec::as_slice),
            Target::Rec { page, .. } => self.rec_queues.get(page).map_or(&[], Vec::as_slice),
        };
        let ahead = queue.iter().take_while(move |&&q| q != id);
        ahead.filter_map(move |&q| {
            let other = &self.locks[&q];
            conflicts(lock, other).then_some(other.trx)
        })
    }
}

/// Whether `req` (a lock entry) conflicts with `other` ahead of it.
fn conflicts(req: &Lock, other: &Lock) -> bool {
    if req.trx == other.trx {
        return false;
    }
    match (&req.target, &other.target) {
        (
            Target::Table { table: t1, mode: m1 },
            Target::Table { table: t2, mode: m2 },
        ) => t1 == t2 && !m1.compatible_with(*m2),
        (
            Target::Rec {
                page: p1,
                mode: m1,
                bitmap: b1,
            },
            Target::Rec {
                page: p2,
                mode: m2,
                bitmap: b2,
            },
        ) => {
            p1 == p2
                && b1.heaps().any(|h| b2.get(h))
                && rec_has_to_wait(*m1, *m2)
        }
        _ => false,
    }
}

/// Counters exposed to the host.
#[derive(Debug, Default)]
pub struct LockStats {
    pub waits: AtomicU64,
    pub deadlocks: AtomicU64,
    pub timeouts: AtomicU64,
}

/// The lock manager.
pub struct LockSys {
    pub(crate) state: Mutex<LockState>,
    wait_timeout: Duration,
    pub stats: LockStats,
}

impl LockSys {
    #[must_use]
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState {
                locks: HashMap::new(),
                table_queues: HashMap::new(),
                rec_queues: HashMap::new(),
                trxs: HashMap::new(),
                next_id: 1,
            }),
            wait_timeout,
            stats: LockStats::default(),
        }
    }

    /// Record the transaction's deadlock-victim weight (typically its
    /// undo size plus lock count); smaller weights are chosen as victims.
    pub fn set_trx_weight(&self, trx: TrxId, weight: u64) {
        self.state.lock().trx_entry(trx).weight = weight;
    }

    // --- Acquisition ---

    /// Acquire a table lock, waiting if necessary.
    pub fn lock_table(&self, trx: TrxId, table: TableId, mode: TableLockMode) -> Result<()> {
        let slot = {
            let mut st = self.state.lock();
            // Re-grants: an equal or stronger table lock already held.
            let held = st.trxs.get(&trx).map_or(false, |t| {
                t.locks.iter().any(|id| match &st.locks[id] {
                    Lock {
                        granted: true,
                        target: Target::Table { table: t2, mode: m2 },
                        ..
                    } => *t2 == table && covers_table(*m2, mode),
                    _ => false,
                })
            });
            if held {
                return Ok(());
            }
            let id = st.new_lock(Lock {
                trx,
                granted: true,
                target: Target::Table { table, mode },
            });
            st.table_queues.entry(table).or_default().push(id);
            if !st.must_keep_waiting(id) {
                return Ok(());
            }
            st.locks.get_mut(&id).expect("just inserted").granted = false;
            self.begin_wait(&mut st, trx, id)?
        };
        self.finish_wait(trx, slot)
    }

    /// Acquire (or join) a record lock, waiting if necessary. On the
    /// supremum slot every flavor degrades to a gap lock.
    pub fn lock_record(
        &self,
        trx: TrxId,
        page: PageId,
        heap: HeapNo,
        mode: RecLockMode,
    ) -> Result<()> {
        let mode = normalize(heap, mode);
        let slot = {
            let mut st = self.state.lock();
            if self.find_covering(&st, trx, page, heap, mode).is_some() {
                return Ok(());
            }
            let mut bitmap = HeapBitmap::default();
            bitmap.set(heap);
            let id = st.new_lock(Lock {
                trx,
                granted: true,
                target: Target::Rec { page, mode, bitmap },
            });
            st.rec_queues.entry(page).or_default().push(id);
            if !st.must_keep_waiting(id) {
                trace!(%trx, %page, %heap, ?mode, "record lock granted");
                return Ok(());
            }
            st.locks.get_mut(&id).expect("just inserted").granted = false;
            self.begin_wait(&mut st, trx, id)?
        };
        self.finish_wait(trx, slot)
    }

    /// Grant a record lock without conflict checks: conversion of the
    /// implicit lock a row writer holds by virtue of its trx-id being on
    /// the record.
    pub fn grant_record_lock(
        &self,
        trx: TrxId,
        page: PageId,
        heap: HeapNo,
        mode: RecLockMode,
    ) {
        let mode = normalize(heap, mode);
        let mut guard = self.state.lock();
        if self.find_covering(&guard, trx, page, heap, mode).is_some() {
            return;
        }
        let mut bitmap = HeapBitmap::default();
        bitmap.set(heap);
        let id = guard.new_lock(Lock {
            trx,
            granted: true,
            target: Target::Rec { page, mode, bitmap },
        });
        // Implicit-lock conversions predate any queued request.
        let st = &mut *guard;
        let queue = st.rec_queues.entry(page).or_default();
        let at = queue
            .iter()
            .position(|qid| !st.locks[qid].granted)
            .unwrap_or(queue.len());
        queue.insert(at, id);
    }

    fn find_covering(
        &self,
        st: &LockState,
        trx: TrxId,
        page: PageId,
        heap: HeapNo,
        mode: RecLockMode,
    ) -> Option<LockId> {
        let trx_locks = st.trxs.get(&trx)?;
        trx_locks.locks.iter().copied().find(|id| {
            match &st.locks[id] {
                Lock {
                    granted: true,
                    target:
                        Target::Rec {
                            page: p2,
                            mode: m2,
                            bitmap,
                        },
                    ..
                } => *p2 == page && bitmap.get(heap) && covers_rec(*m2, mode),
                _ => false,
            }
        })
    }

    fn begin_wait(
        &self,
        st: &mut parking_lot::MutexGuard<'_, LockState>,
        trx: TrxId,
        id: LockId,
    ) -> Result<Arc<WaitSlot>> {
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        let slot = WaitSlot::new();
        {
            let entry = st.trx_entry(trx);
            debug_assert!(entry.waiting_on.is_none(), "transaction already waiting");
            entry.waiting_on = Some(id);
            entry.wait_slot = Some(Arc::clone(&slot));
        }
        // Deadlock check on every blocking request.
        if let Some(victim) = deadlock::pick_victim(st, trx) {
            self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
            debug!(requester = %trx, %victim, "deadlock detected");
            if victim == trx {
                self.cancel_wait(st, trx, id);
                return Err(OakError::Deadlock);
            }
            // Kill the lighter waiter; our own wait continues and will be
            // granted once the victim's locks unwind.
            let victim_slot = st
                .trxs
                .get(&victim)
                .and_then(|t| t.wait_slot.clone())
                .expect("cycle members are waiting");
            victim_slot.deliver(WaitOutcome::DeadlockVictim);
        }
        Ok(slot)
    }

    fn finish_wait(&self, trx: TrxId, slot: Arc<WaitSlot>) -> Result<()> {
        match slot.wait(self.wait_timeout) {
            Some(WaitOutcome::Granted) => Ok(()),
            Some(WaitOutcome::DeadlockVictim) => {
                let mut st = self.state.lock();
                if let Some(id) = st.trxs.get(&trx).and_then(|t| t.waiting_on) {
                    self.cancel_wait(&mut st, trx, id);
                }
                Err(OakError::Deadlock)
            }
            None => {
                // Timeout; re-check under the mutex (a grant may have
                // raced the deadline).
                let mut st = self.state.lock();
                match st.trxs.get(&trx).and_then(|t| t.waiting_on) {
                    None => Ok(()),
                    Some(id) if st.locks[&id].granted => {
                        let entry = st.trx_entry(trx);
                        entry.waiting_on = None;
                        entry.wait_slot = None;
                        Ok(())
                    }
                    Some(id) => {
                        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        self.cancel_wait(&mut st, trx, id);
                        Err(OakError::LockWaitTimeout)
                    }
                }
            }
        }
    }

    /// Drop a waiting lock entry and clear the transaction's wait state.
    fn cancel_wait(&self, st: &mut LockState, trx: TrxId, id: LockId) {
        if let Some(lock) = st.locks.remove(&id) {
            match &lock.target {
                Target::Table { table, .. } => {
                    if let Some(q) = st.table_queues.get_mut(table) {
                        q.retain(|&x| x != id);
                    }
                }
                Target::Rec { page, .. } => {
                    if let Some(q) = st.rec_queues.get_mut(page) {
                        q.retain(|&x| x != id);
                    }
                }
            }
        }
        if let Some(entry) = st.trxs.get_mut(&trx) {
            entry.locks.retain(|&x| x != id);
            entry.waiting_on = None;
            entry.wait_slot = None;
        }
        // Removing a waiter can unblock someone behind it.
        self.grant_waiters(st);
    }

    // --- Release ---

    /// Release every lock of the transaction (commit or rollback) and
    /// re-evaluate the affected queues in FIFO order.
    pub fn release_all(&self, trx: TrxId) {
        let mut st = self.state.lock();
        let Some(entry) = st.trxs.remove(&trx) else {
            return;
        };
        if let Some(slot) = entry.wait_slot {
            // A waiting transaction being released was chosen as a victim
            // or timed out; make sure it is not left parked.
            slot.deliver(WaitOutcome::DeadlockVictim);
        }
        for id in entry.locks {
            if let Some(lock) = st.locks.remove(&id) {
                match &lock.target {
                    Target::Table { table, .. } => {
                        if let Some(q) = st.table_queues.get_mut(table) {
                            q.retain(|&x| x != id);
                        }
                    }
                    Target::Rec { page, .. } => {
                        if let Some(q) = st.rec_queues.get_mut(page) {
                            q.retain(|&x| x != id);
                        }
                    }
                }
            }
        }
        self.grant_waiters(&mut st);
        trace!(%trx, "released all locks");
    }

    /// Grant every waiting lock that no longer conflicts with anything
    /// ahead of it, in queue order.
    fn grant_waiters(&self, st: &mut LockState) {
        let waiting: Vec<LockId> = st
            .locks
            .iter()
            .filter(|(_, l)| !l.granted)
            .map(|(&id, _)| id)
            .collect();
        // Queue order: lock ids are assigned in arrival order.
        let mut waiting = waiting;
        waiting.sort_unstable();
        for id in waiting {
            if !st.locks.contains_key(&id) || st.must_keep_waiting(id) {
                continue;
            }
            let lock = st.locks.get_mut(&id).expect("checked above");
            lock.granted = true;
            let trx = lock.trx;
            if let Some(entry) = st.trxs.get_mut(&trx) {
                if entry.waiting_on == Some(id) {
                    entry.waiting_on = None;
                    if let Some(slot) = entry.wait_slot.take() {
                        slot.deliver(WaitOutcome::Granted);
                    }
                }
            }
        }
    }

    // --- Reorganization inheritance ---

    /// A record moved to another page position (split or merge): its lock
    /// bits follow it.
    pub fn rec_moved(&self, from_page: PageId, from_heap: HeapNo, to_page: PageId, to_heap: HeapNo) {
        let mut st = self.state.lock();
        let on_page: Vec<LockId> = st
            .rec_queues
            .get(&from_page)
            .map(|q| q.clone())
            .unwrap_or_default();
        for id in on_page {
            let (trx, mode, granted) = match st.locks.get_mut(&id) {
                Some(Lock {
                    trx,
                    granted,
                    target: Target::Rec { mode, bitmap, .. },
                }) if bitmap.get(from_heap) => {
                    bitmap.clear(from_heap);
                    (*trx, *mode, *granted)
                }
                _ => continue,
            };
            let nid = st.new_lock(Lock {
                trx,
                granted,
                target: Target::Rec {
                    page: to_page,
                    mode,
                    bitmap: {
                        let mut b = HeapBitmap::default();
                        b.set(to_heap);
                        b
                    },
                },
            });
            st.rec_queues.entry(to_page).or_default().push(nid);
            if !granted {
                // The wait now targets the new location; the drained old
                // entry would otherwise linger as a zombie.
                if let Some(entry) = st.trxs.get_mut(&trx) {
                    if entry.waiting_on == Some(id) {
                        entry.waiting_on = Some(nid);
                    }
                }
                self.drop_lock_entry(&mut st, id);
            }
        }
        self.prune_empty(&mut st, from_page);
    }

    /// Remove a (drained) lock entry from all structures without touching
    /// the owning transaction's wait slot.
    fn drop_lock_entry(&self, st: &mut LockState, id: LockId) {
        if let Some(lock) = st.locks.remove(&id) {
            match &lock.target {
                Target::Table { table, .. } => {
                    if let Some(q) = st.table_queues.get_mut(table) {
                        q.retain(|&x| x != id);
                    }
                }
                Target::Rec { page, .. } => {
                    if let Some(q) = st.rec_queues.get_mut(page) {
                        q.retain(|&x| x != id);
                    }
                }
            }
            if let Some(entry) = st.trxs.get_mut(&lock.trx) {
                entry.locks.retain(|&x| x != id);
            }
        }
    }

    /// A record was physically removed: locks on it are inherited by its
    /// heir as gap locks (insert intentions die with the record).
    pub fn rec_removed(
        &self,
        page: PageId,
        removed_heap: HeapNo,
        heir_page: PageId,
        heir_heap: HeapNo,
    ) {
        let mut st = self.state.lock();
        let on_page: Vec<LockId> = st
            .rec_queues
            .get(&page)
            .map(|q| q.clone())
            .unwrap_or_default();
        for id in on_page {
            let (trx, mode, granted) = match st.locks.get_mut(&id) {
                Some(Lock {
                    trx,
                    granted,
                    target: Target::Rec { mode, bitmap, .. },
                }) if bitmap.get(removed_heap) => {
                    bitmap.clear(removed_heap);
                    (*trx, *mode, *granted)
                }
                _ => continue,
            };
            if mode.kind == RecLockKind::InsertIntention {
                continue;
            }
            let inherited = RecLockMode {
                exclusive: mode.exclusive,
                kind: RecLockKind::Gap,
            };
            let nid = st.new_lock(Lock {
                trx,
                granted,
                target: Target::Rec {
                    page: heir_page,
                    mode: normalize(heir_heap, inherited),
                    bitmap: {
                        let mut b = HeapBitmap::default();
                        b.set(heir_heap);
                        b
                    },
                },
            });
            st.rec_queues.entry(heir_page).or_default().push(nid);
            if !granted {
                if let Some(entry) = st.trxs.get_mut(&trx) {
                    if entry.waiting_on == Some(id) {
                        entry.waiting_on = Some(nid);
                    }
                }
                self.drop_lock_entry(&mut st, id);
            }
        }
        self.prune_empty(&mut st, page);
        self.grant_waiters(&mut st);
    }

    fn prune_empty(&self, st: &mut LockState, page: PageId) {
        let empty: Vec<LockId> = st
            .rec_queues
            .get(&page)
            .map(|q| {
                q.iter()
                    .copied()
                    .filter(|id| match &st.locks[id] {
                        Lock {
                            granted: true,
                            target: Target::Rec { bitmap, .. },
                            ..
                        } => bitmap.is_empty(),
                        _ => false,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for id in empty {
            if let Some(lock) = st.locks.remove(&id) {
                if let Some(q) = st.rec_queues.get_mut(&page) {
                    q.retain(|&x| x != id);
                }
                if let Some(entry) = st.trxs.get_mut(&lock.trx) {
                    entry.locks.retain(|&x| x != id);
                }
            }
        }
    }

    // --- Introspection (tests and diagnostics) ---

    /// Whether the transaction holds a granted lock covering the slot.
    #[must_use]
    pub fn holds_record_lock(
        &self,
        trx: TrxId,
        page: PageId,
        heap: HeapNo,
        mode: RecLockMode,
    ) -> bool {
        let st = self.state.lock();
        self.find_covering(&st, trx, page, heap, normalize(heap, mode))
            .is_some()
    }

    /// Number of lock structs held by the transaction.
    #[must_use]
    pub fn lock_count(&self, trx: TrxId) -> usize {
        self.state
            .lock()
            .trxs
            .get(&trx)
            .map_or(0, |t| t.locks.len())
    }
}

/// On the supremum pseudo-record every flavor is a gap lock.
fn normalize(heap: HeapNo, mode: RecLockMode) -> RecLockMode {
    if heap == HeapNo::SUPREMUM && mode.kind != RecLockKind::InsertIntention {
        RecLockMode {
            exclusive: mode.exclusive,
            kind: RecLockKind::Gap,
        }
    } else {
        mode
    }
}

/// Whether a held table mode makes a new request redundant.
fn covers_table(held: TableLockMode, req: TableLockMode) -> bool {
    use TableLockMode::{IS, IX, S, X};
    match (held, req) {
        (X, _) | (S, S | IS) | (IX, IX | IS) | (IS, IS) => true,
        _ => false,
    }
}

/// Whether a held record lock makes a new request redundant.
fn covers_rec(held: RecLockMode, req: RecLockMode) -> bool {
    if req.kind == RecLockKind::InsertIntention || held.kind == RecLockKind::InsertIntention {
        return held == req;
    }
    if req.exclusive && !held.exclusive {
        return false;
    }
    match (held.kind, req.kind) {
        (a, b) if a == b => true,
        (RecLockKind::NextKey, RecLockKind::NotGap | RecLockKind::Gap) => true,
        _ => false,
    }
}
