//! The transaction system: id assignment, rollback segments, undo log
//! lifecycle, commit, rollback, and crash resurrection.
//!
//! The transaction-system page (page 2 of the system tablespace) persists
//! the id high-water mark and the rollback-segment directory. Ids are
//! handed out from an atomic counter and persisted with a safety margin,
//! so a crash can never reissue an id.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use oakdb_error::{OakError, Result};
use oakdb_fsp::flst::{self, BaseNode};
use oakdb_fsp::{fsp_alloc_free_page, fsp_free_page};
use oakdb_lock::LockSys;
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::{BufferPool, LatchMode};
use oakdb_types::limits::{FIL_NULL, FIL_PAGE_NEXT, FIL_PAGE_PREV};
use oakdb_types::{
    IsolationLevel, Lsn, PageId, PageNo, PageType, RollPtr, SpaceId, TrxId, UndoNo,
};
use oakdb_vfs::StorageFile;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::read_view::ReadView;
use crate::undo::{
    self, undo_append, undo_page_fits, undo_page_init, UndoKind, UndoRec, UndoRecType, UndoState,
    UNDO_FREE, UNDO_LAST_REC, UNDO_LIST_NODE, UNDO_STATE,
};

/// Fixed location of the transaction-system page in the system
/// tablespace (the first page allocated after space bootstrap).
pub const TRX_SYS_PAGE: PageNo = PageNo(2);

/// Transaction-system page layout (absolute offsets).
const SYS_MAX_TRX_ID: usize = 38;
const SYS_N_RSEGS: usize = 46;
const SYS_RSEG_ARRAY: usize = 50;

/// Rollback-segment header page layout.
const RSEG_HISTORY: usize = 38;
const RSEG_SLOTS: usize = 54;
/// Undo-log slots per rollback segment.
pub const RSEG_N_SLOTS: usize = 32;

/// Ids are persisted in blocks of this size; recovery resumes past the
/// persisted bound so ids never repeat.
const TRX_ID_MARGIN: u64 = 256;

/// Transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    Active,
    Prepared,
    CommittedInMemory,
}

/// Handle to one undo log (a chain of undo pages).
#[derive(Debug, Clone, Copy)]
pub struct UndoHandle {
    pub kind: UndoKind,
    pub rseg_id: u8,
    pub first_page: PageNo,
    pub last_page: PageNo,
    pub slot: usize,
}

/// An open read view registered with the transaction system.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    pub id: u64,
    pub view: Arc<ReadView>,
}

/// One transaction. Owned by a single worker thread; the transaction
/// system tracks only its id and read view.
#[derive(Debug)]
pub struct Trx {
    pub isolation: IsolationLevel,
    pub state: TrxState,
    /// Assigned at the first write.
    pub id: Option<TrxId>,
    pub undo_no: u64,
    pub insert_undo: Option<UndoHandle>,
    pub update_undo: Option<UndoHandle>,
    pub view: Option<ViewHandle>,
    /// Set after a deadlock or lock-wait timeout: only rollback is legal.
    pub rollback_only: bool,
    pub start_lsn: Lsn,
    pub commit_lsn: Lsn,
}

impl Trx {
    /// The id to compare record trx-ids against (zero when the
    /// transaction has not written yet).
    #[must_use]
    pub fn id_or_zero(&self) -> TrxId {
        self.id.unwrap_or(TrxId::ZERO)
    }
}

struct TrxSysInner {
    active: BTreeSet<TrxId>,
    views: HashMap<u64, Arc<ReadView>>,
    next_view_id: u64,
}

/// The transaction system.
pub struct TrxSys<F: StorageFile> {
    pool: Arc<BufferPool<F>>,
    pub lock_sys: Arc<LockSys>,
    next_trx_id: AtomicU64,
    /// All ids below this bound are persisted on the system page.
    persisted_bound: AtomicU64,
    inner: Mutex<TrxSysInner>,
    rsegs: Vec<PageNo>,
    rseg_rr: AtomicUsize,
}

impl<F: StorageFile> TrxSys<F> {
    /// Bootstrap the transaction-system page and rollback segments in a
    /// fresh system tablespace. Must run right after space bootstrap so
    /// the system page lands on its fixed page number.
    pub fn create(
        pool: Arc<BufferPool<F>>,
        lock_sys: Arc<LockSys>,
        n_rsegs: usize,
    ) -> Result<Self> {
        assert!(n_rsegs >= 1 && n_rsegs <= 128);
        let mut mtr = Mtr::start(Arc::clone(&pool));
        let sys_page = fsp_alloc_free_page(&mut mtr, SpaceId::SYSTEM)?;
        assert_eq!(sys_page, TRX_SYS_PAGE, "bootstrap order violated");
        let sys_h = mtr.create_page(PageId::new(SpaceId::SYSTEM, sys_page))?;
        oakdb_fsp::page_init(&mut mtr, sys_h, PageType::TrxSystem);
        mtr.write_u64(sys_h, SYS_MAX_TRX_ID, TRX_ID_MARGIN);
        mtr.write_u32(sys_h, SYS_N_RSEGS, n_rsegs as u32);

        let mut rsegs = Vec::with_capacity(n_rsegs);
        for i in 0..n_rsegs {
            let page_no = fsp_alloc_free_page(&mut mtr, SpaceId::SYSTEM)?;
            let h = mtr.create_page(PageId::new(SpaceId::SYSTEM, page_no))?;
            oakdb_fsp::page_init(&mut mtr, h, PageType::TrxSystem);
            flst::init(&mut mtr, BaseNode::new(h, RSEG_HISTORY));
            for slot in 0..RSEG_N_SLOTS {
                mtr.write_u32(h, RSEG_SLOTS + slot * 4, FIL_NULL);
            }
            mtr.write_u32(sys_h, SYS_RSEG_ARRAY + i * 4, page_no.0);
            rsegs.push(page_no);
        }
        mtr.commit()?;
        info!(n_rsegs, "created transaction system");
        Ok(Self {
            pool,
            lock_sys,
            next_trx_id: AtomicU64::new(1),
            persisted_bound: AtomicU64::new(TRX_ID_MARGIN),
            inner: Mutex::new(TrxSysInner {
                active: BTreeSet::new(),
                views: HashMap::new(),
                next_view_id: 1,
            }),
            rsegs,
            rseg_rr: AtomicUsize::new(0),
        })
    }

    /// Open the transaction system of an existing database. The id
    /// counter resumes past the persisted bound.
    pub fn open(pool: Arc<BufferPool<F>>, lock_sys: Arc<LockSys>) -> Result<Self> {
        let (persisted, rsegs) = {
            let guard = pool.get_page(
                PageId::new(SpaceId::SYSTEM, TRX_SYS_PAGE),
                LatchMode::Shared,
            )?;
            let data = guard.data();
            let persisted = oakdb_types::mach::read_u64(data, SYS_MAX_TRX_ID);
            let n = oakdb_types::mach::read_u32(data, SYS_N_RSEGS) as usize;
            let rsegs = (0..n)
                .map(|i| PageNo(oakdb_types::mach::read_u32(data, SYS_RSEG_ARRAY + i * 4)))
                .collect();
            (persisted, rsegs)
        };
        let next = persisted + 1;
        let sys = Self {
            pool,
            lock_sys,
            next_trx_id: AtomicU64::new(next),
            persisted_bound: AtomicU64::new(persisted),
            inner: Mutex::new(TrxSysInner {
                active: BTreeSet::new(),
                views: HashMap::new(),
                next_view_id: 1,
            }),
            rsegs,
            rseg_rr: AtomicUsize::new(0),
        };
        sys.persist_id_bound(next + TRX_ID_MARGIN)?;
        debug!(resume_at = next, "opened transaction system");
        Ok(sys)
    }

    fn persist_id_bound(&self, bound: u64) -> Result<()> {
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, TRX_SYS_PAGE),
            LatchMode::Exclusive,
        )?;
        mtr.write_u64(h, SYS_MAX_TRX_ID, bound);
        mtr.commit()?;
        self.persisted_bound.store(bound, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool<F>> {
        &self.pool
    }

    // --- Lifecycle ---

    /// Start a transaction. Repeatable-read and serializable transactions
    /// get their consistent view immediately; read-committed transactions
    /// get one per statement from [`TrxSys::open_view`].
    #[must_use]
    pub fn begin(&self, isolation: IsolationLevel) -> Trx {
        let view = isolation
            .view_per_transaction()
            .then(|| self.open_view(TrxId::ZERO));
        Trx {
            isolation,
            state: TrxState::Active,
            id: None,
            undo_no: 0,
            insert_undo: None,
            update_undo: None,
            view,
            rollback_only: false,
            start_lsn: self.pool.log().write_lsn(),
            commit_lsn: Lsn::ZERO,
        }
    }

    /// Build and register a read view.
    #[must_use]
    pub fn open_view(&self, creator: TrxId) -> ViewHandle {
        let low_limit = TrxId(self.next_trx_id.load(Ordering::Acquire));
        let mut inner = self.inner.lock();
        let active: Vec<TrxId> = inner
            .active
            .iter()
            .copied()
            .filter(|&t| t != creator)
            .collect();
        let up_limit = active.first().copied().unwrap_or(low_limit);
        let view = Arc::new(ReadView {
            low_limit,
            up_limit,
            active,
            creator,
        });
        let id = inner.next_view_id;
        inner.next_view_id += 1;
        inner.views.insert(id, Arc::clone(&view));
        ViewHandle { id, view }
    }

    /// Unregister a read view (commit, rollback, or statement end under
    /// read committed).
    pub fn close_view(&self, handle: &ViewHandle) {
        self.inner.lock().views.remove(&handle.id);
    }

    /// No version below this limit is needed by any reader; purge may
    /// reclaim history older than it.
    #[must_use]
    pub fn oldest_view_limit(&self) -> TrxId {
        let inner = self.inner.lock();
        let next = TrxId(self.next_trx_id.load(Ordering::Acquire));
        let view_min = inner
            .views
            .values()
            .map(|v| v.up_limit)
            .min()
            .unwrap_or(next);
        let active_min = inner.active.first().copied().unwrap_or(next);
        view_min.min(active_min)
    }

    /// Assign the transaction id on first write: registers it active and
    /// persists the id bound when the margin is exhausted.
    pub fn ensure_id(&self, trx: &mut Trx) -> Result<TrxId> {
        if let Some(id) = trx.id {
            return Ok(id);
        }
        let raw = self.next_trx_id.fetch_add(1, Ordering::AcqRel);
        let id = TrxId(raw);
        if raw + 1 > self.persisted_bound.load(Ordering::Acquire) {
            self.persist_id_bound(raw + TRX_ID_MARGIN)?;
        }
        self.inner.lock().active.insert(id);
        trx.id = Some(id);
        // The creator's own writes are visible through the id check; keep
        // the registered view as created.
        debug!(%id, "assigned transaction id");
        Ok(id)
    }

    fn rseg_for_new_log(&self) -> u8 {
        (self.rseg_rr.fetch_add(1, Ordering::Relaxed) % self.rsegs.len()) as u8
    }

    // --- Undo writing ---

    /// Append an undo record for a clustered-index mutation, inside the
    /// caller's MTR (so undo and index change are atomic). The undo
    /// number is assigned here. Returns the roll pointer to store in the
    /// record.
    pub fn write_undo(&self, mtr: &mut Mtr<F>, trx: &mut Trx, mut rec: UndoRec) -> Result<RollPtr> {
        let trx_id = self.ensure_id(trx)?;
        let kind = if rec.rec_type == UndoRecType::Insert {
            UndoKind::Insert
        } else {
            UndoKind::Update
        };
        rec.undo_no = UndoNo(trx.undo_no);
        trx.undo_no += 1;
        self.lock_sys.set_trx_weight(trx_id, trx.undo_no);

        let body_len = undo::encode_undo_rec(0, &rec).len();
        let (handle, page_h) = self.undo_page_for_append(mtr, trx, trx_id, kind, body_len)?;
        let offset = undo_append(mtr, page_h, &rec)?;
        Ok(RollPtr::new(
            kind == UndoKind::Insert,
            handle.rseg_id,
            handle.last_page,
            offset,
        ))
    }

    /// The undo page with room for the next record, opening the log or
    /// extending the chain as needed.
    fn undo_page_for_append(
        &self,
        mtr: &mut Mtr<F>,
        trx: &mut Trx,
        trx_id: TrxId,
        kind: UndoKind,
        body_len: usize,
    ) -> Result<(UndoHandle, PageHandle)> {
        let slot_of = |trx: &Trx| match kind {
            UndoKind::Insert => trx.insert_undo,
            UndoKind::Update => trx.update_undo,
        };
        if slot_of(trx).is_none() {
            // Open a new undo log: first page plus a rollback-segment
            // slot so recovery can find it.
            let rseg_id = self.rseg_for_new_log();
            let rseg_page = self.rsegs[usize::from(rseg_id)];
            let rseg_h = mtr.get_page(
                PageId::new(SpaceId::SYSTEM, rseg_page),
                LatchMode::Exclusive,
            )?;
            let slot = (0..RSEG_N_SLOTS)
                .find(|s| mtr.read_u32(rseg_h, RSEG_SLOTS + s * 4) == FIL_NULL)
                .ok_or_else(|| {
                    OakError::internal("rollback segment has no free undo slots")
                })?;
            let page_no = fsp_alloc_free_page(mtr, SpaceId::SYSTEM)?;
            let h = mtr.create_page(PageId::new(SpaceId::SYSTEM, page_no))?;
            undo_page_init(mtr, h, trx_id, kind);
            mtr.write_u32(rseg_h, RSEG_SLOTS + slot * 4, page_no.0);
            let handle = UndoHandle {
                kind,
                rseg_id,
                first_page: page_no,
                last_page: page_no,
                slot,
            };
            match kind {
                UndoKind::Insert => trx.insert_undo = Some(handle),
                UndoKind::Update => trx.update_undo = Some(handle),
            }
            debug!(%trx_id, ?kind, first_page = %page_no, "opened undo log");
        }

        let mut handle = slot_of(trx).expect("just opened");
        let mut page_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, handle.last_page),
            LatchMode::Exclusive,
        )?;
        if !undo_page_fits(mtr.page_data(page_h), body_len) {
            // Chain a fresh page.
            let page_no = fsp_alloc_free_page(mtr, SpaceId::SYSTEM)?;
            let new_h = mtr.create_page(PageId::new(SpaceId::SYSTEM, page_no))?;
            undo_page_init(mtr, new_h, trx_id, kind);
            mtr.write_u32(new_h, FIL_PAGE_PREV, handle.last_page.0);
            mtr.write_u32(page_h, FIL_PAGE_NEXT, page_no.0);
            handle.last_page = page_no;
            match kind {
                UndoKind::Insert => trx.insert_undo = Some(handle),
                UndoKind::Update => trx.update_undo = Some(handle),
            }
            page_h = new_h;
        }
        Ok((handle, page_h))
    }

    // --- Commit ---

    /// Commit: persist the undo-log state transition, release locks, and
    /// report success only once the commit is durable in the redo log.
    pub fn commit(&self, trx: &mut Trx) -> Result<()> {
        if trx.rollback_only {
            return Err(OakError::invalid(
                "transaction must be rolled back after deadlock or lock timeout",
            ));
        }
        let mut commit_lsn = None;
        if let Some(id) = trx.id {
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            if let Some(handle) = trx.insert_undo.take() {
                // Insert undo is rollback-only information; reclaim it.
                self.discard_undo_log(&mut mtr, &handle)?;
            }
            if let Some(handle) = trx.update_undo.take() {
                // Update undo feeds MVCC and purge: onto the history list.
                let first_h = mtr.get_page(
                    PageId::new(SpaceId::SYSTEM, handle.first_page),
                    LatchMode::Exclusive,
                )?;
                mtr.write_u16(first_h, UNDO_STATE, UndoState::ToPurge as u16);
                let rseg_h = mtr.get_page(
                    PageId::new(SpaceId::SYSTEM, self.rsegs[usize::from(handle.rseg_id)]),
                    LatchMode::Exclusive,
                )?;
                flst::add_last(
                    &mut mtr,
                    SpaceId::SYSTEM,
                    BaseNode::new(rseg_h, RSEG_HISTORY),
                    first_h,
                    UNDO_LIST_NODE,
                )?;
                mtr.write_u32(rseg_h, RSEG_SLOTS + handle.slot * 4, FIL_NULL);
            }
            if let Some((_, end)) = mtr.commit()? {
                commit_lsn = Some(end);
            }
            self.inner.lock().active.remove(&id);
            self.lock_sys.release_all(id);
        }
        if let Some(view) = trx.view.take() {
            self.close_view(&view);
        }
        trx.state = TrxState::CommittedInMemory;
        // Durability: success is reported only after the commit group
        // reached disk.
        if let Some(end) = commit_lsn {
            trx.commit_lsn = end;
            self.pool.log().flush_to(end)?;
        }
        Ok(())
    }

    /// Free every page of an undo log and release its segment slot.
    fn discard_undo_log(&self, mtr: &mut Mtr<F>, handle: &UndoHandle) -> Result<()> {
        let mut page_no = handle.first_page;
        while page_no != PageNo(FIL_NULL) {
            let h = mtr.get_page(PageId::new(SpaceId::SYSTEM, page_no), LatchMode::Exclusive)?;
            let next = oakdb_types::mach::read_u32(mtr.page_data(h), FIL_PAGE_NEXT);
            fsp_free_page(mtr, SpaceId::SYSTEM, page_no)?;
            page_no = PageNo(next);
        }
        let rseg_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, self.rsegs[usize::from(handle.rseg_id)]),
            LatchMode::Exclusive,
        )?;
        mtr.write_u32(rseg_h, RSEG_SLOTS + handle.slot * 4, FIL_NULL);
        Ok(())
    }

    // --- Rollback ---

    /// Pop the newest undo record across both logs, removing it from the
    /// log inside the caller's MTR so a crash mid-rollback never undoes
    /// the same record twice. Records with undo-no below `stop_at` stay.
    pub fn pop_undo(
        &self,
        mtr: &mut Mtr<F>,
        trx: &mut Trx,
        stop_at: u64,
    ) -> Result<Option<UndoRec>> {
        let peek_ins = self.peek_undo(mtr, trx.insert_undo.as_ref())?;
        let peek_upd = self.peek_undo(mtr, trx.update_undo.as_ref())?;
        let take_insert = match (&peek_ins, &peek_upd) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a.undo_no > b.undo_no,
        };
        let rec = if take_insert {
            peek_ins.expect("checked")
        } else {
            peek_upd.expect("checked")
        };
        if rec.undo_no.0 < stop_at {
            return Ok(None);
        }
        // Truncate the chosen log's top record.
        let handle_opt = if take_insert {
            &mut trx.insert_undo
        } else {
            &mut trx.update_undo
        };
        let handle = handle_opt.as_mut().expect("peeked non-empty log");
        let page_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, handle.last_page),
            LatchMode::Exclusive,
        )?;
        let top = undo::last_rec_offset(mtr.page_data(page_h));
        let (_, back) = undo::parse_undo_rec(mtr.page_data(page_h), top)?;
        mtr.write_u16(page_h, UNDO_FREE, top);
        mtr.write_u16(page_h, UNDO_LAST_REC, back);
        if back == 0 && handle.last_page != handle.first_page {
            // The page emptied: unlink and free it.
            let prev = oakdb_types::mach::read_u32(mtr.page_data(page_h), FIL_PAGE_PREV);
            let prev_h =
                mtr.get_page(PageId::new(SpaceId::SYSTEM, PageNo(prev)), LatchMode::Exclusive)?;
            mtr.write_u32(prev_h, FIL_PAGE_NEXT, FIL_NULL);
            fsp_free_page(mtr, SpaceId::SYSTEM, handle.last_page)?;
            handle.last_page = PageNo(prev);
        }
        Ok(Some(rec))
    }

    /// The newest undo record across both logs, without removing it.
    /// Rollback peeks first to learn which index to latch, then pops
    /// under that latch.
    pub fn peek_top_undo(&self, mtr: &mut Mtr<F>, trx: &Trx) -> Result<Option<UndoRec>> {
        let a = self.peek_undo(mtr, trx.insert_undo.as_ref())?;
        let b = self.peek_undo(mtr, trx.update_undo.as_ref())?;
        Ok(match (a, b) {
            (None, None) => None,
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (Some(x), Some(y)) => Some(if x.undo_no > y.undo_no { x } else { y }),
        })
    }

    fn peek_undo(&self, mtr: &mut Mtr<F>, handle: Option<&UndoHandle>) -> Result<Option<UndoRec>> {
        let Some(handle) = handle else {
            return Ok(None);
        };
        let page_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, handle.last_page),
            LatchMode::Exclusive,
        )?;
        let top = undo::last_rec_offset(mtr.page_data(page_h));
        if top == 0 {
            return Ok(None);
        }
        let (rec, _) = undo::parse_undo_rec(mtr.page_data(page_h), top)?;
        Ok(Some(rec))
    }

    /// Finish a full rollback: reclaim both undo logs, drop the active
    /// registration, release locks, close the view.
    pub fn finish_rollback(&self, trx: &mut Trx) -> Result<()> {
        if let Some(id) = trx.id {
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            if let Some(handle) = trx.insert_undo.take() {
                self.discard_undo_log(&mut mtr, &handle)?;
            }
            if let Some(handle) = trx.update_undo.take() {
                self.discard_undo_log(&mut mtr, &handle)?;
            }
            mtr.commit()?;
            self.inner.lock().active.remove(&id);
            self.lock_sys.release_all(id);
        }
        if let Some(view) = trx.view.take() {
            self.close_view(&view);
        }
        trx.state = TrxState::CommittedInMemory;
        trx.rollback_only = false;
        debug!(id = ?trx.id, "rollback complete");
        Ok(())
    }

    /// A savepoint is simply the current undo number; rolling back to it
    /// undoes every later record while keeping all locks.
    #[must_use]
    pub fn savepoint(trx: &Trx) -> u64 {
        trx.undo_no
    }

    // --- Crash resurrection ---

    /// Scan the rollback segments for undo logs still in the active
    /// state: their transactions were running at the crash and must be
    /// rolled back. Also advances the id counter past every resurrected
    /// id.
    pub fn resurrect(&self) -> Result<Vec<Trx>> {
        let mut out: Vec<Trx> = Vec::new();
        for (rseg_id, &rseg_page) in self.rsegs.iter().enumerate() {
            let slots: Vec<u32> = {
                let guard = self
                    .pool
                    .get_page(PageId::new(SpaceId::SYSTEM, rseg_page), LatchMode::Shared)?;
                (0..RSEG_N_SLOTS)
                    .map(|s| oakdb_types::mach::read_u32(guard.data(), RSEG_SLOTS + s * 4))
                    .collect()
            };
            for (slot, first_page) in slots.into_iter().enumerate() {
                if first_page == FIL_NULL {
                    continue;
                }
                let (trx_id, kind, last_page, top_undo_no) =
                    self.inspect_undo_log(PageNo(first_page))?;
                let handle = UndoHandle {
                    kind,
                    rseg_id: rseg_id as u8,
                    first_page: PageNo(first_page),
                    last_page,
                    slot,
                };
                // Group the two logs of one transaction.
                let trx = out.iter_mut().find(|t| t.id == Some(trx_id));
                match trx {
                    Some(t) => {
                        match kind {
                            UndoKind::Insert => t.insert_undo = Some(handle),
                            UndoKind::Update => t.update_undo = Some(handle),
                        }
                        t.undo_no = t.undo_no.max(top_undo_no + 1);
                    }
                    None => {
                        let mut t = Trx {
                            isolation: IsolationLevel::RepeatableRead,
                            state: TrxState::Active,
                            id: Some(trx_id),
                            undo_no: top_undo_no + 1,
                            insert_undo: None,
                            update_undo: None,
                            view: None,
                            rollback_only: false,
                            start_lsn: Lsn::ZERO,
                            commit_lsn: Lsn::ZERO,
                        };
                        match kind {
                            UndoKind::Insert => t.insert_undo = Some(handle),
                            UndoKind::Update => t.update_undo = Some(handle),
                        }
                        out.push(t);
                    }
                }
                self.inner.lock().active.insert(trx_id);
                // Never reissue a resurrected id.
                let _ = self
                    .next_trx_id
                    .fetch_max(trx_id.0 + 1, Ordering::AcqRel);
            }
        }
        if !out.is_empty() {
            info!(count = out.len(), "resurrected uncommitted transactions");
        }
        Ok(out)
    }

    /// Read (trx-id, kind, last page, newest undo-no) of an undo log.
    fn inspect_undo_log(&self, first_page: PageNo) -> Result<(TrxId, UndoKind, PageNo, u64)> {
        let mut page_no = first_page;
        let mut trx_id = TrxId::ZERO;
        let mut kind = UndoKind::Insert;
        let mut top_undo_no = 0u64;
        loop {
            let guard = self
                .pool
                .get_page(PageId::new(SpaceId::SYSTEM, page_no), LatchMode::Shared)?;
            let data = guard.data();
            if page_no == first_page {
                trx_id = undo::undo_trx_id(data);
                kind = undo::undo_kind(data)
                    .ok_or_else(|| OakError::internal("undo page without a kind tag"))?;
                if undo::undo_state(data) != Some(UndoState::Active) {
                    return Err(OakError::internal(
                        "non-active undo log still occupies a segment slot",
                    ));
                }
            }
            let top = undo::last_rec_offset(data);
            if top != 0 {
                let (rec, _) = undo::parse_undo_rec(data, top)?;
                top_undo_no = top_undo_no.max(rec.undo_no.0);
            }
            let next = oakdb_types::mach::read_u32(data, FIL_PAGE_NEXT);
            if next == FIL_NULL {
                return Ok((trx_id, kind, page_no, top_undo_no));
            }
            page_no = PageNo(next);
        }
    }

    /// Rollback-segment header pages (for purge).
    #[must_use]
    pub fn rseg_pages(&self) -> &[PageNo] {
        &self.rsegs
    }

    /// Whether an id belongs to a currently active transaction.
    #[must_use]
    pub fn is_active(&self, id: TrxId) -> bool {
        self.inner.lock().active.contains(&id)
    }
}
