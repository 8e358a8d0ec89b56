//! The buffer pool: fixed set of latched frames over the tablespace files.
//!
//! Frames are tracked by three structures under one short-critical-section
//! mutex: a page hash (identity → frame), an LRU list split into young and
//! old sublists at a midpoint ~3/8 from the tail, and a flush list ordered
//! by oldest-modification LSN. Per-frame read/write latches are
//! `parking_lot` rwlocks whose owned guards mini-transactions hold across
//! their lifetime; the pool mutex is never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use oakdb_error::{OakError, Result};
use oakdb_log::LogSys;
use oakdb_types::{Lsn, PageId};
use oakdb_vfs::StorageFile;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use tracing::{debug, trace};

use crate::buf::{finalize_for_write, verify_on_read, PageBuf};
use crate::space::Tablespaces;

/// Requested latch mode for a page access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Pin only; no data access. Used for prefetch and bookkeeping.
    None,
    /// Shared latch for reading.
    Shared,
    /// Exclusive latch for modification through a mini-transaction.
    Exclusive,
}

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of 16 KiB frames.
    pub n_frames: usize,
    /// How long a page must sit in the old sublist before a re-touch
    /// promotes it to the young head (scan resistance).
    pub old_dwell: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_frames: 1024,
            old_dwell: Duration::from_secs(1),
        }
    }
}

/// Old sublist target fraction: 3/8 of the LRU.
const OLD_NUMER: usize = 3;
const OLD_DENOM: usize = 8;
/// Below this LRU length the young/old split is not maintained.
const LRU_SPLIT_MIN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    /// Claimed for a page whose disk read is in flight.
    ReadPending,
    Resident,
}

struct FrameNode {
    page_id: Option<PageId>,
    state: FrameState,
    dirty: bool,
    oldest_mod: Lsn,
    newest_mod: Lsn,
    old: bool,
    accessed_at: Option<Instant>,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
    flush_prev: Option<u32>,
    flush_next: Option<u32>,
}

impl FrameNode {
    fn empty() -> Self {
        Self {
            page_id: None,
            state: FrameState::Free,
            dirty: false,
            oldest_mod: Lsn::ZERO,
            newest_mod: Lsn::ZERO,
            old: false,
            accessed_at: None,
            lru_prev: None,
            lru_next: None,
            flush_prev: None,
            flush_next: None,
        }
    }
}

struct PoolState {
    hash: HashMap<PageId, u32>,
    nodes: Vec<FrameNode>,
    free: Vec<u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    /// First node of the old sublist; `None` when the LRU is empty.
    lru_old_head: Option<u32>,
    lru_len: usize,
    old_len: usize,
    flush_head: Option<u32>,
    flush_tail: Option<u32>,
    flush_len: usize,
}

/// Monotone counters exposed to the host.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub evictions: AtomicU64,
}

struct FrameSlot {
    buf: Arc<RwLock<PageBuf>>,
    fix: AtomicU32,
    /// Bumped on every modification; persistent cursors use it to detect
    /// that a bookmarked page changed while unlatched.
    modify_clock: AtomicU64,
}

/// The buffer pool.
pub struct BufferPool<F: StorageFile> {
    frames: Vec<FrameSlot>,
    state: Mutex<PoolState>,
    io_cond: Condvar,
    spaces: Arc<Tablespaces<F>>,
    log: Arc<LogSys<F>>,
    dwell: Duration,
    pub stats: PoolStats,
}

/// A pinned (and possibly latched) page.
///
/// Dropping the guard releases the latch first, then the pin, so eviction
/// never observes an unpinned frame whose latch is still held.
pub struct PageGuard<F: StorageFile> {
    pool: Arc<BufferPool<F>>,
    frame: u32,
    id: PageId,
    latch: Latch,
}

enum Latch {
    None,
    Shared(ArcRwLockReadGuard<RawRwLock, PageBuf>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, PageBuf>),
}

impl<F: StorageFile> PageGuard<F> {
    /// The page identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Whether this guard holds the exclusive latch.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        matches!(self.latch, Latch::Exclusive(_))
    }

    /// Page bytes. Panics if the guard was taken with `LatchMode::None`.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Latch::Shared(g) => g.as_slice(),
            Latch::Exclusive(g) => g.as_slice(),
            Latch::None => panic!("data access through an unlatched page guard"),
        }
    }

    /// Mutable page bytes. Panics unless the exclusive latch is held.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.latch {
            Latch::Exclusive(g) => g.as_mut_slice(),
            _ => panic!("mutation through a non-exclusive page guard"),
        }
    }

    /// The page LSN from the header.
    #[must_use]
    pub fn page_lsn(&self) -> Lsn {
        match &self.latch {
            Latch::Shared(g) => g.lsn(),
            Latch::Exclusive(g) => g.lsn(),
            Latch::None => panic!("LSN access through an unlatched page guard"),
        }
    }

    /// Stamp the page LSN (mini-transaction commit only).
    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        match &mut self.latch {
            Latch::Exclusive(g) => g.set_lsn(lsn),
            _ => panic!("LSN stamp through a non-exclusive page guard"),
        }
    }

    pub(crate) fn frame_index(&self) -> u32 {
        self.frame
    }

    /// The frame's modify clock at this moment. Only meaningful while the
    /// frame is latched or pinned; persistent cursors compare it across an
    /// unlatch/relatch to detect intervening modifications.
    #[must_use]
    pub fn modify_clock(&self) -> u64 {
        self.pool.frames[self.frame as usize]
            .modify_clock
            .load(Ordering::Acquire)
    }
}

impl<F: StorageFile> Drop for PageGuard<F> {
    fn drop(&mut self) {
        // Latch before pin: see the type-level comment.
        let latch = std::mem::replace(&mut self.latch, Latch::None);
        drop(latch);
        self.pool.unfix(self.frame);
    }
}

impl<F: StorageFile> BufferPool<F> {
    #[must_use]
    pub fn new(spaces: Arc<Tablespaces<F>>, log: Arc<LogSys<F>>, config: &PoolConfig) -> Arc<Self> {
        assert!(config.n_frames >= 4, "buffer pool needs at least 4 frames");
        let frames = (0..config.n_frames)
            .map(|_| FrameSlot {
                buf: Arc::new(RwLock::new(PageBuf::zeroed())),
                fix: AtomicU32::new(0),
                modify_clock: AtomicU64::new(0),
            })
            .collect();
        let nodes = (0..config.n_frames).map(|_| FrameNode::empty()).collect();
        let free = (0..config.n_frames as u32).rev().collect();
        Arc::new(Self {
            frames,
            state: Mutex::new(PoolState {
                hash: HashMap::new(),
                nodes,
                free,
                lru_head: None,
                lru_tail: None,
                lru_old_head: None,
                lru_len: 0,
                old_len: 0,
                flush_head: None,
                flush_tail: None,
                flush_len: 0,
            }),
            io_cond: Condvar::new(),
            spaces,
            log,
            dwell: config.old_dwell,
            stats: PoolStats::default(),
        })
    }

    /// The tablespace registry this pool reads from and writes to.
    #[must_use]
    pub fn spaces(&self) -> &Arc<Tablespaces<F>> {
        &self.spaces
    }

    /// The log system used to enforce write-ahead logging.
    #[must_use]
    pub fn log(&self) -> &Arc<LogSys<F>> {
        &self.log
    }

    // --- Get / create ---

    /// Fetch a page, reading it from disk on a miss, and acquire the
    /// requested latch.
    pub fn get_page(self: &Arc<Self>, id: PageId, mode: LatchMode) -> Result<PageGuard<F>> {
        loop {
            let mut st = self.state.lock();
            if let Some(&idx) = st.hash.get(&id) {
                if st.nodes[idx as usize].state == FrameState::ReadPending {
                    self.io_cond.wait(&mut st);
                    continue;
                }
                self.fix(idx);
                self.touch(&mut st, idx);
                drop(st);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.latch_guard(id, idx, mode));
            }

            // Miss: claim a frame and read.
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let idx = match self.claim_frame(&mut st)? {
                Some(idx) => idx,
                None => {
                    // The lock was released and state changed; retry.
                    drop(st);
                    continue;
                }
            };
            let node = &mut st.nodes[idx as usize];
            node.page_id = Some(id);
            node.state = FrameState::ReadPending;
            node.dirty = false;
            node.oldest_mod = Lsn::ZERO;
            node.newest_mod = Lsn::ZERO;
            st.hash.insert(id, idx);
            self.fix(idx);
            drop(st);

            let read_result = self.read_into_frame(id, idx);

            let mut st = self.state.lock();
            match read_result {
                Ok(()) => {
                    st.nodes[idx as usize].state = FrameState::Resident;
                    self.lru_insert_at_midpoint(&mut st, idx);
                    st.nodes[idx as usize].accessed_at = Some(Instant::now());
                    self.io_cond.notify_all();
                    drop(st);
                    self.stats.reads.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.latch_guard(id, idx, mode));
                }
                Err(err) => {
                    st.hash.remove(&id);
                    let node = &mut st.nodes[idx as usize];
                    node.page_id = None;
                    node.state = FrameState::Free;
                    st.free.push(idx);
                    self.unfix(idx);
                    self.io_cond.notify_all();
                    return Err(err);
                }
            }
        }
    }

    /// Materialize a page without reading from disk (fresh allocation by
    /// the space manager). The frame starts zeroed; the caller initializes
    /// it through a mini-transaction.
    pub fn create_page(self: &Arc<Self>, id: PageId) -> Result<PageGuard<F>> {
        loop {
            let mut st = self.state.lock();
            if st.hash.contains_key(&id) {
                drop(st);
                // Already resident (e.g. redo recreated it); hand out the
                // existing frame.
                return self.get_page(id, LatchMode::Exclusive);
            }
            let idx = match self.claim_frame(&mut st)? {
                Some(idx) => idx,
                None => {
                    drop(st);
                    continue;
                }
            };
            let node = &mut st.nodes[idx as usize];
            node.page_id = Some(id);
            node.state = FrameState::Resident;
            node.dirty = false;
            node.oldest_mod = Lsn::ZERO;
            node.newest_mod = Lsn::ZERO;
            st.hash.insert(id, idx);
            self.fix(idx);
            self.lru_insert_at_midpoint(&mut st, idx);
            st.nodes[idx as usize].accessed_at = Some(Instant::now());
            drop(st);

            let mut guard = self.latch_guard(id, idx, LatchMode::Exclusive);
            guard.data_mut().fill(0);
            return Ok(guard);
        }
    }

    fn latch_guard(self: &Arc<Self>, id: PageId, idx: u32, mode: LatchMode) -> PageGuard<F> {
        let slot = &self.frames[idx as usize];
        let latch = match mode {
            LatchMode::None => Latch::None,
            LatchMode::Shared => Latch::Shared(slot.buf.read_arc()),
            LatchMode::Exclusive => Latch::Exclusive(slot.buf.write_arc()),
        };
        PageGuard {
            pool: Arc::clone(self),
            frame: idx,
            id,
            latch,
        }
    }

    fn read_into_frame(&self, id: PageId, idx: u32) -> Result<()> {
        let mut guard = self.frames[idx as usize].buf.write_arc();
        self.spaces.read_page(id, guard.as_mut_slice())?;
        verify_on_read(id, guard.as_slice())
    }

    fn fix(&self, idx: u32) {
        self.frames[idx as usize].fix.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unfix(&self, idx: u32) {
        let prev = self.frames[idx as usize].fix.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unfix of an unfixed frame");
        if prev == 1 {
            // A frame may have become evictable.
            self.io_cond.notify_all();
        }
    }

    fn fix_count(&self, idx: u32) -> u32 {
        self.frames[idx as usize].fix.load(Ordering::Acquire)
    }

    /// Take a free frame, or evict one. Returns `None` when the state lock
    /// had to be released (dirty victim flushed, or waiting for pins);
    /// the caller retries from the top.
    fn claim_frame(&self, st: &mut parking_lot::MutexGuard<'_, PoolState>) -> Result<Option<u32>> {
        if let Some(idx) = st.free.pop() {
            return Ok(Some(idx));
        }
        // Walk the LRU from the cold tail.
        let mut dirty_victim = None;
        let mut cursor = st.lru_tail;
        while let Some(idx) = cursor {
            let node = &st.nodes[idx as usize];
            cursor = node.lru_prev;
            if node.state != FrameState::Resident || self.fix_count(idx) != 0 {
                continue;
            }
            if !node.dirty {
                let id = node.page_id.expect("resident frame has identity");
                self.evict(st, idx);
                trace!(%id, "evicted clean page");
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(idx));
            }
            if dirty_victim.is_none() {
                dirty_victim = Some(idx);
            }
        }
        match dirty_victim {
            Some(idx) => {
                // Flush the oldest dirty candidate outside the lock, then
                // let the caller retry; the page stays in the LRU and is
                // evicted clean on the next pass.
                self.fix(idx);
                parking_lot::MutexGuard::unlocked(st, || {
                    let result = self.flush_frame(idx);
                    self.unfix(idx);
                    result
                })?;
                Ok(None)
            }
            None => {
                // Every frame is pinned; wait for an unfix.
                let timed_out = self
                    .io_cond
                    .wait_for(st, Duration::from_millis(100))
                    .timed_out();
                if timed_out {
                    debug!("buffer pool exhausted: all frames pinned");
                    return Err(OakError::OutOfMemory);
                }
                Ok(None)
            }
        }
    }

    fn evict(&self, st: &mut PoolState, idx: u32) {
        let id = st.nodes[idx as usize].page_id.expect("evicting empty frame");
        debug_assert!(!st.nodes[idx as usize].dirty);
        // Frame reuse invalidates any bookmark taken on the old occupant.
        self.frames[idx as usize]
            .modify_clock
            .fetch_add(1, Ordering::Release);
        st.hash.remove(&id);
        self.lru_detach(st, idx);
        let node = &mut st.nodes[idx as usize];
        node.page_id = None;
        node.state = FrameState::Free;
        node.accessed_at = None;
    }

    // --- Dirty tracking ---

    /// Record that a mini-transaction modified the page: on first dirtying
    /// the frame enters the flush list keyed by the MTR start LSN; the
    /// newest-modification LSN advances to the MTR end LSN.
    pub fn note_modification(&self, guard: &PageGuard<F>, start_lsn: Lsn, end_lsn: Lsn) {
        debug_assert!(guard.is_exclusive(), "dirtying without the X latch");
        let idx = guard.frame_index();
        self.frames[idx as usize]
            .modify_clock
            .fetch_add(1, Ordering::Release);
        let mut st = self.state.lock();
        let node = &mut st.nodes[idx as usize];
        debug_assert_eq!(node.state, FrameState::Resident);
        node.newest_mod = end_lsn;
        if !node.dirty {
            node.dirty = true;
            node.oldest_mod = start_lsn;
            self.flush_push_head(&mut st, idx);
        }
    }

    /// Oldest-modification LSN over all dirty pages; `None` when clean.
    /// This bounds the next checkpoint. The list is walked in full:
    /// concurrent commits (and recovery) insert in completion order, so
    /// the tail alone is not guaranteed to be the minimum.
    #[must_use]
    pub fn min_dirty_lsn(&self) -> Option<Lsn> {
        let st = self.state.lock();
        let mut min = None;
        let mut cursor = st.flush_tail;
        while let Some(idx) = cursor {
            let node = &st.nodes[idx as usize];
            if min.map_or(true, |m| node.oldest_mod < m) {
                min = Some(node.oldest_mod);
            }
            cursor = node.flush_prev;
        }
        min
    }

    /// Number of dirty pages.
    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.state.lock().flush_len
    }

    /// Whether the page is currently resident.
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.state.lock().hash.contains_key(&id)
    }

    // --- Flushing ---

    /// Write one frame to disk, enforcing WAL first. The shared latch is
    /// held across the write and the clean-marking, so no mini-transaction
    /// can slip a modification between the copy and the bookkeeping.
    pub(crate) fn flush_frame(&self, idx: u32) -> Result<()> {
        let latch = self.frames[idx as usize].buf.read_arc();
        let (id, newest) = {
            let st = self.state.lock();
            let node = &st.nodes[idx as usize];
            if !node.dirty || node.state != FrameState::Resident {
                return Ok(());
            }
            (node.page_id.expect("dirty frame has identity"), node.newest_mod)
        };

        // WAL: redo up to the page LSN must be durable before the page.
        self.log.flush_to(newest)?;

        let mut image = latch.as_slice().to_vec();
        finalize_for_write(&mut image);
        self.spaces.write_page(id, &image)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        let mut st = self.state.lock();
        let node = &mut st.nodes[idx as usize];
        if node.dirty {
            node.dirty = false;
            self.flush_detach(&mut st, idx);
        }
        drop(st);
        drop(latch);
        Ok(())
    }

    /// Flush up to `max_pages` from the cold end of the flush list,
    /// batching neighbors in page order to coalesce I/O. Returns the
    /// number of pages written.
    pub fn flush_batch(&self, max_pages: usize) -> Result<usize> {
        let mut victims: Vec<(PageId, u32)> = Vec::with_capacity(max_pages.min(64));
        {
            let st = self.state.lock();
            let mut cursor = st.flush_tail;
            while let Some(idx) = cursor {
                if victims.len() >= max_pages {
                    break;
                }
                let node = &st.nodes[idx as usize];
                cursor = node.flush_prev;
                victims.push((node.page_id.expect("dirty frame has identity"), idx));
            }
            for &(_, idx) in &victims {
                self.fix(idx);
            }
        }
        // Neighbor ordering: adjacent pages of one space write sequentially.
        victims.sort_by_key(|&(id, _)| id);
        let mut written = 0;
        let mut result = Ok(());
        for &(_, idx) in &victims {
            match self.flush_frame(idx) {
                Ok(()) => written += 1,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        for &(_, idx) in &victims {
            self.unfix(idx);
        }
        result.map(|()| written)
    }

    /// Flush every dirty page (shutdown, or a sharp checkpoint).
    pub fn flush_all(&self) -> Result<()> {
        loop {
            let flushed = self.flush_batch(usize::MAX)?;
            if flushed == 0 && self.dirty_pages() == 0 {
                return Ok(());
            }
            if flushed == 0 {
                std::thread::yield_now();
            }
        }
    }

    // --- LRU maintenance ---

    fn touch(&self, st: &mut PoolState, idx: u32) {
        let node = &st.nodes[idx as usize];
        if node.old {
            let promote = node
                .accessed_at
                .map_or(true, |t| t.elapsed() >= self.dwell);
            if promote {
                self.lru_make_young(st, idx);
            }
        } else if st.lru_head != Some(idx) {
            self.lru_detach(st, idx);
            self.lru_push_head(st, idx);
            self.lru_adjust_boundary(st);
        }
    }

    fn lru_push_head(&self, st: &mut PoolState, idx: u32) {
        let old_head = st.lru_head;
        {
            let node = &mut st.nodes[idx as usize];
            node.lru_prev = None;
            node.lru_next = old_head;
            node.old = false;
        }
        if let Some(h) = old_head {
            st.nodes[h as usize].lru_prev = Some(idx);
        }
        st.lru_head = Some(idx);
        if st.lru_tail.is_none() {
            st.lru_tail = Some(idx);
        }
        st.lru_len += 1;
    }

    /// Insert a newly read page at the old-sublist head (the midpoint), so
    /// one sequential scan cannot flood the young region.
    fn lru_insert_at_midpoint(&self, st: &mut PoolState, idx: u32) {
        if st.lru_len < LRU_SPLIT_MIN {
            // Too small to split: insert at head with the whole list old.
            self.lru_push_head(st, idx);
            st.lru_old_head = st.lru_head;
            st.old_len = 0;
            let mut cursor = st.lru_head;
            while let Some(i) = cursor {
                st.nodes[i as usize].old = true;
                st.old_len += 1;
                cursor = st.nodes[i as usize].lru_next;
            }
            return;
        }
        let at = st.lru_old_head.unwrap_or(st.lru_tail.expect("non-empty LRU"));
        let prev = st.nodes[at as usize].lru_prev;
        {
            let node = &mut st.nodes[idx as usize];
            node.lru_prev = prev;
            node.lru_next = Some(at);
            node.old = true;
        }
        st.nodes[at as usize].lru_prev = Some(idx);
        match prev {
            Some(p) => st.nodes[p as usize].lru_next = Some(idx),
            None => st.lru_head = Some(idx),
        }
        st.lru_old_head = Some(idx);
        st.lru_len += 1;
        st.old_len += 1;
        self.lru_adjust_boundary(st);
    }

    fn lru_make_young(&self, st: &mut PoolState, idx: u32) {
        self.lru_detach(st, idx);
        self.lru_push_head(st, idx);
        st.nodes[idx as usize].accessed_at = Some(Instant::now());
        self.lru_adjust_boundary(st);
    }

    fn lru_detach(&self, st: &mut PoolState, idx: u32) {
        let (prev, next, was_old) = {
            let node = &st.nodes[idx as usize];
            (node.lru_prev, node.lru_next, node.old)
        };
        if st.lru_old_head == Some(idx) {
            st.lru_old_head = next;
        }
        match prev {
            Some(p) => st.nodes[p as usize].lru_next = next,
            None => st.lru_head = next,
        }
        match next {
            Some(n) => st.nodes[n as usize].lru_prev = prev,
            None => st.lru_tail = prev,
        }
        let node = &mut st.nodes[idx as usize];
        node.lru_prev = None;
        node.lru_next = None;
        st.lru_len -= 1;
        if was_old {
            st.old_len -= 1;
            node.old = false;
        }
    }

    /// Keep the old sublist at ~3/8 of the LRU by shifting the boundary.
    fn lru_adjust_boundary(&self, st: &mut PoolState) {
        if st.lru_len < LRU_SPLIT_MIN {
            return;
        }
        let target = (st.lru_len * OLD_NUMER / OLD_DENOM).max(1);
        while st.old_len < target {
            // Grow old: the young tail joins the old sublist.
            let boundary = match st.lru_old_head {
                Some(b) => st.nodes[b as usize].lru_prev,
                None => st.lru_tail,
            };
            let Some(b) = boundary else { break };
            st.nodes[b as usize].old = true;
            st.lru_old_head = Some(b);
            st.old_len += 1;
        }
        while st.old_len > target {
            // Shrink old: the old head becomes young.
            let Some(b) = st.lru_old_head else { break };
            st.nodes[b as usize].old = false;
            st.old_len -= 1;
            st.lru_old_head = st.nodes[b as usize].lru_next;
        }
    }

    // --- Flush list (head = newest first-dirty LSN) ---

    fn flush_push_head(&self, st: &mut PoolState, idx: u32) {
        let old_head = st.flush_head;
        {
            let node = &mut st.nodes[idx as usize];
            node.flush_prev = None;
            node.flush_next = old_head;
        }
        if let Some(h) = old_head {
            st.nodes[h as usize].flush_prev = Some(idx);
        }
        st.flush_head = Some(idx);
        if st.flush_tail.is_none() {
            st.flush_tail = Some(idx);
        }
        st.flush_len += 1;
    }

    fn flush_detach(&self, st: &mut PoolState, idx: u32) {
        let (prev, next) = {
            let node = &st.nodes[idx as usize];
            (node.flush_prev, node.flush_next)
        };
        match prev {
            Some(p) => st.nodes[p as usize].flush_next = next,
            None => st.flush_head = next,
        }
        match next {
            Some(n) => st.nodes[n as usize].flush_prev = prev,
            None => st.flush_tail = prev,
        }
        let node = &mut st.nodes[idx as usize];
        node.flush_prev = None;
        node.flush_next = None;
        st.flush_len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakdb_log::{LogConfig, LogSys};
    use oakdb_types::{PageNo, SpaceId};
    use oakdb_vfs::{MemStorage, Storage};
    use std::path::Path;

    fn setup(n_frames: usize) -> (Arc<BufferPool<oakdb_vfs::MemFile>>, MemStorage) {
        let storage = MemStorage::new();
        let log = Arc::new(
            LogSys::create(
                &storage,
                &LogConfig {
                    dir: "logs".into(),
                    n_files: 2,
                    file_size: 256 * 1024,
                },
            )
            .unwrap(),
        );
        let spaces = Arc::new(Tablespaces::new());
        spaces.add_file(
            SpaceId(0),
            storage.open(Path::new("ibdata1"), true).unwrap(),
            256,
        );
        let pool = BufferPool::new(
            spaces,
            log,
            &PoolConfig {
                n_frames,
                old_dwell: Duration::ZERO,
            },
        );
        (pool, storage)
    }

    fn page(no: u32) -> PageId {
        PageId::new(SpaceId(0), PageNo(no))
    }

    #[test]
    fn miss_then_hit() {
        let (pool, _storage) = setup(8);
        {
            let guard = pool.get_page(page(1), LatchMode::Shared).unwrap();
            assert_eq!(guard.id(), page(1));
        }
        let _again = pool.get_page(page(1), LatchMode::Shared).unwrap();
        assert_eq!(pool.stats.misses.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats.hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dirty_page_survives_eviction_cycle() {
        let (pool, _storage) = setup(4);
        let log = Arc::clone(pool.log());
        {
            let mut guard = pool.get_page(page(1), LatchMode::Exclusive).unwrap();
            guard.data_mut()[5000] = 0xAB;
            // Simulate an MTR commit: redo appended, LSN stamped, dirtied.
            let (start, end) = log.append_group(&[0xEEu8; 16]).unwrap();
            guard.set_page_lsn(end);
            // Header identity is normally set by the space manager at
            // allocation; set it here so checksum verification passes.
            oakdb_types::mach::write_u32(
                guard.data_mut(),
                oakdb_types::limits::FIL_PAGE_OFFSET,
                1,
            );
            pool.note_modification(&guard, start, end);
        }
        assert_eq!(pool.dirty_pages(), 1);
        // Fill the pool so page 1 gets evicted (flushing it first).
        for n in 2..10 {
            let _ = pool.get_page(page(n), LatchMode::Shared).unwrap();
        }
        // Re-read: content must come back from disk.
        let guard = pool.get_page(page(1), LatchMode::Shared).unwrap();
        assert_eq!(guard.data()[5000], 0xAB);
    }

    #[test]
    fn wal_enforced_before_page_write() {
        let (pool, _storage) = setup(8);
        let log = Arc::clone(pool.log());
        let (start, end) = log.append_group(&[1u8; 8]).unwrap();
        {
            let mut guard = pool.get_page(page(3), LatchMode::Exclusive).unwrap();
            guard.data_mut()[100] = 1;
            guard.set_page_lsn(end);
            pool.note_modification(&guard, start, end);
        }
        assert!(log.flushed_lsn() < end);
        pool.flush_all().unwrap();
        // The flusher must have pushed the log out first.
        assert!(log.flushed_lsn() >= end);
        assert_eq!(pool.dirty_pages(), 0);
    }

    #[test]
    fn min_dirty_lsn_tracks_oldest() {
        let (pool, _storage) = setup(8);
        let log = Arc::clone(pool.log());
        assert_eq!(pool.min_dirty_lsn(), None);
        let (s1, e1) = log.append_group(&[1u8; 8]).unwrap();
        {
            let mut g = pool.get_page(page(1), LatchMode::Exclusive).unwrap();
            g.set_page_lsn(e1);
            pool.note_modification(&g, s1, e1);
        }
        let (s2, e2) = log.append_group(&[1u8; 8]).unwrap();
        {
            let mut g = pool.get_page(page(2), LatchMode::Exclusive).unwrap();
            g.set_page_lsn(e2);
            pool.note_modification(&g, s2, e2);
        }
        assert_eq!(pool.min_dirty_lsn(), Some(s1));
    }

    #[test]
    fn create_page_is_zeroed_and_latched() {
        let (pool, _storage) = setup(8);
        let mut guard = pool.create_page(page(9)).unwrap();
        assert!(guard.is_exclusive());
        assert!(guard.data_mut().iter().all(|&b| b == 0));
    }

    #[test]
    fn eviction_prefers_cold_clean_pages() {
        let (pool, _storage) = setup(4);
        for n in 1..=4 {
            let _ = pool.get_page(page(n), LatchMode::None).unwrap();
        }
        // Touch page 4 to keep it warm, then bring in a new page.
        let _ = pool.get_page(page(4), LatchMode::None).unwrap();
        let _ = pool.get_page(page(5), LatchMode::None).unwrap();
        assert!(pool.contains(page(4)));
        assert!(pool.contains(page(5)));
        assert!(pool.stats.evictions.load(Ordering::Relaxed) >= 1);
    }
}
