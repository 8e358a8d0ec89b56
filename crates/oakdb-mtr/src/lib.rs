//! Mini-transactions.
//!
//! An [`Mtr`] brackets a group of page modifications that must become
//! persistent all-or-nothing. It tracks every page latch it acquires and
//! accumulates physiological redo records in a private buffer. At commit
//! the buffer is appended to the global log atomically, the group's end
//! LSN is stamped into every modified page, the pages enter the flush
//! list, and the latches release in reverse acquisition order. Until
//! commit, no other thread can observe the modifications (they happen
//! under the exclusive page latch), so a crash before the log append
//! simply loses the whole group.

use std::sync::Arc;

use oakdb_error::Result;
use oakdb_log::record;
use oakdb_pager::{BufferPool, LatchMode, PageGuard};
use oakdb_types::{mach, Lsn, PageId, SpaceId};
use oakdb_vfs::StorageFile;
use smallvec::SmallVec;
use tracing::trace;

/// Handle to a page acquired by this mini-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle(usize);

struct TrackedPage<F: StorageFile> {
    guard: PageGuard<F>,
    dirtied: bool,
}

/// A mini-transaction. Short-lived, single-thread, never blocks on locks
/// other than page latches and the log mutex at commit.
///
/// Slots are `Option` so latch-coupled descent can release a parent's
/// latch mid-MTR without disturbing the handles of pages acquired later.
pub struct Mtr<F: StorageFile> {
    pool: Arc<BufferPool<F>>,
    pages: SmallVec<[Option<TrackedPage<F>>; 8]>,
    log_buf: Vec<u8>,
}

impl<F: StorageFile> Mtr<F> {
    /// Begin a mini-transaction.
    #[must_use]
    pub fn start(pool: Arc<BufferPool<F>>) -> Self {
        Self {
            pool,
            pages: SmallVec::new(),
            log_buf: Vec::new(),
        }
    }

    /// The buffer pool this MTR operates on.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool<F>> {
        &self.pool
    }

    /// Acquire a page with the given latch mode, tracking the latch for
    /// release at commit. Re-requesting a page already held returns the
    /// original handle (the first acquisition's mode wins; requesting a
    /// stronger mode later is a caller bug and debug-asserted).
    pub fn get_page(&mut self, id: PageId, mode: LatchMode) -> Result<PageHandle> {
        if let Some(i) = self.find(id) {
            debug_assert!(
                mode != LatchMode::Exclusive || self.tracked(PageHandle(i)).guard.is_exclusive(),
                "page {id} re-requested with a stronger latch inside one MTR"
            );
            return Ok(PageHandle(i));
        }
        let guard = self.pool.get_page(id, mode)?;
        self.pages.push(Some(TrackedPage {
            guard,
            dirtied: false,
        }));
        Ok(PageHandle(self.pages.len() - 1))
    }

    fn find(&self, id: PageId) -> Option<usize> {
        self.pages
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.guard.id() == id))
    }

    fn tracked(&self, handle: PageHandle) -> &TrackedPage<F> {
        self.pages[handle.0]
            .as_ref()
            .expect("page handle used after release")
    }

    fn tracked_mut(&mut self, handle: PageHandle) -> &mut TrackedPage<F> {
        self.pages[handle.0]
            .as_mut()
            .expect("page handle used after release")
    }

    /// Materialize a brand-new page (no disk read) under the exclusive
    /// latch. Used by the space manager for freshly allocated pages.
    pub fn create_page(&mut self, id: PageId) -> Result<PageHandle> {
        if let Some(i) = self.find(id) {
            debug_assert!(self.tracked(PageHandle(i)).guard.is_exclusive());
            return Ok(PageHandle(i));
        }
        let guard = self.pool.create_page(id)?;
        self.pages.push(Some(TrackedPage {
            guard,
            dirtied: false,
        }));
        Ok(PageHandle(self.pages.len() - 1))
    }

    /// Release a page's latch before commit. Only legal for pages this MTR
    /// never modified; used by latch-coupled descent to drop parents.
    pub fn release_page(&mut self, handle: PageHandle) {
        let page = self.pages[handle.0]
            .take()
            .expect("page released twice");
        assert!(
            !page.dirtied,
            "cannot release a modified page before commit"
        );
        drop(page);
    }

    // --- Read access ---

    /// The page identity behind a handle.
    #[must_use]
    pub fn page_id(&self, handle: PageHandle) -> PageId {
        self.tracked(handle).guard.id()
    }

    /// The frame modify clock of a latched page (for persistent cursors).
    #[must_use]
    pub fn modify_clock(&self, handle: PageHandle) -> u64 {
        self.tracked(handle).guard.modify_clock()
    }

    /// Immutable page bytes.
    #[must_use]
    pub fn page_data(&self, handle: PageHandle) -> &[u8] {
        self.tracked(handle).guard.data()
    }

    /// Read a big-endian u16 from the page.
    #[must_use]
    pub fn read_u16(&self, handle: PageHandle, off: usize) -> u16 {
        mach::read_u16(self.page_data(handle), off)
    }

    /// Read a big-endian u32 from the page.
    #[must_use]
    pub fn read_u32(&self, handle: PageHandle, off: usize) -> u32 {
        mach::read_u32(self.page_data(handle), off)
    }

    /// Read a big-endian u64 from the page.
    #[must_use]
    pub fn read_u64(&self, handle: PageHandle, off: usize) -> u64 {
        mach::read_u64(self.page_data(handle), off)
    }

    // --- Logged writes ---

    /// Mutable page bytes **without** logging. The caller must pair every
    /// mutation made through this with a logical redo record
    /// ([`Mtr::log_rec_insert`] and friends); byte-level writes should use
    /// the typed write helpers instead.
    pub fn page_data_mut_unlogged(&mut self, handle: PageHandle) -> &mut [u8] {
        let page = self.tracked_mut(handle);
        page.dirtied = true;
        page.guard.data_mut()
    }

    fn logged_write(&mut self, handle: PageHandle, off: usize, value: u64, width: usize) {
        let id = self.page_id(handle);
        let page = self.tracked_mut(handle);
        page.dirtied = true;
        let data = page.guard.data_mut();
        match width {
            1 => mach::write_u8(data, off, value as u8),
            2 => mach::write_u16(data, off, value as u16),
            4 => mach::write_u32(data, off, value as u32),
            _ => mach::write_u64(data, off, value),
        }
        record::encode_write(&mut self.log_buf, id, off as u16, value, width);
    }

    /// Write a byte and log it.
    pub fn write_u8(&mut self, handle: PageHandle, off: usize, value: u8) {
        self.logged_write(handle, off, u64::from(value), 1);
    }

    /// Write a big-endian u16 and log it.
    pub fn write_u16(&mut self, handle: PageHandle, off: usize, value: u16) {
        self.logged_write(handle, off, u64::from(value), 2);
    }

    /// Write a big-endian u32 and log it.
    pub fn write_u32(&mut self, handle: PageHandle, off: usize, value: u32) {
        self.logged_write(handle, off, u64::from(value), 4);
    }

    /// Write a big-endian u64 and log it.
    pub fn write_u64(&mut self, handle: PageHandle, off: usize, value: u64) {
        self.logged_write(handle, off, u64::from(value), 8);
    }

    /// Write a byte string and log it.
    pub fn write_bytes(&mut self, handle: PageHandle, off: usize, bytes: &[u8]) {
        let id = self.page_id(handle);
        let page = self.tracked_mut(handle);
        page.dirtied = true;
        page.guard.data_mut()[off..off + bytes.len()].copy_from_slice(bytes);
        record::encode_write_string(&mut self.log_buf, id, off as u16, bytes);
    }

    // --- Logical record logging (mutation applied by the caller) ---

    /// Log a record insertion applied through
    /// [`Mtr::page_data_mut_unlogged`].
    pub fn log_rec_insert(&mut self, handle: PageHandle, body: &[u8]) {
        debug_assert!(self.tracked(handle).dirtied);
        let id = self.page_id(handle);
        record::encode_rec_insert(&mut self.log_buf, id, body);
    }

    /// Log a record removal applied through
    /// [`Mtr::page_data_mut_unlogged`].
    pub fn log_rec_delete(&mut self, handle: PageHandle, offset: u16) {
        debug_assert!(self.tracked(handle).dirtied);
        let id = self.page_id(handle);
        record::encode_rec_delete(&mut self.log_buf, id, offset);
    }

    /// Log an undo-record append applied through
    /// [`Mtr::page_data_mut_unlogged`].
    pub fn log_undo_insert(&mut self, handle: PageHandle, body: &[u8]) {
        debug_assert!(self.tracked(handle).dirtied);
        let id = self.page_id(handle);
        record::encode_undo_insert(&mut self.log_buf, id, body);
    }

    /// Log the creation of a tablespace.
    pub fn log_file_create(&mut self, space: SpaceId) {
        record::encode_file_create(&mut self.log_buf, space);
    }

    // --- Commit ---

    /// Commit: append the redo group to the log, stamp the end LSN into
    /// every modified page, move them onto the flush list, and release all
    /// latches in reverse acquisition order. A read-only MTR releases
    /// latches and returns `None`.
    pub fn commit(mut self) -> Result<Option<(Lsn, Lsn)>> {
        let lsns = if self.log_buf.is_empty() {
            debug_assert!(self
                .pages
                .iter()
                .flatten()
                .all(|p| !p.dirtied));
            None
        } else {
            let (start, end) = self.pool.log().append_group(&self.log_buf)?;
            for page in self.pages.iter_mut().flatten().filter(|p| p.dirtied) {
                page.guard.set_page_lsn(end);
            }
            // Flush-list insertion under the pool mutex, after the LSN is
            // on the page and before any latch is released.
            for page in self.pages.iter().flatten().filter(|p| p.dirtied) {
                self.pool.note_modification(&page.guard, start, end);
            }
            trace!(%start, %end, pages = self.pages.len(), "mtr commit");
            Some((start, end))
        };
        // Reverse release order.
        while self.pages.pop().is_some() {}
        self.log_buf.clear();
        Ok(lsns)
    }
}

impl<F: StorageFile> Drop for Mtr<F> {
    fn drop(&mut self) {
        // A dropped MTR with buffered redo would mean page images diverge
        // from the log; modifications happen under X latches that we are
        // about to release, so this must never happen outside commit.
        debug_assert!(
            self.log_buf.is_empty(),
            "mini-transaction dropped with uncommitted modifications"
        );
        while self.pages.pop().is_some() {}
    }
}
