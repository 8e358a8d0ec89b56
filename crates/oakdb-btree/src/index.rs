//! The B+ tree proper: creation, latch-coupled descent, and cursor
//! movement.
//!
//! Structural changes (splits, merges, root raise/lower) happen only
//! while the per-index latch is held exclusively; searches and leaf-local
//! modifications hold it shared. Page latches therefore follow the simple
//! crabbing protocol: latch the child, release the parent.

use std::sync::Arc;

use oakdb_error::{OakError, Result};
use oakdb_fsp::{fseg_alloc_page, fseg_create, fseg_free_page, read_segment_header, write_segment_header};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::{BufferPool, LatchMode};
use oakdb_types::limits::{FIL_NULL, FIL_PAGE_NEXT, FIL_PAGE_PREV};
use oakdb_types::{mach, FileAddr, HeapNo, IndexId, PageId, PageNo, SpaceId};
use oakdb_vfs::StorageFile;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::page::{self, PAGE_BTR_SEG_LEAF, PAGE_BTR_SEG_TOP, PAGE_INFIMUM, PAGE_SUPREMUM};
use crate::rec;
use crate::ReorgHook;

/// Records larger than this are rejected up front so any page can always
/// hold at least two of them after a split.
pub const MAX_REC_DATA: usize = 4000;

/// One open B+ tree index.
pub struct BtreeIndex {
    pub id: IndexId,
    pub space: SpaceId,
    pub root: PageNo,
    /// Clustered indexes store full rows with (trx-id, roll-ptr) system
    /// columns; secondary indexes store key + primary key.
    pub clustered: bool,
    latch: RwLock<()>,
    hook: Option<Arc<dyn ReorgHook>>,
}

/// Held index latch; shared for searches and leaf-local changes,
/// exclusive for structural changes.
pub enum TreeLatch<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

/// A positioned leaf cursor: `rec` is the origin of the last record with
/// key ≤ the search key (possibly the infimum).
#[derive(Debug, Clone, Copy)]
pub struct LeafCursor {
    pub page: PageHandle,
    pub rec: u16,
    pub exact: bool,
}

/// Bookmark for restoring a cursor position across latch release.
#[derive(Debug, Clone)]
pub struct CursorBookmark {
    pub page_no: PageNo,
    pub rec: u16,
    pub key: Vec<u8>,
    pub modify_clock: u64,
}

impl BtreeIndex {
    /// Create a new index: two segments (leaf and non-leaf) and an empty
    /// leaf root allocated from the non-leaf segment.
    pub fn create<F: StorageFile>(
        pool: &Arc<BufferPool<F>>,
        space: SpaceId,
        id: IndexId,
        clustered: bool,
        hook: Option<Arc<dyn ReorgHook>>,
    ) -> Result<Self> {
        let mut mtr = Mtr::start(Arc::clone(pool));
        let top_seg = fseg_create(&mut mtr, space)?;
        let root_no = fseg_alloc_page(&mut mtr, space, top_seg)?;
        let leaf_seg = fseg_create(&mut mtr, space)?;

        let root_h = mtr.create_page(PageId::new(space, root_no))?;
        page::page_create(&mut mtr, root_h, id, 0);
        write_segment_header(&mut mtr, root_h, PAGE_BTR_SEG_TOP, space, top_seg);
        write_segment_header(&mut mtr, root_h, PAGE_BTR_SEG_LEAF, space, leaf_seg);
        mtr.commit()?;
        debug!(index = %id, %space, root = %root_no, "created index");
        Ok(Self {
            id,
            space,
            root: root_no,
            clustered,
            latch: RwLock::new(()),
            hook,
        })
    }

    /// Open an existing index whose root is known (from the dictionary).
    #[must_use]
    pub fn open(
        space: SpaceId,
        id: IndexId,
        root: PageNo,
        clustered: bool,
        hook: Option<Arc<dyn ReorgHook>>,
    ) -> Self {
        Self {
            id,
            space,
            root,
            clustered,
            latch: RwLock::new(()),
            hook,
        }
    }

    /// Shared index latch: searches, scans, leaf-local inserts/deletes.
    #[must_use]
    pub fn latch_read(&self) -> TreeLatch<'_> {
        TreeLatch::Read(self.latch.read())
    }

    /// Exclusive index latch: splits, merges, root changes.
    #[must_use]
    pub fn latch_write(&self) -> TreeLatch<'_> {
        TreeLatch::Write(self.latch.write())
    }

    pub(crate) fn hook(&self) -> Option<&Arc<dyn ReorgHook>> {
        self.hook.as_ref()
    }

    pub(crate) fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.space, page_no)
    }

    /// The segment feeding pages of the given level, read from the root
    /// (which must be latched in this MTR).
    pub(crate) fn segment_for_level<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        leaf: bool,
    ) -> Result<FileAddr> {
        let root_h = mtr.get_page(self.page_id(self.root), LatchMode::Exclusive)?;
        let off = if leaf { PAGE_BTR_SEG_LEAF } else { PAGE_BTR_SEG_TOP };
        let (_, addr) = read_segment_header(mtr.page_data(root_h), off);
        Ok(addr)
    }

    pub(crate) fn alloc_page<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        leaf: bool,
    ) -> Result<PageNo> {
        let seg = self.segment_for_level(mtr, leaf)?;
        fseg_alloc_page(mtr, self.space, seg)
    }

    pub(crate) fn free_page<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        leaf: bool,
        page_no: PageNo,
    ) -> Result<()> {
        let seg = self.segment_for_level(mtr, leaf)?;
        fseg_free_page(mtr, self.space, seg, page_no)
    }

    // --- Descent ---

    /// The child pointer stored in a node record.
    #[must_use]
    pub fn node_ptr_child(page_data: &[u8], origin: u16) -> PageNo {
        let dlen = rec::data_len(page_data, origin);
        PageNo(mach::read_u32(
            page_data,
            usize::from(origin) + dlen - 4,
        ))
    }

    /// Latch-coupled descent to the leaf that covers `key`. Internal
    /// levels are latched shared and released as soon as the child is
    /// latched; the leaf is latched in `leaf_mode`. The caller must hold
    /// the index latch (shared suffices).
    pub fn search_leaf<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        key: &[u8],
        leaf_mode: LatchMode,
    ) -> Result<LeafCursor> {
        let mut h = mtr.get_page(self.page_id(self.root), LatchMode::Shared)?;
        if page::is_leaf(mtr.page_data(h)) && leaf_mode == LatchMode::Exclusive {
            // Root is the leaf and we need it exclusive; relatch. The
            // shared index latch keeps the root's role stable meanwhile.
            mtr.release_page(h);
            h = mtr.get_page(self.page_id(self.root), LatchMode::Exclusive)?;
        }
        loop {
            let data = mtr.page_data(h);
            if page::is_leaf(data) {
                let (at, exact) = page::search_le(data, key);
                return Ok(LeafCursor { page: h, rec: at, exact });
            }
            let child = self.child_for_key(data, key)?;
            let child_is_leaf = page::level(data) == 1;
            let mode = if child_is_leaf { leaf_mode } else { LatchMode::Shared };
            let ch = mtr.get_page(self.page_id(child), mode)?;
            mtr.release_page(h);
            h = ch;
        }
    }

    /// Descent keeping an exclusive latch on every level; for structural
    /// changes under the exclusive index latch. Returns the path from the
    /// root (index 0) to the leaf.
    pub(crate) fn descend_x<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        key: &[u8],
    ) -> Result<Vec<PageHandle>> {
        let mut path = Vec::new();
        let mut h = mtr.get_page(self.page_id(self.root), LatchMode::Exclusive)?;
        loop {
            path.push(h);
            let data = mtr.page_data(h);
            if page::is_leaf(data) {
                return Ok(path);
            }
            let child = self.child_for_key(data, key)?;
            h = mtr.get_page(self.page_id(child), LatchMode::Exclusive)?;
        }
    }

    fn child_for_key(&self, data: &[u8], key: &[u8]) -> Result<PageNo> {
        let (at, _) = page::search_le(data, key);
        let at = if at == PAGE_INFIMUM {
            page::first_user_rec(data).ok_or_else(|| {
                OakError::corrupt(self.space.0, self.root.0, "empty internal page".to_owned())
            })?
        } else {
            at
        };
        Ok(Self::node_ptr_child(data, at))
    }

    // --- Cursor movement ---

    /// Advance to the next user record, following the leaf chain. Returns
    /// false at the end of the index (cursor parks on the supremum of the
    /// last leaf).
    pub fn cursor_next<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &mut LeafCursor,
        mode: LatchMode,
    ) -> Result<bool> {
        let data = mtr.page_data(cur.page);
        let nxt = rec::next(data, cur.rec);
        if nxt != 0 && nxt != PAGE_SUPREMUM {
            cur.rec = nxt;
            cur.exact = false;
            return Ok(true);
        }
        loop {
            let data = mtr.page_data(cur.page);
            let next_pg = page::next_page(data);
            if next_pg == FIL_NULL {
                cur.rec = PAGE_SUPREMUM;
                return Ok(false);
            }
            // Forward scans latch siblings left to right.
            let nh = mtr.get_page(self.page_id(PageNo(next_pg)), mode)?;
            mtr.release_page(cur.page);
            cur.page = nh;
            if let Some(r) = page::first_user_rec(mtr.page_data(nh)) {
                cur.rec = r;
                cur.exact = false;
                return Ok(true);
            }
        }
    }

    /// Step back to the previous user record. The current leaf's latch is
    /// released before the left sibling is taken; sibling links cannot
    /// change underneath because structural changes need the exclusive
    /// index latch.
    pub fn cursor_prev<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &mut LeafCursor,
        mode: LatchMode,
    ) -> Result<bool> {
        if cur.rec != PAGE_INFIMUM {
            let data = mtr.page_data(cur.page);
            let p = page::rec_prev(data, cur.rec);
            if p != PAGE_INFIMUM {
                cur.rec = p;
                cur.exact = false;
                return Ok(true);
            }
            cur.rec = PAGE_INFIMUM;
        }
        loop {
            let data = mtr.page_data(cur.page);
            let prev_pg = page::prev_page(data);
            let this_pg = mtr.page_id(cur.page).page_no;
            if prev_pg == FIL_NULL {
                cur.rec = PAGE_INFIMUM;
                return Ok(false);
            }
            mtr.release_page(cur.page);
            let ph = mtr.get_page(self.page_id(PageNo(prev_pg)), mode)?;
            debug_assert_eq!(
                page::next_page(mtr.page_data(ph)),
                this_pg.0,
                "leaf chain changed without the index latch"
            );
            cur.page = ph;
            if let Some(r) = page::last_user_rec(mtr.page_data(ph)) {
                cur.rec = r;
                cur.exact = false;
                return Ok(true);
            }
        }
    }

    /// Position on the first user record of the index.
    pub fn cursor_first<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        mode: LatchMode,
    ) -> Result<Option<LeafCursor>> {
        let mut cur = self.search_leaf(mtr, &[], mode)?;
        // Empty key sorts before everything; the cursor parks on the
        // infimum of the leftmost leaf.
        if self.cursor_next(mtr, &mut cur, mode)? {
            Ok(Some(cur))
        } else {
            Ok(None)
        }
    }

    /// Position on the last user record of the index.
    pub fn cursor_last<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        mode: LatchMode,
    ) -> Result<Option<LeafCursor>> {
        let mut cur = self.search_leaf(mtr, &[0xFF; 32], mode)?;
        // A key of 32 0xFF bytes may still sort below long user keys;
        // walk forward to the true end, then step back onto a record.
        while self.cursor_next(mtr, &mut cur, mode)? {}
        if self.cursor_prev(mtr, &mut cur, mode)? {
            Ok(Some(cur))
        } else {
            Ok(None)
        }
    }

    /// Save a bookmark so the caller can release every latch and restore
    /// later.
    pub fn bookmark<F: StorageFile>(&self, mtr: &Mtr<F>, cur: &LeafCursor) -> CursorBookmark {
        let data = mtr.page_data(cur.page);
        let key = if cur.rec == PAGE_INFIMUM || cur.rec == PAGE_SUPREMUM {
            Vec::new()
        } else {
            rec::key(data, cur.rec).to_vec()
        };
        CursorBookmark {
            page_no: mtr.page_id(cur.page).page_no,
            rec: cur.rec,
            key,
            modify_clock: mtr.modify_clock(cur.page),
        }
    }

    /// Restore a bookmarked position. If the page is unchanged (modify
    /// clock matches) the exact position is revived; otherwise the key is
    /// re-searched from the root.
    pub fn restore<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        bm: &CursorBookmark,
        leaf_mode: LatchMode,
    ) -> Result<LeafCursor> {
        let h = mtr.get_page(self.page_id(bm.page_no), leaf_mode)?;
        if mtr.modify_clock(h) == bm.modify_clock {
            return Ok(LeafCursor {
                page: h,
                rec: bm.rec,
                exact: false,
            });
        }
        mtr.release_page(h);
        self.search_leaf(mtr, &bm.key, leaf_mode)
    }

    // --- Sibling link maintenance (structural ops) ---

    pub(crate) fn link_after<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        left: PageHandle,
        right: PageHandle,
    ) -> Result<()> {
        let left_no = mtr.page_id(left).page_no;
        let right_no = mtr.page_id(right).page_no;
        let old_next = page::next_page(mtr.page_data(left));
        mtr.write_u32(right, FIL_PAGE_PREV, left_no.0);
        mtr.write_u32(right, FIL_PAGE_NEXT, old_next);
        mtr.write_u32(left, FIL_PAGE_NEXT, right_no.0);
        if old_next != FIL_NULL {
            let nh = mtr.get_page(self.page_id(PageNo(old_next)), LatchMode::Exclusive)?;
            mtr.write_u32(nh, FIL_PAGE_PREV, right_no.0);
        }
        Ok(())
    }

    pub(crate) fn unlink_right<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        left: PageHandle,
        right: PageHandle,
    ) -> Result<()> {
        let left_no = mtr.page_id(left).page_no;
        let new_next = page::next_page(mtr.page_data(right));
        mtr.write_u32(left, FIL_PAGE_NEXT, new_next);
        if new_next != FIL_NULL {
            let nh = mtr.get_page(self.page_id(PageNo(new_next)), LatchMode::Exclusive)?;
            mtr.write_u32(nh, FIL_PAGE_PREV, left_no.0);
        }
        Ok(())
    }

    /// Notify the reorg hook about a leaf record that moved pages.
    pub(crate) fn note_moved<F: StorageFile>(
        &self,
        mtr: &Mtr<F>,
        from_page: PageHandle,
        from_heap: HeapNo,
        to_page: PageHandle,
        to_heap: HeapNo,
    ) {
        if let Some(hook) = self.hook() {
            hook.rec_moved(
                mtr.page_id(from_page),
                from_heap,
                mtr.page_id(to_page),
                to_heap,
            );
        }
    }
}
