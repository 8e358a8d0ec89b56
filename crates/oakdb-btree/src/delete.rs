//! Deletion: delete-marking, optimistic physical removal, and pessimistic
//! removal with page merges and tree shrink.

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::LatchMode;
use oakdb_types::limits::{FIL_NULL, FIL_PAGE_NEXT, FIL_PAGE_PREV};
use oakdb_types::{HeapNo, PageNo};
use oakdb_vfs::StorageFile;
use tracing::debug;

use crate::index::{BtreeIndex, LeafCursor};
use crate::page::{self, PAGE_BTR_SEG_LEAF, PAGE_INFIMUM, PAGE_MAX_TRX_ID, PAGE_SUPREMUM};
use crate::rec::{self, REC_INFO_DELETED};

impl BtreeIndex {
    /// Set or clear the delete mark on the record under the cursor. This
    /// is the MVCC-safe "delete": the record stays in place for old read
    /// views until purge removes it physically.
    pub fn delete_mark_at<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &LeafCursor,
        mark: bool,
    ) {
        let b = rec::info_byte(mtr.page_data(cur.page), cur.rec);
        let new = if mark {
            b | REC_INFO_DELETED
        } else {
            b & !REC_INFO_DELETED
        };
        mtr.write_u8(cur.page, usize::from(cur.rec) - 5, new);
    }

    /// Whether removing the record under `cur` and reinserting
    /// `new_data_len` data bytes can stay leaf-local: the removal must
    /// not underfill the page and the replacement must fit (the removed
    /// slot is reusable when it is at least as large).
    #[must_use]
    pub fn can_replace_optimistically<F: StorageFile>(
        &self,
        mtr: &Mtr<F>,
        cur: &LeafCursor,
        new_data_len: usize,
    ) -> bool {
        let data = mtr.page_data(cur.page);
        let old_dlen = rec::data_len(data, cur.rec);
        if old_dlen == new_data_len {
            return true;
        }
        let old_size = rec::size(data, cur.rec);
        let is_root = mtr.page_id(cur.page).page_no == self.root;
        let capacity =
            oakdb_types::limits::PAGE_TRAILER - page::PAGE_SUPREMUM_END - page::DIR_SLOT_SIZE * 16;
        let removal_ok = is_root || (page::used_bytes(data) - old_size) * 2 >= capacity;
        let insert_ok = old_size >= crate::rec::REC_EXTRAS + new_data_len
            || page::fits(data, new_data_len);
        removal_ok && insert_ok
    }

    /// Optimistic physical removal: succeeds only when it cannot underfill
    /// the page (or the page is the root). Returns `false` when the caller
    /// must escalate to [`BtreeIndex::remove_pessimistic`].
    pub fn remove_at<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &LeafCursor,
    ) -> Result<bool> {
        let data = mtr.page_data(cur.page);
        let is_root = mtr.page_id(cur.page).page_no == self.root;
        if !is_root {
            let after = page::used_bytes(data) - rec::size(data, cur.rec);
            let capacity =
                oakdb_types::limits::PAGE_TRAILER - page::PAGE_SUPREMUM_END - page::DIR_SLOT_SIZE * 16;
            if after * 2 < capacity {
                return Ok(false);
            }
        }
        self.remove_on_page(mtr, cur.page, cur.rec)?;
        Ok(true)
    }

    /// Remove one record from a latched page, logging and notifying the
    /// lock system's gap inheritance.
    fn remove_on_page<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        h: PageHandle,
        origin: u16,
    ) -> Result<()> {
        let data = mtr.page_data(h);
        let heap = rec::heap_no(data, origin);
        let heir = rec::next(data, origin);
        let heir_heap = rec::heap_no(data, heir);
        let leaf = page::is_leaf(data);
        page::apply_delete(mtr.page_data_mut_unlogged(h), origin)?;
        mtr.log_rec_delete(h, origin);
        if leaf {
            if let Some(hook) = self.hook() {
                hook.rec_removed(mtr.page_id(h), heap, mtr.page_id(h), heir_heap);
            }
        }
        Ok(())
    }

    /// Pessimistic removal of the record with `key` (which must exist):
    /// exclusive descent, removal, then merges up the path and a root
    /// shrink when the tree can lose a level. The caller holds the
    /// exclusive index latch.
    pub fn remove_pessimistic<F: StorageFile>(&self, mtr: &mut Mtr<F>, key: &[u8]) -> Result<()> {
        let mut path = self.descend_x(mtr, key)?;
        let leaf_h = *path.last().expect("descent returns at least the root");
        let (at, exact) = page::search_le(mtr.page_data(leaf_h), key);
        if !exact {
            return Err(OakError::RowNotFound);
        }
        self.remove_on_page(mtr, leaf_h, at)?;

        // Merge underfull pages from the leaf upward.
        let mut depth = path.len() - 1;
        while depth > 0 {
            let h = path[depth];
            if !page::is_underfull(mtr.page_data(h)) {
                break;
            }
            if !self.try_merge(mtr, &path, depth)? {
                break;
            }
            depth -= 1;
        }
        self.try_root_shrink(mtr, path[0])?;
        Ok(())
    }

    /// Merge `path[depth]` with a sibling when their records fit on one
    /// page. Prefers absorbing into the left sibling; falls back to
    /// absorbing the right sibling. Returns whether a merge happened.
    fn try_merge<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        path: &[PageHandle],
        depth: usize,
    ) -> Result<bool> {
        let h = path[depth];
        let parent = path[depth - 1];
        let data = mtr.page_data(h);
        let page_no = mtr.page_id(h).page_no;
        let capacity =
            oakdb_types::limits::PAGE_TRAILER - page::PAGE_SUPREMUM_END - page::DIR_SLOT_SIZE * 16;

        // Absorb this page into its left sibling. Latching left-of-right
        // here is safe: structural changes are serialized by the
        // exclusive index latch.
        let left_no = page::prev_page(data);
        if left_no != FIL_NULL {
            let left_h = mtr.get_page(self.page_id(PageNo(left_no)), LatchMode::Exclusive)?;
            if page::used_bytes(mtr.page_data(left_h)) + page::used_bytes(mtr.page_data(h))
                <= capacity
            {
                self.move_all_records(mtr, h, left_h)?;
                self.unlink_right(mtr, left_h, h)?;
                self.remove_node_ptr(mtr, parent, page_no)?;
                let leaf = page::is_leaf(mtr.page_data(h));
                self.free_page(mtr, leaf, page_no)?;
                debug!(index = %self.id, merged = %page_no, into = left_no, "merged into left sibling");
                return Ok(true);
            }
        }

        // Absorb the right sibling into this page.
        let right_no = page::next_page(mtr.page_data(h));
        if right_no != FIL_NULL {
            let right_h = mtr.get_page(self.page_id(PageNo(right_no)), LatchMode::Exclusive)?;
            if page::used_bytes(mtr.page_data(right_h)) + page::used_bytes(mtr.page_data(h))
                <= capacity
            {
                // The right sibling's node pointer may live in a cousin,
                // not in `parent`; find it before the records move.
                let right_first_key = page::first_user_rec(mtr.page_data(right_h))
                    .map(|o| rec::key(mtr.page_data(right_h), o).to_vec());
                self.move_all_records(mtr, right_h, h)?;
                self.unlink_right(mtr, h, right_h)?;
                let father = self.father_of(mtr, parent, right_no, right_first_key.as_deref())?;
                self.remove_node_ptr(mtr, father, PageNo(right_no))?;
                let leaf = page::is_leaf(mtr.page_data(h));
                self.free_page(mtr, leaf, PageNo(right_no))?;
                debug!(index = %self.id, merged = right_no, into = %page_no, "absorbed right sibling");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move every record of `from` onto the end or front of `to`,
    /// preserving key order (`to` must be the adjacent sibling).
    fn move_all_records<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        from: PageHandle,
        to: PageHandle,
    ) -> Result<()> {
        let leaf = page::is_leaf(mtr.page_data(from));
        let mut origins = Vec::new();
        {
            let src = mtr.page_data(from);
            let mut cur = rec::next(src, PAGE_INFIMUM);
            while cur != PAGE_SUPREMUM {
                origins.push(cur);
                cur = rec::next(src, cur);
            }
        }
        for &o in &origins {
            let src = mtr.page_data(from);
            let info = rec::info_byte(src, o) & 0xF0;
            let status = rec::status(src, o);
            let klen = rec::key_len(src, o);
            let rec_data = rec::data(src, o).to_vec();
            let from_heap = rec::heap_no(src, o);
            let key = rec_data[..klen].to_vec();
            let (prev, _) = page::search_le(mtr.page_data(to), &key);
            let body =
                page::build_insert_body(prev, info, status, &key, &rec_data[klen..]);
            let new_origin = page::apply_insert(mtr.page_data_mut_unlogged(to), &body)?;
            mtr.log_rec_insert(to, &body);
            if leaf {
                let to_heap = rec::heap_no(mtr.page_data(to), new_origin);
                self.note_moved(mtr, from, from_heap, to, to_heap);
            }
        }
        for &o in &origins {
            page::apply_delete(mtr.page_data_mut_unlogged(from), o)?;
            mtr.log_rec_delete(from, o);
        }
        // Keep the survivor's high-water mark.
        let from_max = page::max_trx_id(mtr.page_data(from));
        if page::max_trx_id(mtr.page_data(to)) < from_max {
            mtr.write_u64(to, PAGE_MAX_TRX_ID, from_max.0);
        }
        Ok(())
    }

    /// Remove the node pointer for `child` from `parent`.
    fn remove_node_ptr<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        parent: PageHandle,
        child: PageNo,
    ) -> Result<()> {
        let data = mtr.page_data(parent);
        let mut cur = rec::next(data, PAGE_INFIMUM);
        while cur != PAGE_SUPREMUM {
            if Self::node_ptr_child(data, cur) == child {
                page::apply_delete(mtr.page_data_mut_unlogged(parent), cur)?;
                mtr.log_rec_delete(parent, cur);
                return Ok(());
            }
            cur = rec::next(data, cur);
        }
        Err(OakError::corrupt(
            self.space.0,
            mtr.page_id(parent).page_no.0,
            format!("node pointer for child {child} not found"),
        ))
    }

    /// Find the internal page holding the node pointer for `child`.
    /// Usually that is `likely_parent`; a cousin is found by descending
    /// toward the child's first key one level above it.
    fn father_of<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        likely_parent: PageHandle,
        child: u32,
        child_first_key: Option<&[u8]>,
    ) -> Result<PageHandle> {
        {
            let data = mtr.page_data(likely_parent);
            let mut cur = rec::next(data, PAGE_INFIMUM);
            while cur != PAGE_SUPREMUM {
                if Self::node_ptr_child(data, cur) == PageNo(child) {
                    return Ok(likely_parent);
                }
                cur = rec::next(data, cur);
            }
        }
        let key = child_first_key.ok_or_else(|| {
            OakError::corrupt(self.space.0, child, "cannot locate father of empty page".to_owned())
        })?;
        let child_level = {
            let parent_level = page::level(mtr.page_data(likely_parent));
            parent_level - 1
        };
        // Descend from the root to the child's level + 1.
        let mut h = mtr.get_page(self.page_id(self.root), LatchMode::Exclusive)?;
        loop {
            let data = mtr.page_data(h);
            if page::level(data) == child_level + 1 {
                return Ok(h);
            }
            let (at, _) = page::search_le(data, key);
            let at = if at == PAGE_INFIMUM {
                page::first_user_rec(data).ok_or_else(|| {
                    OakError::corrupt(self.space.0, self.root.0, "empty internal page".to_owned())
                })?
            } else {
                at
            };
            let next = Self::node_ptr_child(data, at);
            h = mtr.get_page(self.page_id(next), LatchMode::Exclusive)?;
        }
    }

    /// Shrink the tree while the root is an internal page with a single
    /// child: pull the child's records up and drop a level.
    fn try_root_shrink<F: StorageFile>(&self, mtr: &mut Mtr<F>, root_h: PageHandle) -> Result<()> {
        loop {
            let data = mtr.page_data(root_h);
            if page::is_leaf(data) || page::n_recs(data) != 1 {
                return Ok(());
            }
            let only = page::first_user_rec(data).expect("n_recs == 1");
            let child_no = Self::node_ptr_child(data, only);
            let child_h = mtr.get_page(self.page_id(child_no), LatchMode::Exclusive)?;
            let child_data = mtr.page_data(child_h);
            let child_level = page::level(child_data);
            debug_assert_eq!(page::prev_page(child_data), FIL_NULL);
            debug_assert_eq!(page::next_page(child_data), FIL_NULL);

            // Rebuild the root at the child's level, keep segment headers.
            let mut seg_headers = [0u8; 20];
            seg_headers
                .copy_from_slice(&mtr.page_data(root_h)[PAGE_BTR_SEG_LEAF..PAGE_BTR_SEG_LEAF + 20]);
            let child_max = page::max_trx_id(child_data);
            page::page_create(mtr, root_h, self.id, child_level);
            mtr.write_bytes(root_h, PAGE_BTR_SEG_LEAF, &seg_headers);
            mtr.write_u64(root_h, PAGE_MAX_TRX_ID, child_max.0);
            mtr.write_u32(root_h, FIL_PAGE_PREV, FIL_NULL);
            mtr.write_u32(root_h, FIL_PAGE_NEXT, FIL_NULL);

            self.move_all_records(mtr, child_h, root_h)?;
            self.free_page(mtr, child_level == 0, child_no)?;
            debug!(index = %self.id, new_level = child_level, "root lowered");
        }
    }

    /// Write fresh system columns into a clustered leaf record in place
    /// (same-size update path and delete-mark bookkeeping).
    pub fn write_sys_cols<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &LeafCursor,
        trx_id: oakdb_types::TrxId,
        roll_ptr: oakdb_types::RollPtr,
    ) {
        debug_assert!(self.clustered);
        let (trx_off, roll_off) = page::sys_col_offsets(mtr.page_data(cur.page), cur.rec);
        mtr.write_u64(cur.page, trx_off, trx_id.0);
        mtr.write_u64(cur.page, roll_off, roll_ptr.0);
        page::update_max_trx_id(mtr, cur.page, trx_id);
    }

    /// Overwrite the payload of a leaf record in place (sizes must
    /// match).
    pub fn update_payload_in_place<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &LeafCursor,
        new_payload: &[u8],
    ) {
        let data = mtr.page_data(cur.page);
        let klen = rec::key_len(data, cur.rec);
        let dlen = rec::data_len(data, cur.rec);
        let sys = if self.clustered { 16 } else { 0 };
        debug_assert_eq!(dlen - klen - sys, new_payload.len(), "in-place size mismatch");
        let off = usize::from(cur.rec) + klen + sys;
        mtr.write_bytes(cur.page, off, new_payload);
    }

    /// The heap number of the record under a cursor.
    #[must_use]
    pub fn cursor_heap_no<F: StorageFile>(&self, mtr: &Mtr<F>, cur: &LeafCursor) -> HeapNo {
        rec::heap_no(mtr.page_data(cur.page), cur.rec)
    }
}
