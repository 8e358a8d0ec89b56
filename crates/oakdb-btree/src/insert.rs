//! Insertion: optimistic leaf-local, and pessimistic with page splits.

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_types::limits::PAGE_SIZE;
use oakdb_types::PageId;
use oakdb_vfs::StorageFile;
use tracing::{debug, trace};

use crate::index::{BtreeIndex, LeafCursor, MAX_REC_DATA};
use crate::page::{
    self, PAGE_BTR_SEG_LEAF, PAGE_INFIMUM, PAGE_MAX_TRX_ID, PAGE_SUPREMUM, DIRECTION_RIGHT,
};
use crate::rec::{self, RecStatus, REC_INFO_MIN_REC};

/// A record to insert: key plus the kind-specific tail (system columns +
/// payload for clustered leaves, primary key for secondary leaves).
#[derive(Debug, Clone, Copy)]
pub struct RecImage<'a> {
    pub info_bits: u8,
    pub key: &'a [u8],
    pub rest: &'a [u8],
}

impl RecImage<'_> {
    fn data_len(&self) -> usize {
        self.key.len() + self.rest.len()
    }
}

impl BtreeIndex {
    /// Optimistic insert at a positioned cursor (leaf latched exclusive,
    /// index latch shared). Returns the new record origin, or `None` when
    /// the leaf has no room and the caller must escalate.
    pub fn insert_at<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        cur: &LeafCursor,
        img: &RecImage<'_>,
    ) -> Result<Option<u16>> {
        check_rec_size(img)?;
        let data = mtr.page_data(cur.page);
        debug_assert!(!cur.exact, "insert over an existing key");
        if !page::fits(data, img.data_len()) {
            return Ok(None);
        }
        let body =
            page::build_insert_body(cur.rec, img.info_bits, RecStatus::Ordinary, img.key, img.rest);
        let origin = page::apply_insert(mtr.page_data_mut_unlogged(cur.page), &body)?;
        mtr.log_rec_insert(cur.page, &body);
        trace!(index = %self.id, origin, "optimistic insert");
        Ok(Some(origin))
    }

    /// Pessimistic insert: descend with exclusive latches and split pages
    /// as needed. The caller holds the exclusive index latch. Returns the
    /// leaf page handle and the new record's origin.
    pub fn insert_pessimistic<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        img: &RecImage<'_>,
    ) -> Result<(PageHandle, u16)> {
        check_rec_size(img)?;
        let mut path = self.descend_x(mtr, img.key)?;
        let depth = path.len() - 1;
        let key = img.key.to_vec();
        let rest = img.rest.to_vec();
        self.insert_into(mtr, &mut path, depth, img.info_bits, RecStatus::Ordinary, &key, &rest)
    }

    /// Insert a record at the given path depth, splitting upward as
    /// required. Also used to push node pointers into parents.
    fn insert_into<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        path: &mut Vec<PageHandle>,
        mut depth: usize,
        info_bits: u8,
        status: RecStatus,
        key: &[u8],
        rest: &[u8],
    ) -> Result<(PageHandle, u16)> {
        loop {
            let h = path[depth];
            let data = mtr.page_data(h);
            let (prev, exact) = page::search_le(data, key);
            debug_assert!(!exact || status == RecStatus::NodePtr, "duplicate key");
            if page::fits(data, key.len() + rest.len()) {
                let body = page::build_insert_body(prev, info_bits, status, key, rest);
                let origin = page::apply_insert(mtr.page_data_mut_unlogged(h), &body)?;
                mtr.log_rec_insert(h, &body);
                return Ok((h, origin));
            }
            if depth == 0 {
                // The root is full: raise the tree by one level and retry
                // one level further down.
                self.root_raise(mtr, path)?;
                depth = 1;
                continue;
            }
            // Split this page; the separator climbs into the parent.
            let (new_h, sep_key) = self.split_page(mtr, path[depth], key)?;
            let new_no = mtr.page_id(new_h).page_no;
            let len_before = path.len();
            self.insert_into(
                mtr,
                path,
                depth - 1,
                0,
                RecStatus::NodePtr,
                &sep_key,
                &new_no.0.to_be_bytes(),
            )?;
            // A parent split may have raised the root and shifted the
            // path below it.
            depth += path.len() - len_before;
            // Retry in whichever half now covers the key.
            if key >= sep_key.as_slice() {
                path[depth] = new_h;
            }
        }
    }

    /// Split `h` into itself and a new right sibling. Returns the new
    /// page's handle and its first key (the separator). The record being
    /// inserted (`key_hint`) biases the split point: a rightmost
    /// sequential insert gets an empty right page.
    fn split_page<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        h: PageHandle,
        key_hint: &[u8],
    ) -> Result<(PageHandle, Vec<u8>)> {
        let data = mtr.page_data(h);
        let level = page::level(data);
        let leaf = level == 0;

        // Collect the chain once.
        let mut origins = Vec::with_capacity(usize::from(page::n_recs(data)));
        let mut cur = rec::next(data, PAGE_INFIMUM);
        let mut total = 0usize;
        while cur != PAGE_SUPREMUM {
            origins.push(cur);
            total += rec::size(data, cur);
            cur = rec::next(data, cur);
        }

        let sequential = page::direction(data) == DIRECTION_RIGHT
            && page::n_direction(data) >= 3
            && origins
                .last()
                .is_some_and(|&last| rec::cmp_with_key(data, last, key_hint).is_lt());
        let split_idx = if sequential {
            origins.len()
        } else {
            // Byte-balanced split point.
            let mut acc = 0usize;
            let mut idx = origins.len() / 2;
            for (i, &o) in origins.iter().enumerate() {
                acc += rec::size(data, o);
                if acc * 2 >= total {
                    idx = (i + 1).min(origins.len() - 1);
                    break;
                }
            }
            idx.max(1)
        };

        let new_no = self.alloc_page(mtr, leaf)?;
        let new_h = mtr.create_page(PageId::new(self.space, new_no))?;
        page::page_create(mtr, new_h, self.id, level);
        mtr.write_u64(new_h, PAGE_MAX_TRX_ID, page::max_trx_id(mtr.page_data(h)).0);

        // Move the tail records to the new page, preserving order.
        let mut prev_on_new = PAGE_INFIMUM;
        for &o in &origins[split_idx..] {
            let src = mtr.page_data(h);
            let info = rec::info_byte(src, o) & 0xF0 & !REC_INFO_MIN_REC;
            let status = rec::status(src, o);
            let klen = rec::key_len(src, o);
            let rec_data = rec::data(src, o).to_vec();
            let from_heap = rec::heap_no(src, o);
            let body = page::build_insert_body(
                prev_on_new,
                info,
                status,
                &rec_data[..klen],
                &rec_data[klen..],
            );
            let new_origin = page::apply_insert(mtr.page_data_mut_unlogged(new_h), &body)?;
            mtr.log_rec_insert(new_h, &body);
            prev_on_new = new_origin;
            if leaf {
                let to_heap = rec::heap_no(mtr.page_data(new_h), new_origin);
                self.note_moved(mtr, h, from_heap, new_h, to_heap);
            }
        }
        for &o in &origins[split_idx..] {
            page::apply_delete(mtr.page_data_mut_unlogged(h), o)?;
            mtr.log_rec_delete(h, o);
        }

        self.link_after(mtr, h, new_h)?;

        let sep_key = if split_idx < origins.len() {
            let nd = mtr.page_data(new_h);
            let first = page::first_user_rec(nd).expect("split moved records");
            rec::key(nd, first).to_vec()
        } else {
            key_hint.to_vec()
        };
        debug!(
            index = %self.id,
            from = %mtr.page_id(h),
            to = %new_no,
            level,
            moved = origins.len() - split_idx,
            "page split"
        );
        Ok((new_h, sep_key))
    }

    /// Grow the tree: move the root's records into a fresh child and turn
    /// the root into a one-child internal page. The root page number
    /// never changes (segment headers and the dictionary point at it).
    fn root_raise<F: StorageFile>(
        &self,
        mtr: &mut Mtr<F>,
        path: &mut Vec<PageHandle>,
    ) -> Result<()> {
        let root_h = path[0];
        let data = mtr.page_data(root_h);
        let old_level = page::level(data);
        let leaf = old_level == 0;

        let child_no = self.alloc_page(mtr, leaf)?;
        let child_h = mtr.create_page(PageId::new(self.space, child_no))?;
        page::page_create(mtr, child_h, self.id, old_level);
        mtr.write_u64(
            child_h,
            PAGE_MAX_TRX_ID,
            page::max_trx_id(mtr.page_data(root_h)).0,
        );

        // Move everything.
        let mut origins = Vec::new();
        let src = mtr.page_data(root_h);
        let mut cur = rec::next(src, PAGE_INFIMUM);
        while cur != PAGE_SUPREMUM {
            origins.push(cur);
            cur = rec::next(src, cur);
        }
        let mut prev_on_child = PAGE_INFIMUM;
        for &o in &origins {
            let src = mtr.page_data(root_h);
            let info = rec::info_byte(src, o) & 0xF0;
            let status = rec::status(src, o);
            let klen = rec::key_len(src, o);
            let rec_data = rec::data(src, o).to_vec();
            let from_heap = rec::heap_no(src, o);
            let body = page::build_insert_body(
                prev_on_child,
                info,
                status,
                &rec_data[..klen],
                &rec_data[klen..],
            );
            let new_origin = page::apply_insert(mtr.page_data_mut_unlogged(child_h), &body)?;
            mtr.log_rec_insert(child_h, &body);
            prev_on_child = new_origin;
            if leaf {
                let to_heap = rec::heap_no(mtr.page_data(child_h), new_origin);
                self.note_moved(mtr, root_h, from_heap, child_h, to_heap);
            }
        }

        // Rebuild the root one level up, preserving its segment headers.
        let mut seg_headers = [0u8; 20];
        seg_headers.copy_from_slice(&mtr.page_data(root_h)[PAGE_BTR_SEG_LEAF..PAGE_BTR_SEG_LEAF + 20]);
        let max_trx = page::max_trx_id(mtr.page_data(root_h));
        page::page_create(mtr, root_h, self.id, old_level + 1);
        mtr.write_bytes(root_h, PAGE_BTR_SEG_LEAF, &seg_headers);
        mtr.write_u64(root_h, PAGE_MAX_TRX_ID, max_trx.0);

        // Single node pointer to the child, flagged as the level minimum.
        let child_data = mtr.page_data(child_h);
        let first = page::first_user_rec(child_data).expect("root raise moved records");
        let first_key = rec::key(child_data, first).to_vec();
        let body = page::build_insert_body(
            PAGE_INFIMUM,
            REC_INFO_MIN_REC,
            RecStatus::NodePtr,
            &first_key,
            &child_no.0.to_be_bytes(),
        );
        page::apply_insert(mtr.page_data_mut_unlogged(root_h), &body)?;
        mtr.log_rec_insert(root_h, &body);

        path.insert(1, child_h);
        debug!(index = %self.id, new_level = old_level + 1, child = %child_no, "root raised");
        Ok(())
    }
}

fn check_rec_size(img: &RecImage<'_>) -> Result<()> {
    if img.key.is_empty() {
        return Err(OakError::invalid("empty key"));
    }
    if img.data_len() > MAX_REC_DATA {
        return Err(OakError::invalid(format!(
            "record of {} bytes exceeds the {MAX_REC_DATA}-byte limit for {PAGE_SIZE}-byte pages",
            img.data_len()
        )));
    }
    Ok(())
}
