//! Row operations: insert, read (consistent and locking), update,
//! delete, range locking, rollback inverses, and purge.
//!
//! Locking discipline: a lock is never waited for while page latches are
//! held. Each operation resolves its lock target under a short
//! shared-latch pass, releases the latches, acquires the lock (possibly
//! waiting), then revalidates the target and retries if the tree moved
//! underneath.

use std::sync::Arc;

use oakdb_btree::{page, rec, BtreeIndex, RecImage};
use oakdb_error::{OakError, Result};
use oakdb_lock::{RecLockKind, RecLockMode, TableLockMode};
use oakdb_mtr::Mtr;
use oakdb_pager::LatchMode;
use oakdb_trx::{Trx, UndoRec, UndoRecType};
use oakdb_types::{mach, HeapNo, IndexId, PageId, RollPtr, TableId, TrxId, UndoNo};
use oakdb_vfs::Storage;
use tracing::trace;

use crate::engine::Engine;

/// Width of the (trx-id, roll-ptr) system columns in clustered leaves.
const SYS_COLS: usize = 16;

/// What a lock pass resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockTarget {
    page: PageId,
    heap: HeapNo,
    found: bool,
}

impl<S: Storage> Engine<S> {
    // -----------------------------------------------------------------
    // Locking helpers
    // -----------------------------------------------------------------

    fn resolve_target<'m>(
        &self,
        mtr: &'m Mtr<S::File>,
        cur: &oakdb_btree::LeafCursor,
        insert_intent: bool,
        gap_on_miss: bool,
    ) -> Option<LockTarget> {
        let data = mtr.page_data(cur.page);
        let page_id = mtr.page_id(cur.page);
        if insert_intent || (!cur.exact && gap_on_miss) {
            let succ = rec::next(data, cur.rec);
            Some(LockTarget {
                page: page_id,
                heap: rec::heap_no(data, succ),
                found: cur.exact,
            })
        } else if cur.exact {
            Some(LockTarget {
                page: page_id,
                heap: rec::heap_no(data, cur.rec),
                found: true,
            })
        } else {
            None
        }
    }

    /// Acquire the row-level lock covering `key`: the record itself on a
    /// hit (next-key under gap-locking isolations), the covering gap on a
    /// miss, or an insert intention on the successor. Returns whether the
    /// key currently exists.
    fn lock_row(
        &self,
        trx: &mut Trx,
        index: &Arc<BtreeIndex>,
        key: &[u8],
        exclusive: bool,
        insert_intent: bool,
    ) -> Result<bool> {
        let trx_id = self.trx_sys.ensure_id(trx)?;
        let gap_on_miss = trx.isolation.uses_gap_locks();
        for _ in 0..64 {
            let target = {
                let _tl = index.latch_read();
                let mut mtr = Mtr::start(Arc::clone(&self.pool));
                let cur = index.search_leaf(&mut mtr, key, LatchMode::Shared)?;
                // Implicit-lock conversion: the row's last writer holds an
                // implicit X lock by virtue of its id on the record; make
                // it explicit before we queue behind it.
                if cur.exact && !insert_intent {
                    let data = mtr.page_data(cur.page);
                    let (toff, _) = page::sys_col_offsets(data, cur.rec);
                    let holder = TrxId(mach::read_u64(data, toff));
                    if holder != TrxId::ZERO
                        && holder != trx_id
                        && self.trx_sys.is_active(holder)
                    {
                        self.lock_sys.grant_record_lock(
                            holder,
                            mtr.page_id(cur.page),
                            rec::heap_no(data, cur.rec),
                            RecLockMode::exclusive(RecLockKind::NotGap),
                        );
                    }
                }
                let target = self.resolve_target(&mtr, &cur, insert_intent, gap_on_miss);
                mtr.commit()?;
                target
            };
            let Some(target) = target else {
                // Read committed takes no gap lock on a miss.
                return Ok(false);
            };

            let mode = if insert_intent {
                RecLockMode::exclusive(RecLockKind::InsertIntention)
            } else if target.found {
                RecLockMode {
                    exclusive,
                    kind: if gap_on_miss {
                        RecLockKind::NextKey
                    } else {
                        RecLockKind::NotGap
                    },
                }
            } else {
                RecLockMode {
                    exclusive,
                    kind: RecLockKind::Gap,
                }
            };
            if let Err(err) = self.lock_sys.lock_record(trx_id, target.page, target.heap, mode) {
                if err.is_rollback_only() {
                    trx.rollback_only = true;
                }
                return Err(err);
            }

            // Revalidate: the tree may have reorganized while we waited.
            let same = {
                let _tl = index.latch_read();
                let mut mtr = Mtr::start(Arc::clone(&self.pool));
                let cur = index.search_leaf(&mut mtr, key, LatchMode::Shared)?;
                let now = self.resolve_target(&mtr, &cur, insert_intent, gap_on_miss);
                mtr.commit()?;
                now == Some(target)
            };
            if same {
                return Ok(target.found);
            }
            trace!(%trx_id, "lock target moved; retrying");
        }
        Err(OakError::internal("lock target kept moving"))
    }

    // -----------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------

    /// Insert a row. `secondaries` holds (index-id, secondary key) pairs;
    /// the engine appends the primary key as the tiebreaker and maintains
    /// those trees.
    pub fn insert_row(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        payload: &[u8],
        secondaries: &[(IndexId, Vec<u8>)],
    ) -> Result<()> {
        self.guard_health()?;
        self.check_usable(trx)?;
        if key.is_empty() {
            return Err(OakError::invalid("empty primary key"));
        }
        let (def, index) = self.clustered_index_of(table_id)?;
        let trx_id = self.trx_sys.ensure_id(trx)?;
        self.lock_table_checked(trx, trx_id, table_id, TableLockMode::IX)?;

        let sec_entries: Vec<(IndexId, Vec<u8>)> = secondaries
            .iter()
            .map(|(id, sec_key)| {
                let mut full = sec_key.clone();
                full.extend_from_slice(key);
                (*id, full)
            })
            .collect();

        for _ in 0..64 {
            // Gap clearance for the insert position.
            let exists = self.lock_row(trx, &index, key, true, true)?;
            if exists {
                // Either a true duplicate or a reusable delete-marked
                // slot; that path needs the record lock as well.
                self.lock_row(trx, &index, key, true, false)?;
            }

            let _tl = index.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
            if cur.exact != exists {
                // Raced with a concurrent insert or purge; take it from
                // the top.
                mtr.commit()?;
                continue;
            }
            if cur.exact {
                let data = mtr.page_data(cur.page);
                if !rec::is_deleted(data, cur.rec) {
                    mtr.commit()?;
                    return Err(OakError::DuplicateKey {
                        index_id: def.index_id.0,
                    });
                }
                // Reuse the delete-marked slot: logically an update that
                // clears the mark.
                let new_data_len = key.len() + SYS_COLS + payload.len();
                if index.can_replace_optimistically(&mtr, &cur, new_data_len) {
                    self.insert_over_deleted(
                        &mut mtr, trx, table_id, &index, &cur, key, payload, &sec_entries, false,
                    )?;
                    mtr.commit()?;
                } else {
                    mtr.commit()?;
                    drop(_tl);
                    let _tlw = index.latch_write();
                    let mut mtr = Mtr::start(Arc::clone(&self.pool));
                    let cur = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
                    if !cur.exact || !rec::is_deleted(mtr.page_data(cur.page), cur.rec) {
                        mtr.commit()?;
                        continue;
                    }
                    self.insert_over_deleted(
                        &mut mtr, trx, table_id, &index, &cur, key, payload, &sec_entries, true,
                    )?;
                    mtr.commit()?;
                }
            } else {
                let data = mtr.page_data(cur.page);
                if !page::fits(data, key.len() + SYS_COLS + payload.len()) {
                    // Escalate: structural change needs the exclusive
                    // index latch and a fresh descent.
                    mtr.commit()?;
                    drop(_tl);
                    let _tlw = index.latch_write();
                    let mut mtr = Mtr::start(Arc::clone(&self.pool));
                    // Re-check under the exclusive latch: the key may
                    // have appeared while no latch was held.
                    let recheck = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
                    if recheck.exact {
                        mtr.commit()?;
                        continue;
                    }
                    let ptr = self.write_insert_undo(&mut mtr, trx, table_id, key, &sec_entries)?;
                    let rest = clustered_rest(trx_id, ptr, payload);
                    let img = RecImage {
                        info_bits: 0,
                        key,
                        rest: &rest,
                    };
                    let (leaf, _) = index.insert_pessimistic(&mut mtr, &img)?;
                    page::update_max_trx_id(&mut mtr, leaf, trx_id);
                    mtr.commit()?;
                } else {
                    let ptr = self.write_insert_undo(&mut mtr, trx, table_id, key, &sec_entries)?;
                    let rest = clustered_rest(trx_id, ptr, payload);
                    let img = RecImage {
                        info_bits: 0,
                        key,
                        rest: &rest,
                    };
                    let inserted = index.insert_at(&mut mtr, &cur, &img)?;
                    debug_assert!(inserted.is_some(), "fits() said there was room");
                    page::update_max_trx_id(&mut mtr, cur.page, trx_id);
                    mtr.commit()?;
                }
            }

            // Secondary trees.
            for (sec_id, entry) in &sec_entries {
                self.sec_insert(trx_id, *sec_id, entry)?;
            }
            return Ok(());
        }
        Err(OakError::internal("insert position kept moving"))
    }

    fn write_insert_undo(
        &self,
        mtr: &mut Mtr<S::File>,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        sec_entries: &[(IndexId, Vec<u8>)],
    ) -> Result<RollPtr> {
        self.trx_sys.write_undo(
            mtr,
            trx,
            UndoRec {
                rec_type: UndoRecType::Insert,
                table_id,
                undo_no: UndoNo(0),
                key: key.to_vec(),
                old_trx_id: TrxId::ZERO,
                old_roll_ptr: RollPtr::ZERO,
                old_deleted: false,
                old_payload: Vec::new(),
                secondaries: sec_entries.to_vec(),
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_over_deleted(
        &self,
        mtr: &mut Mtr<S::File>,
        trx: &mut Trx,
        table_id: TableId,
        index: &Arc<BtreeIndex>,
        cur: &oakdb_btree::LeafCursor,
        key: &[u8],
        payload: &[u8],
        sec_entries: &[(IndexId, Vec<u8>)],
        structural: bool,
    ) -> Result<()> {
        let trx_id = trx.id.expect("caller assigned the id");
        let data = mtr.page_data(cur.page);
        let (toff, roff) = page::sys_col_offsets(data, cur.rec);
        let old_trx = TrxId(mach::read_u64(data, toff));
        let old_roll = RollPtr(mach::read_u64(data, roff));
        let klen = rec::key_len(data, cur.rec);
        let dlen = rec::data_len(data, cur.rec);
        let old_payload =
            data[usize::from(cur.rec) + klen + SYS_COLS..usize::from(cur.rec) + dlen].to_vec();

        let ptr = self.trx_sys.write_undo(
            mtr,
            trx,
            UndoRec {
                rec_type: UndoRecType::UpdateExisting,
                table_id,
                undo_no: UndoNo(0),
                key: key.to_vec(),
                old_trx_id: old_trx,
                old_roll_ptr: old_roll,
                old_deleted: true,
                old_payload,
                secondaries: sec_entries.to_vec(),
            },
        )?;
        // Same key; the payload may differ in size.
        self.replace_payload(mtr, index, cur, key, payload, trx_id, ptr, false, structural)?;
        Ok(())
    }

    /// Rewrite a clustered record's payload and system columns; clears or
    /// sets the delete mark. In place when sizes match, else a physical
    /// remove + reinsert on the same key. With `structural` the caller
    /// holds the exclusive index latch and splits/merges are allowed;
    /// without it the caller must have verified
    /// [`BtreeIndex::can_replace_optimistically`] under the same latch.
    #[allow(clippy::too_many_arguments)]
    fn replace_payload(
        &self,
        mtr: &mut Mtr<S::File>,
        index: &Arc<BtreeIndex>,
        cur: &oakdb_btree::LeafCursor,
        key: &[u8],
        new_payload: &[u8],
        trx_id: TrxId,
        roll_ptr: RollPtr,
        delete_marked: bool,
        structural: bool,
    ) -> Result<()> {
        let data = mtr.page_data(cur.page);
        let klen = rec::key_len(data, cur.rec);
        let dlen = rec::data_len(data, cur.rec);
        let same_size = dlen - klen - SYS_COLS == new_payload.len();
        if same_size {
            index.delete_mark_at(mtr, cur, delete_marked);
            index.update_payload_in_place(mtr, cur, new_payload);
            index.write_sys_cols(mtr, cur, trx_id, roll_ptr);
            return Ok(());
        }
        // Size changed: remove and reinsert under the same key.
        let rest = clustered_rest(trx_id, roll_ptr, new_payload);
        let img = RecImage {
            info_bits: if delete_marked {
                rec::REC_INFO_DELETED
            } else {
                0
            },
            key,
            rest: &rest,
        };
        let removed_in_page = index.remove_at(mtr, cur)?;
        if !removed_in_page {
            if !structural {
                return Err(OakError::internal(
                    "leaf-local replacement was not pre-checked",
                ));
            }
            index.remove_pessimistic(mtr, key)?;
            // The leaf may have merged away; reinsert with a fresh
            // descent.
            let (leaf, _) = index.insert_pessimistic(mtr, &img)?;
            page::update_max_trx_id(mtr, leaf, trx_id);
            return Ok(());
        }
        let (at, exact) = page::search_le(mtr.page_data(cur.page), key);
        debug_assert!(!exact);
        let reinsert = oakdb_btree::LeafCursor {
            page: cur.page,
            rec: at,
            exact: false,
        };
        // The reinserted image already carries the new system columns.
        if index.insert_at(mtr, &reinsert, &img)?.is_none() {
            if !structural {
                return Err(OakError::internal(
                    "leaf-local replacement was not pre-checked",
                ));
            }
            let (leaf, _) = index.insert_pessimistic(mtr, &img)?;
            page::update_max_trx_id(mtr, leaf, trx_id);
            return Ok(());
        }
        page::update_max_trx_id(mtr, cur.page, trx_id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Consistent (non-locking) read through the transaction's view.
    pub fn read_row(&self, trx: &mut Trx, table_id: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.guard_health()?;
        self.check_usable(trx)?;
        let (_, index) = self.clustered_index_of(table_id)?;
        let temp = if trx.view.is_none() {
            // Read committed: a fresh view per statement.
            Some(self.trx_sys.open_view(trx.id_or_zero()))
        } else {
            None
        };
        let view = trx
            .view
            .as_ref()
            .map(|v| Arc::clone(&v.view))
            .unwrap_or_else(|| Arc::clone(&temp.as_ref().expect("opened above").view));

        let result = (|| {
            let current = {
                let _tl = index.latch_read();
                let mut mtr = Mtr::start(Arc::clone(&self.pool));
                let cur = index.search_leaf(&mut mtr, key, LatchMode::Shared)?;
                let snap = cur.exact.then(|| read_clustered(&mtr, &cur));
                mtr.commit()?;
                snap
            };
            let Some((rec_trx, roll, payload, deleted)) = current else {
                return Ok(None);
            };
            // A transaction always sees its own writes.
            if trx.id.is_some() && rec_trx == trx.id_or_zero() {
                return Ok((!deleted).then_some(payload));
            }
            oakdb_trx::visible_version(&self.pool, &view, rec_trx, roll, &payload, deleted)
        })();
        if let Some(t) = temp {
            self.trx_sys.close_view(&t);
        }
        result
    }

    /// Locking read: lock the record (S or X), then return the latest
    /// committed version.
    pub fn read_row_locking(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        exclusive: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.guard_health()?;
        self.check_usable(trx)?;
        let (_, index) = self.clustered_index_of(table_id)?;
        let trx_id = self.trx_sys.ensure_id(trx)?;
        let table_mode = if exclusive {
            TableLockMode::IX
        } else {
            TableLockMode::IS
        };
        self.lock_table_checked(trx, trx_id, table_id, table_mode)?;
        if !self.lock_row(trx, &index, key, exclusive, false)? {
            return Ok(None);
        }
        let _tl = index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let cur = index.search_leaf(&mut mtr, key, LatchMode::Shared)?;
        let out = if cur.exact {
            let (_, _, payload, deleted) = read_clustered(&mtr, &cur);
            (!deleted).then_some(payload)
        } else {
            None
        };
        mtr.commit()?;
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Update / delete
    // -----------------------------------------------------------------

    /// Update a row's payload (key and secondary entries unchanged; a
    /// key-changing update is a delete plus an insert at the row layer).
    pub fn update_row(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        new_payload: &[u8],
    ) -> Result<()> {
        self.guard_health()?;
        self.check_usable(trx)?;
        let (_, index) = self.clustered_index_of(table_id)?;
        let trx_id = self.trx_sys.ensure_id(trx)?;
        self.lock_table_checked(trx, trx_id, table_id, TableLockMode::IX)?;
        if !self.lock_row(trx, &index, key, true, false)? {
            return Err(OakError::RowNotFound);
        }

        // Leaf-local attempt first; escalate to the exclusive index latch
        // when the replacement cannot stay on the page.
        {
            let _tl = index.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
            if !cur.exact {
                mtr.commit()?;
                return Err(OakError::RowNotFound);
            }
            let (old_trx, old_roll, old_payload, deleted) = read_clustered(&mtr, &cur);
            if deleted {
                mtr.commit()?;
                return Err(OakError::RowNotFound);
            }
            let new_data_len = key.len() + SYS_COLS + new_payload.len();
            if index.can_replace_optimistically(&mtr, &cur, new_data_len) {
                let ptr = self.write_update_undo(
                    &mut mtr, trx, table_id, key, old_trx, old_roll, old_payload,
                )?;
                self.replace_payload(
                    &mut mtr, &index, &cur, key, new_payload, trx_id, ptr, false, false,
                )?;
                page::update_max_trx_id(&mut mtr, cur.page, trx_id);
                mtr.commit()?;
                return Ok(());
            }
            mtr.commit()?;
        }

        let _tlw = index.latch_write();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let cur = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
        if !cur.exact {
            mtr.commit()?;
            return Err(OakError::RowNotFound);
        }
        let (old_trx, old_roll, old_payload, deleted) = read_clustered(&mtr, &cur);
        if deleted {
            mtr.commit()?;
            return Err(OakError::RowNotFound);
        }
        let ptr =
            self.write_update_undo(&mut mtr, trx, table_id, key, old_trx, old_roll, old_payload)?;
        self.replace_payload(&mut mtr, &index, &cur, key, new_payload, trx_id, ptr, false, true)?;
        mtr.commit()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_update_undo(
        &self,
        mtr: &mut Mtr<S::File>,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        old_trx: TrxId,
        old_roll: RollPtr,
        old_payload: Vec<u8>,
    ) -> Result<RollPtr> {
        self.trx_sys.write_undo(
            mtr,
            trx,
            UndoRec {
                rec_type: UndoRecType::UpdateExisting,
                table_id,
                undo_no: UndoNo(0),
                key: key.to_vec(),
                old_trx_id: old_trx,
                old_roll_ptr: old_roll,
                old_deleted: false,
                old_payload,
                secondaries: Vec::new(),
            },
        )
    }

    /// Delete a row: delete-mark the clustered record and every secondary
    /// entry; physical removal happens at purge.
    pub fn delete_row(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        key: &[u8],
        secondaries: &[(IndexId, Vec<u8>)],
    ) -> Result<()> {
        self.guard_health()?;
        self.check_usable(trx)?;
        let (_, index) = self.clustered_index_of(table_id)?;
        let trx_id = self.trx_sys.ensure_id(trx)?;
        self.lock_table_checked(trx, trx_id, table_id, TableLockMode::IX)?;
        if !self.lock_row(trx, &index, key, true, false)? {
            return Err(OakError::RowNotFound);
        }

        let sec_entries: Vec<(IndexId, Vec<u8>)> = secondaries
            .iter()
            .map(|(id, sec_key)| {
                let mut full = sec_key.clone();
                full.extend_from_slice(key);
                (*id, full)
            })
            .collect();

        {
            let _tl = index.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = index.search_leaf(&mut mtr, key, LatchMode::Exclusive)?;
            if !cur.exact {
                mtr.commit()?;
                return Err(OakError::RowNotFound);
            }
            let (old_trx, old_roll, old_payload, deleted) = read_clustered(&mtr, &cur);
            if deleted {
                mtr.commit()?;
                return Err(OakError::RowNotFound);
            }
            let ptr = self.trx_sys.write_undo(
                &mut mtr,
                trx,
                UndoRec {
                    rec_type: UndoRecType::DeleteMark,
                    table_id,
                    undo_no: UndoNo(0),
                    key: key.to_vec(),
                    old_trx_id: old_trx,
                    old_roll_ptr: old_roll,
                    old_deleted: false,
                    old_payload,
                    secondaries: sec_entries.clone(),
                },
            )?;
            index.delete_mark_at(&mut mtr, &cur, true);
            index.write_sys_cols(&mut mtr, &cur, trx_id, ptr);
            page::update_max_trx_id(&mut mtr, cur.page, trx_id);
            mtr.commit()?;
        }
        for (sec_id, entry) in &sec_entries {
            self.sec_set_mark(trx_id, *sec_id, entry, true)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Range locking (phantom prevention)
    // -----------------------------------------------------------------

    /// Locking range read over the clustered index: next-key locks on
    /// every record in `[low, high]` plus the gap beyond, so no
    /// concurrent insert can land in the range. Returns the rows.
    pub fn lock_range(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        low: &[u8],
        high: &[u8],
        exclusive: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.guard_health()?;
        self.check_usable(trx)?;
        let (_, index) = self.clustered_index_of(table_id)?;
        let trx_id = self.trx_sys.ensure_id(trx)?;
        let table_mode = if exclusive {
            TableLockMode::IX
        } else {
            TableLockMode::IS
        };
        self.lock_table_checked(trx, trx_id, table_id, table_mode)?;

        for _ in 0..64 {
            let (targets, rows) = self.collect_range(&index, low, high)?;
            let mode = RecLockMode {
                exclusive,
                kind: RecLockKind::NextKey,
            };
            for &(page_id, heap) in &targets {
                if let Err(err) = self.lock_sys.lock_record(trx_id, page_id, heap, mode) {
                    if err.is_rollback_only() {
                        trx.rollback_only = true;
                    }
                    return Err(err);
                }
            }
            let (targets_after, rows_after) = self.collect_range(&index, low, high)?;
            if targets_after == targets {
                let _ = rows;
                return Ok(rows_after
                    .into_iter()
                    .filter_map(|(k, p, deleted)| (!deleted).then_some((k, p)))
                    .collect());
            }
        }
        Err(OakError::internal("range kept moving during lock scan"))
    }

    /// One shared-latch pass over the range: lock targets (every record
    /// in range plus the successor) and current row images.
    #[allow(clippy::type_complexity)]
    fn collect_range(
        &self,
        index: &Arc<BtreeIndex>,
        low: &[u8],
        high: &[u8],
    ) -> Result<(Vec<(PageId, HeapNo)>, Vec<(Vec<u8>, Vec<u8>, bool)>)> {
        let _tl = index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let mut cur = index.search_leaf(&mut mtr, low, LatchMode::Shared)?;
        let mut targets = Vec::new();
        let mut rows = Vec::new();
        // Position on the first record ≥ low.
        if !cur.exact {
            if !index.cursor_next(&mut mtr, &mut cur, LatchMode::Shared)? {
                // Empty tail: the supremum of the last leaf guards the gap.
                targets.push((mtr.page_id(cur.page), HeapNo::SUPREMUM));
                mtr.commit()?;
                return Ok((targets, rows));
            }
        }
        loop {
            let data = mtr.page_data(cur.page);
            let key = rec::key(data, cur.rec).to_vec();
            if key.as_slice() > high {
                // Successor guards the gap after the range.
                targets.push((mtr.page_id(cur.page), rec::heap_no(data, cur.rec)));
                break;
            }
            targets.push((mtr.page_id(cur.page), rec::heap_no(data, cur.rec)));
            let (_, _, payload, deleted) = read_clustered(&mtr, &cur);
            rows.push((key, payload, deleted));
            if !index.cursor_next(&mut mtr, &mut cur, LatchMode::Shared)? {
                targets.push((mtr.page_id(cur.page), HeapNo::SUPREMUM));
                break;
            }
        }
        mtr.commit()?;
        Ok((targets, rows))
    }

    // -----------------------------------------------------------------
    // Secondary index maintenance
    // -----------------------------------------------------------------

    /// Resolve a secondary entry (full key, primary suffix included) to
    /// its visibility through the clustered index.
    pub fn secondary_lookup(
        &self,
        trx: &mut Trx,
        index_id: IndexId,
        sec_key: &[u8],
        primary_len: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.guard_health()?;
        let sec = self.index(index_id)?;
        if sec.clustered {
            return Err(OakError::invalid("secondary lookup on a clustered index"));
        }
        let def = self
            .dict
            .index_def(index_id)
            .ok_or_else(|| OakError::schema(format!("unknown index {index_id}")))?;
        let found = {
            let _tl = sec.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = sec.search_leaf(&mut mtr, sec_key, LatchMode::Shared)?;
            let r = cur.exact.then(|| {
                let data = mtr.page_data(cur.page);
                let key = rec::key(data, cur.rec).to_vec();
                (key, rec::is_deleted(data, cur.rec))
            });
            mtr.commit()?;
            r
        };
        let Some((full_key, marked)) = found else {
            return Ok(None);
        };
        if marked {
            // Latest-state semantics for marked entries: the row no
            // longer carries this secondary key.
            return Ok(None);
        }
        // The clustered index is the source of truth for visibility (the
        // secondary page's max-trx-id cannot prove an entry visible).
        let pk = full_key[full_key.len() - primary_len..].to_vec();
        self.read_row(trx, def.table_id, &pk)
            .map(|row| row.map(|_| pk))
    }

    fn sec_insert(&self, trx_id: TrxId, index_id: IndexId, full_key: &[u8]) -> Result<()> {
        let sec = self.index(index_id)?;
        {
            let _tl = sec.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = sec.search_leaf(&mut mtr, full_key, LatchMode::Exclusive)?;
            if cur.exact {
                // A delete-marked twin from an earlier incarnation of the
                // row: revive it.
                let deleted = rec::is_deleted(mtr.page_data(cur.page), cur.rec);
                if !deleted {
                    mtr.commit()?;
                    return Err(OakError::DuplicateKey {
                        index_id: index_id.0,
                    });
                }
                sec.delete_mark_at(&mut mtr, &cur, false);
                page::update_max_trx_id(&mut mtr, cur.page, trx_id);
                mtr.commit()?;
                return Ok(());
            }
            let img = RecImage {
                info_bits: 0,
                key: full_key,
                rest: &[],
            };
            if sec.insert_at(&mut mtr, &cur, &img)?.is_some() {
                page::update_max_trx_id(&mut mtr, cur.page, trx_id);
                mtr.commit()?;
                return Ok(());
            }
            mtr.commit()?;
        }
        let _tlw = sec.latch_write();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let recheck = sec.search_leaf(&mut mtr, full_key, LatchMode::Exclusive)?;
        if recheck.exact {
            let deleted = rec::is_deleted(mtr.page_data(recheck.page), recheck.rec);
            if !deleted {
                mtr.commit()?;
                return Err(OakError::DuplicateKey {
                    index_id: index_id.0,
                });
            }
            sec.delete_mark_at(&mut mtr, &recheck, false);
            page::update_max_trx_id(&mut mtr, recheck.page, trx_id);
            mtr.commit()?;
            return Ok(());
        }
        let img = RecImage {
            info_bits: 0,
            key: full_key,
            rest: &[],
        };
        let (leaf, _) = sec.insert_pessimistic(&mut mtr, &img)?;
        page::update_max_trx_id(&mut mtr, leaf, trx_id);
        mtr.commit()?;
        Ok(())
    }

    fn sec_set_mark(
        &self,
        trx_id: TrxId,
        index_id: IndexId,
        full_key: &[u8],
        mark: bool,
    ) -> Result<()> {
        let sec = self.index(index_id)?;
        let _tl = sec.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        let cur = sec.search_leaf(&mut mtr, full_key, LatchMode::Exclusive)?;
        if cur.exact {
            sec.delete_mark_at(&mut mtr, &cur, mark);
            page::update_max_trx_id(&mut mtr, cur.page, trx_id);
        }
        mtr.commit()?;
        Ok(())
    }

    /// Physically drop a secondary entry (rollback of an insert, purge).
    fn sec_remove(&self, index_id: IndexId, full_key: &[u8]) -> Result<()> {
        let sec = self.index(index_id)?;
        {
            let _tl = sec.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = sec.search_leaf(&mut mtr, full_key, LatchMode::Exclusive)?;
            if !cur.exact {
                mtr.commit()?;
                return Ok(());
            }
            let removed = sec.remove_at(&mut mtr, &cur)?;
            mtr.commit()?;
            if removed {
                return Ok(());
            }
        }
        let _tlw = sec.latch_write();
        let mut mtr = Mtr::start(Arc::clone(&self.pool));
        match sec.remove_pessimistic(&mut mtr, full_key) {
            Ok(()) | Err(OakError::RowNotFound) => {}
            Err(err) => return Err(err),
        }
        mtr.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Rollback inverses and purge
    // -----------------------------------------------------------------

    /// Apply the logical inverse of one undo record. The caller holds the
    /// exclusive latch of the table's clustered index and shares our MTR
    /// with the undo truncation.
    pub(crate) fn apply_inverse(&self, mtr: &mut Mtr<S::File>, rec: &UndoRec) -> Result<()> {
        let (_, index) = self.clustered_index_of(rec.table_id)?;
        match rec.rec_type {
            UndoRecType::Insert => {
                // Remove the inserted record; tolerate its absence (a
                // crash may have interrupted a previous rollback).
                let cur = index.search_leaf(mtr, &rec.key, LatchMode::Exclusive)?;
                if cur.exact {
                    if !index.remove_at(mtr, &cur)? {
                        index.remove_pessimistic(mtr, &rec.key)?;
                    }
                }
                for (sec_id, entry) in &rec.secondaries {
                    self.sec_remove_in(mtr, *sec_id, entry)?;
                }
            }
            UndoRecType::UpdateExisting => {
                let cur = index.search_leaf(mtr, &rec.key, LatchMode::Exclusive)?;
                if cur.exact {
                    self.replace_payload(
                        mtr,
                        &index,
                        &cur,
                        &rec.key,
                        &rec.old_payload,
                        rec.old_trx_id,
                        rec.old_roll_ptr,
                        rec.old_deleted,
                        true,
                    )?;
                }
                for (sec_id, entry) in &rec.secondaries {
                    self.sec_set_mark_in(mtr, *sec_id, entry, rec.old_deleted)?;
                }
            }
            UndoRecType::DeleteMark => {
                let cur = index.search_leaf(mtr, &rec.key, LatchMode::Exclusive)?;
                if cur.exact {
                    index.delete_mark_at(mtr, &cur, rec.old_deleted);
                    index.write_sys_cols(mtr, &cur, rec.old_trx_id, rec.old_roll_ptr);
                }
                for (sec_id, entry) in &rec.secondaries {
                    self.sec_set_mark_in(mtr, *sec_id, entry, rec.old_deleted)?;
                }
            }
        }
        Ok(())
    }

    fn sec_remove_in(&self, mtr: &mut Mtr<S::File>, index_id: IndexId, full_key: &[u8]) -> Result<()> {
        let sec = self.index(index_id)?;
        let _tlw = sec.latch_write();
        let cur = sec.search_leaf(mtr, full_key, LatchMode::Exclusive)?;
        if cur.exact && !sec.remove_at(mtr, &cur)? {
            match sec.remove_pessimistic(mtr, full_key) {
                Ok(()) | Err(OakError::RowNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn sec_set_mark_in(
        &self,
        mtr: &mut Mtr<S::File>,
        index_id: IndexId,
        full_key: &[u8],
        mark: bool,
    ) -> Result<()> {
        let sec = self.index(index_id)?;
        let _tl = sec.latch_write();
        let cur = sec.search_leaf(mtr, full_key, LatchMode::Exclusive)?;
        if cur.exact {
            sec.delete_mark_at(mtr, &cur, mark);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Misc helpers
    // -----------------------------------------------------------------

    fn lock_table_checked(
        &self,
        trx: &mut Trx,
        trx_id: TrxId,
        table_id: TableId,
        mode: TableLockMode,
    ) -> Result<()> {
        match self.lock_sys.lock_table(trx_id, table_id, mode) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_rollback_only() {
                    trx.rollback_only = true;
                }
                Err(err)
            }
        }
    }

    fn check_usable(&self, trx: &Trx) -> Result<()> {
        if trx.rollback_only {
            return Err(OakError::invalid(
                "transaction is rollback-only after deadlock or lock timeout",
            ));
        }
        Ok(())
    }
}

/// Snapshot (trx-id, roll-ptr, payload, delete-marked) from a latched
/// clustered record.
pub(crate) fn read_clustered<F: oakdb_vfs::StorageFile>(
    mtr: &Mtr<F>,
    cur: &oakdb_btree::LeafCursor,
) -> (TrxId, RollPtr, Vec<u8>, bool) {
    let data = mtr.page_data(cur.page);
    let (toff, roff) = page::sys_col_offsets(data, cur.rec);
    let rec_trx = TrxId(mach::read_u64(data, toff));
    let roll = RollPtr(mach::read_u64(data, roff));
    let klen = rec::key_len(data, cur.rec);
    let dlen = rec::data_len(data, cur.rec);
    let payload = data[usize::from(cur.rec) + klen + SYS_COLS..usize::from(cur.rec) + dlen].to_vec();
    (rec_trx, roll, payload, rec::is_deleted(data, cur.rec))
}

/// Compose the data tail of a clustered leaf record.
fn clustered_rest(trx_id: TrxId, roll_ptr: RollPtr, payload: &[u8]) -> Vec<u8> {
    let mut rest = Vec::with_capacity(SYS_COLS + payload.len());
    rest.extend_from_slice(&trx_id.0.to_be_bytes());
    rest.extend_from_slice(&roll_ptr.0.to_be_bytes());
    rest.extend_from_slice(payload);
    rest
}

/// Purge hook: physically removes delete-marked records whose history is
/// no longer visible to any view.
pub(crate) struct EnginePurge<'a, S: Storage>(pub &'a Engine<S>);

impl<S: Storage> oakdb_trx::PurgeApplier<S::File> for EnginePurge<'_, S> {
    fn purge_record(&self, rec: &UndoRec, deleter: TrxId) -> Result<()> {
        let engine = self.0;
        let Ok((_, index)) = engine.clustered_index_of(rec.table_id) else {
            // The host dropped the table; nothing to clean.
            return Ok(());
        };
        {
            let _tlw = index.latch_write();
            let mut mtr = Mtr::start(Arc::clone(&engine.pool));
            let cur = index.search_leaf(&mut mtr, &rec.key, LatchMode::Exclusive)?;
            if cur.exact {
                let data = mtr.page_data(cur.page);
                let (toff, _) = page::sys_col_offsets(data, cur.rec);
                let rec_trx = TrxId(mach::read_u64(data, toff));
                // Only the exact delete-marked incarnation is removable;
                // a reinserted row keeps living.
                if rec::is_deleted(data, cur.rec) && rec_trx == deleter {
                    if !index.remove_at(&mut mtr, &cur)? {
                        index.remove_pessimistic(&mut mtr, &rec.key)?;
                    }
                }
            }
            mtr.commit()?;
        }
        for (sec_id, entry) in &rec.secondaries {
            engine.purge_secondary(*sec_id, entry)?;
        }
        Ok(())
    }
}

impl<S: Storage> Engine<S> {
    fn purge_secondary(&self, index_id: IndexId, full_key: &[u8]) -> Result<()> {
        let Ok(sec) = self.index(index_id) else {
            return Ok(());
        };
        {
            let _tl = sec.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let cur = sec.search_leaf(&mut mtr, full_key, LatchMode::Exclusive)?;
            // Only a still-marked entry goes; a revived twin stays.
            if !cur.exact || !rec::is_deleted(mtr.page_data(cur.page), cur.rec) {
                mtr.commit()?;
                return Ok(());
            }
            mtr.commit()?;
        }
        self.sec_remove(index_id, full_key)
    }
}
