//! User-facing cursors.
//!
//! A cursor is a persistent position in one index: between calls it holds
//! no latches, only a bookmark (page, record, key, modify clock); each
//! operation restores the position, revalidating through the modify clock
//! and re-searching by key when the page changed underneath.

use std::sync::Arc;

use oakdb_btree::{page, rec, BtreeIndex, CursorBookmark};
use oakdb_error::{OakError, Result};
use oakdb_mtr::Mtr;
use oakdb_pager::LatchMode;
use oakdb_trx::Trx;
use oakdb_types::IndexId;
use oakdb_vfs::Storage;

use crate::dict::IndexDef;
use crate::engine::Engine;
use crate::row;

/// How a search positions the cursor relative to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Position only on an exact match.
    Exact,
    /// Position on the first record ≥ key.
    GreaterEqual,
    /// Position on the last record ≤ key.
    LessEqual,
}

/// A positioned cursor over one index.
pub struct Cursor<'e, S: Storage> {
    engine: &'e Engine<S>,
    def: IndexDef,
    index: Arc<BtreeIndex>,
    position: Option<CursorBookmark>,
}

impl<'e, S: Storage> Cursor<'e, S> {
    pub(crate) fn open(engine: &'e Engine<S>, index_id: IndexId) -> Result<Self> {
        let def = engine
            .dict
            .index_def(index_id)
            .ok_or_else(|| OakError::schema(format!("unknown index {index_id}")))?;
        let index = engine.index(index_id)?;
        Ok(Self {
            engine,
            def,
            index,
            position: None,
        })
    }

    /// Whether the cursor is positioned on a user record.
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        self.position.is_some()
    }

    /// Search and position. Returns whether a satisfying record was
    /// found; an unsatisfied search leaves the cursor unpositioned.
    pub fn search(&mut self, key: &[u8], mode: SearchMode) -> Result<bool> {
        self.engine.guard_health()?;
        let _tl = self.index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
        let mut cur = self.index.search_leaf(&mut mtr, key, LatchMode::Shared)?;
        let positioned = match mode {
            SearchMode::Exact => cur.exact,
            SearchMode::LessEqual => {
                // The LE position may be the infimum of the leftmost leaf.
                cur.rec != page::PAGE_INFIMUM
                    || self.index.cursor_prev(&mut mtr, &mut cur, LatchMode::Shared)?
            }
            SearchMode::GreaterEqual => {
                cur.exact || self.index.cursor_next(&mut mtr, &mut cur, LatchMode::Shared)?
            }
        };
        self.position = positioned.then(|| self.index.bookmark(&mtr, &cur));
        mtr.commit()?;
        Ok(positioned)
    }

    /// Position on the first record of the index.
    pub fn first(&mut self) -> Result<bool> {
        self.engine.guard_health()?;
        let _tl = self.index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
        let found = self.index.cursor_first(&mut mtr, LatchMode::Shared)?;
        self.position = found.map(|cur| self.index.bookmark(&mtr, &cur));
        mtr.commit()?;
        Ok(self.position.is_some())
    }

    /// Position on the last record of the index.
    pub fn last(&mut self) -> Result<bool> {
        self.engine.guard_health()?;
        let _tl = self.index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
        let found = self.index.cursor_last(&mut mtr, LatchMode::Shared)?;
        self.position = found.map(|cur| self.index.bookmark(&mtr, &cur));
        mtr.commit()?;
        Ok(self.position.is_some())
    }

    /// Advance to the next record. At the end the cursor unpositions.
    pub fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    /// Step back to the previous record.
    pub fn prev(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        self.engine.guard_health()?;
        let Some(bm) = &self.position else {
            return Err(OakError::invalid("cursor is not positioned"));
        };
        let _tl = self.index.latch_read();
        let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
        let mut cur = self.index.restore(&mut mtr, bm, LatchMode::Shared)?;
        let moved = if forward {
            self.index.cursor_next(&mut mtr, &mut cur, LatchMode::Shared)?
        } else {
            self.index.cursor_prev(&mut mtr, &mut cur, LatchMode::Shared)?
        };
        self.position = moved.then(|| self.index.bookmark(&mtr, &cur));
        mtr.commit()?;
        Ok(moved)
    }

    /// Read the row under the cursor through the transaction's view.
    /// Returns `None` when the version at this position is invisible or
    /// delete-marked for the reader.
    pub fn read(&self, trx: &mut Trx) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.engine.guard_health()?;
        let Some(bm) = &self.position else {
            return Err(OakError::invalid("cursor is not positioned"));
        };
        if !self.def.clustered {
            // A secondary entry is just its key (secondary key with the
            // primary key appended); a delete-marked entry is invisible.
            // Hosts resolve the row through the clustered index with
            // [`Engine::secondary_lookup`].
            let _tl = self.index.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
            let cur = self.index.restore(&mut mtr, bm, LatchMode::Shared)?;
            let data = mtr.page_data(cur.page);
            let out = (cur.rec != page::PAGE_INFIMUM
                && cur.rec != page::PAGE_SUPREMUM
                && !rec::is_deleted(data, cur.rec))
            .then(|| (rec::key(data, cur.rec).to_vec(), Vec::new()));
            mtr.commit()?;
            return Ok(out);
        }
        let snapshot = {
            let _tl = self.index.latch_read();
            let mut mtr = Mtr::start(Arc::clone(&self.engine.pool));
            let cur = self.index.restore(&mut mtr, bm, LatchMode::Shared)?;
            let data = mtr.page_data(cur.page);
            let snap = (cur.rec != page::PAGE_INFIMUM && cur.rec != page::PAGE_SUPREMUM).then(
                || {
                    let key = rec::key(data, cur.rec).to_vec();
                    let (t, r, payload, deleted) = row::read_clustered(&mtr, &cur);
                    (key, t, r, payload, deleted)
                },
            );
            mtr.commit()?;
            snap
        };
        let Some((key, rec_trx, roll, payload, deleted)) = snapshot else {
            return Ok(None);
        };
        if trx.id.is_some() && rec_trx == trx.id_or_zero() {
            return Ok((!deleted).then_some((key, payload)));
        }
        let temp = trx
            .view
            .is_none()
            .then(|| self.engine.trx_sys.open_view(trx.id_or_zero()));
        let view = trx
            .view
            .as_ref()
            .map(|v| Arc::clone(&v.view))
            .unwrap_or_else(|| Arc::clone(&temp.as_ref().expect("opened above").view));
        let visible =
            oakdb_trx::visible_version(&self.engine.pool, &view, rec_trx, roll, &payload, deleted);
        if let Some(t) = temp {
            self.engine.trx_sys.close_view(&t);
        }
        Ok(visible?.map(|p| (key, p)))
    }

    /// The key under the cursor (raw bytes, including the primary-key
    /// suffix on secondary indexes).
    #[must_use]
    pub fn current_key(&self) -> Option<&[u8]> {
        self.position.as_ref().map(|bm| bm.key.as_slice())
    }

    // --- Writes (clustered cursors only; they delegate to the row
    // layer, which owns locking and undo) ---

    fn require_clustered(&self) -> Result<()> {
        if self.def.clustered {
            Ok(())
        } else {
            Err(OakError::invalid("writes go through the clustered index"))
        }
    }

    /// Insert a row into the cursor's table.
    pub fn insert(
        &mut self,
        trx: &mut Trx,
        key: &[u8],
        payload: &[u8],
        secondaries: &[(IndexId, Vec<u8>)],
    ) -> Result<()> {
        self.require_clustered()?;
        self.engine
            .insert_row(trx, self.def.table_id, key, payload, secondaries)
    }

    /// Update the payload of the row under the cursor.
    pub fn update(&mut self, trx: &mut Trx, new_payload: &[u8]) -> Result<()> {
        self.require_clustered()?;
        let key = self
            .position
            .as_ref()
            .map(|bm| bm.key.clone())
            .ok_or_else(|| OakError::invalid("cursor is not positioned"))?;
        self.engine.update_row(trx, self.def.table_id, &key, new_payload)
    }

    /// Delete the row under the cursor.
    pub fn delete(&mut self, trx: &mut Trx, secondaries: &[(IndexId, Vec<u8>)]) -> Result<()> {
        self.require_clustered()?;
        let key = self
            .position
            .as_ref()
            .map(|bm| bm.key.clone())
            .ok_or_else(|| OakError::invalid("cursor is not positioned"))?;
        self.engine
            .delete_row(trx, self.def.table_id, &key, secondaries)
    }
}

impl<S: Storage> Engine<S> {
    /// Open a cursor over an index.
    pub fn cursor(&self, index_id: IndexId) -> Result<Cursor<'_, S>> {
        self.guard_health()?;
        Cursor::open(self, index_id)
    }
}
