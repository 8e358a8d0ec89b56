//! Purge: reclaiming history that no read view can see.
//!
//! Committed update-undo logs sit on each rollback segment's history
//! list in commit order. Once a log's transaction id drops below the
//! oldest view limit, its delete-marked records can be physically
//! removed from the indexes and the undo pages freed.

use oakdb_error::Result;
use oakdb_fsp::flst::{self, BaseNode};
use oakdb_fsp::fsp_free_page;
use oakdb_mtr::Mtr;
use oakdb_pager::LatchMode;
use oakdb_types::limits::{FIL_NULL, FIL_PAGE_NEXT};
use oakdb_types::{PageId, PageNo, SpaceId, TrxId};
use oakdb_vfs::StorageFile;
use std::sync::Arc;
use tracing::debug;

use crate::trx::TrxSys;
use crate::undo::{self, UndoRecType, UNDO_LIST_NODE, UNDO_RECS_START};

/// Physical cleanup driven by purge: the row layer removes a
/// delete-marked record (and its secondary entries) if it is still
/// marked and invisible to everyone.
pub trait PurgeApplier<F: StorageFile> {
    fn purge_record(&self, rec: &crate::undo::UndoRec, deleter: TrxId) -> Result<()>;
}

/// Rollback-segment history layout shared with `trx.rs`.
const RSEG_HISTORY: usize = 38;

impl<F: StorageFile> TrxSys<F> {
    /// Process up to `limit` history undo logs whose transactions are
    /// older than every open read view. Returns how many logs were
    /// reclaimed; zero means the history list is (effectively) drained.
    pub fn purge_step(&self, applier: &dyn PurgeApplier<F>, limit: usize) -> Result<usize> {
        let horizon = self.oldest_view_limit();
        let mut reclaimed = 0;
        for &rseg_page in self.rseg_pages() {
            while reclaimed < limit {
                if !self.purge_one(rseg_page, horizon, applier)? {
                    break;
                }
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Reclaim the oldest history log of one rollback segment if it is
    /// below the horizon.
    fn purge_one(
        &self,
        rseg_page: PageNo,
        horizon: TrxId,
        applier: &dyn PurgeApplier<F>,
    ) -> Result<bool> {
        // Identify the oldest history log and check the horizon with
        // latches only (no changes yet).
        let first_log_page = {
            let mut mtr = Mtr::start(Arc::clone(self.pool()));
            let rseg_h = mtr.get_page(
                PageId::new(SpaceId::SYSTEM, rseg_page),
                LatchMode::Shared,
            )?;
            let head = flst::first(&mtr, BaseNode::new(rseg_h, RSEG_HISTORY));
            mtr.commit()?;
            if head.is_null() {
                return Ok(false);
            }
            head.page_no
        };
        {
            let guard = self.pool().get_page(
                PageId::new(SpaceId::SYSTEM, first_log_page),
                LatchMode::Shared,
            )?;
            let trx_id = undo::undo_trx_id(guard.data());
            if trx_id >= horizon {
                return Ok(false);
            }
        }

        // Apply the physical removals, oldest record first.
        let mut page_no = first_log_page;
        let deleter = {
            let guard = self.pool().get_page(
                PageId::new(SpaceId::SYSTEM, first_log_page),
                LatchMode::Shared,
            )?;
            undo::undo_trx_id(guard.data())
        };
        loop {
            let (records, next) = {
                let guard = self
                    .pool()
                    .get_page(PageId::new(SpaceId::SYSTEM, page_no), LatchMode::Shared)?;
                let data = guard.data();
                let mut records = Vec::new();
                let free = oakdb_types::mach::read_u16(data, undo::UNDO_FREE);
                let mut at = UNDO_RECS_START as u16;
                while at < free {
                    let (rec, _) = undo::parse_undo_rec(data, at)?;
                    let len = oakdb_types::mach::read_u16(data, usize::from(at));
                    records.push(rec);
                    at += len;
                }
                (
                    records,
                    oakdb_types::mach::read_u32(data, FIL_PAGE_NEXT),
                )
            };
            for rec in records {
                if rec.rec_type == UndoRecType::DeleteMark {
                    applier.purge_record(&rec, deleter)?;
                }
            }
            if next == FIL_NULL {
                break;
            }
            page_no = PageNo(next);
        }

        // Unhook from the history list and free the pages.
        let mut mtr = Mtr::start(Arc::clone(self.pool()));
        let rseg_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, rseg_page),
            LatchMode::Exclusive,
        )?;
        let first_h = mtr.get_page(
            PageId::new(SpaceId::SYSTEM, first_log_page),
            LatchMode::Exclusive,
        )?;
        flst::remove(
            &mut mtr,
            SpaceId::SYSTEM,
            BaseNode::new(rseg_h, RSEG_HISTORY),
            first_h,
            UNDO_LIST_NODE,
        )?;
        let mut page_no = first_log_page;
        while page_no.0 != FIL_NULL {
            let h = mtr.get_page(PageId::new(SpaceId::SYSTEM, page_no), LatchMode::Exclusive)?;
            let next = oakdb_types::mach::read_u32(mtr.page_data(h), FIL_PAGE_NEXT);
            fsp_free_page(&mut mtr, SpaceId::SYSTEM, page_no)?;
            page_no = PageNo(next);
        }
        mtr.commit()?;
        debug!(%deleter, log_page = %first_log_page, "purged undo log");
        Ok(true)
    }

    /// Length of the history list across all rollback segments.
    pub fn history_length(&self) -> Result<u32> {
        let mut total = 0;
        for &rseg_page in self.rseg_pages() {
            let mut mtr = Mtr::start(Arc::clone(self.pool()));
            let rseg_h = mtr.get_page(
                PageId::new(SpaceId::SYSTEM, rseg_page),
                LatchMode::Shared,
            )?;
            total += flst::len(&mtr, BaseNode::new(rseg_h, RSEG_HISTORY));
            mtr.commit()?;
        }
        Ok(total)
    }
}
