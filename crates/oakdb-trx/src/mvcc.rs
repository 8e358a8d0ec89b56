//! Old-version synthesis: walking the roll-pointer chain through undo.

use std::sync::Arc;

use oakdb_error::Result;
use oakdb_pager::{BufferPool, LatchMode};
use oakdb_types::{PageId, RollPtr, SpaceId, TrxId};
use oakdb_vfs::StorageFile;

use crate::read_view::ReadView;
use crate::undo::{parse_undo_rec, UndoRecType};

/// A synthesized previous version of a clustered-index row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldVersion {
    pub trx_id: TrxId,
    pub roll_ptr: RollPtr,
    pub payload: Vec<u8>,
    /// Whether that version was delete-marked (true when an insert
    /// reused a delete-marked slot).
    pub deleted: bool,
}

/// Follow one roll-pointer step. `None` means the row did not exist
/// before this version (the chain ends at an insert, or history was
/// purged).
pub fn prev_version<F: StorageFile>(
    pool: &Arc<BufferPool<F>>,
    roll_ptr: RollPtr,
) -> Result<Option<OldVersion>> {
    if roll_ptr.is_zero() || roll_ptr.is_insert() {
        return Ok(None);
    }
    let guard = pool.get_page(
        PageId::new(SpaceId::SYSTEM, roll_ptr.page_no()),
        LatchMode::Shared,
    )?;
    let (rec, _) = parse_undo_rec(guard.data(), roll_ptr.offset())?;
    match rec.rec_type {
        UndoRecType::Insert => Ok(None),
        UndoRecType::UpdateExisting | UndoRecType::DeleteMark => Ok(Some(OldVersion {
            trx_id: rec.old_trx_id,
            roll_ptr: rec.old_roll_ptr,
            payload: rec.old_payload,
            deleted: rec.old_deleted,
        })),
    }
}

/// Resolve the version of a row visible to `view`: starting from the
/// current clustered record state, walk backward until a visible version
/// appears. Returns `None` when the row did not exist for this view.
pub fn visible_version<F: StorageFile>(
    pool: &Arc<BufferPool<F>>,
    view: &ReadView,
    trx_id: TrxId,
    mut roll_ptr: RollPtr,
    current_payload: &[u8],
    current_deleted: bool,
) -> Result<Option<Vec<u8>>> {
    if view.is_visible(trx_id) {
        return Ok((!current_deleted).then(|| current_payload.to_vec()));
    }
    loop {
        match prev_version(pool, roll_ptr)? {
            None => return Ok(None),
            Some(old) => {
                if view.is_visible(old.trx_id) {
                    return Ok((!old.deleted).then_some(old.payload));
                }
                roll_ptr = old.roll_ptr;
            }
        }
    }
}
