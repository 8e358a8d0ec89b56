//! Redo application.
//!
//! The log scan (in `oakdb-log`) already grouped durable records by page
//! and discarded the torn tail. This pass replays each record against its
//! page unless the page LSN shows the effect already on disk, which makes
//! a second recovery run a no-op.

use std::sync::Arc;

use oakdb_btree::page as index_page;
use oakdb_error::Result;
use oakdb_log::{PageOp, ScanResult};
use oakdb_pager::{BufferPool, LatchMode, Tablespaces};
use oakdb_types::mach;
use oakdb_vfs::StorageFile;
use tracing::{info, warn};

pub(crate) fn apply_redo<F: StorageFile>(
    pool: &Arc<BufferPool<F>>,
    spaces: &Arc<Tablespaces<F>>,
    scan: &ScanResult,
) -> Result<()> {
    // Spaces whose files disappeared are tombstoned: their redo is
    // skipped and later access fails cleanly.
    for space in &scan.created_spaces {
        if !spaces.is_open(*space) {
            spaces.tombstone(*space);
        }
    }

    let mut applied = 0usize;
    let mut skipped = 0usize;
    for (&page_id, entries) in &scan.page_redo {
        if !spaces.is_open(page_id.space) || spaces.is_tombstoned(page_id.space) {
            warn!(%page_id, "skipping redo for unavailable tablespace");
            continue;
        }
        let mut guard = pool.get_page(page_id, LatchMode::Exclusive)?;
        let mut first_applied = None;
        let mut last_applied = None;
        for entry in entries {
            if guard.page_lsn() >= entry.end_lsn {
                skipped += 1;
                continue;
            }
            let data = guard.data_mut();
            match &entry.op {
                PageOp::Write1 { offset, value } => {
                    mach::write_u8(data, usize::from(*offset), *value);
                }
                PageOp::Write2 { offset, value } => {
                    mach::write_u16(data, usize::from(*offset), *value);
                }
                PageOp::Write4 { offset, value } => {
                    mach::write_u32(data, usize::from(*offset), *value);
                }
                PageOp::Write8 { offset, value } => {
                    mach::write_u64(data, usize::from(*offset), *value);
                }
                PageOp::WriteString { offset, bytes } => {
                    let at = usize::from(*offset);
                    data[at..at + bytes.len()].copy_from_slice(bytes);
                }
                PageOp::RecInsert { body } => {
                    index_page::apply_insert(data, body)?;
                }
                PageOp::RecDelete { offset } => {
                    index_page::apply_delete(data, *offset)?;
                }
                PageOp::UndoInsert { body } => {
                    oakdb_trx::undo::apply_undo_insert(data, body)?;
                }
            }
            guard.set_page_lsn(entry.end_lsn);
            first_applied.get_or_insert(entry.end_lsn);
            last_applied = Some(entry.end_lsn);
            applied += 1;
        }
        if let (Some(first), Some(last)) = (first_applied, last_applied) {
            pool.note_modification(&guard, first, last);
        }
    }
    info!(applied, skipped, "redo pass complete");
    Ok(())
}
