//! Undo log pages and records.
//!
//! An undo log is a chain of undo pages (linked through the common
//! header's prev/next fields) holding variable-length undo records in
//! write order, newest last. Records capture the pre-image of a
//! clustered-index change; roll pointers address them directly as
//! (rseg, page, offset).
//!
//! Page header (after the 38-byte common header):
//!
//! ```text
//!  38  trx-id(8)      owner of this log
//!  46  state(2)       1 = active, 2 = cached, 3 = to-purge
//!  48  kind(2)        1 = insert undo, 2 = update undo
//!  50  log-start(2)   offset of the first record (68)
//!  52  free(2)        offset of the next record to write
//!  54  last-rec(2)    offset of the newest record (0 = none)
//!  56  list node(12)  history-list linkage (first page of update logs)
//!  68  records...
//! ```

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_types::limits::PAGE_TRAILER;
use oakdb_types::{mach, IndexId, PageType, RollPtr, TableId, TrxId, UndoNo};
use oakdb_vfs::StorageFile;

pub const UNDO_TRX_ID: usize = 38;
pub const UNDO_STATE: usize = 46;
pub const UNDO_KIND: usize = 48;
pub const UNDO_LOG_START: usize = 50;
pub const UNDO_FREE: usize = 52;
pub const UNDO_LAST_REC: usize = 54;
pub const UNDO_LIST_NODE: usize = 56;
pub const UNDO_RECS_START: usize = 68;

/// Undo log states stored in the page header of the log's first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UndoState {
    /// The owning transaction is still running; crash recovery rolls the
    /// log back.
    Active = 1,
    /// Committed insert-undo awaiting page reclamation.
    Cached = 2,
    /// Committed update-undo on the history list awaiting purge.
    ToPurge = 3,
}

impl UndoState {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Active),
            2 => Some(Self::Cached),
            3 => Some(Self::ToPurge),
            _ => None,
        }
    }
}

/// Undo record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoRecType {
    /// A fresh insert; rollback deletes the record, MVCC stops here.
    Insert = 1,
    /// An update that kept the key; the pre-image payload is stored.
    UpdateExisting = 2,
    /// A delete-mark; rollback clears the mark.
    DeleteMark = 3,
}

impl UndoRecType {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Insert),
            2 => Some(Self::UpdateExisting),
            3 => Some(Self::DeleteMark),
            _ => None,
        }
    }
}

/// One parsed undo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRec {
    pub rec_type: UndoRecType,
    pub table_id: TableId,
    pub undo_no: UndoNo,
    pub key: Vec<u8>,
    /// Pre-image system columns (update and delete-mark records).
    pub old_trx_id: TrxId,
    pub old_roll_ptr: RollPtr,
    /// Whether the pre-image version was delete-marked (an insert over a
    /// delete-marked slot records `true`).
    pub old_deleted: bool,
    /// Pre-image payload (update and delete-mark records).
    pub old_payload: Vec<u8>,
    /// Secondary-index entries of this row, so rollback and purge can
    /// maintain the secondary trees without recomputing keys.
    pub secondaries: Vec<(IndexId, Vec<u8>)>,
}

/// Serialized layout: len(2), back(2), type(1), table-id(8), undo-no(8),
/// key-len(2), key, sec-count(2), [index-id(8), len(2), entry]*, then for
/// update/delete-mark: old-trx(8), old-roll(8), old-deleted(1),
/// old-payload-len(2), old-payload.
#[must_use]
pub fn encode_undo_rec(back: u16, rec: &UndoRec) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40 + rec.key.len() + rec.old_payload.len());
    buf.extend_from_slice(&[0, 0]); // length patched below
    buf.extend_from_slice(&back.to_be_bytes());
    buf.push(rec.rec_type as u8);
    buf.extend_from_slice(&rec.table_id.0.to_be_bytes());
    buf.extend_from_slice(&rec.undo_no.0.to_be_bytes());
    buf.extend_from_slice(&(rec.key.len() as u16).to_be_bytes());
    buf.extend_from_slice(&rec.key);
    buf.extend_from_slice(&(rec.secondaries.len() as u16).to_be_bytes());
    for (index_id, entry) in &rec.secondaries {
        buf.extend_from_slice(&index_id.0.to_be_bytes());
        buf.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        buf.extend_from_slice(entry);
    }
    if rec.rec_type != UndoRecType::Insert {
        buf.extend_from_slice(&rec.old_trx_id.0.to_be_bytes());
        buf.extend_from_slice(&rec.old_roll_ptr.0.to_be_bytes());
        buf.push(u8::from(rec.old_deleted));
        buf.extend_from_slice(&(rec.old_payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rec.old_payload);
    }
    let len = buf.len() as u16;
    buf[0..2].copy_from_slice(&len.to_be_bytes());
    buf
}

/// Parse the record at `offset`; returns the record and its back link.
pub fn parse_undo_rec(page: &[u8], offset: u16) -> Result<(UndoRec, u16)> {
    let at = usize::from(offset);
    let len = usize::from(mach::read_u16(page, at));
    if len < 25 || at + len > PAGE_TRAILER {
        return Err(OakError::internal(format!(
            "undo record at {offset} has invalid length {len}"
        )));
    }
    let back = mach::read_u16(page, at + 2);
    let rec_type = UndoRecType::from_raw(page[at + 4])
        .ok_or_else(|| OakError::internal("unknown undo record type"))?;
    let table_id = TableId(mach::read_u64(page, at + 5));
    let undo_no = UndoNo(mach::read_u64(page, at + 13));
    let key_len = usize::from(mach::read_u16(page, at + 21));
    let mut cursor = at + 23;
    let key = page[cursor..cursor + key_len].to_vec();
    cursor += key_len;
    let sec_count = usize::from(mach::read_u16(page, cursor));
    cursor += 2;
    let mut secondaries = Vec::with_capacity(sec_count);
    for _ in 0..sec_count {
        let index_id = IndexId(mach::read_u64(page, cursor));
        let elen = usize::from(mach::read_u16(page, cursor + 8));
        let entry = page[cursor + 10..cursor + 10 + elen].to_vec();
        secondaries.push((index_id, entry));
        cursor += 10 + elen;
    }
    let (old_trx_id, old_roll_ptr, old_deleted, old_payload) =
        if rec_type == UndoRecType::Insert {
            (TrxId::ZERO, RollPtr::ZERO, false, Vec::new())
        } else {
            let t = TrxId(mach::read_u64(page, cursor));
            let r = RollPtr(mach::read_u64(page, cursor + 8));
            let deleted = page[cursor + 16] != 0;
            let plen = usize::from(mach::read_u16(page, cursor + 17));
            let p = page[cursor + 19..cursor + 19 + plen].to_vec();
            (t, r, deleted, p)
        };
    Ok((
        UndoRec {
            rec_type,
            table_id,
            undo_no,
            key,
            old_trx_id,
            old_roll_ptr,
            old_deleted,
            old_payload,
            secondaries,
        },
        back,
    ))
}

// --- Page operations ---

/// Undo log kinds stored on the first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UndoKind {
    /// Pre-images of fresh inserts; discarded at commit.
    Insert = 1,
    /// Pre-images of updates and delete-marks; kept for MVCC and purge.
    Update = 2,
}

impl UndoKind {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            _ => None,
        }
    }
}

/// Initialize a fresh undo page through the MTR.
pub fn undo_page_init<F: StorageFile>(
    mtr: &mut Mtr<F>,
    h: PageHandle,
    trx_id: TrxId,
    kind: UndoKind,
) {
    oakdb_fsp::page_init(mtr, h, PageType::UndoLog);
    mtr.write_u64(h, UNDO_TRX_ID, trx_id.0);
    mtr.write_u16(h, UNDO_STATE, UndoState::Active as u16);
    mtr.write_u16(h, UNDO_KIND, kind as u16);
    mtr.write_u16(h, UNDO_LOG_START, UNDO_RECS_START as u16);
    mtr.write_u16(h, UNDO_FREE, UNDO_RECS_START as u16);
    mtr.write_u16(h, UNDO_LAST_REC, 0);
}

/// The log kind recorded on (the first page of) a log.
#[must_use]
pub fn undo_kind(page: &[u8]) -> Option<UndoKind> {
    UndoKind::from_raw(mach::read_u16(page, UNDO_KIND))
}

/// Whether `body` fits on the page.
#[must_use]
pub fn undo_page_fits(page: &[u8], body_len: usize) -> bool {
    usize::from(mach::read_u16(page, UNDO_FREE)) + body_len <= PAGE_TRAILER
}

/// Append a serialized undo record: deterministic, shared with redo
/// replay. Returns the record's offset.
pub fn apply_undo_insert(page: &mut [u8], body: &[u8]) -> Result<u16> {
    let free = mach::read_u16(page, UNDO_FREE);
    let at = usize::from(free);
    if at + body.len() > PAGE_TRAILER {
        return Err(OakError::internal("undo record does not fit on page"));
    }
    page[at..at + body.len()].copy_from_slice(body);
    mach::write_u16(page, UNDO_FREE, free + body.len() as u16);
    mach::write_u16(page, UNDO_LAST_REC, free);
    Ok(free)
}

/// Append an undo record through the MTR (mutation + logical redo).
pub fn undo_append<F: StorageFile>(
    mtr: &mut Mtr<F>,
    h: PageHandle,
    rec: &UndoRec,
) -> Result<u16> {
    let back = mach::read_u16(mtr.page_data(h), UNDO_LAST_REC);
    let body = encode_undo_rec(back, rec);
    let offset = apply_undo_insert(mtr.page_data_mut_unlogged(h), &body)?;
    mtr.log_undo_insert(h, &body);
    Ok(offset)
}

/// The newest record offset on a page (0 = empty page).
#[must_use]
pub fn last_rec_offset(page: &[u8]) -> u16 {
    mach::read_u16(page, UNDO_LAST_REC)
}

/// The undo state recorded on (the first page of) a log.
#[must_use]
pub fn undo_state(page: &[u8]) -> Option<UndoState> {
    UndoState::from_raw(mach::read_u16(page, UNDO_STATE))
}

/// The owning transaction of a log.
#[must_use]
pub fn undo_trx_id(page: &[u8]) -> TrxId {
    TrxId(mach::read_u64(page, UNDO_TRX_ID))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rec_type: UndoRecType) -> UndoRec {
        UndoRec {
            rec_type,
            table_id: TableId(12),
            undo_no: UndoNo(3),
            key: b"key-bytes".to_vec(),
            old_trx_id: TrxId(77),
            old_roll_ptr: RollPtr::new(false, 2, oakdb_types::PageNo(9), 400),
            old_deleted: true,
            old_payload: b"previous payload".to_vec(),
            secondaries: vec![
                (IndexId(5), b"sec-entry-a".to_vec()),
                (IndexId(6), b"sec-entry-b".to_vec()),
            ],
        }
    }

    #[test]
    fn record_round_trip_update() {
        let rec = sample(UndoRecType::UpdateExisting);
        let body = encode_undo_rec(123, &rec);
        let mut page = vec![0u8; oakdb_types::limits::PAGE_SIZE];
        mach::write_u16(&mut page, UNDO_FREE, UNDO_RECS_START as u16);
        let off = apply_undo_insert(&mut page, &body).unwrap();
        let (parsed, back) = parse_undo_rec(&page, off).unwrap();
        assert_eq!(parsed, rec);
        assert_eq!(back, 123);
        assert_eq!(last_rec_offset(&page), off);
    }

    #[test]
    fn record_round_trip_insert_has_no_preimage() {
        let mut rec = sample(UndoRecType::Insert);
        let body = encode_undo_rec(0, &rec);
        let mut page = vec![0u8; oakdb_types::limits::PAGE_SIZE];
        mach::write_u16(&mut page, UNDO_FREE, UNDO_RECS_START as u16);
        let off = apply_undo_insert(&mut page, &body).unwrap();
        let (parsed, _) = parse_undo_rec(&page, off).unwrap();
        // The pre-image fields come back empty regardless of input;
        // secondary entries survive (rollback needs them).
        rec.old_trx_id = TrxId::ZERO;
        rec.old_roll_ptr = RollPtr::ZERO;
        rec.old_deleted = false;
        rec.old_payload.clear();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn appended_records_chain_backward() {
        let mut page = vec![0u8; oakdb_types::limits::PAGE_SIZE];
        mach::write_u16(&mut page, UNDO_FREE, UNDO_RECS_START as u16);
        let r1 = sample(UndoRecType::Insert);
        let o1 = apply_undo_insert(&mut page, &encode_undo_rec(0, &r1)).unwrap();
        let o2 = apply_undo_insert(&mut page, &encode_undo_rec(o1, &sample(UndoRecType::DeleteMark)))
            .unwrap();
        let (_, back2) = parse_undo_rec(&page, o2).unwrap();
        assert_eq!(back2, o1);
        let (_, back1) = parse_undo_rec(&page, o1).unwrap();
        assert_eq!(back1, 0);
    }

    #[test]
    fn full_page_rejects_append() {
        let mut page = vec![0u8; oakdb_types::limits::PAGE_SIZE];
        mach::write_u16(&mut page, UNDO_FREE, (PAGE_TRAILER - 10) as u16);
        let body = encode_undo_rec(0, &sample(UndoRecType::Insert));
        assert!(!undo_page_fits(&page, body.len()));
        assert!(apply_undo_insert(&mut page, &body).is_err());
    }
}
