//! Redo record codec.
//!
//! A mini-transaction serializes each page mutation into one physiological
//! record: a type byte, the target (space, page-no), and a type-specific
//! body. The log system appends the whole batch as one *group* and closes
//! it with a [`MLOG_MULTI_REC_END`] terminator carrying the group's start
//! LSN and a checksum of its body; recovery treats a group as durable only
//! when the terminator validates, so a torn tail (or stale bytes from a
//! previous ring cycle) is discarded cleanly.

use oakdb_error::{OakError, Result};
use oakdb_types::mach;
use oakdb_types::{Lsn, PageId, PageNo, SpaceId};
use xxhash_rust::xxh3::xxh3_64;

// Record type tags. Tag 0 is deliberately invalid: freshly created log
// files are zero-filled, so the scan stops at the unwritten tail.
pub const MLOG_1BYTE: u8 = 1;
pub const MLOG_2BYTES: u8 = 2;
pub const MLOG_4BYTES: u8 = 3;
pub const MLOG_8BYTES: u8 = 4;
pub const MLOG_WRITE_STRING: u8 = 5;
pub const MLOG_COMP_REC_INSERT: u8 = 6;
pub const MLOG_REC_DELETE: u8 = 7;
pub const MLOG_UNDO_INSERT: u8 = 8;
pub const MLOG_FILE_CREATE: u8 = 9;
pub const MLOG_CHECKPOINT: u8 = 10;
pub const MLOG_MULTI_REC_END: u8 = 31;

/// Serialized size of the group terminator: type(1) + start-LSN(8) +
/// checksum(4).
pub const GROUP_END_SIZE: usize = 13;

/// A page-scoped mutation parsed from the redo stream.
///
/// Byte-level writes are applied physically during recovery; record-level
/// operations are applied through the index-page and undo-page apply
/// routines of the owning subsystem (physiological logging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    /// Write one byte at `offset`.
    Write1 { offset: u16, value: u8 },
    /// Write a big-endian u16 at `offset`.
    Write2 { offset: u16, value: u16 },
    /// Write a big-endian u32 at `offset`.
    Write4 { offset: u16, value: u32 },
    /// Write a big-endian u64 at `offset`.
    Write8 { offset: u16, value: u64 },
    /// Write a byte string at `offset`.
    WriteString { offset: u16, bytes: Vec<u8> },
    /// Insert a record into an index page; `body` is the btree-defined
    /// insertion image.
    RecInsert { body: Vec<u8> },
    /// Physically remove the record whose origin is at `offset` from an
    /// index page.
    RecDelete { offset: u16 },
    /// Append an undo record to an undo page; `body` is the undo-defined
    /// image.
    UndoInsert { body: Vec<u8> },
}

/// One parsed redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    /// A mutation of one page.
    Page { page: PageId, op: PageOp },
    /// A tablespace file came into existence.
    FileCreate { space: SpaceId },
    /// Checkpoint marker written into the stream when a checkpoint
    /// completes; informational during the scan.
    Checkpoint { checkpoint_no: u64, lsn: Lsn },
    /// Group terminator.
    MultiRecEnd { start_lsn: Lsn, checksum: u32 },
}

/// Checksum over a group body, stored in the terminator.
#[must_use]
pub fn group_checksum(body: &[u8]) -> u32 {
    xxh3_64(body) as u32
}

fn push_page_header(buf: &mut Vec<u8>, ty: u8, page: PageId) {
    buf.push(ty);
    buf.extend_from_slice(&page.space.0.to_be_bytes());
    buf.extend_from_slice(&page.page_no.0.to_be_bytes());
}

/// Append a byte-write record of the given width (1, 2, 4, or 8).
pub fn encode_write(buf: &mut Vec<u8>, page: PageId, offset: u16, value: u64, width: usize) {
    let ty = match width {
        1 => MLOG_1BYTE,
        2 => MLOG_2BYTES,
        4 => MLOG_4BYTES,
        8 => MLOG_8BYTES,
        _ => unreachable!("redo write width must be 1, 2, 4, or 8"),
    };
    push_page_header(buf, ty, page);
    buf.extend_from_slice(&offset.to_be_bytes());
    match width {
        1 => buf.push(value as u8),
        2 => buf.extend_from_slice(&(value as u16).to_be_bytes()),
        4 => buf.extend_from_slice(&(value as u32).to_be_bytes()),
        _ => buf.extend_from_slice(&value.to_be_bytes()),
    }
}

/// Append a string-write record.
pub fn encode_write_string(buf: &mut Vec<u8>, page: PageId, offset: u16, bytes: &[u8]) {
    debug_assert!(bytes.len() <= usize::from(u16::MAX));
    push_page_header(buf, MLOG_WRITE_STRING, page);
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Append a record-insert record with an opaque btree insertion image.
pub fn encode_rec_insert(buf: &mut Vec<u8>, page: PageId, body: &[u8]) {
    debug_assert!(body.len() <= usize::from(u16::MAX));
    push_page_header(buf, MLOG_COMP_REC_INSERT, page);
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(body);
}

/// Append a record-delete record.
pub fn encode_rec_delete(buf: &mut Vec<u8>, page: PageId, offset: u16) {
    push_page_header(buf, MLOG_REC_DELETE, page);
    buf.extend_from_slice(&offset.to_be_bytes());
}

/// Append an undo-insert record with an opaque undo image.
pub fn encode_undo_insert(buf: &mut Vec<u8>, page: PageId, body: &[u8]) {
    debug_assert!(body.len() <= usize::from(u16::MAX));
    push_page_header(buf, MLOG_UNDO_INSERT, page);
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(body);
}

/// Append a file-create record.
pub fn encode_file_create(buf: &mut Vec<u8>, space: SpaceId) {
    buf.push(MLOG_FILE_CREATE);
    buf.extend_from_slice(&space.0.to_be_bytes());
}

/// Append a checkpoint marker.
pub fn encode_checkpoint(buf: &mut Vec<u8>, checkpoint_no: u64, lsn: Lsn) {
    buf.push(MLOG_CHECKPOINT);
    buf.extend_from_slice(&checkpoint_no.to_be_bytes());
    buf.extend_from_slice(&lsn.0.to_be_bytes());
}

/// Append the group terminator for a group whose body started at
/// `start_lsn`.
pub fn encode_group_end(buf: &mut Vec<u8>, start_lsn: Lsn, checksum: u32) {
    buf.push(MLOG_MULTI_REC_END);
    buf.extend_from_slice(&start_lsn.0.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
}

/// Outcome of parsing one record from the stream.
#[derive(Debug)]
pub enum Parsed {
    /// A record and the number of bytes it consumed.
    Record(RedoRecord, usize),
    /// The bytes at the cursor are not a record (unwritten tail or stale
    /// ring content); the scan ends here.
    End,
    /// The record header is valid but the buffer ends mid-record; with a
    /// complete buffer this means a torn tail.
    Truncated,
}

fn need(buf: &[u8], n: usize) -> bool {
    buf.len() >= n
}

/// Parse one record at the start of `buf`.
pub fn parse_record(buf: &[u8]) -> Result<Parsed> {
    let Some(&ty) = buf.first() else {
        return Ok(Parsed::Truncated);
    };
    let page_header = |buf: &[u8]| -> (PageId, usize) {
        let space = SpaceId(mach::read_u32(buf, 1));
        let page_no = PageNo(mach::read_u32(buf, 5));
        (PageId::new(space, page_no), 9)
    };
    match ty {
        MLOG_1BYTE | MLOG_2BYTES | MLOG_4BYTES | MLOG_8BYTES => {
            let width = match ty {
                MLOG_1BYTE => 1,
                MLOG_2BYTES => 2,
                MLOG_4BYTES => 4,
                _ => 8,
            };
            if !need(buf, 9 + 2 + width) {
                return Ok(Parsed::Truncated);
            }
            let (page, mut at) = page_header(buf);
            let offset = mach::read_u16(buf, at);
            at += 2;
            let op = match width {
                1 => PageOp::Write1 {
                    offset,
                    value: buf[at],
                },
                2 => PageOp::Write2 {
                    offset,
                    value: mach::read_u16(buf, at),
                },
                4 => PageOp::Write4 {
                    offset,
                    value: mach::read_u32(buf, at),
                },
                _ => PageOp::Write8 {
                    offset,
                    value: mach::read_u64(buf, at),
                },
            };
            Ok(Parsed::Record(RedoRecord::Page { page, op }, at + width))
        }
        MLOG_WRITE_STRING => {
            if !need(buf, 13) {
                return Ok(Parsed::Truncated);
            }
            let (page, at) = page_header(buf);
            let offset = mach::read_u16(buf, at);
            let len = usize::from(mach::read_u16(buf, at + 2));
            if !need(buf, at + 4 + len) {
                return Ok(Parsed::Truncated);
            }
            let bytes = buf[at + 4..at + 4 + len].to_vec();
            Ok(Parsed::Record(
                RedoRecord::Page {
                    page,
                    op: PageOp::WriteString { offset, bytes },
                },
                at + 4 + len,
            ))
        }
        MLOG_COMP_REC_INSERT | MLOG_UNDO_INSERT => {
            if !need(buf, 11) {
                return Ok(Parsed::Truncated);
            }
            let (page, at) = page_header(buf);
            let len = usize::from(mach::read_u16(buf, at));
            if !need(buf, at + 2 + len) {
                return Ok(Parsed::Truncated);
            }
            let body = buf[at + 2..at + 2 + len].to_vec();
            let op = if ty == MLOG_COMP_REC_INSERT {
                PageOp::RecInsert { body }
            } else {
                PageOp::UndoInsert { body }
            };
            Ok(Parsed::Record(RedoRecord::Page { page, op }, at + 2 + len))
        }
        MLOG_REC_DELETE => {
            if !need(buf, 11) {
                return Ok(Parsed::Truncated);
            }
            let (page, at) = page_header(buf);
            let offset = mach::read_u16(buf, at);
            Ok(Parsed::Record(
                RedoRecord::Page {
                    page,
                    op: PageOp::RecDelete { offset },
                },
                at + 2,
            ))
        }
        MLOG_FILE_CREATE => {
            if !need(buf, 5) {
                return Ok(Parsed::Truncated);
            }
            let space = SpaceId(mach::read_u32(buf, 1));
            Ok(Parsed::Record(RedoRecord::FileCreate { space }, 5))
        }
        MLOG_CHECKPOINT => {
            if !need(buf, 17) {
                return Ok(Parsed::Truncated);
            }
            Ok(Parsed::Record(
                RedoRecord::Checkpoint {
                    checkpoint_no: mach::read_u64(buf, 1),
                    lsn: Lsn(mach::read_u64(buf, 9)),
                },
                17,
            ))
        }
        MLOG_MULTI_REC_END => {
            if !need(buf, GROUP_END_SIZE) {
                return Ok(Parsed::Truncated);
            }
            Ok(Parsed::Record(
                RedoRecord::MultiRecEnd {
                    start_lsn: Lsn(mach::read_u64(buf, 1)),
                    checksum: mach::read_u32(buf, 9),
                },
                GROUP_END_SIZE,
            ))
        }
        0 => Ok(Parsed::End),
        other => Err(OakError::LogCorruption {
            lsn: 0,
            detail: format!("unknown redo record type {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> PageId {
        PageId::new(SpaceId(3), PageNo(41))
    }

    #[test]
    fn byte_write_round_trip() {
        let mut buf = Vec::new();
        encode_write(&mut buf, page(), 100, 0xAABB, 2);
        match parse_record(&buf).unwrap() {
            Parsed::Record(RedoRecord::Page { page: p, op }, n) => {
                assert_eq!(p, page());
                assert_eq!(
                    op,
                    PageOp::Write2 {
                        offset: 100,
                        value: 0xAABB
                    }
                );
                assert_eq!(n, buf.len());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn string_write_round_trip() {
        let mut buf = Vec::new();
        encode_write_string(&mut buf, page(), 7, b"payload");
        match parse_record(&buf).unwrap() {
            Parsed::Record(RedoRecord::Page { op, .. }, n) => {
                assert_eq!(
                    op,
                    PageOp::WriteString {
                        offset: 7,
                        bytes: b"payload".to_vec()
                    }
                );
                assert_eq!(n, buf.len());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn truncated_record_reported() {
        let mut buf = Vec::new();
        encode_write_string(&mut buf, page(), 7, b"payload");
        buf.truncate(buf.len() - 3);
        assert!(matches!(parse_record(&buf).unwrap(), Parsed::Truncated));
    }

    #[test]
    fn zero_byte_ends_scan() {
        assert!(matches!(parse_record(&[0u8; 16]).unwrap(), Parsed::End));
    }

    #[test]
    fn unknown_type_is_corruption() {
        assert!(parse_record(&[200u8; 16]).is_err());
    }

    #[test]
    fn group_end_round_trip() {
        let mut buf = Vec::new();
        encode_group_end(&mut buf, Lsn(9000), 0xDEAD);
        assert_eq!(buf.len(), GROUP_END_SIZE);
        match parse_record(&buf).unwrap() {
            Parsed::Record(RedoRecord::MultiRecEnd { start_lsn, checksum }, _) => {
                assert_eq!(start_lsn, Lsn(9000));
                assert_eq!(checksum, 0xDEAD);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
