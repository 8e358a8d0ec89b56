//! Compact record format.
//!
//! A record's origin is the first byte of its data; bookkeeping sits just
//! before it: two 2-byte length fields and the 5-byte header.
//!
//! ```text
//!  origin-9  key-len(2)
//!  origin-7  data-len(2)      total bytes after the origin
//!  origin-5  info bits | n-owned(1)
//!  origin-4  heap-no(13 bits) | status(3 bits)  (2 bytes)
//!  origin-2  next record origin(2), 0 = none
//!  origin    data: key, then kind-specific fields
//! ```
//!
//! Leaf records of a clustered index carry (trx-id, roll-ptr) between the
//! key and the payload; node-pointer records carry the child page number;
//! the interpretation of the data tail belongs to the tree layer, the page
//! layer only needs `key-len` and `data-len`.

use oakdb_types::mach;
use oakdb_types::HeapNo;

/// Bytes of bookkeeping before a record origin.
pub const REC_EXTRAS: usize = 9;

/// Info bit: the record is delete-marked.
pub const REC_INFO_DELETED: u8 = 0x20;
/// Info bit: the record is the minimum on its (non-leaf) level.
pub const REC_INFO_MIN_REC: u8 = 0x10;
/// Low nibble of the info byte: number of records owned by this directory
/// owner (0 for non-owners).
const REC_N_OWNED_MASK: u8 = 0x0F;
const REC_INFO_MASK: u8 = 0xF0;

/// Record status stored in the low 3 bits next to the heap number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecStatus {
    /// User record.
    Ordinary = 0,
    /// Node pointer on a non-leaf level.
    NodePtr = 1,
    /// The page infimum.
    Infimum = 2,
    /// The page supremum.
    Supremum = 3,
}

impl RecStatus {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw & 0x7 {
            0 => Self::Ordinary,
            1 => Self::NodePtr,
            2 => Self::Infimum,
            _ => Self::Supremum,
        }
    }
}

// --- Header accessors (operate on whole-page slices, origin-relative) ---

#[inline]
#[must_use]
pub fn info_byte(page: &[u8], origin: u16) -> u8 {
    page[origin as usize - 5]
}

#[inline]
pub fn set_info_byte(page: &mut [u8], origin: u16, value: u8) {
    page[origin as usize - 5] = value;
}

#[inline]
#[must_use]
pub fn is_deleted(page: &[u8], origin: u16) -> bool {
    info_byte(page, origin) & REC_INFO_DELETED != 0
}

#[inline]
pub fn set_deleted(page: &mut [u8], origin: u16, deleted: bool) {
    let b = info_byte(page, origin);
    set_info_byte(
        page,
        origin,
        if deleted {
            b | REC_INFO_DELETED
        } else {
            b & !REC_INFO_DELETED
        },
    );
}

#[inline]
#[must_use]
pub fn is_min_rec(page: &[u8], origin: u16) -> bool {
    info_byte(page, origin) & REC_INFO_MIN_REC != 0
}

#[inline]
#[must_use]
pub fn n_owned(page: &[u8], origin: u16) -> u8 {
    info_byte(page, origin) & REC_N_OWNED_MASK
}

#[inline]
pub fn set_n_owned(page: &mut [u8], origin: u16, n: u8) {
    debug_assert!(n <= REC_N_OWNED_MASK);
    let b = info_byte(page, origin);
    set_info_byte(page, origin, (b & REC_INFO_MASK) | n);
}

#[inline]
#[must_use]
pub fn heap_no(page: &[u8], origin: u16) -> HeapNo {
    HeapNo(mach::read_u16(page, origin as usize - 4) >> 3)
}

#[inline]
#[must_use]
pub fn status(page: &[u8], origin: u16) -> RecStatus {
    RecStatus::from_raw((mach::read_u16(page, origin as usize - 4) & 0x7) as u8)
}

#[inline]
pub fn set_heap_no_status(page: &mut [u8], origin: u16, heap: HeapNo, status: RecStatus) {
    mach::write_u16(page, origin as usize - 4, (heap.0 << 3) | status as u16);
}

/// Origin of the next record in key order; 0 means none (only legal on
/// the supremum and free-list tails).
#[inline]
#[must_use]
pub fn next(page: &[u8], origin: u16) -> u16 {
    mach::read_u16(page, origin as usize - 2)
}

#[inline]
pub fn set_next(page: &mut [u8], origin: u16, next_origin: u16) {
    mach::write_u16(page, origin as usize - 2, next_origin);
}

// --- Length fields (user and node-pointer records only) ---

#[inline]
#[must_use]
pub fn key_len(page: &[u8], origin: u16) -> usize {
    usize::from(mach::read_u16(page, origin as usize - 9))
}

#[inline]
#[must_use]
pub fn data_len(page: &[u8], origin: u16) -> usize {
    usize::from(mach::read_u16(page, origin as usize - 7))
}

#[inline]
pub fn set_lens(page: &mut [u8], origin: u16, key: usize, data: usize) {
    mach::write_u16(page, origin as usize - 9, key as u16);
    mach::write_u16(page, origin as usize - 7, data as u16);
}

/// The record's key bytes.
#[must_use]
pub fn key(page: &[u8], origin: u16) -> &[u8] {
    let o = origin as usize;
    &page[o..o + key_len(page, origin)]
}

/// All bytes after the origin (key plus kind-specific tail).
#[must_use]
pub fn data(page: &[u8], origin: u16) -> &[u8] {
    let o = origin as usize;
    &page[o..o + data_len(page, origin)]
}

/// Whole footprint of a user/node record, extras included.
#[must_use]
pub fn size(page: &[u8], origin: u16) -> usize {
    REC_EXTRAS + data_len(page, origin)
}

/// Compare a record against a search key. Infimum sorts below everything,
/// supremum above.
#[must_use]
pub fn cmp_with_key(page: &[u8], origin: u16, search: &[u8]) -> std::cmp::Ordering {
    match status(page, origin) {
        RecStatus::Infimum => std::cmp::Ordering::Less,
        RecStatus::Supremum => std::cmp::Ordering::Greater,
        _ => key(page, origin).cmp(search),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut page = vec![0u8; 256];
        let origin = 100u16;
        set_lens(&mut page, origin, 3, 10);
        set_info_byte(&mut page, origin, 0);
        set_heap_no_status(&mut page, origin, HeapNo(7), RecStatus::Ordinary);
        set_next(&mut page, origin, 200);
        set_n_owned(&mut page, origin, 5);
        set_deleted(&mut page, origin, true);

        assert_eq!(key_len(&page, origin), 3);
        assert_eq!(data_len(&page, origin), 10);
        assert_eq!(heap_no(&page, origin), HeapNo(7));
        assert_eq!(status(&page, origin), RecStatus::Ordinary);
        assert_eq!(next(&page, origin), 200);
        assert_eq!(n_owned(&page, origin), 5);
        assert!(is_deleted(&page, origin));

        set_deleted(&mut page, origin, false);
        assert!(!is_deleted(&page, origin));
        assert_eq!(n_owned(&page, origin), 5);
        assert_eq!(size(&page, origin), REC_EXTRAS + 10);
    }

    #[test]
    fn system_records_compare_at_extremes() {
        let mut page = vec![0u8; 256];
        set_heap_no_status(&mut page, 50, HeapNo(0), RecStatus::Infimum);
        set_heap_no_status(&mut page, 80, HeapNo(1), RecStatus::Supremum);
        assert_eq!(
            cmp_with_key(&page, 50, b"anything"),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            cmp_with_key(&page, 80, b"anything"),
            std::cmp::Ordering::Greater
        );
    }
}
