//! Index page layout and the record-level apply routines.
//!
//! The routines here mutate raw page bytes deterministically: the live
//! path calls them under a mini-transaction's exclusive latch and logs a
//! logical redo record; recovery replays the same routine against the
//! same page state. Page layout:
//!
//! ```text
//!   0  common header (38)
//!  38  index header (56): counters, max-trx-id, level, index id,
//!      leaf / non-leaf segment headers
//!  94  infimum header(5) + "infimum\0"
//! 107  supremum header(5) + "supremum"
//! 120  record heap, growing up
//!  ..  free gap
//!  ..  page directory, growing down from the trailer
//! ```

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_types::limits::{FIL_NULL, FIL_PAGE_NEXT, FIL_PAGE_PREV, PAGE_SIZE, PAGE_TRAILER};
use oakdb_types::{mach, HeapNo, IndexId, PageType, TrxId};
use oakdb_vfs::StorageFile;

use crate::rec::{self, RecStatus, REC_EXTRAS, REC_INFO_MIN_REC};

// --- Index header offsets (absolute) ---

pub const PAGE_N_DIR_SLOTS: usize = 38;
pub const PAGE_HEAP_TOP: usize = 40;
pub const PAGE_N_HEAP: usize = 42;
pub const PAGE_FREE: usize = 44;
pub const PAGE_GARBAGE: usize = 46;
pub const PAGE_LAST_INSERT: usize = 48;
pub const PAGE_DIRECTION: usize = 50;
pub const PAGE_N_DIRECTION: usize = 52;
pub const PAGE_N_RECS: usize = 54;
pub const PAGE_MAX_TRX_ID: usize = 56;
pub const PAGE_LEVEL: usize = 64;
pub const PAGE_INDEX_ID: usize = 66;
pub const PAGE_BTR_SEG_LEAF: usize = 74;
pub const PAGE_BTR_SEG_TOP: usize = 84;

/// Record origins of the system records and the first heap byte.
pub const PAGE_INFIMUM: u16 = 99;
pub const PAGE_SUPREMUM: u16 = 112;
pub const PAGE_SUPREMUM_END: usize = 120;

pub const DIR_SLOT_SIZE: usize = 2;
/// Directory group bounds: an owner owns 4..=8 records (infimum exactly
/// 1, the supremum group 1..=8).
pub const DIR_MAX_OWNED: u8 = 8;
pub const DIR_MIN_OWNED: u8 = 4;

pub const DIRECTION_NONE: u16 = 0;
pub const DIRECTION_RIGHT: u16 = 1;
pub const DIRECTION_LEFT: u16 = 2;

// --- Header accessors (raw slices) ---

macro_rules! hdr16 {
    ($get:ident, $set:ident, $off:expr) => {
        #[inline]
        #[must_use]
        pub fn $get(page: &[u8]) -> u16 {
            mach::read_u16(page, $off)
        }
        #[inline]
        pub fn $set(page: &mut [u8], v: u16) {
            mach::write_u16(page, $off, v);
        }
    };
}

hdr16!(n_dir_slots, set_n_dir_slots, PAGE_N_DIR_SLOTS);
hdr16!(heap_top, set_heap_top, PAGE_HEAP_TOP);
hdr16!(n_heap, set_n_heap, PAGE_N_HEAP);
hdr16!(free_head, set_free_head, PAGE_FREE);
hdr16!(garbage, set_garbage, PAGE_GARBAGE);
hdr16!(last_insert, set_last_insert, PAGE_LAST_INSERT);
hdr16!(direction, set_direction, PAGE_DIRECTION);
hdr16!(n_direction, set_n_direction, PAGE_N_DIRECTION);
hdr16!(n_recs, set_n_recs, PAGE_N_RECS);
hdr16!(level, set_level, PAGE_LEVEL);

#[inline]
#[must_use]
pub fn index_id(page: &[u8]) -> IndexId {
    IndexId(mach::read_u64(page, PAGE_INDEX_ID))
}

#[inline]
#[must_use]
pub fn max_trx_id(page: &[u8]) -> TrxId {
    TrxId(mach::read_u64(page, PAGE_MAX_TRX_ID))
}

#[inline]
#[must_use]
pub fn is_leaf(page: &[u8]) -> bool {
    level(page) == 0
}

#[inline]
#[must_use]
pub fn prev_page(page: &[u8]) -> u32 {
    mach::read_u32(page, FIL_PAGE_PREV)
}

#[inline]
#[must_use]
pub fn next_page(page: &[u8]) -> u32 {
    mach::read_u32(page, FIL_PAGE_NEXT)
}

// --- Directory (raw slices) ---

#[inline]
fn slot_addr(i: usize) -> usize {
    PAGE_TRAILER - DIR_SLOT_SIZE * (i + 1)
}

#[inline]
#[must_use]
pub fn dir_slot(page: &[u8], i: usize) -> u16 {
    mach::read_u16(page, slot_addr(i))
}

#[inline]
pub fn dir_set_slot(page: &mut [u8], i: usize, origin: u16) {
    mach::write_u16(page, slot_addr(i), origin);
}

fn dir_insert_slot(page: &mut [u8], pos: usize, origin: u16) {
    let n = usize::from(n_dir_slots(page));
    debug_assert!(pos > 0 && pos < n, "system slots are fixed");
    // Slots pos..n shift one position down (toward lower addresses).
    let lo = slot_addr(n - 1);
    let hi = slot_addr(pos - 1);
    page.copy_within(lo..hi, lo - DIR_SLOT_SIZE);
    dir_set_slot(page, pos, origin);
    set_n_dir_slots(page, (n + 1) as u16);
}

fn dir_remove_slot(page: &mut [u8], pos: usize) {
    let n = usize::from(n_dir_slots(page));
    debug_assert!(pos > 0 && pos < n - 1, "system slots are fixed");
    let lo = slot_addr(n - 1);
    let hi = slot_addr(pos);
    page.copy_within(lo..hi, lo + DIR_SLOT_SIZE);
    set_n_dir_slots(page, (n - 1) as u16);
}

fn find_owner_slot(page: &[u8], owner_origin: u16) -> usize {
    let n = usize::from(n_dir_slots(page));
    (0..n)
        .find(|&i| dir_slot(page, i) == owner_origin)
        .expect("directory owner not found in slots")
}

// --- Initialization ---

/// Initialize an empty index page image (raw bytes; identity fields and
/// page type are the space manager's business).
pub fn page_init_raw(page: &mut [u8], index_id: IndexId, level_: u16) {
    mach::write_u32(page, FIL_PAGE_PREV, FIL_NULL);
    mach::write_u32(page, FIL_PAGE_NEXT, FIL_NULL);
    set_n_dir_slots(page, 2);
    set_heap_top(page, PAGE_SUPREMUM_END as u16);
    set_n_heap(page, 2);
    set_free_head(page, 0);
    set_garbage(page, 0);
    set_last_insert(page, 0);
    set_direction(page, DIRECTION_NONE);
    set_n_direction(page, 0);
    set_n_recs(page, 0);
    mach::write_u64(page, PAGE_MAX_TRX_ID, 0);
    set_level(page, level_);
    mach::write_u64(page, PAGE_INDEX_ID, index_id.0);

    // Infimum.
    rec::set_info_byte(page, PAGE_INFIMUM, 0);
    rec::set_n_owned(page, PAGE_INFIMUM, 1);
    rec::set_heap_no_status(page, PAGE_INFIMUM, HeapNo::INFIMUM, RecStatus::Infimum);
    rec::set_next(page, PAGE_INFIMUM, PAGE_SUPREMUM);
    page[PAGE_INFIMUM as usize..PAGE_INFIMUM as usize + 8].copy_from_slice(b"infimum\0");
    // Supremum.
    rec::set_info_byte(page, PAGE_SUPREMUM, 0);
    rec::set_n_owned(page, PAGE_SUPREMUM, 1);
    rec::set_heap_no_status(page, PAGE_SUPREMUM, HeapNo::SUPREMUM, RecStatus::Supremum);
    rec::set_next(page, PAGE_SUPREMUM, 0);
    page[PAGE_SUPREMUM as usize..PAGE_SUPREMUM as usize + 8].copy_from_slice(b"supremum");

    dir_set_slot(page, 0, PAGE_INFIMUM);
    dir_set_slot(page, 1, PAGE_SUPREMUM);
}

/// Create an index page through a mini-transaction (fresh allocation).
pub fn page_create<F: StorageFile>(
    mtr: &mut Mtr<F>,
    h: PageHandle,
    index_id: IndexId,
    level_: u16,
) {
    oakdb_fsp::page_init(mtr, h, PageType::Index);
    let mut img = vec![0u8; PAGE_SIZE];
    page_init_raw(&mut img, index_id, level_);
    mtr.write_u32(h, FIL_PAGE_PREV, FIL_NULL);
    mtr.write_u32(h, FIL_PAGE_NEXT, FIL_NULL);
    mtr.write_bytes(h, PAGE_N_DIR_SLOTS, &img[PAGE_N_DIR_SLOTS..PAGE_SUPREMUM_END]);
    mtr.write_u16(h, slot_addr(0), PAGE_INFIMUM);
    mtr.write_u16(h, slot_addr(1), PAGE_SUPREMUM);
}

// --- Search ---

/// Find the last record whose key is ≤ `key` (the infimum when every
/// user record is greater). Returns (origin, exact-match).
#[must_use]
pub fn search_le(page: &[u8], key: &[u8]) -> (u16, bool) {
    use std::cmp::Ordering;
    let n = usize::from(n_dir_slots(page));
    let (mut lo, mut hi) = (0usize, n - 1);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        match rec::cmp_with_key(page, dir_slot(page, mid), key) {
            Ordering::Greater => hi = mid,
            _ => lo = mid,
        }
    }
    let mut cur = dir_slot(page, lo);
    let mut exact = rec::cmp_with_key(page, cur, key) == Ordering::Equal;
    loop {
        let nxt = rec::next(page, cur);
        if nxt == 0 {
            break;
        }
        match rec::cmp_with_key(page, nxt, key) {
            Ordering::Greater => break,
            Ordering::Equal => {
                cur = nxt;
                exact = true;
                break;
            }
            Ordering::Less => cur = nxt,
        }
    }
    (cur, exact)
}

/// First user record, or `None` on an empty page.
#[must_use]
pub fn first_user_rec(page: &[u8]) -> Option<u16> {
    let r = rec::next(page, PAGE_INFIMUM);
    (r != PAGE_SUPREMUM).then_some(r)
}

/// Last user record, or `None` on an empty page.
#[must_use]
pub fn last_user_rec(page: &[u8]) -> Option<u16> {
    // The record before the supremum: start at the owner preceding the
    // supremum group and walk.
    let n = usize::from(n_dir_slots(page));
    let mut cur = dir_slot(page, n - 2);
    loop {
        let nxt = rec::next(page, cur);
        if nxt == PAGE_SUPREMUM {
            break;
        }
        cur = nxt;
    }
    (cur != PAGE_INFIMUM).then_some(cur)
}

/// Record preceding `origin` in key order (possibly the infimum).
#[must_use]
pub fn rec_prev(page: &[u8], origin: u16) -> u16 {
    let mut cur = PAGE_INFIMUM;
    loop {
        let nxt = rec::next(page, cur);
        if nxt == origin {
            return cur;
        }
        assert_ne!(nxt, 0, "record not on the page chain");
        cur = nxt;
    }
}

// --- Space accounting ---

/// Usable bytes in the gap between the heap and the directory, keeping
/// room for one more directory slot.
#[must_use]
pub fn free_space(page: &[u8]) -> usize {
    let n = usize::from(n_dir_slots(page));
    let dir_floor = PAGE_TRAILER - DIR_SLOT_SIZE * (n + 1);
    dir_floor.saturating_sub(usize::from(heap_top(page)))
}

/// Whether a record with `data_len` bytes after the origin fits, via the
/// gap or by reusing the free-list head.
#[must_use]
pub fn fits(page: &[u8], data_len: usize) -> bool {
    let need = REC_EXTRAS + data_len;
    if free_space(page) >= need {
        return true;
    }
    let fh = free_head(page);
    fh != 0 && rec::size(page, fh) >= need
}

/// Bytes occupied by live (linked) records, extras included.
#[must_use]
pub fn used_bytes(page: &[u8]) -> usize {
    usize::from(heap_top(page)) - PAGE_SUPREMUM_END - usize::from(garbage(page))
}

/// A page is underfull when its live bytes drop below half of the payload
/// area; merge candidates are chosen on this bound.
#[must_use]
pub fn is_underfull(page: &[u8]) -> bool {
    let capacity = PAGE_TRAILER - PAGE_SUPREMUM_END - DIR_SLOT_SIZE * 16;
    used_bytes(page) * 2 < capacity
}

// --- Insert ---

/// Serialized insertion image for [`apply_insert`] and the redo log:
/// prev-origin(2), info-bits(1), status(1), key-len(2), data.
#[must_use]
pub fn build_insert_body(
    prev_origin: u16,
    info_bits: u8,
    status: RecStatus,
    key: &[u8],
    rest: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + key.len() + rest.len());
    body.extend_from_slice(&prev_origin.to_be_bytes());
    body.push(info_bits);
    body.push(status as u8);
    body.extend_from_slice(&(key.len() as u16).to_be_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(rest);
    body
}

/// Insert a record described by `body` after its recorded predecessor.
/// Deterministic given the page state: the same call replays byte-exact
/// during recovery. Returns the new record's origin.
pub fn apply_insert(page: &mut [u8], body: &[u8]) -> Result<u16> {
    if body.len() < 6 {
        return Err(OakError::internal("short record-insert image"));
    }
    let prev = mach::read_u16(body, 0);
    let info_bits = body[2] & 0xF0;
    let status = RecStatus::from_raw(body[3]);
    let klen = usize::from(mach::read_u16(body, 4));
    let data = &body[6..];
    if klen > data.len() {
        return Err(OakError::internal("record image key length out of range"));
    }
    let need = REC_EXTRAS + data.len();

    // Allocate: reuse the free-list head when it is big enough, else carve
    // from the heap.
    let fh = free_head(page);
    let (origin, reused) = if fh != 0 && rec::size(page, fh) >= need {
        set_free_head(page, rec::next(page, fh));
        let sz = rec::size(page, fh);
        set_garbage(page, garbage(page) - sz as u16);
        (fh, true)
    } else {
        if free_space(page) < need {
            return Err(OakError::internal("record does not fit on page"));
        }
        let top = heap_top(page);
        set_heap_top(page, top + need as u16);
        (top + REC_EXTRAS as u16, false)
    };

    let heap = if reused {
        rec::heap_no(page, origin)
    } else {
        let nh = n_heap(page);
        set_n_heap(page, nh + 1);
        HeapNo(nh)
    };

    rec::set_lens(page, origin, klen, data.len());
    rec::set_info_byte(page, origin, info_bits);
    rec::set_heap_no_status(page, origin, heap, status);
    let o = usize::from(origin);
    page[o..o + data.len()].copy_from_slice(data);

    // Link into the sorted chain.
    let nxt = rec::next(page, prev);
    rec::set_next(page, origin, nxt);
    rec::set_next(page, prev, origin);
    set_n_recs(page, n_recs(page) + 1);

    // Insert-direction heuristic for split-point biasing.
    let last = last_insert(page);
    if last != 0 && last == prev {
        set_direction(page, DIRECTION_RIGHT);
        set_n_direction(page, n_direction(page) + 1);
    } else if last != 0 && nxt == last {
        set_direction(page, DIRECTION_LEFT);
        set_n_direction(page, n_direction(page) + 1);
    } else {
        set_direction(page, DIRECTION_NONE);
        set_n_direction(page, 0);
    }
    set_last_insert(page, origin);

    // Ownership: the new record joins the group of the next owner.
    let mut owner = origin;
    while rec::n_owned(page, owner) == 0 {
        owner = rec::next(page, owner);
        debug_assert_ne!(owner, 0, "chain reached the end without an owner");
    }
    let owned = rec::n_owned(page, owner) + 1;
    rec::set_n_owned(page, owner, owned);
    if owned > DIR_MAX_OWNED {
        dir_split_group(page, owner);
    }
    Ok(origin)
}

/// Split an oversized directory group in two.
fn dir_split_group(page: &mut [u8], owner: u16) {
    let slot = find_owner_slot(page, owner);
    let count = rec::n_owned(page, owner);
    let prev_owner = dir_slot(page, slot - 1);
    // Walk to the member that will own the first half.
    let half = DIR_MIN_OWNED;
    let mut new_owner = rec::next(page, prev_owner);
    for _ in 1..half {
        new_owner = rec::next(page, new_owner);
    }
    rec::set_n_owned(page, new_owner, half);
    rec::set_n_owned(page, owner, count - half);
    dir_insert_slot(page, slot, new_owner);
}

// --- Delete ---

/// Physically remove the record at `origin`: unlink, move to the free
/// list, fix directory ownership. Deterministic for redo replay.
pub fn apply_delete(page: &mut [u8], origin: u16) -> Result<()> {
    if origin == PAGE_INFIMUM || origin == PAGE_SUPREMUM {
        return Err(OakError::internal("attempt to delete a system record"));
    }
    let prev = rec_prev(page, origin);

    // Ownership first, while the chain still contains the record.
    let mut owner = origin;
    while rec::n_owned(page, owner) == 0 {
        owner = rec::next(page, owner);
        debug_assert_ne!(owner, 0);
    }
    let owner_slot;
    let remaining = rec::n_owned(page, owner) - 1;
    if owner == origin {
        // Ownership passes to the predecessor.
        owner_slot = find_owner_slot(page, origin);
        rec::set_n_owned(page, origin, 0);
        rec::set_n_owned(page, prev, remaining);
        dir_set_slot(page, owner_slot, prev);
    } else {
        rec::set_n_owned(page, owner, remaining);
        owner_slot = find_owner_slot(page, owner);
    }

    // Unlink and push onto the free list.
    rec::set_next(page, prev, rec::next(page, origin));
    rec::set_next(page, origin, free_head(page));
    set_free_head(page, origin);
    set_garbage(page, garbage(page) + rec::size(page, origin) as u16);
    set_n_recs(page, n_recs(page) - 1);
    set_last_insert(page, 0);

    dir_balance(page, owner_slot);
    Ok(())
}

/// Rebalance a group that dropped below its minimum by borrowing from or
/// merging with the following group.
fn dir_balance(page: &mut [u8], slot: usize) {
    let n = usize::from(n_dir_slots(page));
    if slot == 0 || slot == n - 1 {
        // Infimum owns exactly itself; the supremum group's minimum is 1.
        return;
    }
    let owner = dir_slot(page, slot);
    let count = rec::n_owned(page, owner);
    if count >= DIR_MIN_OWNED {
        return;
    }
    let next_owner = dir_slot(page, slot + 1);
    let next_count = rec::n_owned(page, next_owner);
    let next_min = if slot + 1 == n - 1 { 1 } else { DIR_MIN_OWNED };
    if next_count > next_min {
        // Borrow the next group's first record as our new owner.
        let borrowed = rec::next(page, owner);
        rec::set_n_owned(page, owner, 0);
        rec::set_n_owned(page, borrowed, count + 1);
        rec::set_n_owned(page, next_owner, next_count - 1);
        dir_set_slot(page, slot, borrowed);
    } else {
        // Merge into the next group.
        rec::set_n_owned(page, owner, 0);
        rec::set_n_owned(page, next_owner, next_count + count);
        dir_remove_slot(page, slot);
    }
}

// --- Sys-column plumbing for clustered leaf records ---

/// Offsets of the (trx-id, roll-ptr) system columns inside a clustered
/// leaf record.
#[must_use]
pub fn sys_col_offsets(page: &[u8], origin: u16) -> (usize, usize) {
    let base = usize::from(origin) + rec::key_len(page, origin);
    (base, base + 8)
}

/// Stamp the page's max-trx-id high-water mark (logged).
pub fn update_max_trx_id<F: StorageFile>(mtr: &mut Mtr<F>, h: PageHandle, trx_id: TrxId) {
    if mach::read_u64(mtr.page_data(h), PAGE_MAX_TRX_ID) < trx_id.0 {
        mtr.write_u64(h, PAGE_MAX_TRX_ID, trx_id.0);
    }
}

// --- Validation (tests and debug assertions) ---

/// Check the page invariants: chain order and completeness, record count,
/// directory structure, and byte accounting.
pub fn validate(page: &[u8]) -> std::result::Result<(), String> {
    // Chain: infimum → ... → supremum, keys strictly ascending.
    let mut count = 0u16;
    let mut cur = PAGE_INFIMUM;
    let mut live_bytes = 0usize;
    loop {
        let nxt = rec::next(page, cur);
        if cur == PAGE_SUPREMUM {
            if nxt != 0 {
                return Err("supremum has a successor".into());
            }
            break;
        }
        if nxt == 0 {
            return Err("chain ended before the supremum".into());
        }
        if cur != PAGE_INFIMUM {
            live_bytes += rec::size(page, cur);
            if rec::cmp_with_key(page, nxt, rec::key(page, cur)) != std::cmp::Ordering::Greater {
                return Err(format!("chain order violated at origin {cur}"));
            }
            count += 1;
        }
        cur = nxt;
    }
    if count != n_recs(page) {
        return Err(format!(
            "n_recs {} but chain has {count} user records",
            n_recs(page)
        ));
    }
    if live_bytes != used_bytes(page) {
        return Err(format!(
            "byte accounting off: chain {live_bytes}, header {}",
            used_bytes(page)
        ));
    }

    // Directory: slots ascending, ownership counts match group walks.
    let n = usize::from(n_dir_slots(page));
    if dir_slot(page, 0) != PAGE_INFIMUM || dir_slot(page, n - 1) != PAGE_SUPREMUM {
        return Err("system slots corrupted".into());
    }
    let mut walker = PAGE_INFIMUM;
    for i in 0..n {
        let owner = dir_slot(page, i);
        let mut members = 0u8;
        loop {
            members += 1;
            if walker == owner {
                break;
            }
            walker = rec::next(page, walker);
            if walker == 0 || members > DIR_MAX_OWNED {
                return Err(format!("slot {i} owner unreachable within its group"));
            }
        }
        if rec::n_owned(page, owner) != members {
            return Err(format!(
                "slot {i}: owner claims {} members, walk found {members}",
                rec::n_owned(page, owner)
            ));
        }
        let (min, max) = match i {
            0 => (1, 1),
            _ if i == n - 1 => (1, DIR_MAX_OWNED),
            _ => (DIR_MIN_OWNED, DIR_MAX_OWNED),
        };
        if !(min..=max).contains(&members) {
            return Err(format!("slot {i} group size {members} out of [{min},{max}]"));
        }
        if i + 1 < n {
            walker = rec::next(page, walker);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page_init_raw(&mut page, IndexId(7), 0);
        page
    }

    fn insert(page: &mut [u8], key: &[u8], rest: &[u8]) -> u16 {
        let (prev, exact) = search_le(page, key);
        assert!(!exact, "duplicate key in test insert");
        let body = build_insert_body(prev, 0, RecStatus::Ordinary, key, rest);
        apply_insert(page, &body).unwrap()
    }

    #[test]
    fn fresh_page_is_valid_and_empty() {
        let page = fresh_page();
        validate(&page).unwrap();
        assert_eq!(n_recs(&page), 0);
        assert!(first_user_rec(&page).is_none());
        assert!(last_user_rec(&page).is_none());
        assert_eq!(index_id(&page), IndexId(7));
        assert!(is_leaf(&page));
    }

    #[test]
    fn ordered_inserts_keep_invariants() {
        let mut page = fresh_page();
        for i in 0..50u32 {
            let key = i.to_be_bytes();
            insert(&mut page, &key, b"payload");
            validate(&page).unwrap();
        }
        assert_eq!(n_recs(&page), 50);
        // Forward walk returns sorted keys.
        let mut cur = first_user_rec(&page).unwrap();
        let mut prev_key = rec::key(&page, cur).to_vec();
        for _ in 1..50 {
            cur = rec::next(&page, cur);
            assert!(rec::key(&page, cur) > prev_key.as_slice());
            prev_key = rec::key(&page, cur).to_vec();
        }
    }

    #[test]
    fn random_order_inserts_keep_invariants() {
        let mut page = fresh_page();
        let mut keys: Vec<u32> = (0..80).collect();
        // Deterministic shuffle.
        let mut s = 0x9E37_79B9u32;
        for i in (1..keys.len()).rev() {
            s = s.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            keys.swap(i, (s as usize) % (i + 1));
        }
        for k in keys {
            insert(&mut page, &k.to_be_bytes(), b"v");
            validate(&page).unwrap();
        }
        assert_eq!(n_recs(&page), 80);
    }

    #[test]
    fn search_le_finds_bounds() {
        let mut page = fresh_page();
        for i in [10u32, 20, 30, 40] {
            insert(&mut page, &i.to_be_bytes(), b"v");
        }
        let (at, exact) = search_le(&page, &20u32.to_be_bytes());
        assert!(exact);
        assert_eq!(rec::key(&page, at), 20u32.to_be_bytes());

        let (at, exact) = search_le(&page, &25u32.to_be_bytes());
        assert!(!exact);
        assert_eq!(rec::key(&page, at), 20u32.to_be_bytes());

        let (at, exact) = search_le(&page, &5u32.to_be_bytes());
        assert!(!exact);
        assert_eq!(at, PAGE_INFIMUM);

        let (at, exact) = search_le(&page, &99u32.to_be_bytes());
        assert!(!exact);
        assert_eq!(rec::key(&page, at), 40u32.to_be_bytes());
    }

    #[test]
    fn delete_relinks_and_reuses_space() {
        let mut page = fresh_page();
        let mut origins = Vec::new();
        for i in 0..20u32 {
            origins.push(insert(&mut page, &i.to_be_bytes(), b"0123456789"));
        }
        let used_before = used_bytes(&page);

        apply_delete(&mut page, origins[7]).unwrap();
        validate(&page).unwrap();
        assert_eq!(n_recs(&page), 19);
        assert!(garbage(&page) > 0);
        assert!(used_bytes(&page) < used_before);

        // Reinsert a same-size record: the free slot is recycled and the
        // heap does not grow.
        let top = heap_top(&page);
        let o = insert(&mut page, &7u32.to_be_bytes(), b"9876543210");
        assert_eq!(o, origins[7]);
        assert_eq!(heap_top(&page), top);
        validate(&page).unwrap();
    }

    #[test]
    fn delete_all_records() {
        let mut page = fresh_page();
        let origins: Vec<u16> = (0..30u32)
            .map(|i| insert(&mut page, &i.to_be_bytes(), b"v"))
            .collect();
        for o in origins {
            apply_delete(&mut page, o).unwrap();
            validate(&page).unwrap();
        }
        assert_eq!(n_recs(&page), 0);
        assert!(first_user_rec(&page).is_none());
    }

    #[test]
    fn delete_marking_is_nondestructive() {
        let mut page = fresh_page();
        let o = insert(&mut page, &1u32.to_be_bytes(), b"v");
        rec::set_deleted(&mut page, o, true);
        validate(&page).unwrap();
        assert_eq!(n_recs(&page), 1);
        let (at, exact) = search_le(&page, &1u32.to_be_bytes());
        assert!(exact);
        assert!(rec::is_deleted(&page, at));
    }

    #[test]
    fn insert_rejected_when_full() {
        let mut page = fresh_page();
        let big = vec![0xABu8; 1000];
        let mut i = 0u32;
        loop {
            let key = i.to_be_bytes();
            if !fits(&page, key.len() + big.len()) {
                break;
            }
            insert(&mut page, &key, &big);
            i += 1;
        }
        let (prev, _) = search_le(&page, &i.to_be_bytes());
        let body = build_insert_body(prev, 0, RecStatus::Ordinary, &i.to_be_bytes(), &big);
        assert!(apply_insert(&mut page, &body).is_err());
        validate(&page).unwrap();
    }

    #[test]
    fn min_rec_flag_preserved() {
        let mut page = fresh_page();
        let (prev, _) = search_le(&page, b"a");
        let body = build_insert_body(prev, REC_INFO_MIN_REC, RecStatus::NodePtr, b"a", b"ab\0\0\0\x05");
        let o = apply_insert(&mut page, &body).unwrap();
        assert!(rec::is_min_rec(&page, o));
        assert_eq!(rec::status(&page, o), RecStatus::NodePtr);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any interleaving of unique inserts and deletes keeps the
            /// page invariants and leaves exactly the surviving keys in
            /// sorted chain order.
            #[test]
            fn mixed_workload_keeps_invariants(ops in proptest::collection::vec((0u16..200, any::<bool>()), 1..120)) {
                let mut page = fresh_page();
                let mut live = std::collections::BTreeMap::new();
                for (k, is_insert) in ops {
                    let key = u32::from(k).to_be_bytes();
                    if is_insert && !live.contains_key(&k) {
                        if fits(&page, key.len() + 8) {
                            let o = insert(&mut page, &key, b"propval1");
                            live.insert(k, o);
                        }
                    } else if let Some(o) = live.remove(&k) {
                        apply_delete(&mut page, o).unwrap();
                    }
                }
                validate(&page).map_err(|e| TestCaseError::fail(e))?;
                prop_assert_eq!(usize::from(n_recs(&page)), live.len());
                let mut cur = first_user_rec(&page);
                for (&k, _) in &live {
                    let origin = cur.expect("chain shorter than live set");
                    prop_assert_eq!(rec::key(&page, origin), u32::from(k).to_be_bytes());
                    let nxt = rec::next(&page, origin);
                    cur = (nxt != PAGE_SUPREMUM).then_some(nxt);
                }
                prop_assert!(cur.is_none());
            }
        }
    }
}
