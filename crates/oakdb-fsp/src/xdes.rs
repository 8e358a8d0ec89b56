//! Extent descriptors.
//!
//! Every page whose number is a multiple of the descriptor stride carries
//! an array of 256 descriptors covering the following 16 384 pages (256
//! extents of 64 pages). A descriptor records the owning segment, its
//! position in a free/fragment/segment list, its state, and a 2-bits-per-
//! page bitmap (free bit + clean bit).

use oakdb_mtr::{Mtr, PageHandle};
use oakdb_types::limits::{EXTENT_SIZE, XDES_PAGE_STRIDE};
use oakdb_types::{PageNo, SpaceId};
use oakdb_vfs::StorageFile;

/// First descriptor byte on a descriptor page (after the space header
/// area, which is only meaningful on page 0).
pub const XDES_ARRAY_OFFSET: usize = 150;

/// Serialized descriptor size: seg-id(8) + list node(12) + state(4) +
/// bitmap(16).
pub const XDES_SIZE: usize = 40;

/// Field offsets within a descriptor.
pub const XDES_SEG_ID: usize = 0;
pub const XDES_FLST_NODE: usize = 8;
pub const XDES_STATE: usize = 20;
pub const XDES_BITMAP: usize = 24;

/// Extent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum XdesState {
    /// On the space free list.
    Free = 1,
    /// Partially used for individually allocated (fragment) pages.
    FreeFrag = 2,
    /// Fully used by fragment pages.
    FullFrag = 3,
    /// Owned by a segment.
    Fseg = 4,
}

impl XdesState {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Free),
            2 => Some(Self::FreeFrag),
            3 => Some(Self::FullFrag),
            4 => Some(Self::Fseg),
            _ => None,
        }
    }
}

/// Which descriptor page and entry describe `page_no`, and the first page
/// of that extent.
#[must_use]
pub fn locate(page_no: PageNo) -> (PageNo, usize, PageNo) {
    let desc_page = page_no.0 - page_no.0 % XDES_PAGE_STRIDE;
    let extent_index = (page_no.0 % XDES_PAGE_STRIDE) / EXTENT_SIZE;
    let entry_off = XDES_ARRAY_OFFSET + extent_index as usize * XDES_SIZE;
    let extent_start = desc_page + extent_index * EXTENT_SIZE;
    (PageNo(desc_page), entry_off, PageNo(extent_start))
}

/// A latched descriptor entry.
#[derive(Debug, Clone, Copy)]
pub struct Xdes {
    pub page: PageHandle,
    pub off: usize,
    /// First page of the described extent.
    pub extent_start: PageNo,
}

impl Xdes {
    /// Initialize the descriptor: no segment, all pages free, the given
    /// state.
    pub fn init<F: StorageFile>(self, mtr: &mut Mtr<F>, state: XdesState) {
        mtr.write_u64(self.page, self.off + XDES_SEG_ID, 0);
        self.set_state(mtr, state);
        // Free bit set for every page: 0b01 per 2-bit pair.
        let bitmap = [0x55u8; 16];
        mtr.write_bytes(self.page, self.off + XDES_BITMAP, &bitmap);
    }

    #[must_use]
    pub fn state<F: StorageFile>(self, mtr: &Mtr<F>) -> Option<XdesState> {
        XdesState::from_raw(mtr.read_u32(self.page, self.off + XDES_STATE))
    }

    pub fn set_state<F: StorageFile>(self, mtr: &mut Mtr<F>, state: XdesState) {
        mtr.write_u32(self.page, self.off + XDES_STATE, state as u32);
    }

    #[must_use]
    pub fn seg_id<F: StorageFile>(self, mtr: &Mtr<F>) -> u64 {
        mtr.read_u64(self.page, self.off + XDES_SEG_ID)
    }

    pub fn set_seg_id<F: StorageFile>(self, mtr: &mut Mtr<F>, seg_id: u64) {
        mtr.write_u64(self.page, self.off + XDES_SEG_ID, seg_id);
    }

    /// Whether the page at `index` within the extent is free.
    #[must_use]
    pub fn is_free<F: StorageFile>(self, mtr: &Mtr<F>, index: u32) -> bool {
        debug_assert!(index < EXTENT_SIZE);
        let byte = mtr.page_data(self.page)[self.off + XDES_BITMAP + (index / 4) as usize];
        byte & (1 << ((index % 4) * 2)) != 0
    }

    /// Set or clear the free bit of the page at `index`.
    pub fn set_free<F: StorageFile>(self, mtr: &mut Mtr<F>, index: u32, free: bool) {
        debug_assert!(index < EXTENT_SIZE);
        let byte_off = self.off + XDES_BITMAP + (index / 4) as usize;
        let mut byte = mtr.page_data(self.page)[byte_off];
        let mask = 1u8 << ((index % 4) * 2);
        if free {
            byte |= mask;
        } else {
            byte &= !mask;
        }
        mtr.write_u8(self.page, byte_off, byte);
    }

    /// Index of the first free page in the extent, if any.
    #[must_use]
    pub fn find_free<F: StorageFile>(self, mtr: &Mtr<F>) -> Option<u32> {
        (0..EXTENT_SIZE).find(|&i| self.is_free(mtr, i))
    }

    /// Number of free pages in the extent.
    #[must_use]
    pub fn free_count<F: StorageFile>(self, mtr: &Mtr<F>) -> u32 {
        (0..EXTENT_SIZE).filter(|&i| self.is_free(mtr, i)).count() as u32
    }

    /// This descriptor's list-node address parts for file lists.
    #[must_use]
    pub fn node_off(self) -> usize {
        self.off + XDES_FLST_NODE
    }
}

/// The descriptor for `page_no` exists only after its extent entered the
/// free list (free-limit advance); callers latch the descriptor page and
/// construct the entry reference.
#[must_use]
pub fn entry_for(page: PageHandle, page_no: PageNo) -> Xdes {
    let (_, entry_off, extent_start) = locate(page_no);
    Xdes {
        page,
        off: entry_off,
        extent_start,
    }
}

/// Space id is unused here but keeps call sites explicit about which space
/// the descriptor belongs to.
#[must_use]
pub fn descriptor_page_id(space: SpaceId, page_no: PageNo) -> oakdb_types::PageId {
    let (desc_page, _, _) = locate(page_no);
    oakdb_types::PageId::new(space, desc_page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_maps_extents() {
        let (desc, off, start) = locate(PageNo(0));
        assert_eq!(desc, PageNo(0));
        assert_eq!(off, XDES_ARRAY_OFFSET);
        assert_eq!(start, PageNo(0));

        let (desc, off, start) = locate(PageNo(65));
        assert_eq!(desc, PageNo(0));
        assert_eq!(off, XDES_ARRAY_OFFSET + XDES_SIZE);
        assert_eq!(start, PageNo(64));

        let (desc, _, start) = locate(PageNo(16384 + 130));
        assert_eq!(desc, PageNo(16384));
        assert_eq!(start, PageNo(16384 + 128));
    }

    #[test]
    fn array_fits_on_page() {
        assert!(XDES_ARRAY_OFFSET + 256 * XDES_SIZE < oakdb_types::limits::PAGE_TRAILER);
    }
}
