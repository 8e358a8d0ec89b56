//! Segments: logical allocation units owning extents and fragment pages.
//!
//! A segment is described by an inode (192 bytes) on an inode page; the
//! owner (a B+ tree root, for instance) embeds a 10-byte segment header
//! pointing at the inode. Small segments use up to 32 individually
//! allocated fragment pages; beyond that they allocate whole extents,
//! kept on the inode's NOT_FULL and FULL lists.

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::LatchMode;
use oakdb_types::limits::{EXTENT_SIZE, FIL_NULL, PAGE_TRAILER};
use oakdb_types::{FileAddr, PageId, PageNo, PageType, SpaceId};
use oakdb_vfs::StorageFile;
use tracing::debug;

use crate::flst::{self, BaseNode};
use crate::header::{
    self, fsp_alloc_free_page, fsp_free_page, header_page, page_init, take_free_extent,
    FSP_SEG_ID, FSP_SEG_INODES_FREE, FSP_SEG_INODES_FULL,
};
use crate::xdes::XdesState;

/// Inode-page layout: the page list node sits right after the common
/// header; inodes follow.
pub const INODE_PAGE_NODE: usize = 38;
pub const INODE_ARRAY_OFFSET: usize = 50;
pub const INODE_SIZE: usize = 192;
/// Inodes per page.
pub const INODES_PER_PAGE: usize = (PAGE_TRAILER - INODE_ARRAY_OFFSET) / INODE_SIZE;

/// Field offsets within an inode.
const INODE_SEG_ID: usize = 0;
const INODE_NOT_FULL_N_USED: usize = 8;
const INODE_FREE: usize = 12;
const INODE_NOT_FULL: usize = 28;
const INODE_FULL: usize = 44;
const INODE_MAGIC: usize = 60;
const INODE_FRAG_ARR: usize = 64;
/// Individually allocated pages per segment before extent allocation
/// begins.
pub const FRAG_ARR_SLOTS: usize = 32;

const INODE_MAGIC_VALUE: u32 = 0x05D6_69D2;

/// Serialized size of a segment header embedded in the owner page:
/// space(4) + inode page(4) + inode offset(2).
pub const SEG_HEADER_SIZE: usize = 10;

/// Write a segment header (owner side).
pub fn write_segment_header<F: StorageFile>(
    mtr: &mut Mtr<F>,
    h: PageHandle,
    off: usize,
    space: SpaceId,
    inode: FileAddr,
) {
    mtr.write_u32(h, off, space.0);
    mtr.write_u32(h, off + 4, inode.page_no.0);
    mtr.write_u16(h, off + 8, inode.offset);
}

/// Read a segment header from raw page bytes.
#[must_use]
pub fn read_segment_header(data: &[u8], off: usize) -> (SpaceId, FileAddr) {
    let space = SpaceId(oakdb_types::mach::read_u32(data, off));
    let page_no = PageNo(oakdb_types::mach::read_u32(data, off + 4));
    let offset = oakdb_types::mach::read_u16(data, off + 8);
    (space, FileAddr::new(page_no, offset))
}

/// Initialize a fresh inode page and put it on the space's free-inode
/// list. `header` is the latched space header page.
pub(crate) fn inode_page_init<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    page_no: PageNo,
    header: PageHandle,
) -> Result<PageHandle> {
    let h = mtr.create_page(PageId::new(space, page_no))?;
    page_init(mtr, h, PageType::SegInode);
    for slot in 0..INODES_PER_PAGE {
        let off = INODE_ARRAY_OFFSET + slot * INODE_SIZE;
        mtr.write_u64(h, off + INODE_SEG_ID, 0);
    }
    flst::add_last(
        mtr,
        space,
        BaseNode::new(header, FSP_SEG_INODES_FREE),
        h,
        INODE_PAGE_NODE,
    )?;
    Ok(h)
}

/// A latched segment inode.
#[derive(Debug, Clone, Copy)]
struct Inode {
    page: PageHandle,
    off: usize,
}

fn inode_at<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    addr: FileAddr,
) -> Result<Inode> {
    let page = mtr.get_page(PageId::new(space, addr.page_no), LatchMode::Exclusive)?;
    Ok(Inode {
        page,
        off: usize::from(addr.offset),
    })
}

fn used_inode_slots<F: StorageFile>(mtr: &Mtr<F>, page: PageHandle) -> usize {
    (0..INODES_PER_PAGE)
        .filter(|slot| {
            mtr.read_u64(page, INODE_ARRAY_OFFSET + slot * INODE_SIZE + INODE_SEG_ID) != 0
        })
        .count()
}

/// Create a segment in `space`; returns the inode address to embed in the
/// owner's segment header.
pub fn fseg_create<F: StorageFile>(mtr: &mut Mtr<F>, space: SpaceId) -> Result<FileAddr> {
    let header = header_page(mtr, space)?;
    let free_inodes = BaseNode::new(header, FSP_SEG_INODES_FREE);

    let inode_page_addr = flst::first(mtr, free_inodes);
    let inode_h = if inode_page_addr.is_null() {
        let page_no = fsp_alloc_free_page(mtr, space)?;
        inode_page_init(mtr, space, page_no, header)?
    } else {
        mtr.get_page(
            PageId::new(space, inode_page_addr.page_no),
            LatchMode::Exclusive,
        )?
    };

    let slot = (0..INODES_PER_PAGE)
        .find(|s| mtr.read_u64(inode_h, INODE_ARRAY_OFFSET + s * INODE_SIZE + INODE_SEG_ID) == 0)
        .ok_or_else(|| OakError::internal("free-inode page has no free slot"))?;
    let off = INODE_ARRAY_OFFSET + slot * INODE_SIZE;

    let seg_id = mtr.read_u64(header, FSP_SEG_ID);
    mtr.write_u64(header, FSP_SEG_ID, seg_id + 1);

    mtr.write_u64(inode_h, off + INODE_SEG_ID, seg_id);
    mtr.write_u32(inode_h, off + INODE_NOT_FULL_N_USED, 0);
    flst::init(mtr, BaseNode::new(inode_h, off + INODE_FREE));
    flst::init(mtr, BaseNode::new(inode_h, off + INODE_NOT_FULL));
    flst::init(mtr, BaseNode::new(inode_h, off + INODE_FULL));
    mtr.write_u32(inode_h, off + INODE_MAGIC, INODE_MAGIC_VALUE);
    for i in 0..FRAG_ARR_SLOTS {
        mtr.write_u32(inode_h, off + INODE_FRAG_ARR + i * 4, FIL_NULL);
    }

    if used_inode_slots(mtr, inode_h) == INODES_PER_PAGE {
        flst::remove(mtr, space, free_inodes, inode_h, INODE_PAGE_NODE)?;
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, FSP_SEG_INODES_FULL),
            inode_h,
            INODE_PAGE_NODE,
        )?;
    }

    let addr = FileAddr::new(mtr.page_id(inode_h).page_no, off as u16);
    debug!(%space, seg_id, inode_page = %addr.page_no, "created segment");
    Ok(addr)
}

/// Allocate one page for the segment.
pub fn fseg_alloc_page<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    inode_addr: FileAddr,
) -> Result<PageNo> {
    // The space header is latched first by every allocation path; it
    // serializes space management within one tablespace.
    let header = header_page(mtr, space)?;
    let inode = inode_at(mtr, space, inode_addr)?;
    debug_assert_eq!(
        mtr.read_u32(inode.page, inode.off + INODE_MAGIC),
        INODE_MAGIC_VALUE,
        "segment inode magic mismatch"
    );

    // 1. A partially used extent of this segment.
    let not_full = BaseNode::new(inode.page, inode.off + INODE_NOT_FULL);
    let first = flst::first(mtr, not_full);
    if !first.is_null() {
        let entry = crate::header::xdes_from_list_addr(mtr, space, first)?;
        let bit = entry
            .find_free(mtr)
            .ok_or_else(|| OakError::internal("NOT_FULL extent has no free page"))?;
        entry.set_free(mtr, bit, false);
        let used = mtr.read_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED);
        if entry.find_free(mtr).is_none() {
            flst::remove(mtr, space, not_full, entry.page, entry.node_off())?;
            flst::add_last(
                mtr,
                space,
                BaseNode::new(inode.page, inode.off + INODE_FULL),
                entry.page,
                entry.node_off(),
            )?;
            mtr.write_u32(
                inode.page,
                inode.off + INODE_NOT_FULL_N_USED,
                used + 1 - EXTENT_SIZE,
            );
        } else {
            mtr.write_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED, used + 1);
        }
        return Ok(PageNo(entry.extent_start.0 + bit));
    }

    // 2. An empty fragment slot.
    if let Some(slot) = (0..FRAG_ARR_SLOTS)
        .find(|i| mtr.read_u32(inode.page, inode.off + INODE_FRAG_ARR + i * 4) == FIL_NULL)
    {
        let page_no = fsp_alloc_free_page(mtr, space)?;
        mtr.write_u32(inode.page, inode.off + INODE_FRAG_ARR + slot * 4, page_no.0);
        return Ok(page_no);
    }

    // 3. Take a whole extent from the space.
    let seg_id = mtr.read_u64(inode.page, inode.off + INODE_SEG_ID);
    let entry = take_free_extent(mtr, space, header)?;
    entry.set_state(mtr, XdesState::Fseg);
    entry.set_seg_id(mtr, seg_id);
    flst::add_last(mtr, space, not_full, entry.page, entry.node_off())?;
    let bit = entry.find_free(mtr).expect("fresh extent has free pages");
    entry.set_free(mtr, bit, false);
    let used = mtr.read_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED);
    mtr.write_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED, used + 1);
    Ok(PageNo(entry.extent_start.0 + bit))
}

/// Return a page to the segment (and the extent to the space when it
/// empties).
pub fn fseg_free_page<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    inode_addr: FileAddr,
    page_no: PageNo,
) -> Result<()> {
    let header = header_page(mtr, space)?;
    let inode = inode_at(mtr, space, inode_addr)?;

    // Fragment page?
    if let Some(slot) = (0..FRAG_ARR_SLOTS)
        .find(|i| mtr.read_u32(inode.page, inode.off + INODE_FRAG_ARR + i * 4) == page_no.0)
    {
        mtr.write_u32(inode.page, inode.off + INODE_FRAG_ARR + slot * 4, FIL_NULL);
        return fsp_free_page(mtr, space, page_no);
    }

    let entry = header::xdes_for_page(mtr, space, page_no)?;
    let seg_id = mtr.read_u64(inode.page, inode.off + INODE_SEG_ID);
    if entry.state(mtr) != Some(XdesState::Fseg) || entry.seg_id(mtr) != seg_id {
        return Err(OakError::internal(format!(
            "page {page_no} does not belong to segment {seg_id}"
        )));
    }
    let bit = page_no.0 - entry.extent_start.0;
    let was_full = entry.find_free(mtr).is_none();
    entry.set_free(mtr, bit, true);

    let not_full = BaseNode::new(inode.page, inode.off + INODE_NOT_FULL);
    let used = mtr.read_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED);
    if was_full {
        flst::remove(
            mtr,
            space,
            BaseNode::new(inode.page, inode.off + INODE_FULL),
            entry.page,
            entry.node_off(),
        )?;
        flst::add_last(mtr, space, not_full, entry.page, entry.node_off())?;
        mtr.write_u32(
            inode.page,
            inode.off + INODE_NOT_FULL_N_USED,
            used + EXTENT_SIZE - 1,
        );
    } else {
        mtr.write_u32(inode.page, inode.off + INODE_NOT_FULL_N_USED, used - 1);
    }

    if entry.free_count(mtr) == EXTENT_SIZE {
        flst::remove(mtr, space, not_full, entry.page, entry.node_off())?;
        entry.set_seg_id(mtr, 0);
        entry.set_state(mtr, XdesState::Free);
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, crate::header::FSP_FREE),
            entry.page,
            entry.node_off(),
        )?;
    }
    Ok(())
}
