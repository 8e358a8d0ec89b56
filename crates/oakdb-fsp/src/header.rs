//! Tablespace header operations: space creation, the free-limit frontier,
//! and fragment-page allocation.

use oakdb_error::{OakError, Result};
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::LatchMode;
use oakdb_types::limits::{
    EXTENT_SIZE, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID, FIL_PAGE_TYPE, XDES_PAGE_STRIDE,
};
use oakdb_types::{FileAddr, PageId, PageNo, PageType, SpaceId};
use oakdb_vfs::StorageFile;
use tracing::debug;

use crate::flst::{self, BaseNode};
use crate::xdes::{self, Xdes, XdesState};

/// Space header field offsets (absolute within page 0).
pub const FSP_SPACE_ID: usize = 38;
pub const FSP_UNUSED: usize = 42;
pub const FSP_SIZE: usize = 46;
pub const FSP_FREE_LIMIT: usize = 50;
pub const FSP_FLAGS: usize = 54;
pub const FSP_FRAG_N_USED: usize = 58;
pub const FSP_FREE: usize = 62;
pub const FSP_FREE_FRAG: usize = 78;
pub const FSP_FULL_FRAG: usize = 94;
pub const FSP_SEG_ID: usize = 110;
pub const FSP_SEG_INODES_FULL: usize = 118;
pub const FSP_SEG_INODES_FREE: usize = 134;
pub const FSP_HEADER_END: usize = 150;

const _: () = assert!(FSP_HEADER_END == xdes::XDES_ARRAY_OFFSET);

/// Initial size of a fresh tablespace, and the growth step: one extent.
pub const FSP_EXTEND_PAGES: u32 = EXTENT_SIZE;

/// Stamp the common header of a freshly materialized page: identity and
/// type (all redo-logged, so recovery reproduces the page from zeros).
pub fn page_init<F: StorageFile>(mtr: &mut Mtr<F>, h: PageHandle, page_type: PageType) {
    let id = mtr.page_id(h);
    mtr.write_u32(h, FIL_PAGE_OFFSET, id.page_no.0);
    mtr.write_u32(h, FIL_PAGE_SPACE_ID, id.space.0);
    mtr.write_u16(h, FIL_PAGE_TYPE, page_type as u16);
}

/// Latch page 0 of the space exclusively.
pub fn header_page<F: StorageFile>(mtr: &mut Mtr<F>, space: SpaceId) -> Result<PageHandle> {
    mtr.get_page(PageId::new(space, PageNo(0)), LatchMode::Exclusive)
}

/// Create the space header and bootstrap pages of a brand-new tablespace.
/// Page 0 becomes the space header + first descriptor page; page 1 the
/// first segment-inode page. Extent 0 starts as a fragment extent with
/// those two pages in use.
pub fn fsp_init<F: StorageFile>(mtr: &mut Mtr<F>, space: SpaceId) -> Result<()> {
    mtr.log_file_create(space);

    let h = mtr.create_page(PageId::new(space, PageNo(0)))?;
    page_init(mtr, h, PageType::SpaceHeader);
    mtr.write_u32(h, FSP_SPACE_ID, space.0);
    mtr.write_u32(h, FSP_UNUSED, 0);
    mtr.write_u32(h, FSP_SIZE, EXTENT_SIZE);
    mtr.write_u32(h, FSP_FREE_LIMIT, EXTENT_SIZE);
    mtr.write_u32(h, FSP_FLAGS, 0);
    mtr.write_u32(h, FSP_FRAG_N_USED, 2);
    flst::init(mtr, BaseNode::new(h, FSP_FREE));
    flst::init(mtr, BaseNode::new(h, FSP_FREE_FRAG));
    flst::init(mtr, BaseNode::new(h, FSP_FULL_FRAG));
    mtr.write_u64(h, FSP_SEG_ID, 1);
    flst::init(mtr, BaseNode::new(h, FSP_SEG_INODES_FULL));
    flst::init(mtr, BaseNode::new(h, FSP_SEG_INODES_FREE));

    // Extent 0: pages 0 (this header) and 1 (inode page) in use.
    let entry = xdes::entry_for(h, PageNo(0));
    entry.init(mtr, XdesState::FreeFrag);
    entry.set_free(mtr, 0, false);
    entry.set_free(mtr, 1, false);
    flst::add_last(
        mtr,
        space,
        BaseNode::new(h, FSP_FREE_FRAG),
        h,
        entry.node_off(),
    )?;

    crate::segment::inode_page_init(mtr, space, PageNo(1), h)?;
    debug!(%space, "initialized tablespace");
    Ok(())
}

/// Read the space size in pages (page 0 must be latched in the MTR).
#[must_use]
pub fn space_size<F: StorageFile>(mtr: &Mtr<F>, header: PageHandle) -> u32 {
    mtr.read_u32(header, FSP_SIZE)
}

/// Resolve a descriptor-list address (pointing at the embedded list node)
/// to a latched descriptor entry.
pub(crate) fn xdes_from_list_addr<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    addr: FileAddr,
) -> Result<Xdes> {
    let page = mtr.get_page(PageId::new(space, addr.page_no), LatchMode::Exclusive)?;
    let entry_off = usize::from(addr.offset) - xdes::XDES_FLST_NODE;
    let index = (entry_off - xdes::XDES_ARRAY_OFFSET) / xdes::XDES_SIZE;
    let extent_start = addr.page_no.0 + index as u32 * EXTENT_SIZE;
    Ok(Xdes {
        page,
        off: entry_off,
        extent_start: PageNo(extent_start),
    })
}

/// Latch the descriptor entry covering `page_no`.
pub fn xdes_for_page<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    page_no: PageNo,
) -> Result<Xdes> {
    let (desc_page, _, _) = xdes::locate(page_no);
    let h = mtr.get_page(PageId::new(space, desc_page), LatchMode::Exclusive)?;
    Ok(xdes::entry_for(h, page_no))
}

/// Advance the free-limit frontier by one extent, initializing its
/// descriptor and putting it on the appropriate list. Extends the data
/// file when the frontier passes the current size.
fn fill_free_list<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    header: PageHandle,
) -> Result<()> {
    let free_limit = mtr.read_u32(header, FSP_FREE_LIMIT);
    let size = mtr.read_u32(header, FSP_SIZE);
    let ext_start = free_limit;

    if ext_start + EXTENT_SIZE > size {
        let new_size = ext_start + EXTENT_SIZE;
        mtr.write_u32(header, FSP_SIZE, new_size);
        mtr.pool().spaces().note_extension(space, new_size);
        debug!(%space, new_size, "extended tablespace");
    }

    // A frontier extent starting on a stride boundary carries the
    // descriptor array for the next stride; materialize that page first.
    let (desc_page_no, _, _) = xdes::locate(PageNo(ext_start));
    let desc_h = if desc_page_no.0 == ext_start {
        let h = mtr.create_page(PageId::new(space, desc_page_no))?;
        page_init(mtr, h, PageType::ExtentDescriptor);
        h
    } else {
        mtr.get_page(PageId::new(space, desc_page_no), LatchMode::Exclusive)?
    };

    let entry = xdes::entry_for(desc_h, PageNo(ext_start));
    entry.init(mtr, XdesState::Free);
    let mut used = 0u32;
    for i in 0..EXTENT_SIZE {
        let p = ext_start + i;
        if p % XDES_PAGE_STRIDE == 0 {
            entry.set_free(mtr, i, false);
            used += 1;
        }
    }
    if used > 0 {
        entry.set_state(mtr, XdesState::FreeFrag);
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, FSP_FREE_FRAG),
            desc_h,
            entry.node_off(),
        )?;
        let frag = mtr.read_u32(header, FSP_FRAG_N_USED);
        mtr.write_u32(header, FSP_FRAG_N_USED, frag + used);
    } else {
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, FSP_FREE),
            desc_h,
            entry.node_off(),
        )?;
    }
    mtr.write_u32(header, FSP_FREE_LIMIT, ext_start + EXTENT_SIZE);
    Ok(())
}

/// Detach the first extent of the space FREE list, filling the frontier
/// when the list is empty. Used both for fragment conversion and for
/// handing whole extents to segments.
pub(crate) fn take_free_extent<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    header: PageHandle,
) -> Result<Xdes> {
    let free_base = BaseNode::new(header, FSP_FREE);
    for _ in 0..3 {
        let addr = flst::first(mtr, free_base);
        if !addr.is_null() {
            let entry = xdes_from_list_addr(mtr, space, addr)?;
            flst::remove(mtr, space, free_base, entry.page, entry.node_off())?;
            return Ok(entry);
        }
        fill_free_list(mtr, space, header)?;
    }
    // Repeated frontier extents went to the fragment list (descriptor
    // pages); one more fill must produce a clean extent.
    let addr = flst::first(mtr, free_base);
    if addr.is_null() {
        return Err(OakError::OutOfFileSpace { space_id: space.0 });
    }
    let entry = xdes_from_list_addr(mtr, space, addr)?;
    flst::remove(mtr, space, free_base, entry.page, entry.node_off())?;
    Ok(entry)
}

/// Allocate one page from the fragment extents (individually allocated
/// pages, not owned by a segment).
pub fn fsp_alloc_free_page<F: StorageFile>(mtr: &mut Mtr<F>, space: SpaceId) -> Result<PageNo> {
    let header = header_page(mtr, space)?;
    let ff_base = BaseNode::new(header, FSP_FREE_FRAG);

    let entry = {
        let addr = flst::first(mtr, ff_base);
        if addr.is_null() {
            let entry = take_free_extent(mtr, space, header)?;
            entry.set_state(mtr, XdesState::FreeFrag);
            flst::add_last(mtr, space, ff_base, entry.page, entry.node_off())?;
            entry
        } else {
            xdes_from_list_addr(mtr, space, addr)?
        }
    };

    let bit = entry
        .find_free(mtr)
        .ok_or_else(|| OakError::internal("FREE_FRAG extent has no free page"))?;
    entry.set_free(mtr, bit, false);
    let frag = mtr.read_u32(header, FSP_FRAG_N_USED);
    mtr.write_u32(header, FSP_FRAG_N_USED, frag + 1);

    if entry.find_free(mtr).is_none() {
        flst::remove(mtr, space, ff_base, entry.page, entry.node_off())?;
        entry.set_state(mtr, XdesState::FullFrag);
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, FSP_FULL_FRAG),
            entry.page,
            entry.node_off(),
        )?;
    }
    Ok(PageNo(entry.extent_start.0 + bit))
}

/// Return a fragment page to its extent.
pub fn fsp_free_page<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    page_no: PageNo,
) -> Result<()> {
    let header = header_page(mtr, space)?;
    let entry = xdes_for_page(mtr, space, page_no)?;
    let bit = page_no.0 - entry.extent_start.0;
    debug_assert!(!entry.is_free(mtr, bit), "double free of page {page_no}");

    match entry.state(mtr) {
        Some(XdesState::FullFrag) => {
            flst::remove(
                mtr,
                space,
                BaseNode::new(header, FSP_FULL_FRAG),
                entry.page,
                entry.node_off(),
            )?;
            entry.set_state(mtr, XdesState::FreeFrag);
            flst::add_last(
                mtr,
                space,
                BaseNode::new(header, FSP_FREE_FRAG),
                entry.page,
                entry.node_off(),
            )?;
        }
        Some(XdesState::FreeFrag) => {}
        other => {
            return Err(OakError::internal(format!(
                "freeing fragment page {page_no} from extent in state {other:?}"
            )))
        }
    }

    entry.set_free(mtr, bit, true);
    let frag = mtr.read_u32(header, FSP_FRAG_N_USED);
    mtr.write_u32(header, FSP_FRAG_N_USED, frag - 1);

    if entry.free_count(mtr) == EXTENT_SIZE {
        flst::remove(
            mtr,
            space,
            BaseNode::new(header, FSP_FREE_FRAG),
            entry.page,
            entry.node_off(),
        )?;
        entry.set_state(mtr, XdesState::Free);
        flst::add_last(
            mtr,
            space,
            BaseNode::new(header, FSP_FREE),
            entry.page,
            entry.node_off(),
        )?;
    }
    Ok(())
}
