//! On-page doubly linked file lists.
//!
//! A list base node (16 bytes: length, first address, last address) lives
//! at a fixed offset of some page; each list node (12 bytes: prev address,
//! next address) is embedded in the structure being linked (an extent
//! descriptor, an inode page header, an undo log header). All updates go
//! through a mini-transaction so they are redo-logged.

use oakdb_error::Result;
use oakdb_mtr::{Mtr, PageHandle};
use oakdb_pager::LatchMode;
use oakdb_types::{FileAddr, PageId, SpaceId};
use oakdb_vfs::StorageFile;

/// Byte offsets within a base node.
const FLST_LEN: usize = 0;
const FLST_FIRST: usize = 4;
const FLST_LAST: usize = 10;

/// Byte offsets within a list node.
const FLST_PREV: usize = 0;
const FLST_NEXT: usize = 6;

/// Write a file address through the MTR (logged as two field writes).
pub fn write_addr<F: StorageFile>(mtr: &mut Mtr<F>, h: PageHandle, off: usize, addr: FileAddr) {
    mtr.write_u32(h, off, addr.page_no.0);
    mtr.write_u16(h, off + 4, addr.offset);
}

/// Read a file address from a latched page.
#[must_use]
pub fn read_addr<F: StorageFile>(mtr: &Mtr<F>, h: PageHandle, off: usize) -> FileAddr {
    FileAddr::read(mtr.page_data(h), off)
}

/// A located base node: the page holding it plus its offset.
#[derive(Debug, Clone, Copy)]
pub struct BaseNode {
    pub page: PageHandle,
    pub off: usize,
}

impl BaseNode {
    #[must_use]
    pub const fn new(page: PageHandle, off: usize) -> Self {
        Self { page, off }
    }
}

/// Initialize an empty list.
pub fn init<F: StorageFile>(mtr: &mut Mtr<F>, base: BaseNode) {
    mtr.write_u32(base.page, base.off + FLST_LEN, 0);
    write_addr(mtr, base.page, base.off + FLST_FIRST, FileAddr::NULL);
    write_addr(mtr, base.page, base.off + FLST_LAST, FileAddr::NULL);
}

/// List length.
#[must_use]
pub fn len<F: StorageFile>(mtr: &Mtr<F>, base: BaseNode) -> u32 {
    mtr.read_u32(base.page, base.off + FLST_LEN)
}

/// Address of the first node, or null.
#[must_use]
pub fn first<F: StorageFile>(mtr: &Mtr<F>, base: BaseNode) -> FileAddr {
    read_addr(mtr, base.page, base.off + FLST_FIRST)
}

/// Address of the last node, or null.
#[must_use]
pub fn last<F: StorageFile>(mtr: &Mtr<F>, base: BaseNode) -> FileAddr {
    read_addr(mtr, base.page, base.off + FLST_LAST)
}

fn node_page<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    addr: FileAddr,
) -> Result<PageHandle> {
    mtr.get_page(PageId::new(space, addr.page_no), LatchMode::Exclusive)
}

/// Append `node` (already latched as `node_h`) to the end of the list.
pub fn add_last<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    base: BaseNode,
    node_h: PageHandle,
    node_off: usize,
) -> Result<()> {
    let node_addr = FileAddr::new(mtr.page_id(node_h).page_no, node_off as u16);
    let old_last = last(mtr, base);

    write_addr(mtr, node_h, node_off + FLST_PREV, old_last);
    write_addr(mtr, node_h, node_off + FLST_NEXT, FileAddr::NULL);

    if old_last.is_null() {
        write_addr(mtr, base.page, base.off + FLST_FIRST, node_addr);
    } else {
        let prev_h = node_page(mtr, space, old_last)?;
        write_addr(mtr, prev_h, usize::from(old_last.offset) + FLST_NEXT, node_addr);
    }
    write_addr(mtr, base.page, base.off + FLST_LAST, node_addr);
    let n = len(mtr, base);
    mtr.write_u32(base.page, base.off + FLST_LEN, n + 1);
    Ok(())
}

/// Unlink `node` (already latched as `node_h`) from the list.
pub fn remove<F: StorageFile>(
    mtr: &mut Mtr<F>,
    space: SpaceId,
    base: BaseNode,
    node_h: PageHandle,
    node_off: usize,
) -> Result<()> {
    let prev = read_addr(mtr, node_h, node_off + FLST_PREV);
    let next = read_addr(mtr, node_h, node_off + FLST_NEXT);

    if prev.is_null() {
        write_addr(mtr, base.page, base.off + FLST_FIRST, next);
    } else {
        let prev_h = node_page(mtr, space, prev)?;
        write_addr(mtr, prev_h, usize::from(prev.offset) + FLST_NEXT, next);
    }
    if next.is_null() {
        write_addr(mtr, base.page, base.off + FLST_LAST, prev);
    } else {
        let next_h = node_page(mtr, space, next)?;
        write_addr(mtr, next_h, usize::from(next.offset) + FLST_PREV, prev);
    }
    let n = len(mtr, base);
    debug_assert!(n > 0, "removing from an empty list");
    mtr.write_u32(base.page, base.off + FLST_LEN, n - 1);
    Ok(())
}

/// Next node after the one at `node_off` on `node_h`.
#[must_use]
pub fn next<F: StorageFile>(mtr: &Mtr<F>, node_h: PageHandle, node_off: usize) -> FileAddr {
    read_addr(mtr, node_h, node_off + FLST_NEXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakdb_log::{LogConfig, LogSys};
    use oakdb_pager::{BufferPool, PoolConfig, Tablespaces};
    use oakdb_types::{PageNo, SpaceId};
    use oakdb_vfs::{MemFile, MemStorage, Storage};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> Arc<BufferPool<MemFile>> {
        let storage = MemStorage::new();
        let log = Arc::new(
            LogSys::create(
                &storage,
                &LogConfig {
                    dir: "logs".into(),
                    n_files: 2,
                    file_size: 512 * 1024,
                },
            )
            .unwrap(),
        );
        let spaces = Arc::new(Tablespaces::new());
        spaces.add_file(
            SpaceId(0),
            storage.open(Path::new("ibdata1"), true).unwrap(),
            128,
        );
        BufferPool::new(
            spaces,
            log,
            &PoolConfig {
                n_frames: 32,
                old_dwell: Duration::ZERO,
            },
        )
    }

    #[test]
    fn add_and_remove_maintain_links() {
        let pool = setup();
        let mut mtr = Mtr::start(Arc::clone(&pool));
        let base_h = mtr
            .get_page(PageId::new(SpaceId(0), PageNo(1)), LatchMode::Exclusive)
            .unwrap();
        let base = BaseNode::new(base_h, 100);
        init(&mut mtr, base);
        assert_eq!(len(&mtr, base), 0);
        assert!(first(&mtr, base).is_null());

        // Three nodes on two different pages.
        let n1_h = mtr
            .get_page(PageId::new(SpaceId(0), PageNo(2)), LatchMode::Exclusive)
            .unwrap();
        add_last(&mut mtr, SpaceId(0), base, n1_h, 200).unwrap();
        add_last(&mut mtr, SpaceId(0), base, n1_h, 300).unwrap();
        let n3_h = mtr
            .get_page(PageId::new(SpaceId(0), PageNo(3)), LatchMode::Exclusive)
            .unwrap();
        add_last(&mut mtr, SpaceId(0), base, n3_h, 200).unwrap();

        assert_eq!(len(&mtr, base), 3);
        assert_eq!(first(&mtr, base), FileAddr::new(PageNo(2), 200));
        assert_eq!(last(&mtr, base), FileAddr::new(PageNo(3), 200));
        assert_eq!(next(&mtr, n1_h, 200), FileAddr::new(PageNo(2), 300));

        // Remove the middle node; neighbors relink.
        remove(&mut mtr, SpaceId(0), base, n1_h, 300).unwrap();
        assert_eq!(len(&mtr, base), 2);
        assert_eq!(next(&mtr, n1_h, 200), FileAddr::new(PageNo(3), 200));

        // Remove the head.
        remove(&mut mtr, SpaceId(0), base, n1_h, 200).unwrap();
        assert_eq!(first(&mtr, base), FileAddr::new(PageNo(3), 200));

        // Remove the only remaining node.
        remove(&mut mtr, SpaceId(0), base, n3_h, 200).unwrap();
        assert_eq!(len(&mtr, base), 0);
        assert!(first(&mtr, base).is_null());
        assert!(last(&mtr, base).is_null());

        mtr.commit().unwrap();
    }
}
