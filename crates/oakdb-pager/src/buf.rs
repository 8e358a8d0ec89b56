//! Page buffers and the page checksum scheme.

use oakdb_error::{OakError, Result};
use oakdb_types::limits::{
    FIL_PAGE_CHECKSUM, FIL_PAGE_LSN, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID, PAGE_SIZE, PAGE_TRAILER,
};
use oakdb_types::{mach, Lsn, PageId};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

/// One 16 KiB page image.
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    /// A zero-filled page.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("page buffer size"),
        }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// The page LSN from the common header.
    #[inline]
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        Lsn(mach::read_u64(self.as_slice(), FIL_PAGE_LSN))
    }

    /// Stamp the page LSN into the common header.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        mach::write_u64(self.as_mut_slice(), FIL_PAGE_LSN, lsn.0);
    }

    pub fn zero_fill(&mut self) {
        self.data.fill(0);
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf").field("lsn", &self.lsn()).finish()
    }
}

/// Pool of reusable page buffers, so steady-state page reads do not
/// allocate.
#[derive(Default)]
pub struct PageBufPool {
    idle: Mutex<Vec<PageBuf>>,
}

impl PageBufPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle buffer or allocate a fresh one. The buffer is zeroed.
    #[must_use]
    pub fn acquire(&self) -> PageBuf {
        match self.idle.lock().pop() {
            Some(mut buf) => {
                buf.zero_fill();
                buf
            }
            None => PageBuf::zeroed(),
        }
    }

    /// Return a buffer for reuse.
    pub fn release(&self, buf: PageBuf) {
        self.idle.lock().push(buf);
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Compute the content checksum: everything between the header checksum
/// field and the trailer.
#[must_use]
fn content_checksum(page: &[u8]) -> u32 {
    xxh3_64(&page[FIL_PAGE_CHECKSUM + 4..PAGE_TRAILER]) as u32
}

/// Stamp checksum fields and the trailer LSN echo before a page goes to
/// disk. The trailer repeats the low 32 bits of the header LSN so a torn
/// write (head and tail from different versions) is detectable.
pub fn finalize_for_write(page: &mut [u8]) {
    let lsn_low = mach::read_u32(page, FIL_PAGE_LSN + 4);
    mach::write_u32(page, PAGE_TRAILER + 4, lsn_low);
    let sum = content_checksum(page);
    mach::write_u32(page, FIL_PAGE_CHECKSUM, sum);
    mach::write_u32(page, PAGE_TRAILER, sum);
}

/// Validate a page read from disk. All-zero pages (sparse tail of a
/// freshly extended file) are accepted as never-written.
pub fn verify_on_read(id: PageId, page: &[u8]) -> Result<()> {
    if page.iter().all(|&b| b == 0) {
        return Ok(());
    }
    let stored_head = mach::read_u32(page, FIL_PAGE_CHECKSUM);
    let stored_tail = mach::read_u32(page, PAGE_TRAILER);
    let computed = content_checksum(page);
    if stored_head != computed || stored_tail != computed {
        return Err(OakError::corrupt(
            id.space.0,
            id.page_no.0,
            format!("checksum mismatch: header {stored_head:#x}, trailer {stored_tail:#x}, computed {computed:#x}"),
        ));
    }
    let lsn_low = mach::read_u32(page, FIL_PAGE_LSN + 4);
    let echo = mach::read_u32(page, PAGE_TRAILER + 4);
    if lsn_low != echo {
        return Err(OakError::corrupt(
            id.space.0,
            id.page_no.0,
            format!("torn page: LSN low word {lsn_low:#x} != trailer echo {echo:#x}"),
        ));
    }
    let header_page_no = mach::read_u32(page, FIL_PAGE_OFFSET);
    if header_page_no != id.page_no.0 {
        return Err(OakError::corrupt(
            id.space.0,
            id.page_no.0,
            format!("page claims to be page {header_page_no}"),
        ));
    }
    let header_space = mach::read_u32(page, FIL_PAGE_SPACE_ID);
    if header_space != id.space.0 {
        return Err(OakError::corrupt(
            id.space.0,
            id.page_no.0,
            format!("page claims space {header_space}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakdb_types::{PageNo, SpaceId};

    fn id() -> PageId {
        PageId::new(SpaceId(2), PageNo(17))
    }

    fn stamped_page() -> PageBuf {
        let mut buf = PageBuf::zeroed();
        let page = buf.as_mut_slice();
        mach::write_u32(page, FIL_PAGE_OFFSET, 17);
        mach::write_u32(page, FIL_PAGE_SPACE_ID, 2);
        mach::write_u64(page, FIL_PAGE_LSN, 0x1_0000_0042);
        page[5000] = 0xEE;
        finalize_for_write(page);
        buf
    }

    #[test]
    fn write_verify_round_trip() {
        let buf = stamped_page();
        verify_on_read(id(), buf.as_slice()).unwrap();
    }

    #[test]
    fn all_zero_page_accepted() {
        let buf = PageBuf::zeroed();
        verify_on_read(id(), buf.as_slice()).unwrap();
    }

    #[test]
    fn flipped_bit_detected() {
        let mut buf = stamped_page();
        buf.as_mut_slice()[6000] ^= 1;
        assert!(verify_on_read(id(), buf.as_slice()).is_err());
    }

    #[test]
    fn torn_write_detected() {
        let mut buf = stamped_page();
        // New LSN in the header without refreshing trailer or checksums
        // simulates a torn write; checksum catches it first, so also
        // refresh checksums to isolate the echo check.
        mach::write_u64(buf.as_mut_slice(), FIL_PAGE_LSN, 0x2_0000_0099);
        let sum = content_checksum(buf.as_slice());
        mach::write_u32(buf.as_mut_slice(), FIL_PAGE_CHECKSUM, sum);
        mach::write_u32(buf.as_mut_slice(), PAGE_TRAILER, sum);
        assert!(verify_on_read(id(), buf.as_slice()).is_err());
    }

    #[test]
    fn wrong_identity_detected() {
        let buf = stamped_page();
        let wrong = PageId::new(SpaceId(2), PageNo(18));
        assert!(verify_on_read(wrong, buf.as_slice()).is_err());
    }

    #[test]
    fn buf_pool_reuses() {
        let pool = PageBufPool::new();
        let mut a = pool.acquire();
        a.as_mut_slice()[0] = 9;
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(b.as_slice()[0], 0, "recycled buffer must be zeroed");
    }
}
