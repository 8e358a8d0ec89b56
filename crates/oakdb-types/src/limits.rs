//! On-disk geometry and common page-header offsets.
//!
//! Every multi-byte on-disk integer in OakDB is big-endian. The constants
//! here cover the layout shared by all page types: the 38-byte common header
//! and the 8-byte trailer. Subsystem-specific layouts (index header, space
//! header, undo header) live in their own crates next to the code that
//! reads them.

/// Database page size in bytes. Fixed; the engine does not support other
/// sizes.
pub const PAGE_SIZE: usize = 16 * 1024;

/// Pages per extent (1 MiB of 16 KiB pages).
pub const EXTENT_SIZE: u32 = 64;

/// Every page whose number is a multiple of this carries the extent
/// descriptor array for the following `PAGE_SIZE` pages.
pub const XDES_PAGE_STRIDE: u32 = PAGE_SIZE as u32;

/// Number of extent descriptors on a descriptor page.
pub const XDES_PER_PAGE: u32 = XDES_PAGE_STRIDE / EXTENT_SIZE;

// --- Common page header (38 bytes at offset 0) ---

/// Page checksum.
pub const FIL_PAGE_CHECKSUM: usize = 0;
/// Page number within its space.
pub const FIL_PAGE_OFFSET: usize = 4;
/// Previous page in the same-level chain (index pages) or list.
pub const FIL_PAGE_PREV: usize = 8;
/// Next page in the same-level chain (index pages) or list.
pub const FIL_PAGE_NEXT: usize = 12;
/// LSN of the newest modification reflected on this page.
pub const FIL_PAGE_LSN: usize = 16;
/// Page type tag.
pub const FIL_PAGE_TYPE: usize = 24;
/// Flush LSN; meaningful only on page 0 of the system space.
pub const FIL_PAGE_FLUSH_LSN: usize = 26;
/// Space id of the owning tablespace.
pub const FIL_PAGE_SPACE_ID: usize = 34;
/// First byte past the common header.
pub const FIL_PAGE_DATA: usize = 38;

// --- Trailer (8 bytes at the end of the page) ---

/// Trailer size: checksum(4) + low 32 bits of the page LSN(4).
pub const PAGE_TRAILER_SIZE: usize = 8;
/// Offset of the trailer from the start of the page.
pub const PAGE_TRAILER: usize = PAGE_SIZE - PAGE_TRAILER_SIZE;

/// "No page" marker in prev/next fields and file addresses.
pub const FIL_NULL: u32 = 0xFFFF_FFFF;

/// Serialized size of a file address: page-no(4) + byte-offset(2).
pub const FIL_ADDR_SIZE: usize = 6;

/// Serialized size of a file-list base node: length(4) + first(6) + last(6).
pub const FLST_BASE_NODE_SIZE: usize = 16;

/// Serialized size of a file-list node: prev(6) + next(6).
pub const FLST_NODE_SIZE: usize = 12;
