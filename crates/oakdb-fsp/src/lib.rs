//! File-space management.
//!
//! Tracks which pages of a tablespace are free or allocated: the space
//! header on page 0, extent descriptors (64-page extents, 2 bits per
//! page), and segments (one per B+ tree level group) holding fragment
//! pages and whole extents. Everything runs through mini-transactions so
//! allocation state is crash-consistent.

pub mod flst;
pub mod header;
pub mod segment;
pub mod xdes;

pub use header::{
    fsp_alloc_free_page, fsp_free_page, fsp_init, header_page, page_init, space_size,
};
pub use segment::{
    fseg_alloc_page, fseg_create, fseg_free_page, read_segment_header, write_segment_header,
    SEG_HEADER_SIZE,
};
pub use xdes::XdesState;
