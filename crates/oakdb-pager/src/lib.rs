//! Buffer pool for OakDB.
//!
//! Caches 16 KiB pages in latched frames, evicts through a scan-resistant
//! young/old LRU, tracks dirty pages in a flush list ordered by
//! first-modification LSN, and enforces write-ahead logging on every page
//! write.

pub mod buf;
pub mod pool;
pub mod space;

pub use buf::{finalize_for_write, verify_on_read, PageBuf, PageBufPool};
pub use pool::{BufferPool, LatchMode, PageGuard, PoolConfig, PoolStats};
pub use space::Tablespaces;
