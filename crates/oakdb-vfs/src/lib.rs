//! Storage abstraction for OakDB.
//!
//! The engine performs all file I/O through the [`Storage`] / [`StorageFile`]
//! traits: positioned reads and writes, fsync, size, truncate. Two backends
//! are provided: [`UnixStorage`] over the local filesystem and [`MemStorage`]
//! for tests (including crash-and-recover tests, which re-open the same
//! in-memory tree).

pub mod memory;
pub mod traits;
pub mod unix;

pub use memory::{MemFile, MemStorage};
pub use traits::{Storage, StorageFile};
pub use unix::{UnixFile, UnixStorage};
