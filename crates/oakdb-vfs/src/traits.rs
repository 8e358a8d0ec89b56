use std::path::Path;

use oakdb_error::Result;

/// A storage backend: opens, creates, and deletes files by path.
///
/// Abstracts the OS so the engine can run against real files (production,
/// crash tests that re-open the same directory) or an in-memory tree
/// (fast unit tests). The engine only needs positioned reads and writes,
/// fsync, size, and truncate; richer filesystem semantics stay out.
pub trait Storage: Send + Sync + 'static {
    /// The file handle type produced by this backend.
    type File: StorageFile;

    /// Open an existing file, or create it when `create` is set.
    fn open(&self, path: &Path, create: bool) -> Result<Self::File>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Delete the file at `path`.
    fn delete(&self, path: &Path) -> Result<()>;
}

/// An open file supporting positioned I/O.
///
/// All offsets are absolute byte positions; there is no cursor. Reads of a
/// region past end-of-file zero-fill the remainder, matching pread of a
/// sparse tail.
pub trait StorageFile: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`, zero-filling past end-of-file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`, extending the file as needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush file contents (and metadata needed to find them) to stable
    /// storage.
    fn sync(&self) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;

    /// Grow or shrink the file to exactly `size` bytes.
    fn set_size(&self, size: u64) -> Result<()>;
}
