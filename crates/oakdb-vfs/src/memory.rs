//! In-memory storage backend for tests.
//!
//! Files live in a shared map so a "re-opened" path sees the bytes written
//! through earlier handles. Crash tests exploit this: drop the engine
//! without flushing, re-open the same `MemStorage`, and recover.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use oakdb_error::{OakError, Result};
use parking_lot::Mutex;

use crate::traits::{Storage, StorageFile};

type FileBytes = Arc<Mutex<Vec<u8>>>;

/// Shared in-memory file tree.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<PathBuf, FileBytes>>>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    type File = MemFile;

    fn open(&self, path: &Path, create: bool) -> Result<Self::File> {
        let mut files = self.files.lock();
        if let Some(bytes) = files.get(path) {
            return Ok(MemFile {
                bytes: Arc::clone(bytes),
            });
        }
        if !create {
            return Err(OakError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )));
        }
        let bytes: FileBytes = Arc::default();
        files.insert(path.to_path_buf(), Arc::clone(&bytes));
        Ok(MemFile { bytes })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path).map(|_| ()).ok_or_else(|| {
            OakError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            ))
        })
    }
}

/// Handle to an in-memory file.
#[derive(Debug)]
pub struct MemFile {
    bytes: FileBytes,
}

impl StorageFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let bytes = self.bytes.lock();
        let offset = usize::try_from(offset).map_err(|_| OakError::invalid("offset overflow"))?;
        buf.fill(0);
        if offset < bytes.len() {
            let n = buf.len().min(bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let offset = usize::try_from(offset).map_err(|_| OakError::invalid("offset overflow"))?;
        let end = offset + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn set_size(&self, size: u64) -> Result<()> {
        let size = usize::try_from(size).map_err(|_| OakError::invalid("size overflow"))?;
        self.bytes.lock().resize(size, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_sees_writes() {
        let storage = MemStorage::new();
        let path = Path::new("a/b");
        storage.open(path, true).unwrap().write_at(b"xyz", 4).unwrap();

        let again = storage.open(path, false).unwrap();
        let mut buf = [0u8; 7];
        again.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"\0\0\0\0xyz");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let storage = MemStorage::new();
        assert!(storage.open(Path::new("nope"), false).is_err());
    }

    #[test]
    fn truncate_shrinks() {
        let storage = MemStorage::new();
        let f = storage.open(Path::new("t"), true).unwrap();
        f.write_at(&[1u8; 100], 0).unwrap();
        f.set_size(10).unwrap();
        assert_eq!(f.size().unwrap(), 10);
        let mut buf = [0u8; 20];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..10], &[1u8; 10]);
        assert_eq!(&buf[10..], &[0u8; 10]);
    }
}
