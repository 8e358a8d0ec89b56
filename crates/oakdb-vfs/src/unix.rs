//! Storage backend over the local filesystem.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use oakdb_error::Result;
use tracing::debug;

use crate::traits::{Storage, StorageFile};

/// Storage backend using `std::fs` with positioned I/O (`pread`/`pwrite`).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixStorage;

impl Storage for UnixStorage {
    type File = UnixFile;

    fn open(&self, path: &Path, create: bool) -> Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        debug!(path = %path.display(), create, "opened file");
        Ok(UnixFile { file })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn delete(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// An open file on the local filesystem.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
}

impl StorageFile for UnixFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                // Past end-of-file: zero-fill, matching a sparse tail.
                buf[done..].fill(0);
                return Ok(());
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioned_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let storage = UnixStorage;
        let file = storage.open(&path, true).unwrap();

        file.write_at(b"hello", 100).unwrap();
        let mut buf = [0u8; 5];
        file.read_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(file.size().unwrap(), 105);
    }

    #[test]
    fn read_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let file = UnixStorage.open(&path, true).unwrap();
        file.write_at(b"ab", 0).unwrap();

        let mut buf = [0xFFu8; 8];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..2], b"ab");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn exists_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let storage = UnixStorage;
        assert!(!storage.exists(&path));
        drop(storage.open(&path, true).unwrap());
        assert!(storage.exists(&path));
        storage.delete(&path).unwrap();
        assert!(!storage.exists(&path));
    }
}
