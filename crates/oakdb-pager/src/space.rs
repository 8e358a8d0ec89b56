//! Tablespace file registry.
//!
//! A tablespace is an ordered list of files sharing one space id, treated
//! as a single linear page array. The last file of a space auto-extends.
//! Spaces whose files were missing at startup are tombstoned: redo for
//! them is skipped and later access fails with a schema error.

use std::collections::{HashMap, HashSet};

use oakdb_error::{OakError, Result};
use oakdb_types::limits::PAGE_SIZE;
use oakdb_types::{PageId, PageNo, SpaceId};
use oakdb_vfs::StorageFile;
use parking_lot::RwLock;
use tracing::warn;

struct SpaceFiles<F> {
    /// (file, size in pages). Only the last file may grow.
    files: Vec<(F, u32)>,
}

impl<F: StorageFile> SpaceFiles<F> {
    /// Resolve a page number to (file index, byte offset).
    fn locate(&self, page_no: PageNo) -> (usize, u64) {
        let mut remaining = page_no.0;
        for (i, (_, pages)) in self.files.iter().enumerate() {
            let last = i + 1 == self.files.len();
            if remaining < *pages || last {
                return (i, u64::from(remaining) * PAGE_SIZE as u64);
            }
            remaining -= *pages;
        }
        unreachable!("space has no files")
    }

    fn total_pages(&self) -> u32 {
        self.files.iter().map(|(_, p)| *p).sum()
    }
}

/// Registry of open tablespaces.
pub struct Tablespaces<F> {
    spaces: RwLock<HashMap<SpaceId, SpaceFiles<F>>>,
    tombstoned: RwLock<HashSet<SpaceId>>,
}

impl<F: StorageFile> Default for Tablespaces<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: StorageFile> Tablespaces<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            tombstoned: RwLock::new(HashSet::new()),
        }
    }

    /// Register a space's first (or next) file. `size_pages` is the fixed
    /// size of the file; for the last file of a space it is the initial
    /// size and the file grows in place.
    pub fn add_file(&self, space: SpaceId, file: F, size_pages: u32) {
        let mut spaces = self.spaces.write();
        spaces
            .entry(space)
            .or_insert_with(|| SpaceFiles { files: Vec::new() })
            .files
            .push((file, size_pages));
    }

    /// Whether the space is registered and serviceable.
    #[must_use]
    pub fn is_open(&self, space: SpaceId) -> bool {
        self.spaces.read().contains_key(&space)
    }

    /// Mark a space whose files could not be found; subsequent access
    /// fails with a schema error instead of undefined behavior.
    pub fn tombstone(&self, space: SpaceId) {
        warn!(%space, "tombstoning tablespace with missing files");
        self.tombstoned.write().insert(space);
    }

    /// Whether the space is tombstoned.
    #[must_use]
    pub fn is_tombstoned(&self, space: SpaceId) -> bool {
        self.tombstoned.read().contains(&space)
    }

    fn check(&self, space: SpaceId) -> Result<()> {
        if self.is_tombstoned(space) {
            return Err(OakError::schema(format!(
                "tablespace {space} is tombstoned (files missing at startup)"
            )));
        }
        Ok(())
    }

    /// Read one page image from the space's files.
    pub fn read_page(&self, id: PageId, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        self.check(id.space)?;
        let spaces = self.spaces.read();
        let space = spaces
            .get(&id.space)
            .ok_or_else(|| OakError::schema(format!("tablespace {} not open", id.space)))?;
        let (file_idx, offset) = space.locate(id.page_no);
        space.files[file_idx].0.read_at(out, offset)?;
        Ok(())
    }

    /// Write one page image to the space's files, extending the last file
    /// as needed.
    pub fn write_page(&self, id: PageId, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        self.check(id.space)?;
        let spaces = self.spaces.read();
        let space = spaces
            .get(&id.space)
            .ok_or_else(|| OakError::schema(format!("tablespace {} not open", id.space)))?;
        let (file_idx, offset) = space.locate(id.page_no);
        space.files[file_idx].0.write_at(page, offset)?;
        Ok(())
    }

    /// Fsync every file of the space.
    pub fn sync(&self, space: SpaceId) -> Result<()> {
        let spaces = self.spaces.read();
        if let Some(files) = spaces.get(&space) {
            for (file, _) in &files.files {
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Fsync every file of every space.
    pub fn sync_all(&self) -> Result<()> {
        let spaces = self.spaces.read();
        for files in spaces.values() {
            for (file, _) in &files.files {
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Current size of the space in pages (sum of file sizes; the last
    /// file's registered size, not its physical length).
    #[must_use]
    pub fn size_pages(&self, space: SpaceId) -> u32 {
        self.spaces
            .read()
            .get(&space)
            .map_or(0, SpaceFiles::total_pages)
    }

    /// Note that the last file of the space has grown to cover
    /// `new_total_pages` pages in total.
    pub fn note_extension(&self, space: SpaceId, new_total_pages: u32) {
        let mut spaces = self.spaces.write();
        if let Some(files) = spaces.get_mut(&space) {
            let fixed: u32 = files.files[..files.files.len() - 1]
                .iter()
                .map(|(_, p)| *p)
                .sum();
            if let Some(last) = files.files.last_mut() {
                if new_total_pages > fixed + last.1 {
                    last.1 = new_total_pages - fixed;
                }
            }
        }
    }

    /// All registered space ids.
    #[must_use]
    pub fn space_ids(&self) -> Vec<SpaceId> {
        self.spaces.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakdb_vfs::{MemStorage, Storage};
    use std::path::Path;

    #[test]
    fn single_file_read_write() {
        let storage = MemStorage::new();
        let spaces = Tablespaces::new();
        let file = storage.open(Path::new("ibdata1"), true).unwrap();
        spaces.add_file(SpaceId(0), file, 64);

        let id = PageId::new(SpaceId(0), PageNo(3));
        let mut page = vec![0u8; PAGE_SIZE];
        page[100] = 0xAA;
        spaces.write_page(id, &page).unwrap();

        let mut back = vec![0u8; PAGE_SIZE];
        spaces.read_page(id, &mut back).unwrap();
        assert_eq!(back[100], 0xAA);
    }

    #[test]
    fn multi_file_spans() {
        let storage = MemStorage::new();
        let spaces = Tablespaces::new();
        spaces.add_file(
            SpaceId(0),
            storage.open(Path::new("ibdata1"), true).unwrap(),
            4,
        );
        spaces.add_file(
            SpaceId(0),
            storage.open(Path::new("ibdata2"), true).unwrap(),
            4,
        );
        assert_eq!(spaces.size_pages(SpaceId(0)), 8);

        // Page 5 lands in the second file at offset 1 page.
        let id = PageId::new(SpaceId(0), PageNo(5));
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 7;
        spaces.write_page(id, &page).unwrap();

        let f2 = storage.open(Path::new("ibdata2"), false).unwrap();
        let mut raw = vec![0u8; PAGE_SIZE];
        f2.read_at(&mut raw, PAGE_SIZE as u64).unwrap();
        assert_eq!(raw[0], 7);
    }

    #[test]
    fn tombstoned_space_rejects_access() {
        let storage = MemStorage::new();
        let spaces = Tablespaces::new();
        spaces.add_file(
            SpaceId(7),
            storage.open(Path::new("t7.ibd"), true).unwrap(),
            4,
        );
        spaces.tombstone(SpaceId(7));
        let id = PageId::new(SpaceId(7), PageNo(0));
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(spaces.read_page(id, &mut page).is_err());
        assert!(spaces.write_page(id, &page).is_err());
    }

    #[test]
    fn extension_grows_last_file() {
        let storage = MemStorage::new();
        let spaces = Tablespaces::new();
        spaces.add_file(
            SpaceId(0),
            storage.open(Path::new("ibdata1"), true).unwrap(),
            4,
        );
        spaces.note_extension(SpaceId(0), 16);
        assert_eq!(spaces.size_pages(SpaceId(0)), 16);
        // Shrinking is ignored.
        spaces.note_extension(SpaceId(0), 8);
        assert_eq!(spaces.size_pages(SpaceId(0)), 16);
    }
}
