//! The log system: an LSN-addressed ring over a fixed set of files.
//!
//! Each file starts with a 2048-byte header (four 512-byte blocks): block 0
//! identifies the file, blocks 1 and 3 of file 0 hold the two checkpoint
//! slots, written alternately so a torn checkpoint write never destroys the
//! previous valid checkpoint. The body of the files forms one logical ring
//! of redo bytes addressed by LSN.

use std::path::PathBuf;

use oakdb_error::{OakError, Result};
use oakdb_types::mach;
use oakdb_types::Lsn;
use oakdb_vfs::{Storage, StorageFile};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::record;

/// Per-file header size: four 512-byte blocks.
pub const LOG_FILE_HEADER_SIZE: u64 = 2048;

/// Offsets of the two checkpoint slots within file 0.
const CHECKPOINT_SLOT_1: u64 = 512;
const CHECKPOINT_SLOT_2: u64 = 3 * 512;

/// Magic tag in block 0 of every log file.
const LOG_HEADER_FORMAT: u32 = 0x4F41_4B31; // "OAK1"

/// The first LSN ever assigned. Nonzero so that LSN 0 can mean "never".
pub const LOG_FIRST_LSN: Lsn = Lsn(8192);

/// Log file naming: `ib_logfile0`, `ib_logfile1`, ...
#[must_use]
pub fn log_file_name(dir: &std::path::Path, index: usize) -> PathBuf {
    dir.join(format!("ib_logfile{index}"))
}

/// Log system configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the log files.
    pub dir: PathBuf,
    /// Number of ring files; at least 2.
    pub n_files: usize,
    /// Size of each file in bytes, header included.
    pub file_size: u64,
}

impl LogConfig {
    /// Total redo capacity of the ring in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        (self.file_size - LOG_FILE_HEADER_SIZE) * self.n_files as u64
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            n_files: 2,
            file_size: 4 * 1024 * 1024,
        }
    }
}

struct LogBuffer {
    /// Bytes in `[buf_start, write_lsn)` not yet written to the files.
    buf: Vec<u8>,
    buf_start: Lsn,
    write_lsn: Lsn,
}

struct FlushState {
    flushed_lsn: Lsn,
    /// A thread is currently writing and syncing; others wait and share the
    /// result (group commit).
    active: bool,
}

struct CheckpointState {
    checkpoint_lsn: Lsn,
    next_checkpoint_no: u64,
}

/// The redo log: in-memory tail buffer plus the durable ring files.
pub struct LogSys<F: StorageFile> {
    files: Vec<F>,
    usable_per_file: u64,
    capacity: u64,
    inner: Mutex<LogBuffer>,
    flush: Mutex<FlushState>,
    flush_done: Condvar,
    /// Cache of `flush.flushed_lsn` for lock-free fast paths.
    flushed_cache: AtomicU64,
    /// Cache of `ckpt.checkpoint_lsn`; read on the append path while the
    /// checkpoint mutex may be held by an in-flight checkpoint.
    checkpoint_cache: AtomicU64,
    ckpt: Mutex<CheckpointState>,
}

impl<F: StorageFile> LogSys<F> {
    /// Create a fresh set of log files and an empty log starting at
    /// [`LOG_FIRST_LSN`].
    pub fn create<S>(storage: &S, config: &LogConfig) -> Result<Self>
    where
        S: Storage<File = F>,
    {
        assert!(config.n_files >= 2, "log ring needs at least two files");
        let mut files = Vec::with_capacity(config.n_files);
        for i in 0..config.n_files {
            let file = storage.open(&log_file_name(&config.dir, i), true)?;
            file.set_size(config.file_size)?;
            // Zero the body so recovery stops at the unwritten tail.
            let zeros = vec![0u8; 64 * 1024];
            let mut off = 0;
            while off < config.file_size {
                let n = zeros.len().min((config.file_size - off) as usize);
                file.write_at(&zeros[..n], off)?;
                off += n as u64;
            }
            files.push(file);
        }
        let log = Self::assemble(files, config, LOG_FIRST_LSN, LOG_FIRST_LSN, 1);
        for i in 0..config.n_files {
            log.write_file_header(i)?;
        }
        log.write_checkpoint_slot(0, LOG_FIRST_LSN)?;
        log.files[0].sync()?;
        info!(
            n_files = config.n_files,
            capacity = log.capacity,
            "created redo log"
        );
        Ok(log)
    }

    /// Open existing log files and position at the newest checkpoint. The
    /// caller runs [`LogSys::recover_scan`] next to find the durable end of
    /// the log and replay it.
    pub fn open<S>(storage: &S, config: &LogConfig) -> Result<Self>
    where
        S: Storage<File = F>,
    {
        let mut files = Vec::with_capacity(config.n_files);
        for i in 0..config.n_files {
            files.push(storage.open(&log_file_name(&config.dir, i), false)?);
        }
        for (i, file) in files.iter().enumerate() {
            let mut block = [0u8; 16];
            file.read_at(&mut block, 0)?;
            if mach::read_u32(&block, 0) != LOG_HEADER_FORMAT {
                return Err(OakError::LogCorruption {
                    lsn: 0,
                    detail: format!("log file {i} has an unrecognized header"),
                });
            }
        }
        let (checkpoint_no, checkpoint_lsn) = Self::read_checkpoints(&files[0])?;
        debug!(%checkpoint_lsn, checkpoint_no, "opened redo log");
        Ok(Self::assemble(
            files,
            config,
            checkpoint_lsn,
            checkpoint_lsn,
            checkpoint_no + 1,
        ))
    }

    fn assemble(
        files: Vec<F>,
        config: &LogConfig,
        write_lsn: Lsn,
        checkpoint_lsn: Lsn,
        next_checkpoint_no: u64,
    ) -> Self {
        let usable = config.file_size - LOG_FILE_HEADER_SIZE;
        Self {
            capacity: usable * files.len() as u64,
            usable_per_file: usable,
            files,
            inner: Mutex::new(LogBuffer {
                buf: Vec::new(),
                buf_start: write_lsn,
                write_lsn,
            }),
            flush: Mutex::new(FlushState {
                flushed_lsn: write_lsn,
                active: false,
            }),
            flush_done: Condvar::new(),
            flushed_cache: AtomicU64::new(write_lsn.0),
            checkpoint_cache: AtomicU64::new(checkpoint_lsn.0),
            ckpt: Mutex::new(CheckpointState {
                checkpoint_lsn,
                next_checkpoint_no,
            }),
        }
    }

    // --- LSN bookkeeping ---

    /// The in-memory log tail.
    #[must_use]
    pub fn write_lsn(&self) -> Lsn {
        self.inner.lock().write_lsn
    }

    /// Everything at or below this LSN is durable.
    #[must_use]
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_cache.load(Ordering::Acquire))
    }

    /// The newest completed checkpoint.
    #[must_use]
    pub fn checkpoint_lsn(&self) -> Lsn {
        Lsn(self.checkpoint_cache.load(Ordering::Acquire))
    }

    /// Redo bytes accumulated since the newest checkpoint.
    #[must_use]
    pub fn age(&self) -> u64 {
        let cp = self.checkpoint_lsn();
        self.write_lsn().0.saturating_sub(cp.0)
    }

    /// Ring capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the log is close enough to wrap-around that a checkpoint
    /// should run now.
    #[must_use]
    pub fn checkpoint_needed(&self) -> bool {
        self.age() * 4 > self.capacity * 3
    }

    // --- Append ---

    /// Append one mini-transaction's record group. The group terminator
    /// (start LSN + body checksum) is appended here, under the same lock
    /// that assigns the LSNs. Returns (start LSN, end LSN).
    pub fn append_group(&self, body: &[u8]) -> Result<(Lsn, Lsn)> {
        debug_assert!(!body.is_empty(), "empty redo group");
        let mut inner = self.inner.lock();
        let start = inner.write_lsn;
        let mut terminator = Vec::with_capacity(record::GROUP_END_SIZE);
        record::encode_group_end(&mut terminator, start, record::group_checksum(body));
        inner.buf.extend_from_slice(body);
        inner.buf.extend_from_slice(&terminator);
        let end = start.add((body.len() + terminator.len()) as u64);
        inner.write_lsn = end;
        drop(inner);

        let age = end.0.saturating_sub(self.checkpoint_lsn().0);
        if age > self.capacity {
            return Err(OakError::internal(
                "redo log capacity exceeded before checkpoint could advance",
            ));
        }
        if age * 8 > self.capacity * 7 {
            warn!(age, capacity = self.capacity, "redo log nearly full");
        }
        Ok((start, end))
    }

    // --- Flush ---

    /// Make everything up to `target` durable. Concurrent callers share one
    /// write + fsync (group commit).
    pub fn flush_to(&self, target: Lsn) -> Result<()> {
        if self.flushed_lsn() >= target {
            return Ok(());
        }
        loop {
            let mut st = self.flush.lock();
            if st.flushed_lsn >= target {
                return Ok(());
            }
            if st.active {
                self.flush_done.wait(&mut st);
                continue;
            }
            st.active = true;
            break;
        }

        let result = self.flush_tail();

        let mut st = self.flush.lock();
        st.active = false;
        if let Ok(new_flushed) = result {
            st.flushed_lsn = new_flushed;
            self.flushed_cache.store(new_flushed.0, Ordering::Release);
        }
        self.flush_done.notify_all();
        drop(st);
        result.map(drop)
    }

    /// Write and fsync everything currently buffered. Only one thread runs
    /// this at a time (guarded by `FlushState::active`).
    fn flush_tail(&self) -> Result<Lsn> {
        let (bytes, start, end) = {
            let inner = self.inner.lock();
            (inner.buf.clone(), inner.buf_start, inner.write_lsn)
        };
        if start == end {
            return Ok(end);
        }
        self.write_ring(start, &bytes)?;
        for idx in self.files_touched(start, end) {
            self.files[idx].sync()?;
        }
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.buf_start, start);
        let drained = (end.0 - start.0) as usize;
        inner.buf.drain(..drained);
        inner.buf_start = end;
        Ok(end)
    }

    /// Ring position of an LSN: (file index, byte offset within file).
    fn ring_position(&self, lsn: Lsn) -> (usize, u64) {
        debug_assert!(lsn >= LOG_FIRST_LSN);
        let pos = (lsn.0 - LOG_FIRST_LSN.0) % self.capacity;
        let file = (pos / self.usable_per_file) as usize;
        (file, LOG_FILE_HEADER_SIZE + pos % self.usable_per_file)
    }

    fn files_touched(&self, start: Lsn, end: Lsn) -> Vec<usize> {
        let mut touched = Vec::new();
        let mut lsn = start;
        while lsn < end {
            let (file, off) = self.ring_position(lsn);
            if !touched.contains(&file) {
                touched.push(file);
            }
            let room = self.usable_per_file - (off - LOG_FILE_HEADER_SIZE);
            lsn = Lsn(end.0.min(lsn.0 + room));
        }
        touched
    }

    fn write_ring(&self, start: Lsn, bytes: &[u8]) -> Result<()> {
        let mut lsn = start;
        let mut rest = bytes;
        while !rest.is_empty() {
            let (file, off) = self.ring_position(lsn);
            let room = (self.usable_per_file - (off - LOG_FILE_HEADER_SIZE)) as usize;
            let n = rest.len().min(room);
            self.files[file].write_at(&rest[..n], off)?;
            lsn = lsn.add(n as u64);
            rest = &rest[n..];
        }
        Ok(())
    }

    pub(crate) fn read_ring(&self, start: Lsn, out: &mut [u8]) -> Result<()> {
        let mut lsn = start;
        let mut filled = 0;
        while filled < out.len() {
            let (file, off) = self.ring_position(lsn);
            let room = (self.usable_per_file - (off - LOG_FILE_HEADER_SIZE)) as usize;
            let n = (out.len() - filled).min(room);
            self.files[file].read_at(&mut out[filled..filled + n], off)?;
            lsn = lsn.add(n as u64);
            filled += n;
        }
        Ok(())
    }

    /// After recovery found the durable end of the log, resume assigning
    /// LSNs from there.
    pub(crate) fn resume_at(&self, end: Lsn) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.buf_start = end;
        inner.write_lsn = end;
        drop(inner);
        let mut st = self.flush.lock();
        st.flushed_lsn = end;
        self.flushed_cache.store(end.0, Ordering::Release);
    }

    // --- Checkpoints ---

    /// Take a checkpoint: everything below `min_dirty_lsn` (the oldest
    /// modification of any dirty page, or the write LSN when nothing is
    /// dirty) no longer needs replay. Flushes the log through the marker,
    /// then publishes the checkpoint in the file-0 header.
    pub fn checkpoint(&self, min_dirty_lsn: Lsn) -> Result<Lsn> {
        let mut ck = self.ckpt.lock();
        let cp_lsn = min_dirty_lsn.min(self.write_lsn()).max(ck.checkpoint_lsn);
        let no = ck.next_checkpoint_no;

        let mut marker = Vec::new();
        record::encode_checkpoint(&mut marker, no, cp_lsn);
        let (_, end) = self.append_group(&marker)?;
        self.flush_to(end)?;

        self.write_checkpoint_slot(no, cp_lsn)?;
        self.files[0].sync()?;
        ck.checkpoint_lsn = cp_lsn;
        ck.next_checkpoint_no = no + 1;
        self.checkpoint_cache.store(cp_lsn.0, Ordering::Release);
        debug!(checkpoint_no = no, %cp_lsn, "checkpoint complete");
        Ok(cp_lsn)
    }

    fn write_file_header(&self, index: usize) -> Result<()> {
        let mut block = [0u8; 512];
        mach::write_u32(&mut block, 0, LOG_HEADER_FORMAT);
        mach::write_u32(&mut block, 4, index as u32);
        mach::write_u64(
            &mut block,
            8,
            LOG_FIRST_LSN.0 + index as u64 * self.usable_per_file,
        );
        self.files[index].write_at(&block, 0)?;
        Ok(())
    }

    fn write_checkpoint_slot(&self, checkpoint_no: u64, lsn: Lsn) -> Result<()> {
        let slot = if checkpoint_no % 2 == 0 {
            CHECKPOINT_SLOT_1
        } else {
            CHECKPOINT_SLOT_2
        };
        let mut block = [0u8; 512];
        mach::write_u64(&mut block, 0, checkpoint_no);
        mach::write_u64(&mut block, 8, lsn.0);
        mach::write_u64(&mut block, 16, (lsn.0 - LOG_FIRST_LSN.0) % self.capacity);
        let sum = xxh3_64(&block[..24]);
        mach::write_u64(&mut block, 24, sum);
        self.files[0].write_at(&block, slot)?;
        Ok(())
    }

    /// Read both checkpoint slots and return the newest valid one.
    fn read_checkpoints(file: &F) -> Result<(u64, Lsn)> {
        let mut best: Option<(u64, Lsn)> = None;
        for slot in [CHECKPOINT_SLOT_1, CHECKPOINT_SLOT_2] {
            let mut block = [0u8; 512];
            file.read_at(&mut block, slot)?;
            let sum = mach::read_u64(&block, 24);
            if sum != xxh3_64(&block[..24]) {
                continue;
            }
            let no = mach::read_u64(&block, 0);
            let lsn = Lsn(mach::read_u64(&block, 8));
            if best.map_or(true, |(bn, _)| no > bn) {
                best = Some((no, lsn));
            }
        }
        best.ok_or_else(|| OakError::LogCorruption {
            lsn: 0,
            detail: "no valid checkpoint record found".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oakdb_vfs::MemStorage;

    fn config() -> LogConfig {
        LogConfig {
            dir: PathBuf::from("logs"),
            n_files: 2,
            file_size: 64 * 1024,
        }
    }

    #[test]
    fn append_assigns_contiguous_lsns() {
        let storage = MemStorage::new();
        let log = LogSys::create(&storage, &config()).unwrap();
        let (s1, e1) = log.append_group(&[1u8; 10]).unwrap();
        let (s2, e2) = log.append_group(&[1u8; 20]).unwrap();
        assert_eq!(s1, LOG_FIRST_LSN);
        assert_eq!(e1.0, s1.0 + 10 + record::GROUP_END_SIZE as u64);
        assert_eq!(s2, e1);
        assert_eq!(e2.0, s2.0 + 20 + record::GROUP_END_SIZE as u64);
    }

    #[test]
    fn flush_advances_durable_lsn() {
        let storage = MemStorage::new();
        let log = LogSys::create(&storage, &config()).unwrap();
        let (_, end) = log.append_group(&[7u8; 100]).unwrap();
        assert!(log.flushed_lsn() < end);
        log.flush_to(end).unwrap();
        assert_eq!(log.flushed_lsn(), end);
        // Idempotent.
        log.flush_to(end).unwrap();
    }

    #[test]
    fn reopen_reads_checkpoint() {
        let storage = MemStorage::new();
        {
            let log = LogSys::create(&storage, &config()).unwrap();
            let (_, end) = log.append_group(&[9u8; 40]).unwrap();
            log.flush_to(end).unwrap();
            log.checkpoint(end).unwrap();
        }
        let log = LogSys::open(&storage, &config()).unwrap();
        assert!(log.checkpoint_lsn() > LOG_FIRST_LSN);
    }

    #[test]
    fn ring_wraps_across_files() {
        let storage = MemStorage::new();
        let log = LogSys::create(&storage, &config()).unwrap();
        // More than one file's worth of redo, in chunks.
        let chunk = vec![0xA5u8; 8 * 1024];
        let mut last = Lsn::ZERO;
        for _ in 0..8 {
            let (_, end) = log.append_group(&chunk).unwrap();
            log.flush_to(end).unwrap();
            log.checkpoint(end).unwrap();
            last = end;
        }
        let mut readback = vec![0u8; 16];
        log.read_ring(Lsn(last.0 - 16), &mut readback).unwrap();
        // The tail of the last chunk is the group terminator; the bytes just
        // before it are chunk payload.
        assert_eq!(readback[0], 0xA5);
    }

    #[test]
    fn missing_checkpoint_is_corruption() {
        let storage = MemStorage::new();
        let _ = LogSys::create(&storage, &config()).unwrap();
        // Wipe both checkpoint slots.
        let file = storage.open(&log_file_name(&config().dir, 0), false).unwrap();
        file.write_at(&[0u8; 512], CHECKPOINT_SLOT_1).unwrap();
        file.write_at(&[0u8; 512], CHECKPOINT_SLOT_2).unwrap();
        assert!(LogSys::open(&storage, &config()).is_err());
    }
}
