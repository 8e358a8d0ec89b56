//! Forward scan of the redo stream for recovery.
//!
//! Starting at the newest checkpoint, records are parsed group by group. A
//! group counts only when its terminator validates: the terminator's start
//! LSN must equal the group's actual position (stale bytes from a previous
//! ring cycle carry an older LSN and fail this check) and its checksum must
//! match the body. The first invalid group ends the scan; everything after
//! it, including a torn tail from a crash mid-flush, is discarded.

use std::collections::HashMap;

use oakdb_error::Result;
use oakdb_types::{Lsn, PageId, SpaceId};
use oakdb_vfs::StorageFile;
use tracing::{debug, info};

use crate::log::LogSys;
use crate::record::{self, PageOp, Parsed, RedoRecord};

/// One page mutation to replay, tagged with the LSN its page will carry
/// after application (the end LSN of its mini-transaction's group).
#[derive(Debug, Clone)]
pub struct RedoEntry {
    pub end_lsn: Lsn,
    pub op: PageOp,
}

/// Everything recovery needs from the durable log.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Where the scan started.
    pub checkpoint_lsn: Lsn,
    /// Durable end of the log; new LSNs are assigned from here.
    pub end_lsn: Lsn,
    /// Page mutations in log order, grouped by page.
    pub page_redo: HashMap<PageId, Vec<RedoEntry>>,
    /// Tablespaces whose creation is recorded after the checkpoint.
    pub created_spaces: Vec<SpaceId>,
}

impl ScanResult {
    /// Total number of page mutations to replay.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.page_redo.values().map(Vec::len).sum()
    }
}

impl<F: StorageFile> LogSys<F> {
    /// Scan the durable log from the newest checkpoint, position the log
    /// tail at the recovered end, and return the mutations to replay.
    pub fn recover_scan(&self) -> Result<ScanResult> {
        let checkpoint_lsn = self.checkpoint_lsn();
        let mut ring = vec![0u8; self.capacity() as usize];
        self.read_ring(checkpoint_lsn, &mut ring)?;

        let mut result = ScanResult {
            checkpoint_lsn,
            end_lsn: checkpoint_lsn,
            ..ScanResult::default()
        };

        let mut at = 0usize;
        'groups: loop {
            let group_start_at = at;
            let group_start_lsn = Lsn(checkpoint_lsn.0 + group_start_at as u64);
            let mut pending: Vec<RedoRecord> = Vec::new();
            loop {
                let parsed = match record::parse_record(&ring[at..]) {
                    Ok(p) => p,
                    // An unrecognized type byte past the durable end is
                    // stale ring content, not corruption.
                    Err(_) => break 'groups,
                };
                match parsed {
                    Parsed::End | Parsed::Truncated => break 'groups,
                    Parsed::Record(RedoRecord::MultiRecEnd { start_lsn, checksum }, n) => {
                        let body = &ring[group_start_at..at];
                        if start_lsn != group_start_lsn
                            || checksum != record::group_checksum(body)
                        {
                            break 'groups;
                        }
                        at += n;
                        let group_end = Lsn(checkpoint_lsn.0 + at as u64);
                        for rec in pending.drain(..) {
                            match rec {
                                RedoRecord::Page { page, op } => {
                                    result.page_redo.entry(page).or_default().push(RedoEntry {
                                        end_lsn: group_end,
                                        op,
                                    });
                                }
                                RedoRecord::FileCreate { space } => {
                                    result.created_spaces.push(space);
                                }
                                RedoRecord::Checkpoint { checkpoint_no, .. } => {
                                    debug!(checkpoint_no, "checkpoint marker in redo stream");
                                }
                                RedoRecord::MultiRecEnd { .. } => unreachable!(),
                            }
                        }
                        result.end_lsn = group_end;
                        continue 'groups;
                    }
                    Parsed::Record(rec, n) => {
                        pending.push(rec);
                        at += n;
                    }
                }
            }
        }

        self.resume_at(result.end_lsn);
        info!(
            checkpoint_lsn = %result.checkpoint_lsn,
            end_lsn = %result.end_lsn,
            records = result.record_count(),
            "redo scan complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogConfig, LOG_FIRST_LSN};
    use oakdb_types::{PageNo, SpaceId};
    use oakdb_vfs::{MemStorage, Storage};
    use std::path::PathBuf;

    fn config() -> LogConfig {
        LogConfig {
            dir: PathBuf::from("logs"),
            n_files: 2,
            file_size: 64 * 1024,
        }
    }

    fn page(no: u32) -> PageId {
        PageId::new(SpaceId(0), PageNo(no))
    }

    #[test]
    fn empty_log_scans_to_checkpoint() {
        let storage = MemStorage::new();
        let log = LogSys::create(&storage, &config()).unwrap();
        let scan = log.recover_scan().unwrap();
        assert_eq!(scan.checkpoint_lsn, LOG_FIRST_LSN);
        assert_eq!(scan.end_lsn, LOG_FIRST_LSN);
        assert_eq!(scan.record_count(), 0);
    }

    #[test]
    fn flushed_groups_are_recovered() {
        let storage = MemStorage::new();
        {
            let log = LogSys::create(&storage, &config()).unwrap();
            let mut body = Vec::new();
            record::encode_write(&mut body, page(4), 100, 0xAB, 1);
            record::encode_write(&mut body, page(4), 200, 0xCDEF, 2);
            let (_, end) = log.append_group(&body).unwrap();

            let mut body2 = Vec::new();
            record::encode_write_string(&mut body2, page(9), 50, b"rec");
            let (_, end2) = log.append_group(&body2).unwrap();
            assert!(end2 > end);
            log.flush_to(end2).unwrap();
        }

        let log = LogSys::open(&storage, &config()).unwrap();
        let scan = log.recover_scan().unwrap();
        assert_eq!(scan.record_count(), 3);
        assert_eq!(scan.page_redo[&page(4)].len(), 2);
        assert_eq!(scan.page_redo[&page(9)].len(), 1);
        // Entries of one group share its end LSN.
        let entries = &scan.page_redo[&page(4)];
        assert_eq!(entries[0].end_lsn, entries[1].end_lsn);
        assert!(scan.end_lsn > scan.checkpoint_lsn);
        assert_eq!(log.write_lsn(), scan.end_lsn);
    }

    #[test]
    fn unflushed_tail_is_discarded() {
        let storage = MemStorage::new();
        {
            let log = LogSys::create(&storage, &config()).unwrap();
            let mut body = Vec::new();
            record::encode_write(&mut body, page(1), 40, 7, 1);
            let (_, end) = log.append_group(&body).unwrap();
            log.flush_to(end).unwrap();
            // Second group never reaches the files.
            let mut body2 = Vec::new();
            record::encode_write(&mut body2, page(2), 40, 8, 1);
            log.append_group(&body2).unwrap();
        }
        let log = LogSys::open(&storage, &config()).unwrap();
        let scan = log.recover_scan().unwrap();
        assert_eq!(scan.record_count(), 1);
        assert!(scan.page_redo.contains_key(&page(1)));
    }

    #[test]
    fn torn_group_is_discarded() {
        let storage = MemStorage::new();
        let end;
        {
            let log = LogSys::create(&storage, &config()).unwrap();
            let mut body = Vec::new();
            record::encode_write(&mut body, page(1), 40, 7, 1);
            let (_, e) = log.append_group(&body).unwrap();
            log.flush_to(e).unwrap();
            end = e;
        }
        // Corrupt the terminator checksum byte on disk.
        let file = storage
            .open(&crate::log::log_file_name(&config().dir, 0), false)
            .unwrap();
        let tear_at = crate::log::LOG_FILE_HEADER_SIZE + (end.0 - LOG_FIRST_LSN.0) - 1;
        let mut b = [0u8; 1];
        file.read_at(&mut b, tear_at).unwrap();
        file.write_at(&[b[0] ^ 0xFF], tear_at).unwrap();

        let log = LogSys::open(&storage, &config()).unwrap();
        let scan = log.recover_scan().unwrap();
        assert_eq!(scan.record_count(), 0);
        assert_eq!(scan.end_lsn, scan.checkpoint_lsn);
    }

    #[test]
    fn rescan_is_idempotent() {
        let storage = MemStorage::new();
        {
            let log = LogSys::create(&storage, &config()).unwrap();
            let mut body = Vec::new();
            record::encode_write(&mut body, page(3), 64, 1234, 4);
            let (_, end) = log.append_group(&body).unwrap();
            log.flush_to(end).unwrap();
        }
        let log = LogSys::open(&storage, &config()).unwrap();
        let first = log.recover_scan().unwrap();
        let log2 = LogSys::open(&storage, &config()).unwrap();
        let second = log2.recover_scan().unwrap();
        assert_eq!(first.end_lsn, second.end_lsn);
        assert_eq!(first.record_count(), second.record_count());
    }
}
