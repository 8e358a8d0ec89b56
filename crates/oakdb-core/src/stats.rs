//! Engine statistics snapshot for the host.

use std::sync::atomic::Ordering;

use oakdb_vfs::Storage;

use crate::engine::Engine;

/// Point-in-time counters across the subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub pages_evicted: u64,
    pub log_write_lsn: u64,
    pub log_flushed_lsn: u64,
    pub log_checkpoint_lsn: u64,
    pub lock_waits: u64,
    pub deadlocks: u64,
    pub lock_timeouts: u64,
    pub history_list_length: u32,
}

impl<S: Storage> Engine<S> {
    /// Gather a statistics snapshot.
    pub fn stats(&self) -> EngineStats {
        let pool = self.pool();
        let lock = self.lock_sys();
        EngineStats {
            pool_hits: pool.stats.hits.load(Ordering::Relaxed),
            pool_misses: pool.stats.misses.load(Ordering::Relaxed),
            pages_read: pool.stats.reads.load(Ordering::Relaxed),
            pages_written: pool.stats.writes.load(Ordering::Relaxed),
            pages_evicted: pool.stats.evictions.load(Ordering::Relaxed),
            log_write_lsn: self.log().write_lsn().0,
            log_flushed_lsn: self.log().flushed_lsn().0,
            log_checkpoint_lsn: self.log().checkpoint_lsn().0,
            lock_waits: lock.stats.waits.load(Ordering::Relaxed),
            deadlocks: lock.stats.deadlocks.load(Ordering::Relaxed),
            lock_timeouts: lock.stats.timeouts.load(Ordering::Relaxed),
            history_list_length: self.trx_sys().history_length().unwrap_or(0),
        }
    }
}
