//! The engine: one value owning every subsystem.
//!
//! All global state (buffer pool, log, lock system, transaction system)
//! hangs off an explicit [`Engine`] so several isolated instances can
//! coexist in one process (and in one test).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oakdb_btree::{BtreeIndex, ReorgHook};
use oakdb_error::{OakError, Result};
use oakdb_lock::LockSys;
use oakdb_log::{log_file_name, LogConfig, LogSys};
use oakdb_mtr::Mtr;
use oakdb_pager::{BufferPool, PoolConfig, Tablespaces};
use oakdb_trx::{Trx, TrxSys};
use oakdb_types::limits::{EXTENT_SIZE, PAGE_SIZE};
use oakdb_types::{HeapNo, IndexId, IsolationLevel, Lsn, PageId, PageNo, SpaceId, TableId};
use oakdb_vfs::{Storage, StorageFile};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::background::Workers;
use crate::config::EngineConfig;
use crate::dict::{Dictionary, IndexDef};
use crate::recovery;

/// Shutdown flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain purge, flush every dirty page, write a final checkpoint.
    Normal,
    /// Stop immediately; the next startup recovers from the redo log.
    NoFlush,
}

/// Bridges page-reorganization events from the B+ tree into the lock
/// system's inheritance rules.
pub(crate) struct LockReorgHook(pub Arc<LockSys>);

impl ReorgHook for LockReorgHook {
    fn rec_moved(&self, from_page: PageId, from_heap: HeapNo, to_page: PageId, to_heap: HeapNo) {
        self.0.rec_moved(from_page, from_heap, to_page, to_heap);
    }

    fn rec_removed(
        &self,
        page: PageId,
        removed_heap: HeapNo,
        heir_page: PageId,
        heir_heap: HeapNo,
    ) {
        self.0.rec_removed(page, removed_heap, heir_page, heir_heap);
    }
}

/// An embeddable transactional storage engine instance.
pub struct Engine<S: Storage> {
    pub(crate) config: EngineConfig,
    pub(crate) spaces: Arc<Tablespaces<S::File>>,
    pub(crate) log: Arc<LogSys<S::File>>,
    pub(crate) pool: Arc<BufferPool<S::File>>,
    pub(crate) lock_sys: Arc<LockSys>,
    pub(crate) trx_sys: Arc<TrxSys<S::File>>,
    pub(crate) dict: Arc<dyn Dictionary>,
    indexes: RwLock<HashMap<IndexId, Arc<BtreeIndex>>>,
    healthy: AtomicBool,
    workers: Mutex<Option<Workers>>,
}

impl<S: Storage> Engine<S> {
    /// Start the engine: create a fresh database or recover an existing
    /// one, then spawn the background workers.
    pub fn startup(storage: S, dict: Arc<dyn Dictionary>, config: EngineConfig) -> Result<Arc<Self>> {
        config.validate().map_err(OakError::invalid)?;
        let log_config = LogConfig {
            dir: config.data_dir.clone(),
            n_files: config.log_files,
            file_size: config.log_file_size,
        };
        let fresh = !storage.exists(&log_file_name(&config.data_dir, 0));
        let data_path = config.data_dir.join(&config.data_file);

        let log = Arc::new(if fresh {
            LogSys::create(&storage, &log_config)?
        } else {
            LogSys::open(&storage, &log_config)?
        });

        let spaces = Arc::new(Tablespaces::new());
        let data_file = storage.open(&data_path, fresh)?;
        let size_pages = if fresh {
            EXTENT_SIZE
        } else {
            ((data_file.size()? + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64).max(u64::from(EXTENT_SIZE))
                as u32
        };
        spaces.add_file(SpaceId::SYSTEM, data_file, size_pages);

        let pool = BufferPool::new(
            Arc::clone(&spaces),
            Arc::clone(&log),
            &PoolConfig {
                n_frames: config.pool_frames,
                old_dwell: config.lru_old_dwell,
            },
        );
        let lock_sys = Arc::new(LockSys::new(config.lock_wait_timeout));

        let (trx_sys, resurrected) = if fresh {
            let mut mtr = Mtr::start(Arc::clone(&pool));
            oakdb_fsp::fsp_init(&mut mtr, SpaceId::SYSTEM)?;
            mtr.commit()?;
            let trx_sys = TrxSys::create(
                Arc::clone(&pool),
                Arc::clone(&lock_sys),
                config.rollback_segments,
            )?;
            info!(dir = %config.data_dir.display(), "initialized fresh database");
            (Arc::new(trx_sys), Vec::new())
        } else {
            let scan = log.recover_scan()?;
            recovery::apply_redo(&pool, &spaces, &scan)?;
            let trx_sys = Arc::new(TrxSys::open(Arc::clone(&pool), Arc::clone(&lock_sys))?);
            let resurrected = trx_sys.resurrect()?;
            (trx_sys, resurrected)
        };

        let engine = Arc::new(Self {
            config,
            spaces,
            log,
            pool,
            lock_sys,
            trx_sys,
            dict,
            indexes: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            workers: Mutex::new(None),
        });

        // Undo pass: roll back everything that was mid-flight at the
        // crash, producing fresh redo so the rollback itself recovers.
        for mut trx in resurrected {
            engine.rollback(&mut trx)?;
        }
        if !fresh {
            engine.checkpoint()?;
            info!("recovery complete");
        }

        *engine.workers.lock() = Some(Workers::spawn(&engine));
        Ok(engine)
    }

    /// Stop the engine. `Normal` drains purge and flushes everything so
    /// the next startup needs no redo; `NoFlush` relies on recovery.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        if let Some(workers) = self.workers.lock().take() {
            workers.stop();
        }
        if self.is_healthy() && mode == ShutdownMode::Normal {
            while self.purge_step(usize::MAX)? > 0 {}
            self.pool.flush_all()?;
            self.checkpoint()?;
            self.spaces.sync_all()?;
        }
        self.healthy.store(false, Ordering::Release);
        info!(?mode, "engine shut down");
        Ok(())
    }

    // --- Health ---

    pub(crate) fn guard_health(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(OakError::EngineShut)
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a fatal error: the instance stops serving.
    pub(crate) fn mark_failed(&self, err: &OakError) {
        error!(%err, "fatal error; marking engine unhealthy");
        self.healthy.store(false, Ordering::Release);
    }

    // --- Subsystem access ---

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool<S::File>> {
        &self.pool
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LogSys<S::File>> {
        &self.log
    }

    #[must_use]
    pub fn lock_sys(&self) -> &Arc<LockSys> {
        &self.lock_sys
    }

    #[must_use]
    pub fn trx_sys(&self) -> &Arc<TrxSys<S::File>> {
        &self.trx_sys
    }

    // --- Indexes ---

    /// Create a B+ tree for a new index and return its root page; the
    /// host records the root in its catalog and registers the definition
    /// with the dictionary.
    pub fn create_index(&self, index_id: IndexId, clustered: bool) -> Result<PageNo> {
        self.guard_health()?;
        let hook: Arc<dyn ReorgHook> = Arc::new(LockReorgHook(Arc::clone(&self.lock_sys)));
        let index = BtreeIndex::create(
            &self.pool,
            SpaceId::SYSTEM,
            index_id,
            clustered,
            Some(hook),
        )?;
        let root = index.root;
        self.indexes.write().insert(index_id, Arc::new(index));
        Ok(root)
    }

    /// The open B+ tree for an index, opening it through the dictionary
    /// on first use.
    pub(crate) fn index(&self, index_id: IndexId) -> Result<Arc<BtreeIndex>> {
        if let Some(idx) = self.indexes.read().get(&index_id) {
            return Ok(Arc::clone(idx));
        }
        let def = self
            .dict
            .index_def(index_id)
            .ok_or_else(|| OakError::schema(format!("unknown index {index_id}")))?;
        if self.spaces.is_tombstoned(def.space) {
            return Err(OakError::schema(format!(
                "index {index_id} lives in tombstoned tablespace {}",
                def.space
            )));
        }
        let hook: Arc<dyn ReorgHook> = Arc::new(LockReorgHook(Arc::clone(&self.lock_sys)));
        let index = Arc::new(BtreeIndex::open(
            def.space,
            def.index_id,
            def.root,
            def.clustered,
            Some(hook),
        ));
        self.indexes
            .write()
            .entry(index_id)
            .or_insert_with(|| Arc::clone(&index));
        Ok(index)
    }

    /// The clustered index of a table, via the dictionary.
    pub(crate) fn clustered_index_of(&self, table_id: TableId) -> Result<(IndexDef, Arc<BtreeIndex>)> {
        let defs = self.dict.table_indexes(table_id);
        let def = defs
            .iter()
            .find(|d| d.clustered)
            .copied()
            .ok_or_else(|| OakError::schema(format!("table {table_id} has no clustered index")))?;
        Ok((def, self.index(def.index_id)?))
    }

    // --- Transactions ---

    /// Begin a transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<Trx> {
        self.guard_health()?;
        Ok(self.trx_sys.begin(isolation))
    }

    /// Commit. Durable once this returns.
    pub fn commit(&self, trx: &mut Trx) -> Result<()> {
        self.guard_health()?;
        match self.trx_sys.commit(trx) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_fatal() || matches!(err, OakError::Io(_)) {
                    // A commit that cannot reach the log is a durability
                    // failure; the instance stops.
                    self.mark_failed(&err);
                }
                Err(err)
            }
        }
    }

    /// Savepoint: remember the current undo position.
    #[must_use]
    pub fn savepoint(&self, trx: &Trx) -> u64 {
        TrxSys::<S::File>::savepoint(trx)
    }

    /// Roll back the whole transaction.
    pub fn rollback(&self, trx: &mut Trx) -> Result<()> {
        self.rollback_to_undo_no(trx, 0)?;
        self.trx_sys.finish_rollback(trx)
    }

    /// Roll back to a savepoint, keeping the transaction (and its locks)
    /// alive.
    pub fn rollback_to(&self, trx: &mut Trx, savepoint: u64) -> Result<()> {
        self.rollback_to_undo_no(trx, savepoint)
    }

    fn rollback_to_undo_no(&self, trx: &mut Trx, stop_at: u64) -> Result<()> {
        loop {
            // Peek first: the affected index determines the latch to take
            // before any page is touched (latch order: index latch, then
            // pages, then undo pages).
            let peeked = {
                let mut mtr = Mtr::start(Arc::clone(&self.pool));
                let rec = self.trx_sys.peek_top_undo(&mut mtr, trx)?;
                mtr.commit()?;
                rec
            };
            let Some(rec) = peeked else { break };
            if rec.undo_no.0 < stop_at {
                break;
            }
            let (_, index) = self.clustered_index_of(rec.table_id)?;
            let _tlw = index.latch_write();
            let mut mtr = Mtr::start(Arc::clone(&self.pool));
            let popped = self
                .trx_sys
                .pop_undo(&mut mtr, trx, stop_at)?
                .expect("peeked record vanished");
            // The inverse operation and the undo truncation share one
            // MTR: a crash mid-rollback never undoes a record twice.
            self.apply_inverse(&mut mtr, &popped)?;
            mtr.commit()?;
        }
        trx.undo_no = trx.undo_no.min(stop_at);
        Ok(())
    }

    // --- Maintenance entry points (background workers and shutdown) ---

    /// Take a checkpoint bounded by the oldest dirty page.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let min_dirty = self
            .pool
            .min_dirty_lsn()
            .unwrap_or_else(|| self.log.write_lsn());
        self.log.checkpoint(min_dirty)
    }

    /// One purge round; returns the number of undo logs reclaimed.
    pub fn purge_step(&self, limit: usize) -> Result<usize> {
        let applier = crate::row::EnginePurge(self);
        self.trx_sys.purge_step(&applier, limit)
    }
}
