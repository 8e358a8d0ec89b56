//! Shared harness for the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;
use std::time::Duration;

use oakdb::types::{IndexId, IsolationLevel, PageNo, SpaceId, TableId};
use oakdb::vfs::MemStorage;
use oakdb::{Engine, EngineConfig, IndexDef, MemDictionary, MemEngine, Trx};

pub const TABLE: TableId = TableId(1);
pub const CLUSTERED: IndexId = IndexId(1);

pub fn test_config() -> EngineConfig {
    EngineConfig {
        pool_frames: 256,
        lru_old_dwell: Duration::ZERO,
        log_file_size: 8 * 1024 * 1024,
        lock_wait_timeout: Duration::from_millis(400),
        flush_interval: Duration::from_millis(50),
        checkpoint_interval: Duration::from_millis(500),
        purge_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

pub struct Db {
    pub storage: MemStorage,
    pub dict: Arc<MemDictionary>,
    pub engine: Arc<MemEngine>,
    pub root: PageNo,
}

/// Fresh database with one table (clustered index only).
pub fn create_db() -> Db {
    create_db_with(test_config())
}

/// Route engine tracing through the test harness; `OAKDB_TEST_LOG=debug`
/// turns it on.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OAKDB_TEST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn create_db_with(config: EngineConfig) -> Db {
    init_tracing();
    let storage = MemStorage::new();
    let dict = Arc::new(MemDictionary::new());
    let engine = Engine::startup(storage.clone(), dict.clone(), config).unwrap();
    let root = engine.create_index(CLUSTERED, true).unwrap();
    dict.register(IndexDef {
        index_id: CLUSTERED,
        table_id: TABLE,
        space: SpaceId::SYSTEM,
        root,
        clustered: true,
    });
    Db {
        storage,
        dict,
        engine,
        root,
    }
}

/// Re-open the same files after a crash or shutdown; the host re-registers
/// its catalog.
pub fn reopen(db: &Db) -> Arc<MemEngine> {
    let dict = Arc::clone(&db.dict);
    Engine::startup(db.storage.clone(), dict, test_config()).unwrap()
}

pub fn put(engine: &MemEngine, trx: &mut Trx, key: u32, value: &[u8]) {
    engine
        .insert_row(trx, TABLE, &key.to_be_bytes(), value, &[])
        .unwrap();
}

pub fn get(engine: &MemEngine, trx: &mut Trx, key: u32) -> Option<Vec<u8>> {
    engine.read_row(trx, TABLE, &key.to_be_bytes()).unwrap()
}

pub fn put_commit(engine: &MemEngine, key: u32, value: &[u8]) {
    let mut trx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    put(engine, &mut trx, key, value);
    engine.commit(&mut trx).unwrap();
}

pub fn get_committed(engine: &MemEngine, key: u32) -> Option<Vec<u8>> {
    let mut trx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let out = get(engine, &mut trx, key);
    engine.commit(&mut trx).unwrap();
    out
}
