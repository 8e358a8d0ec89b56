//! Smoke test over real files: the same engine flows against the local
//! filesystem, including a close-and-reopen cycle.

use std::sync::Arc;
use std::time::Duration;

use oakdb::types::{IndexId, IsolationLevel, SpaceId, TableId};
use oakdb::vfs::UnixStorage;
use oakdb::{Engine, EngineConfig, IndexDef, MemDictionary, ShutdownMode};

#[test]
fn disk_round_trip_with_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        pool_frames: 64,
        log_file_size: 4 * 1024 * 1024,
        lock_wait_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    };
    let table = TableId(1);
    let index_id = IndexId(1);

    let dict = Arc::new(MemDictionary::new());
    let root = {
        let engine = Engine::startup(UnixStorage, dict.clone(), config.clone()).unwrap();
        let root = engine.create_index(index_id, true).unwrap();
        dict.register(IndexDef {
            index_id,
            table_id: table,
            space: SpaceId::SYSTEM,
            root,
            clustered: true,
        });
        let mut trx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
        for k in 0..200u32 {
            engine
                .insert_row(&mut trx, table, &k.to_be_bytes(), b"disk-payload", &[])
                .unwrap();
        }
        engine.commit(&mut trx).unwrap();
        engine.shutdown(ShutdownMode::Normal).unwrap();
        root
    };

    // Reopen from the same directory; the catalog (dictionary) is the
    // host's to restore.
    let dict = Arc::new(MemDictionary::new());
    dict.register(IndexDef {
        index_id,
        table_id: table,
        space: SpaceId::SYSTEM,
        root,
        clustered: true,
    });
    let engine = Engine::startup(UnixStorage, dict, config).unwrap();
    let mut trx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    for k in 0..200u32 {
        assert_eq!(
            engine.read_row(&mut trx, table, &k.to_be_bytes()).unwrap().as_deref(),
            Some(&b"disk-payload"[..])
        );
    }
    engine.commit(&mut trx).unwrap();
    engine.shutdown(ShutdownMode::Normal).unwrap();
}
