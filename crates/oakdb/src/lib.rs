//! OakDB: an embeddable transactional storage engine.
//!
//! Tables live in B+ tree clustered indexes over a 16 KiB paged store.
//! Durability comes from write-ahead redo logging with checkpoint-based
//! crash recovery; concurrency from MVCC snapshot reads backed by undo
//! logs plus row-level locking (gap and next-key flavors) with deadlock
//! detection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oakdb::{Engine, EngineConfig, MemDictionary, IndexDef, ShutdownMode};
//! use oakdb::types::{IndexId, IsolationLevel, SpaceId, TableId};
//! use oakdb::vfs::UnixStorage;
//!
//! # fn main() -> oakdb::Result<()> {
//! let dict = Arc::new(MemDictionary::new());
//! let engine = Engine::startup(UnixStorage, dict.clone(), EngineConfig::default())?;
//!
//! let root = engine.create_index(IndexId(1), true)?;
//! dict.register(IndexDef {
//!     index_id: IndexId(1),
//!     table_id: TableId(1),
//!     space: SpaceId::SYSTEM,
//!     root,
//!     clustered: true,
//! });
//!
//! let mut trx = engine.begin(IsolationLevel::RepeatableRead)?;
//! engine.insert_row(&mut trx, TableId(1), b"key", b"value", &[])?;
//! engine.commit(&mut trx)?;
//! engine.shutdown(ShutdownMode::Normal)?;
//! # Ok(())
//! # }
//! ```

pub use oakdb_core::{
    Cursor, Dictionary, Engine, EngineConfig, EngineStats, IndexDef, MemDictionary, SearchMode,
    ShutdownMode,
};
pub use oakdb_error::{OakError, Result};
pub use oakdb_trx::{Trx, TrxState};

/// Identifier and limit types.
pub mod types {
    pub use oakdb_types::limits;
    pub use oakdb_types::{
        FileAddr, HeapNo, IndexId, IsolationLevel, Lsn, PageId, PageNo, RollPtr, SpaceId, TableId,
        TrxId,
    };
}

/// Storage backends.
pub mod vfs {
    pub use oakdb_vfs::{MemStorage, Storage, StorageFile, UnixStorage};
}

/// Lower-level subsystems, exposed for embedders with special needs and
/// for the integration tests.
pub mod internals {
    pub use oakdb_btree as btree;
    pub use oakdb_fsp as fsp;
    pub use oakdb_lock as lock;
    pub use oakdb_log as log;
    pub use oakdb_mtr as mtr;
    pub use oakdb_pager as pager;
    pub use oakdb_trx as trx;
}

/// Engine over the local filesystem.
pub type DiskEngine = Engine<oakdb_vfs::UnixStorage>;
/// Engine over the in-memory storage backend (tests, ephemeral data).
pub type MemEngine = Engine<oakdb_vfs::MemStorage>;
