//! Engine assembly.
//!
//! Wires the paged store, redo log, B+ trees, lock manager, and
//! transaction system into one [`Engine`] value: startup with crash
//! recovery (analysis from the log scan, redo, then an undo pass),
//! background flusher/checkpointer/purge threads, row operations, and
//! persistent cursors.

pub mod background;
pub mod config;
pub mod cursor;
pub mod dict;
pub mod engine;
pub mod recovery;
pub mod row;
pub mod stats;

pub use config::EngineConfig;
pub use cursor::{Cursor, SearchMode};
pub use dict::{Dictionary, IndexDef, MemDictionary};
pub use engine::{Engine, ShutdownMode};
pub use stats::EngineStats;
