//! The dictionary oracle.
//!
//! Schema persistence is the host application's concern: the engine only
//! needs, given an index id, the index's root page, its tablespace, and
//! whether it is the clustered index of its table. The host registers
//! definitions at startup (after recovery, from its own catalog).

use std::collections::HashMap;

use oakdb_types::{IndexId, PageNo, SpaceId, TableId};
use parking_lot::RwLock;

/// Everything the engine needs to know about one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub index_id: IndexId,
    pub table_id: TableId,
    pub space: SpaceId,
    pub root: PageNo,
    /// Clustered indexes store the rows; secondary indexes store
    /// entries of (secondary key + appended primary key).
    pub clustered: bool,
}

/// Index-id → definition lookup.
pub trait Dictionary: Send + Sync + 'static {
    fn index_def(&self, index_id: IndexId) -> Option<IndexDef>;

    /// All indexes of a table, clustered first.
    fn table_indexes(&self, table_id: TableId) -> Vec<IndexDef>;
}

/// In-memory dictionary for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemDictionary {
    defs: RwLock<HashMap<IndexId, IndexDef>>,
}

impl MemDictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: IndexDef) {
        self.defs.write().insert(def.index_id, def);
    }

    pub fn forget(&self, index_id: IndexId) {
        self.defs.write().remove(&index_id);
    }
}

impl Dictionary for MemDictionary {
    fn index_def(&self, index_id: IndexId) -> Option<IndexDef> {
        self.defs.read().get(&index_id).copied()
    }

    fn table_indexes(&self, table_id: TableId) -> Vec<IndexDef> {
        let defs = self.defs.read();
        let mut out: Vec<IndexDef> = defs
            .values()
            .filter(|d| d.table_id == table_id)
            .copied()
            .collect();
        out.sort_by_key(|d| (!d.clustered, d.index_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let dict = MemDictionary::new();
        let def = IndexDef {
            index_id: IndexId(10),
            table_id: TableId(1),
            space: SpaceId::SYSTEM,
            root: PageNo(7),
            clustered: true,
        };
        dict.register(def);
        assert_eq!(dict.index_def(IndexId(10)), Some(def));
        assert_eq!(dict.index_def(IndexId(11)), None);
    }

    #[test]
    fn table_indexes_clustered_first() {
        let dict = MemDictionary::new();
        for (id, clustered) in [(2u64, false), (1, true), (3, false)] {
            dict.register(IndexDef {
                index_id: IndexId(id),
                table_id: TableId(9),
                space: SpaceId::SYSTEM,
                root: PageNo(id as u32 + 10),
                clustered,
            });
        }
        let defs = dict.table_indexes(TableId(9));
        assert_eq!(defs.len(), 3);
        assert!(defs[0].clustered);
        assert_eq!(defs[1].index_id, IndexId(2));
    }
}
