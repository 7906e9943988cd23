//! Persisted mapping between store node ids and u64 Raft ids.
//!
//! The control plane addresses nodes by string id (the certificate CN);
//! openraft wants dense u64 ids. The mapping must survive restarts,
//! since a member that came back with a different Raft id would look
//! like a brand-new voter, so assignments are written to the same redb
//! database as the log before use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{RaftError, RaftResult};

/// raft id → node id.
const ASSIGNMENTS: TableDefinition<u64, &str> = TableDefinition::new("raft_id_assignments");

/// Bidirectional node id ↔ Raft id map.
pub struct NodeIdMap {
    db: Arc<Database>,
    inner: RwLock<MapInner>,
}

#[derive(Default)]
struct MapInner {
    by_node: HashMap<String, u64>,
    by_raft: HashMap<u64, String>,
    next_id: u64,
}

impl NodeIdMap {
    /// Open the map, loading persisted assignments.
    pub fn new(db: Arc<Database>) -> RaftResult<Self> {
        let txn = db
            .begin_write()
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        txn.open_table(ASSIGNMENTS)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        txn.commit().map_err(|e| RaftError::Storage(e.to_string()))?;

        let mut inner = MapInner {
            next_id: 1,
            ..MapInner::default()
        };
        {
            let txn = db
                .begin_read()
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            let table = txn
                .open_table(ASSIGNMENTS)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            for item in table.iter().map_err(|e| RaftError::Storage(e.to_string()))? {
                let (raft_id, node_id) =
                    item.map_err(|e| RaftError::Storage(e.to_string()))?;
                let raft_id = raft_id.value();
                let node_id = node_id.value().to_string();
                inner.by_node.insert(node_id.clone(), raft_id);
                inner.by_raft.insert(raft_id, node_id);
                inner.next_id = inner.next_id.max(raft_id + 1);
            }
        }

        Ok(Self {
            db,
            inner: RwLock::new(inner),
        })
    }

    /// Raft id for a node, assigning and persisting the next free id on
    /// first sight.
    pub fn assign(&self, node_id: &str) -> RaftResult<u64> {
        if let Some(id) = self.raft_id_for(node_id) {
            return Ok(id);
        }

        let mut inner = self.inner.write().unwrap();
        // Re-check under the write lock.
        if let Some(&id) = inner.by_node.get(node_id) {
            return Ok(id);
        }

        let raft_id = inner.next_id;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(ASSIGNMENTS)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
            table
                .insert(raft_id, node_id)
                .map_err(|e| RaftError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| RaftError::Storage(e.to_string()))?;

        inner.next_id += 1;
        inner.by_node.insert(node_id.to_string(), raft_id);
        inner.by_raft.insert(raft_id, node_id.to_string());
        debug!(node_id, raft_id, "raft id assigned");
        Ok(raft_id)
    }

    pub fn raft_id_for(&self, node_id: &str) -> Option<u64> {
        self.inner.read().unwrap().by_node.get(node_id).copied()
    }

    pub fn node_id_for(&self, raft_id: u64) -> Option<String> {
        self.inner.read().unwrap().by_raft.get(&raft_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
