//! Full-state capture and restore.
//!
//! The Raft layer compacts its log by replacing applied entries with a
//! snapshot; the payload is this serialized structure. Restoring clears
//! the in-memory graph, repopulates every table, and rebuilds all
//! indexes, after which the store is equivalent to the source store by
//! id and contents.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::objects::*;
use crate::store::Store;

/// Bumped when the snapshot layout changes incompatibly.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// A Raft cluster member, persisted alongside the object graph.
///
/// Distinct from [`Node`]: this is consensus membership, not cluster
/// inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftMemberRecord {
    pub raft_id: u64,
    pub node_id: NodeId,
    pub addr: String,
}

/// Everything a joining member needs to reconstruct the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub commit_index: u64,
    pub clusters: Vec<Cluster>,
    pub nodes: Vec<Node>,
    pub services: Vec<Service>,
    pub tasks: Vec<Task>,
    pub networks: Vec<Network>,
    pub volumes: Vec<Volume>,
    pub resources: Vec<Resource>,
    pub extensions: Vec<Extension>,
    /// Raft membership at snapshot time, filled in by the Raft layer.
    pub members: Vec<RaftMemberRecord>,
    /// Raft ids that have been removed and must never rejoin.
    pub removed_members: Vec<u64>,
}

impl Store {
    /// Capture every entity of every kind.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.inner.read().unwrap();
        StoreSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            commit_index: state.commit_index,
            clusters: state.clusters.iter().cloned().collect(),
            nodes: state.nodes.iter().cloned().collect(),
            services: state.services.iter().cloned().collect(),
            tasks: state.tasks.iter().cloned().collect(),
            networks: state.networks.iter().cloned().collect(),
            volumes: state.volumes.iter().cloned().collect(),
            resources: state.resources.iter().cloned().collect(),
            extensions: state.extensions.iter().cloned().collect(),
            members: Vec::new(),
            removed_members: Vec::new(),
        }
    }

    /// Replace the in-memory graph with the snapshot contents.
    pub fn restore(&self, snapshot: &StoreSnapshot) {
        let mut state = self.inner.write().unwrap();
        state.clusters.clear();
        state.nodes.clear();
        state.services.clear();
        state.tasks.clear();
        state.networks.clear();
        state.volumes.clear();
        state.resources.clear();
        state.extensions.clear();

        for obj in &snapshot.clusters {
            state.clusters.put(obj.clone());
        }
        for obj in &snapshot.nodes {
            state.nodes.put(obj.clone());
        }
        for obj in &snapshot.services {
            state.services.put(obj.clone());
        }
        for obj in &snapshot.tasks {
            state.tasks.put(obj.clone());
        }
        for obj in &snapshot.networks {
            state.networks.put(obj.clone());
        }
        for obj in &snapshot.volumes {
            state.volumes.put(obj.clone());
        }
        for obj in &snapshot.resources {
            state.resources.put(obj.clone());
        }
        for obj in &snapshot.extensions {
            state.extensions.put(obj.clone());
        }
        state.commit_index = snapshot.commit_index;

        info!(
            commit_index = snapshot.commit_index,
            nodes = snapshot.nodes.len(),
            services = snapshot.services.len(),
            tasks = snapshot.tasks.len(),
            "store restored from snapshot"
        );
    }
}
