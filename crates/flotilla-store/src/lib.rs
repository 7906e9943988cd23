//! Flotilla object store — replicated, in-memory, indexed.
//!
//! Every manager holds the full cluster state in memory: clusters, nodes,
//! services, tasks, networks, volumes and extension resources. Mutations are
//! expressed as batches of [`StoreAction`]s collected by a write transaction;
//! on a leader the batch is routed through Raft (via [`ProposalRouter`]) and
//! becomes visible only once the committed entry is applied locally, so the
//! store contents are a deterministic function of the Raft log.
//!
//! # Modules
//!
//! - **`objects`** — domain types (`Node`, `Service`, `Task`, ...)
//! - **`object`** — the closed [`Kind`]/[`Object`] variants and `StoreObject`
//! - **`index`** — per-kind tables with primary and secondary indexes
//! - **`store`** — transactions, commit routing, action application
//! - **`watch`** — the commit-ordered event bus
//! - **`snapshot`** — full-state capture and restore for log compaction

pub mod error;
pub mod index;
pub mod object;
pub mod objects;
pub mod snapshot;
pub mod store;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use index::Filter;
pub use object::{Kind, Object, StoreAction, StoreObject};
pub use objects::*;
pub use snapshot::{RaftMemberRecord, StoreSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use store::{ProposalError, ProposalRouter, ReadTx, Store, WriteTx};
pub use watch::{EventStream, StoreEvent, WatchError};

/// Generate a fresh object id.
///
/// Ids are 32 hex characters; uniqueness is probabilistic, collisions are
/// caught by the store's create-time id check.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
