// openraft's StorageError is large by design — allow it.
#![allow(clippy::result_large_err)]

//! Flotilla Raft consensus — openraft + redb log, in-memory state machine.
//!
//! Wraps openraft to replicate store-action batches across managers. The
//! log and hard state are durable in redb; the state machine is the
//! in-memory object store, rebuilt on restart from the latest persisted
//! snapshot plus log replay.
//!
//! # Architecture
//!
//! - **`typ`** — type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`** — Raft log storage backed by redb
//! - **`state_machine`** — applies committed batches into the object store
//! - **`network`** — tonic transport for inter-manager Raft RPCs
//! - **`server`** — gRPC services for consensus and membership
//! - **`node_map`** — persisted String ↔ u64 node id mapping
//! - **`node`** — the assembled node: propose, leadership, join/leave

pub mod error;
pub mod log_store;
pub mod network;
pub mod node;
pub mod node_map;
pub mod server;
pub mod state_machine;
pub mod typ;

pub use error::{RaftError, RaftResult};
pub use log_store::LogStore;
pub use network::{NetworkConnection, NetworkFactory};
pub use node::{LeaderState, MemberInfo, RaftNode, RaftNodeConfig, RaftProposer};
pub use node_map::NodeIdMap;
pub use server::{RaftMembershipServer, RaftRpcServer};
pub use state_machine::StateMachine;
pub use typ::{FlotillaRaft, Request, Response, TypeConfig};
