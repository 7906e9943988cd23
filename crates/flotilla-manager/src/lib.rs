//! Flotilla manager — the control-plane process.
//!
//! Assembles the store, Raft node, dispatcher, CA, and the leader-only
//! control loops (orchestrator, allocator, scheduler, reaper), and
//! serves every gRPC surface on one listener. Non-leader managers
//! forward writes to the leader with a redirect guard.

pub mod controlapi;
pub mod manager;
pub mod proxy;
pub mod roles;

pub use controlapi::ControlApi;
pub use manager::{bootstrap_cluster, Manager, ManagerConfig};
pub use proxy::{ForwardingControl, LeaderGuard};
pub use roles::{authorize, Identity, RequiredRole};
