//! Flotilla scheduler — assigns unallocated tasks to eligible nodes.
//!
//! The scheduler watches the store for allocated-but-unassigned tasks
//! and for node changes, keeps an in-memory heap of eligible nodes
//! ordered by assigned-task count, and commits `{node_id, Assigned}`
//! back through the store. Constraint matching prefers the heap root
//! (least loaded) and falls back to a full scan when constraints
//! exclude it.

pub mod constraint;
pub mod error;
pub mod heap;
pub mod scheduler;

pub use constraint::{Constraint, ConstraintOp};
pub use error::{SchedulerError, SchedulerResult};
pub use heap::{NodeHeap, NodeInfo};
pub use scheduler::{Scheduler, SchedulerConfig};
