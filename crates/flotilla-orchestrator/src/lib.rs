//! Flotilla orchestrator — converges observed tasks onto declared services.
//!
//! Leader-resident loops:
//!
//! - **`orchestrator`** — watches services, tasks and nodes; keeps the
//!   task set shaped like the spec (replica count, one-per-node for
//!   global services), drives rolling updates, and hands terminal tasks
//!   to the restart supervisor
//! - **`restart`** — restart policy bookkeeping: per-slot attempt
//!   windows and delayed replacement scheduling
//! - **`reaper`** — deletes acknowledged `Remove` tasks and trims
//!   per-slot task history to the cluster's retention limit

pub mod error;
pub mod orchestrator;
pub mod reaper;
pub mod restart;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use reaper::TaskReaper;
pub use restart::RestartSupervisor;
