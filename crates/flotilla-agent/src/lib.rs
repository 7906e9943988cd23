//! Flotilla agent — the worker-node process.
//!
//! Maintains exactly one session to a manager, runs a controller per
//! assigned task, and reports every observed state change back through
//! a coalescing, retrying status pipeline.
//!
//! The container runtime sits behind the [`Executor`]/[`Controller`]
//! traits; session backoff, manager selection, assignment diffing and
//! the task state machine all live here.

pub mod agent;
pub mod error;
pub mod exec;
pub mod managers;
pub mod reporter;
pub mod worker;

pub use agent::{Agent, AgentConfig};
pub use error::{AgentError, AgentResult};
pub use exec::{ControlError, Controller, Executor};
pub use managers::ManagerSet;
pub use reporter::{StatusReporter, StatusSink};
pub use worker::Worker;
