//! Error types for the scheduler.

use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),

    #[error("invalid constraint expression: {0}")]
    InvalidConstraint(String),

    #[error("scheduler event stream lagged; resynchronized")]
    Resynced,
}
