//! Error types for the dispatcher.

use thiserror::Error;

pub type DispatcherResult<T> = Result<T, DispatcherError>;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("node not registered: {0}")]
    NodeNotRegistered(String),

    #[error("session expired for node {0}")]
    SessionExpired(String),

    #[error("node {0} is re-registering too quickly")]
    RateLimited(String),

    #[error("node {0} is not an accepted cluster member")]
    NotAccepted(String),

    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),
}

impl From<DispatcherError> for tonic::Status {
    fn from(err: DispatcherError) -> Self {
        match &err {
            DispatcherError::NodeNotRegistered(_) => tonic::Status::not_found(err.to_string()),
            DispatcherError::SessionExpired(_) => {
                tonic::Status::failed_precondition(err.to_string())
            }
            DispatcherError::RateLimited(_) => {
                tonic::Status::resource_exhausted(err.to_string())
            }
            DispatcherError::NotAccepted(_) => tonic::Status::permission_denied(err.to_string()),
            DispatcherError::Store(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
