//! Error types for the agent.

use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no managers known")]
    NoManagers,

    #[error("session closed by manager")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),

    #[error("connect error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("invalid manager address: {0}")]
    InvalidAddr(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("agent is shutting down")]
    Stopped,
}
