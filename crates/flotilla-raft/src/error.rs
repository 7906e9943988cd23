//! Error types for the consensus layer.

use thiserror::Error;

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors surfaced by the Raft node.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft node is stopped")]
    Stopped,

    #[error("lost leadership during proposal")]
    LostLeadership,

    #[error("proposal too large: {size} bytes (limit {limit})")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("failed to append entry: {0}")]
    AppendEntry(String),

    #[error("failed to apply snapshot: {0}")]
    ApplySnapshot(String),

    #[error("member id already exists: {0}")]
    IdExists(u64),

    #[error("member id was removed and may not rejoin: {0}")]
    IdRemoved(u64),

    #[error("member id not found: {0}")]
    IdNotFound(u64),

    #[error("cannot remove member {0}: the cluster would lose quorum")]
    CannotRemoveMember(u64),

    #[error("this member has been removed from the cluster")]
    MemberRemoved,

    #[error("proposal rejected: {0}")]
    ProposalRejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("membership change failed: {0}")]
    Membership(String),
}
