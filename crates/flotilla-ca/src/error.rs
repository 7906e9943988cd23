//! Error types for the certificate authority.

use thiserror::Error;

pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("certificate parse failed: {0}")]
    Parse(String),

    #[error("invalid join token")]
    InvalidToken,

    #[error("join token does not match this cluster's root")]
    TokenRootMismatch,

    #[error("root key is sealed and no valid passphrase was supplied")]
    SealedKey,

    #[error("root key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("unknown certificate request token")]
    UnknownRequestToken,

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
