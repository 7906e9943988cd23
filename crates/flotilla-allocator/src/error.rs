//! Error types for the allocator.

use thiserror::Error;

pub type AllocatorResult<T> = Result<T, AllocatorError>;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("address space exhausted")]
    SpaceExhausted,

    #[error("subnet pool {0} exhausted")]
    PoolExhausted(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("port {0} already published")]
    PortInUse(u16),

    #[error("dynamic port range exhausted")]
    PortsExhausted,

    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("pool {subnet} still has {in_use} addresses in use")]
    PoolInUse { subnet: String, in_use: usize },

    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),
}
