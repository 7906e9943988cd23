//! Generated protobuf types and gRPC service stubs for Flotilla.
//!
//! Four services ride the same mTLS listener on every manager:
//!
//! - **`control`** — operator CRUD over the object store
//! - **`dispatcher`** — agent sessions, heartbeats, status reports
//! - **`ca`** — asynchronous certificate issuance and root retrieval
//! - **`raft`** — consensus RPCs plus membership management
//!
//! Complex domain objects cross the wire as JSON-encoded
//! `flotilla-store` types inside opaque `bytes` fields; the protobuf
//! layer pins only the method set and routing-relevant scalars.

pub mod control {
    tonic::include_proto!("flotilla.control");
}

pub mod dispatcher {
    tonic::include_proto!("flotilla.dispatcher");
}

pub mod ca {
    tonic::include_proto!("flotilla.ca");
}

pub mod raft {
    tonic::include_proto!("flotilla.raft");
}

/// Metadata key carrying the chain of managers that forwarded a call to
/// the leader. A non-empty incoming chain is refused to stop redirect
/// loops.
pub const REDIRECT_HEADER: &str = "flotilla-redirect";
