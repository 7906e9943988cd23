//! Flotilla certificate authority.
//!
//! Every node's identity is a TLS certificate: CN carries the node id,
//! OU the role (`flotilla-manager` / `flotilla-worker`), O the cluster
//! id. Issuance is asynchronous: a CSR is submitted with a bootstrap
//! token, a poll token comes back immediately, and the CA server signs
//! out of band, so signing composes with Raft-backed state.
//!
//! - **`root`** — root CA material, CSR signing, cert inspection
//! - **`keys`** — passphrase sealing of the root key
//! - **`token`** — bootstrap join tokens (`FLTL-1-...`)
//! - **`server`** — the issuance loop and `NodeCa` gRPC service
//! - **`renewer`** — worker-side expiry watcher and renewal flow

pub mod error;
pub mod keys;
pub mod renewer;
pub mod root;
pub mod server;
pub mod token;

pub use error::{CaError, CaResult};
pub use keys::{passphrases_from_env, seal, unseal, unseal_with_grace};
pub use renewer::{CertIssuer, CertPaths, GrpcCertIssuer, Renewer, RenewerConfig};
pub use root::{
    generate_key_and_csr, parse_identity, remaining_lifetime_fraction, CertIdentity, IssuedCert,
    NodeKeyMaterial, RootCa,
};
pub use server::{CaServer, CaServerConfig, CertSigner, NodeCaGrpcServer};
pub use token::JoinToken;

/// OU value for manager certificates.
pub const MANAGER_OU: &str = "flotilla-manager";

/// OU value for worker certificates.
pub const WORKER_OU: &str = "flotilla-worker";

/// Environment variable holding the CA key passphrase.
pub const PASSPHRASE_ENV: &str = "FLOTILLA_CA_PASSPHRASE";

/// Previous passphrase, accepted during rotation.
pub const PASSPHRASE_PREV_ENV: &str = "FLOTILLA_CA_PASSPHRASE_PREV";
