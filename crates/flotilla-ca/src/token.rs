//! Bootstrap join tokens.
//!
//! `FLTL-1-<ca digest>-<secret>`: the digest pins the root CA the
//! joining node must see (defeating man-in-the-middle managers), the
//! secret authorizes admission. One token exists per role; rotating a
//! token only revokes future joins.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CaError, CaResult};

const TOKEN_PREFIX: &str = "FLTL";
const TOKEN_VERSION: &str = "1";
/// Hex chars of the CA digest carried in the token.
const DIGEST_LEN: usize = 40;
const SECRET_BYTES: usize = 16;

/// A parsed bootstrap token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinToken {
    pub ca_digest: String,
    pub secret: String,
}

impl JoinToken {
    /// Mint a token bound to a root CA certificate.
    pub fn generate(ca_cert_pem: &str) -> Self {
        let mut secret_bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        Self {
            ca_digest: ca_digest(ca_cert_pem),
            secret: hex(&secret_bytes),
        }
    }

    pub fn parse(token: &str) -> CaResult<Self> {
        let mut parts = token.split('-');
        let (prefix, version, digest, secret) = (
            parts.next().ok_or(CaError::InvalidToken)?,
            parts.next().ok_or(CaError::InvalidToken)?,
            parts.next().ok_or(CaError::InvalidToken)?,
            parts.next().ok_or(CaError::InvalidToken)?,
        );
        if parts.next().is_some()
            || prefix != TOKEN_PREFIX
            || version != TOKEN_VERSION
            || digest.len() != DIGEST_LEN
            || secret.is_empty()
            || !digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(CaError::InvalidToken);
        }
        Ok(Self {
            ca_digest: digest.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Whether this token pins the given root certificate.
    pub fn matches_ca(&self, ca_cert_pem: &str) -> bool {
        self.ca_digest == ca_digest(ca_cert_pem)
    }
}

impl std::fmt::Display for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}-{TOKEN_VERSION}-{}-{}",
            self.ca_digest, self.secret
        )
    }
}

fn ca_digest(ca_cert_pem: &str) -> String {
    let digest = Sha256::digest(ca_cert_pem.as_bytes());
    hex(&digest)[..DIGEST_LEN].to_string()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
