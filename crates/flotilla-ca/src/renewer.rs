//! Worker-side certificate renewal.
//!
//! Each node watches its own leaf certificate; once less than a
//! threshold fraction of its lifetime remains, it generates a fresh key
//! and CSR, submits a renewal request, polls until the CA signs, and
//! atomically replaces its key material on disk. The next mutual-TLS
//! handshake uses the new certificate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use flotilla_proto::ca::node_ca_client::NodeCaClient;
use flotilla_proto::ca::{IssueNodeCertificateRequest, NodeCertificateStatusRequest};
use flotilla_store::NodeRole;

use crate::error::{CaError, CaResult};
use crate::root::{generate_key_and_csr, remaining_lifetime_fraction};

/// Abstract issuance endpoint, so the renewal flow tests without a live
/// manager.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Submit a CSR; returns the poll token.
    async fn issue(
        &self,
        role: NodeRole,
        csr_pem: &str,
        join_token: &str,
        node_id: &str,
    ) -> CaResult<String>;

    /// Poll a request: `(state, cert_pem)` where state is
    /// "pending" / "issued" / "rejected".
    async fn status(&self, poll_token: &str) -> CaResult<(String, String)>;
}

/// Issuer backed by the manager's `NodeCa` service.
pub struct GrpcCertIssuer {
    client: NodeCaClient<Channel>,
}

impl GrpcCertIssuer {
    pub fn new(client: NodeCaClient<Channel>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertIssuer for GrpcCertIssuer {
    async fn issue(
        &self,
        role: NodeRole,
        csr_pem: &str,
        join_token: &str,
        node_id: &str,
    ) -> CaResult<String> {
        let mut client = self.client.clone();
        let response = client
            .issue_node_certificate(IssueNodeCertificateRequest {
                role: role.as_str().to_string(),
                csr_pem: csr_pem.to_string(),
                join_token: join_token.to_string(),
                node_id: node_id.to_string(),
            })
            .await
            .map_err(|e| CaError::KeyUnavailable(e.to_string()))?;
        Ok(response.into_inner().token)
    }

    async fn status(&self, poll_token: &str) -> CaResult<(String, String)> {
        let mut client = self.client.clone();
        let response = client
            .node_certificate_status(NodeCertificateStatusRequest {
                token: poll_token.to_string(),
            })
            .await
            .map_err(|e| CaError::KeyUnavailable(e.to_string()))?;
        let inner = response.into_inner();
        Ok((inner.state, inner.cert_pem))
    }
}

#[derive(Debug, Clone)]
pub struct RenewerConfig {
    /// Renew when less than this fraction of the lifetime remains.
    pub threshold: f64,
    /// How often the leaf certificate is re-checked.
    pub check_interval: Duration,
    /// Poll cadence while an issuance is in flight.
    pub poll_interval: Duration,
    /// Polls before a renewal attempt is abandoned.
    pub poll_budget: u32,
}

impl Default for RenewerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            check_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
            poll_budget: 120,
        }
    }
}

/// On-disk layout of a node's credential set.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPaths {
    /// The conventional layout under a state directory.
    pub fn under(state_dir: &Path) -> Self {
        let certs = state_dir.join("certificates");
        Self {
            cert: certs.join("node.crt"),
            key: certs.join("node.key"),
        }
    }
}

pub struct Renewer<I> {
    issuer: I,
    config: RenewerConfig,
    node_id: String,
    role: NodeRole,
}

impl<I: CertIssuer> Renewer<I> {
    pub fn new(issuer: I, node_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            issuer,
            config: RenewerConfig::default(),
            node_id: node_id.into(),
            role,
        }
    }

    pub fn with_config(mut self, config: RenewerConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether the certificate at `paths` is due for renewal.
    pub fn needs_renewal(&self, cert_pem: &str) -> bool {
        match remaining_lifetime_fraction(cert_pem) {
            Ok(fraction) => fraction < self.config.threshold,
            Err(err) => {
                warn!(error = %err, "cannot inspect certificate; forcing renewal");
                true
            }
        }
    }

    /// One renewal round: new key, renewal CSR, poll until signed.
    /// Returns `(key_pem, cert_pem)`.
    pub async fn renew(&self) -> CaResult<(String, String)> {
        let material = generate_key_and_csr(&self.node_id)?;
        let poll_token = self
            .issuer
            .issue(self.role, &material.csr_pem, "", &self.node_id)
            .await?;

        for _ in 0..self.config.poll_budget {
            let (state, cert_pem) = self.issuer.status(&poll_token).await?;
            match state.as_str() {
                "issued" => {
                    info!(node_id = %self.node_id, "certificate renewed");
                    return Ok((material.key_pem, cert_pem));
                }
                "rejected" => {
                    return Err(CaError::KeyUnavailable("renewal rejected".into()));
                }
                _ => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
        Err(CaError::KeyUnavailable("renewal timed out".into()))
    }

    /// Run the periodic check-and-renew loop against on-disk paths.
    pub async fn run(
        &self,
        paths: CertPaths,
        mut shutdown: watch::Receiver<bool>,
    ) -> CaResult<()> {
        let mut tick = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cert_pem = match std::fs::read_to_string(&paths.cert) {
                        Ok(pem) => pem,
                        Err(err) => {
                            warn!(error = %err, "cannot read node certificate");
                            continue;
                        }
                    };
                    if !self.needs_renewal(&cert_pem) {
                        debug!(node_id = %self.node_id, "certificate still fresh");
                        continue;
                    }
                    match self.renew().await {
                        Ok((key_pem, cert_pem)) => {
                            replace_credentials(&paths, &key_pem, &cert_pem)?;
                        }
                        Err(err) => {
                            warn!(node_id = %self.node_id, error = %err, "renewal failed; will retry");
                        }
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Atomically swap the key and certificate: write both to temp files,
/// then rename. A crash mid-swap leaves either the old pair or the new
/// pair, never a torn mix of readable halves.
pub fn replace_credentials(paths: &CertPaths, key_pem: &str, cert_pem: &str) -> CaResult<()> {
    if let Some(dir) = paths.key.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let key_tmp = paths.key.with_extension("key.tmp");
    let cert_tmp = paths.cert.with_extension("crt.tmp");
    std::fs::write(&key_tmp, key_pem)?;
    std::fs::write(&cert_tmp, cert_pem)?;
    std::fs::rename(&key_tmp, &paths.key)?;
    std::fs::rename(&cert_tmp, &paths.cert)?;

    info!(cert = %paths.cert.display(), "credentials replaced");
    Ok(())
}
