//! The CA server: asynchronous issuance backed by the store.
//!
//! `issue_node_certificate` only records the request (certificate
//! status `Pending`) and returns a poll token; the signing loop watches
//! the store, validates, signs, and writes the certificate back. Every
//! step is a replicated store write, so a leader change mid-issuance
//! loses nothing: the new leader's signing loop picks up where the old
//! one stopped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use flotilla_proto::ca::node_ca_server::{NodeCa, NodeCaServer};
use flotilla_proto::ca::{
    GetRootCaCertificateRequest, GetRootCaCertificateResponse, IssueNodeCertificateRequest,
    IssueNodeCertificateResponse, NodeCertificateStatusRequest, NodeCertificateStatusResponse,
};
use flotilla_store::{
    new_id, CertificateStatus, Filter, Kind, Node, NodeCertificate, NodeMembership, NodeRole,
    NodeSpec, NodeStatus, Object, Store, StoreEvent, WatchError,
};

use crate::error::{CaError, CaResult};
use crate::root::{CertIdentity, IssuedCert, RootCa};
use crate::token::JoinToken;

/// Pluggable signing backend. The local root signs in process; an
/// external CA implements this over whatever transport it speaks and is
/// installed with [`CaServer::with_signer`].
#[async_trait]
pub trait CertSigner: Send + Sync {
    async fn sign(&self, csr_pem: &str, identity: &CertIdentity) -> CaResult<IssuedCert>;
}

#[async_trait]
impl CertSigner for RootCa {
    async fn sign(&self, csr_pem: &str, identity: &CertIdentity) -> CaResult<IssuedCert> {
        self.sign_csr(csr_pem, identity)
    }
}

#[derive(Debug, Clone)]
pub struct CaServerConfig {
    /// Stamped into the O field of every issued certificate.
    pub cluster_id: String,
}

pub struct CaServer {
    store: Store,
    root: Arc<RootCa>,
    signer: Arc<dyn CertSigner>,
    config: CaServerConfig,
}

impl CaServer {
    pub fn new(store: Store, root: Arc<RootCa>, config: CaServerConfig) -> Self {
        Self {
            store,
            signer: Arc::clone(&root) as Arc<dyn CertSigner>,
            root,
            config,
        }
    }

    /// Replace the signing backend (external CA); the local root keeps
    /// serving verification and the trust anchor.
    pub fn with_signer(mut self, signer: Arc<dyn CertSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Signing loop: watch for pending certificates and sign them.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CaResult<()> {
        let mut events = self.store.watch_where(|e| e.kind() == Kind::Node);

        // Requests that arrived while no CA server ran.
        self.sign_pending().await?;
        info!("ca server started");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Ok(StoreEvent::Created(Object::Node(node)))
                    | Ok(StoreEvent::Updated(Object::Node(node))) => {
                        if wants_signature(&node) {
                            if let Err(err) = self.sign_node(&node).await {
                                warn!(node_id = %node.id, error = %err, "signing failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(WatchError::Lagged(n)) => {
                        warn!(missed = n, "ca server lagged; sweeping pending requests");
                        events = self.store.watch_where(|e| e.kind() == Kind::Node);
                        self.sign_pending().await?;
                    }
                    Err(WatchError::Closed) => return Ok(()),
                },
                _ = shutdown.changed() => {
                    info!("ca server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn sign_pending(&self) -> CaResult<()> {
        let pending: Vec<Node> = self.store.view(|tx| {
            tx.find::<Node>(&Filter::All)
                .into_iter()
                .filter(wants_signature)
                .collect()
        });
        for node in pending {
            if let Err(err) = self.sign_node(&node).await {
                warn!(node_id = %node.id, error = %err, "signing failed");
            }
        }
        Ok(())
    }

    /// Sign one node's CSR and write the result back.
    async fn sign_node(&self, node: &Node) -> CaResult<()> {
        let role = node.certificate.role.unwrap_or(node.role);
        let identity = CertIdentity {
            node_id: node.id.clone(),
            role,
            cluster_id: self.config.cluster_id.clone(),
        };

        let outcome = self
            .signer
            .sign(&node.certificate.csr_pem, &identity)
            .await;
        let node_id = node.id.clone();
        self.store
            .update(move |tx| {
                let Some(mut node) = tx.get::<Node>(&node_id) else {
                    return Ok(());
                };
                if !wants_signature(&node) {
                    return Ok(());
                }
                match &outcome {
                    Ok(issued) => {
                        node.certificate.status = CertificateStatus::Issued;
                        node.certificate.cert_pem = issued.cert_pem.clone();
                        node.role = role;
                    }
                    Err(err) => {
                        node.certificate.status = CertificateStatus::Rejected;
                        node.status.message = format!("certificate rejected: {err}");
                    }
                }
                tx.update(node)
            })
            .await?;
        Ok(())
    }

    /// Record an issuance request. Returns `(node_id, poll_token)`.
    pub async fn issue_node_certificate(
        &self,
        role: &str,
        csr_pem: &str,
        join_token: &str,
        renewal_node_id: &str,
    ) -> CaResult<(String, String)> {
        let role = parse_role(role)?;
        let poll_token = new_id();

        if !renewal_node_id.is_empty() {
            return self.record_renewal(renewal_node_id, csr_pem, &poll_token).await;
        }

        self.validate_join_token(role, join_token)?;

        let node_id = new_id();
        let node = Node {
            id: node_id.clone(),
            meta: Default::default(),
            role,
            spec: NodeSpec {
                membership: NodeMembership::Accepted,
                ..NodeSpec::default()
            },
            description: None,
            status: NodeStatus::default(),
            certificate: NodeCertificate {
                status: CertificateStatus::Pending,
                csr_pem: csr_pem.to_string(),
                cert_pem: String::new(),
                token: poll_token.clone(),
                role: Some(role),
            },
            manager: None,
        };
        self.store.update(|tx| tx.create(node)).await?;

        info!(%node_id, role = ?role, "certificate request recorded");
        Ok((node_id, poll_token))
    }

    /// Renewal: same CN/OU/O, fresh CSR, no join token needed because
    /// the caller already authenticated with its current certificate.
    async fn record_renewal(
        &self,
        node_id: &str,
        csr_pem: &str,
        poll_token: &str,
    ) -> CaResult<(String, String)> {
        let found = self.store.view(|tx| tx.get::<Node>(node_id));
        let Some(_) = found else {
            return Err(CaError::UnknownRequestToken);
        };

        let node_id = node_id.to_string();
        let csr = csr_pem.to_string();
        let token = poll_token.to_string();
        let update_id = node_id.clone();
        self.store
            .update(move |tx| {
                let Some(mut node) = tx.get::<Node>(&update_id) else {
                    return Ok(());
                };
                node.certificate.status = CertificateStatus::Renew;
                node.certificate.csr_pem = csr.clone();
                node.certificate.cert_pem = String::new();
                node.certificate.token = token.clone();
                tx.update(node)
            })
            .await?;

        info!(%node_id, "certificate renewal recorded");
        Ok((node_id, poll_token.to_string()))
    }

    /// Poll an issuance request by its token.
    pub fn certificate_status(
        &self,
        poll_token: &str,
    ) -> CaResult<(CertificateStatus, String, String)> {
        let node = self.store.view(|tx| {
            tx.find::<Node>(&Filter::All)
                .into_iter()
                .find(|n| !n.certificate.token.is_empty() && n.certificate.token == poll_token)
        });
        let node = node.ok_or(CaError::UnknownRequestToken)?;
        Ok((
            node.certificate.status,
            node.certificate.cert_pem,
            self.root.cert_pem().to_string(),
        ))
    }

    pub fn root_cert_pem(&self) -> &str {
        self.root.cert_pem()
    }

    fn validate_join_token(&self, role: NodeRole, join_token: &str) -> CaResult<()> {
        let token = JoinToken::parse(join_token)?;
        if !token.matches_ca(self.root.cert_pem()) {
            return Err(CaError::TokenRootMismatch);
        }

        let cluster = self
            .store
            .view(|tx| tx.cluster())
            .ok_or(CaError::InvalidToken)?;
        let expected = match role {
            NodeRole::Manager => cluster.root_ca.join_token_manager,
            NodeRole::Worker => cluster.root_ca.join_token_worker,
        };
        if expected != join_token {
            return Err(CaError::InvalidToken);
        }
        Ok(())
    }
}

/// Nodes the signing loop should act on.
fn wants_signature(node: &Node) -> bool {
    matches!(
        node.certificate.status,
        CertificateStatus::Pending | CertificateStatus::Renew
    ) && !node.certificate.csr_pem.is_empty()
}

fn parse_role(role: &str) -> CaResult<NodeRole> {
    match role {
        "manager" => Ok(NodeRole::Manager),
        "worker" => Ok(NodeRole::Worker),
        other => Err(CaError::InvalidRole(other.to_string())),
    }
}

// ── gRPC shim ─────────────────────────────────────────────────────

pub struct NodeCaGrpcServer {
    ca: Arc<CaServer>,
}

impl NodeCaGrpcServer {
    pub fn new(ca: Arc<CaServer>) -> Self {
        Self { ca }
    }

    pub fn into_service(self) -> NodeCaServer<Self> {
        NodeCaServer::new(self)
    }
}

fn status_of(err: CaError) -> Status {
    match &err {
        CaError::InvalidToken | CaError::TokenRootMismatch => {
            Status::permission_denied(err.to_string())
        }
        CaError::UnknownRequestToken => Status::not_found(err.to_string()),
        CaError::InvalidRole(_) => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl NodeCa for NodeCaGrpcServer {
    async fn issue_node_certificate(
        &self,
        request: Request<IssueNodeCertificateRequest>,
    ) -> Result<Response<IssueNodeCertificateResponse>, Status> {
        let req = request.into_inner();
        let (node_id, token) = self
            .ca
            .issue_node_certificate(&req.role, &req.csr_pem, &req.join_token, &req.node_id)
            .await
            .map_err(status_of)?;
        Ok(Response::new(IssueNodeCertificateResponse {
            node_id,
            token,
        }))
    }

    async fn node_certificate_status(
        &self,
        request: Request<NodeCertificateStatusRequest>,
    ) -> Result<Response<NodeCertificateStatusResponse>, Status> {
        let req = request.into_inner();
        let (state, cert_pem, root_ca_pem) = self
            .ca
            .certificate_status(&req.token)
            .map_err(status_of)?;

        let state = match state {
            CertificateStatus::Issued => "issued",
            CertificateStatus::Rejected => "rejected",
            _ => "pending",
        };
        Ok(Response::new(NodeCertificateStatusResponse {
            state: state.to_string(),
            cert_pem,
            root_ca_pem,
        }))
    }

    async fn get_root_ca_certificate(
        &self,
        _request: Request<GetRootCaCertificateRequest>,
    ) -> Result<Response<GetRootCaCertificateResponse>, Status> {
        Ok(Response::new(GetRootCaCertificateResponse {
            cert_pem: self.ca.root_cert_pem().to_string(),
        }))
    }
}
