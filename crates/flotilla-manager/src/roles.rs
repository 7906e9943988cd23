//! Peer identity extraction and role gating.
//!
//! The TLS layer hands us the peer's certificate chain; the subject CN
//! is the node id, OU the role, O the cluster. A handler declares the
//! role it requires and rejects peers outside the policy. Connections
//! without client certificates (plaintext dev clusters) carry no
//! identity and only pass `RequiredRole::Any` gates.

use tonic::{Request, Status};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use flotilla_store::NodeRole;

/// Role policy for an RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredRole {
    Manager,
    Worker,
    Any,
}

/// Identity carried by a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node_id: String,
    pub role: NodeRole,
    pub cluster_id: String,
}

/// Extract the identity from the request's peer certificates, if any.
pub fn identity_from_request<T>(request: &Request<T>) -> Option<Identity> {
    let certs = request.peer_certs()?;
    let leaf = certs.first()?;
    identity_from_der(leaf.as_ref())
}

/// Parse an identity out of a DER certificate.
pub fn identity_from_der(der: &[u8]) -> Option<Identity> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let subject = cert.subject();

    let node_id = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())?
        .to_string();
    let ou = subject
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .unwrap_or_default();
    let cluster_id = subject
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let role = if ou == flotilla_ca::MANAGER_OU {
        NodeRole::Manager
    } else if ou == flotilla_ca::WORKER_OU {
        NodeRole::Worker
    } else {
        return None;
    };

    Some(Identity {
        node_id,
        role,
        cluster_id,
    })
}

/// Gate a request on the required role.
///
/// Managers satisfy worker-level gates (a manager may do anything a
/// worker may); workers never satisfy manager gates.
pub fn authorize<T>(request: &Request<T>, required: RequiredRole) -> Result<Option<Identity>, Status> {
    let identity = identity_from_request(request);
    match (required, &identity) {
        (RequiredRole::Any, _) => Ok(identity),
        (_, None) => Err(Status::unauthenticated(
            "client certificate with a cluster role is required",
        )),
        (RequiredRole::Manager, Some(id)) if id.role == NodeRole::Manager => Ok(identity),
        (RequiredRole::Worker, Some(_)) => Ok(identity),
        (RequiredRole::Manager, Some(id)) => Err(Status::permission_denied(format!(
            "method requires a manager certificate; peer {} is a {}",
            id.node_id,
            id.role.as_str()
        ))),
    }
}
