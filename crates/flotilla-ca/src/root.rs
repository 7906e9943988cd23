//! Root CA material and CSR signing.
//!
//! The CA never trusts the DN inside a CSR: it stamps the subject from
//! the validated identity (node id, role, cluster id), so a node cannot
//! request someone else's name.

use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;
use x509_parser::pem::parse_x509_pem;

use flotilla_store::NodeRole;

use crate::error::{CaError, CaResult};
use crate::{MANAGER_OU, WORKER_OU};

/// Default lifetime of issued node certificates: 90 days.
const DEFAULT_CERT_LIFETIME_SECS: u64 = 90 * 24 * 3600;

/// Validity backdating to absorb clock skew between nodes.
const NOT_BEFORE_SKEW_SECS: i64 = 300;

/// The identity stamped into an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    pub node_id: String,
    pub role: NodeRole,
    pub cluster_id: String,
}

impl CertIdentity {
    pub fn ou(&self) -> &'static str {
        match self.role {
            NodeRole::Manager => MANAGER_OU,
            NodeRole::Worker => WORKER_OU,
        }
    }
}

/// A freshly issued certificate.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
}

/// A node's private key and CSR, generated worker-side.
#[derive(Debug, Clone)]
pub struct NodeKeyMaterial {
    pub key_pem: String,
    pub csr_pem: String,
}

/// Root certificate plus (optionally) its signing key.
pub struct RootCa {
    cert_pem: String,
    key_pem: Option<String>,
    cert_lifetime_secs: u64,
}

impl RootCa {
    /// Generate a fresh self-signed root for a new cluster.
    pub fn generate(cluster_name: &str) -> CaResult<Self> {
        let mut params = ca_params(cluster_name);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(1);
        params.not_after = now + TimeDuration::days(10 * 365);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        info!(cluster = cluster_name, "generated cluster root CA");

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: Some(key.serialize_pem()),
            cert_lifetime_secs: DEFAULT_CERT_LIFETIME_SECS,
        })
    }

    /// Reconstruct from persisted material. `key_pem` is absent on
    /// members that only verify (or when an external CA signs).
    pub fn from_pem(cert_pem: String, key_pem: Option<String>) -> Self {
        Self {
            cert_pem,
            key_pem,
            cert_lifetime_secs: DEFAULT_CERT_LIFETIME_SECS,
        }
    }

    pub fn with_cert_lifetime_secs(mut self, secs: u64) -> Self {
        self.cert_lifetime_secs = secs;
        self
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> Option<&str> {
        self.key_pem.as_deref()
    }

    /// Whether this instance can sign (has the private key).
    pub fn can_sign(&self) -> bool {
        self.key_pem.is_some()
    }

    /// Sign a CSR, stamping the subject from `identity`.
    pub fn sign_csr(&self, csr_pem: &str, identity: &CertIdentity) -> CaResult<IssuedCert> {
        let key_pem = self
            .key_pem
            .as_deref()
            .ok_or_else(|| CaError::KeyUnavailable("root key not loaded".into()))?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.node_id.as_str());
        dn.push(DnType::OrganizationalUnitName, identity.ou());
        dn.push(DnType::OrganizationName, identity.cluster_id.as_str());
        csr.params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - TimeDuration::seconds(NOT_BEFORE_SKEW_SECS);
        csr.params.not_after =
            now + TimeDuration::seconds(self.cert_lifetime_secs as i64);
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let ca_key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, ca_key)?;
        let cert = csr.signed_by(&issuer)?;

        info!(node_id = %identity.node_id, role = identity.ou(), "certificate issued");
        Ok(IssuedCert {
            cert_pem: cert.pem(),
        })
    }

    /// Verify that a PEM certificate was signed by this root.
    pub fn verify(&self, cert_pem: &str) -> CaResult<()> {
        let (_, ca_pem) =
            parse_x509_pem(self.cert_pem.as_bytes()).map_err(|e| CaError::Parse(e.to_string()))?;
        let ca = ca_pem
            .parse_x509()
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let (_, leaf_pem) =
            parse_x509_pem(cert_pem.as_bytes()).map_err(|e| CaError::Parse(e.to_string()))?;
        let leaf = leaf_pem
            .parse_x509()
            .map_err(|e| CaError::Parse(e.to_string()))?;

        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| CaError::Parse(format!("signature verification failed: {e}")))
    }
}

/// Generate a node's private key and CSR. The DN here is advisory; the
/// CA overwrites it at signing time.
pub fn generate_key_and_csr(node_id: &str) -> CaResult<NodeKeyMaterial> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, node_id);
    params.distinguished_name = dn;
    if let Ok(san) = node_id.try_into() {
        params.subject_alt_names = vec![SanType::DnsName(san)];
    }

    let key = KeyPair::generate()?;
    let csr = params.serialize_request(&key)?;
    Ok(NodeKeyMaterial {
        key_pem: key.serialize_pem(),
        csr_pem: csr.pem()?,
    })
}

/// Identity parsed out of an issued certificate.
pub fn parse_identity(cert_pem: &str) -> CaResult<CertIdentity> {
    let (_, pem) =
        parse_x509_pem(cert_pem.as_bytes()).map_err(|e| CaError::Parse(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| CaError::Parse(e.to_string()))?;
    let subject = cert.subject();

    let node_id = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| CaError::Parse("certificate has no CN".into()))?
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

    let role = match ou {
        _ if ou == MANAGER_OU => NodeRole::Manager,
        _ if ou == WORKER_OU => NodeRole::Worker,
        other => return Err(CaError::InvalidRole(other.to_string())),
    };

    Ok(CertIdentity {
        node_id,
        role,
        cluster_id,
    })
}

/// Fraction of the certificate's validity that remains, in `[0, 1]`.
pub fn remaining_lifetime_fraction(cert_pem: &str) -> CaResult<f64> {
    let (_, pem) =
        parse_x509_pem(cert_pem.as_bytes()).map_err(|e| CaError::Parse(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| CaError::Parse(e.to_string()))?;

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let total = (not_after - not_before).max(1);
    let remaining = (not_after - now).max(0);
    Ok(remaining as f64 / total as f64)
}

fn ca_params(cluster_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{cluster_name} root CA"));
    dn.push(DnType::OrganizationName, cluster_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(node_id: &str, role: NodeRole) -> CertIdentity {
        CertIdentity {
            node_id: node_id.into(),
            role,
            cluster_id: "cluster-1".into(),
        }
    }

    #[test]
    fn generated_root_can_sign_and_verify() {
        let ca = RootCa::generate("testcluster").unwrap();
        assert!(ca.can_sign());
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));

        let material = generate_key_and_csr("node-1").unwrap();
        let issued = ca
            .sign_csr(&material.csr_pem, &identity("node-1", NodeRole::Worker))
            .unwrap();

        ca.verify(&issued.cert_pem).unwrap();
    }

    #[test]
    fn issued_identity_is_stamped_not_requested() {
        let ca = RootCa::generate("testcluster").unwrap();
        // The CSR claims to be "imposter"; the CA stamps the validated id.
        let material = generate_key_and_csr("imposter").unwrap();
        let issued = ca
            .sign_csr(&material.csr_pem, &identity("node-7", NodeRole::Manager))
            .unwrap();

        let parsed = parse_identity(&issued.cert_pem).unwrap();
        assert_eq!(parsed.node_id, "node-7");
        assert_eq!(parsed.role, NodeRole::Manager);
        assert_eq!(parsed.cluster_id, "cluster-1");
    }

    #[test]
    fn verify_rejects_foreign_certificates() {
        let ca = RootCa::generate("cluster-a").unwrap();
        let other = RootCa::generate("cluster-b").unwrap();

        let material = generate_key_and_csr("node-1").unwrap();
        let foreign = other
            .sign_csr(&material.csr_pem, &identity("node-1", NodeRole::Worker))
            .unwrap();

        assert!(ca.verify(&foreign.cert_pem).is_err());
    }

    #[test]
    fn cert_without_key_cannot_sign() {
        let ca = RootCa::generate("testcluster").unwrap();
        let verify_only = RootCa::from_pem(ca.cert_pem().to_string(), None);
        assert!(!verify_only.can_sign());

        let material = generate_key_and_csr("node-1").unwrap();
        let err = verify_only
            .sign_csr(&material.csr_pem, &identity("node-1", NodeRole::Worker))
            .unwrap_err();
        assert!(matches!(err, CaError::KeyUnavailable(_)));
    }

    #[test]
    fn fresh_cert_has_nearly_full_lifetime() {
        let ca = RootCa::generate("testcluster").unwrap();
        let material = generate_key_and_csr("node-1").unwrap();
        let issued = ca
            .sign_csr(&material.csr_pem, &identity("node-1", NodeRole::Worker))
            .unwrap();

        let fraction = remaining_lifetime_fraction(&issued.cert_pem).unwrap();
        assert!(fraction > 0.95, "fraction was {fraction}");
    }

    #[test]
    fn short_lifetime_is_honored() {
        let ca = RootCa::generate("testcluster")
            .unwrap()
            .with_cert_lifetime_secs(3600);
        let material = generate_key_and_csr("node-1").unwrap();
        let issued = ca
            .sign_csr(&material.csr_pem, &identity("node-1", NodeRole::Worker))
            .unwrap();

        // 5-minute skew over a 1h-and-skew window: most but not all left.
        let fraction = remaining_lifetime_fraction(&issued.cert_pem).unwrap();
        assert!(fraction > 0.8 && fraction <= 1.0, "fraction was {fraction}");
    }

    #[test]
    fn certificate_without_role_ou_is_rejected() {
        // A CA certificate carries no role OU, so it has no node identity.
        let ca = RootCa::generate("testcluster").unwrap();
        let err = parse_identity(ca.cert_pem()).unwrap_err();
        assert!(matches!(err, CaError::InvalidRole(_)));
    }
}
