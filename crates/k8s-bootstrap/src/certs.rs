//! Cluster PKI and join secrets.
//!
//! Generates the etcd CA and the peer certificate every control plane uses
//! to reach the external datastore, plus the kubeadm-style bootstrap token
//! and certificate key. Key material always comes from the OS RNG.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime};

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, Result};

/// Validity of the etcd CA.
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Validity of the etcd peer certificate.
pub const PEER_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const CERTIFICATE_KEY_BYTES: usize = 32;

/// PEM-encoded etcd CA plus peer certificate and key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCerts {
    /// CA certificate.
    pub ca_cert: String,
    /// Peer certificate signed by the CA.
    pub etcd_cert: String,
    /// Peer private key.
    pub etcd_key: String,
}

impl fmt::Debug for ClusterCerts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCerts")
            .field("ca_cert", &self.ca_cert)
            .field("etcd_cert", &self.etcd_cert)
            .field("etcd_key", &"<redacted>")
            .finish()
    }
}

fn validity(lifetime: Duration) -> (SystemTime, SystemTime) {
    let now = SystemTime::now();
    (now, now + lifetime)
}

fn cert_err(what: &str) -> impl FnOnce(rcgen::Error) -> BootstrapError + '_ {
    move |e| BootstrapError::CertGen(format!("{what}: {e}"))
}

/// SAN for one datastore address: an IP, or a DNS name for a hostname.
fn datastore_san(raw: &str) -> Result<SanType> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let is_hostname = !raw.is_empty()
        && raw.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !is_hostname {
        return Err(BootstrapError::CertGen(format!(
            "datastore address '{raw}' is neither an IP address nor a hostname"
        )));
    }
    let name = raw.try_into().map_err(cert_err("datastore DNS name"))?;
    Ok(SanType::DnsName(name))
}

/// Generate the etcd CA and a peer certificate valid for `datastore_ips`.
///
/// The peer certificate's SAN set is exactly the datastore addresses plus
/// `127.0.0.1`. Addresses that are hostnames become DNS names. Nothing is
/// returned unless every artifact was produced.
///
/// # Errors
///
/// Returns [`BootstrapError::CertGen`] if an address is malformed, or if
/// key generation or signing fails.
pub fn generate_cluster_certs(datastore_ips: &[String]) -> Result<ClusterCerts> {
    let mut sans = Vec::with_capacity(datastore_ips.len() + 1);
    for raw in datastore_ips {
        let san = datastore_san(raw)?;
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    let loopback = SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST));
    if !sans.contains(&loopback) {
        sans.push(loopback);
    }

    let mut ca_params =
        CertificateParams::new(Vec::<String>::new()).map_err(cert_err("CA params"))?;
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "etcd-ca");
    ca_dn.push(DnType::OrganizationName, "k8s-bootstrap");
    ca_params.distinguished_name = ca_dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = validity(CA_VALIDITY);
    ca_params.not_before = not_before.into();
    ca_params.not_after = not_after.into();

    let ca_key = KeyPair::generate().map_err(cert_err("CA key"))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(cert_err("CA self-sign"))?;

    let mut peer_params =
        CertificateParams::new(Vec::<String>::new()).map_err(cert_err("peer params"))?;
    let mut peer_dn = DistinguishedName::new();
    peer_dn.push(DnType::CommonName, "etcd");
    peer_dn.push(DnType::OrganizationName, "k8s-bootstrap");
    peer_params.distinguished_name = peer_dn;
    peer_params.subject_alt_names = sans;
    peer_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    peer_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let (not_before, not_after) = validity(PEER_VALIDITY);
    peer_params.not_before = not_before.into();
    peer_params.not_after = not_after.into();

    let peer_key = KeyPair::generate().map_err(cert_err("peer key"))?;
    let peer_cert = peer_params
        .signed_by(&peer_key, &ca_cert, &ca_key)
        .map_err(cert_err("peer signing"))?;

    Ok(ClusterCerts {
        ca_cert: ca_cert.pem(),
        etcd_cert: peer_cert.pem(),
        etcd_key: peer_key.serialize_pem(),
    })
}

/// Draw `len` characters uniformly from [`TOKEN_ALPHABET`].
fn random_token_chars(len: usize) -> Result<String> {
    // Largest multiple of the alphabet size that fits in a byte; bytes at
    // or above it are discarded so every character is equally likely.
    let limit = u8::try_from(256 - 256 % TOKEN_ALPHABET.len())
        .map_err(|e| BootstrapError::TokenGen(e.to_string()))?;

    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while out.len() < len {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| BootstrapError::TokenGen(e.to_string()))?;
        for &b in buf.iter().filter(|&&b| b < limit) {
            if out.len() == len {
                break;
            }
            out.push(char::from(TOKEN_ALPHABET[usize::from(b) % TOKEN_ALPHABET.len()]));
        }
    }
    Ok(out)
}

/// Generate a bootstrap token of the form `[a-z0-9]{6}.[a-z0-9]{16}`.
///
/// # Errors
///
/// Returns [`BootstrapError::TokenGen`] if the OS RNG fails.
pub fn generate_bootstrap_token() -> Result<String> {
    let id = random_token_chars(TOKEN_ID_LEN)?;
    let secret = random_token_chars(TOKEN_SECRET_LEN)?;
    Ok(format!("{id}.{secret}"))
}

/// Generate a 256-bit certificate key, hex encoded.
///
/// Used by kubeadm to encrypt the control-plane certificates it uploads
/// for joining control planes.
///
/// # Errors
///
/// Returns [`BootstrapError::TokenGen`] if the OS RNG fails.
pub fn generate_certificate_key() -> Result<String> {
    let mut key = [0u8; CERTIFICATE_KEY_BYTES];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| BootstrapError::TokenGen(e.to_string()))?;
    Ok(hex::encode(key))
}
