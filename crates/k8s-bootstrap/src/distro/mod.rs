//! Kubernetes distro bootstrap strategies.
//!
//! Each distro turns the cluster topology and its secrets into the ordered
//! [`ScriptCollection`]s run on control planes and workers. The
//! [`crate::Bootstrapper`] picks one strategy at construction and drives it.

mod k3s;
mod kubeadm;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use k3s::K3s;
pub use kubeadm::Kubeadm;

use crate::certs::ClusterCerts;
use crate::error::{BootstrapError, Result};
use crate::script::{Script, ScriptCollection};
use crate::state::JoinSecrets;

/// Default Kubernetes API port.
pub const K8S_API_PORT: u16 = 6443;

/// Default etcd client port.
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Supported distros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    /// Lightweight k3s, talking to the external datastore directly.
    K3s,
    /// Upstream kubeadm with an external etcd.
    Kubeadm,
}

impl Distro {
    /// Build the strategy for this distro.
    #[must_use]
    pub fn strategy(self) -> Box<dyn BootstrapStrategy> {
        match self {
            Self::K3s => Box::new(K3s),
            Self::Kubeadm => Box::new(Kubeadm),
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::K3s => write!(f, "k3s"),
            Self::Kubeadm => write!(f, "kubeadm"),
        }
    }
}

impl FromStr for Distro {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "k3s" => Ok(Self::K3s),
            "kubeadm" => Ok(Self::Kubeadm),
            other => Err(BootstrapError::Config(format!("unknown distro '{other}'"))),
        }
    }
}

/// CNI plugins known to at least one distro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniPlugin {
    Flannel,
    Cilium,
    /// No overlay; networking is left to the operator.
    None,
}

impl CniPlugin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flannel => "flannel",
            Self::Cilium => "cilium",
            Self::None => "none",
        }
    }

    /// Parse a plugin name. Unknown and empty names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "flannel" => Some(Self::Flannel),
            "cilium" => Some(Self::Cilium),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for CniPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to "does this distro support that CNI plugin".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CniSupport {
    /// The plugin is recognized.
    pub valid: bool,
    /// The plugin is the one the distro ships wired in.
    pub is_default: bool,
}

impl CniSupport {
    pub const INVALID: Self = Self {
        valid: false,
        is_default: false,
    };
    pub const DEFAULT: Self = Self {
        valid: true,
        is_default: true,
    };
    pub const ALTERNATIVE: Self = Self {
        valid: true,
        is_default: false,
    };
}

/// Inputs for a control-plane script.
#[derive(Debug, Clone, Copy)]
pub struct ControlPlaneParams<'a> {
    /// Validated distro version.
    pub version: &'a str,
    /// Datastore private addresses, in order.
    pub datastore_private_ips: &'a [String],
    /// Public API endpoint (load balancer), added to the serving cert.
    pub public_address: &'a str,
    /// Private API endpoint (load balancer) used by joining nodes.
    pub private_address: &'a str,
    /// Whether the bundled CNI must be disabled for an external one.
    pub external_cni: bool,
    /// Join material captured or generated so far.
    pub join: &'a JoinSecrets,
}

impl ControlPlaneParams<'_> {
    /// Endpoint joining control planes talk to.
    #[must_use]
    pub fn join_address(&self) -> &str {
        join_endpoint(self.public_address, self.private_address)
    }
}

/// The private load balancer address, or the public one when no private
/// address is configured.
#[must_use]
pub fn join_endpoint<'a>(public: &'a str, private: &'a str) -> &'a str {
    if private.is_empty() {
        public
    } else {
        private
    }
}

/// Script generation for one distro.
pub trait BootstrapStrategy: Send + Sync {
    /// Distro implemented by this strategy.
    fn distro(&self) -> Distro;

    /// Whether `version` is acceptable. Pure; never coerces.
    fn validate_version(&self, version: &str) -> bool;

    /// Classify a CNI plugin name.
    fn supported_cni(&self, name: &str) -> CniSupport;

    /// Fill in join secrets that must exist before control plane 0 runs.
    /// Existing values are kept. Returns whether anything was generated.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::TokenGen`] if the RNG fails.
    fn prepare_join_secrets(&self, join: &mut JoinSecrets) -> Result<bool>;

    /// Write the datastore CA, peer cert and key to the node.
    fn etcd_cert_transfer_script(&self, certs: &ClusterCerts) -> ScriptCollection;

    /// Bring up the first control plane against the external datastore.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::OutOfOrder`] if required join secrets are
    /// missing.
    fn control_plane0_script(&self, params: &ControlPlaneParams<'_>) -> Result<ScriptCollection>;

    /// Join a further control plane using secrets from control plane 0.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::OutOfOrder`] if join secrets are missing.
    fn control_plane_n_script(&self, params: &ControlPlaneParams<'_>)
        -> Result<ScriptCollection>;

    /// Run on control plane 0 after init; its last step prints the join
    /// material that [`Self::capture_join_secret`] records.
    fn join_secret_script(&self) -> ScriptCollection;

    /// Record the output of [`Self::join_secret_script`].
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::UnexpectedOutput`] if the output is unusable.
    fn capture_join_secret(&self, join: &mut JoinSecrets, output: &str) -> Result<()>;

    /// Join a worker through `server_address`.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::OutOfOrder`] if join secrets are missing.
    fn worker_join_script(
        &self,
        version: &str,
        server_address: &str,
        join: &JoinSecrets,
    ) -> Result<ScriptCollection>;

    /// Print the admin kubeconfig of a control plane.
    fn kubeconfig_script(&self) -> ScriptCollection;
}

/// `https://<ip>:2379` for every datastore address, in order.
pub fn etcd_endpoint_urls(ips: &[String]) -> impl Iterator<Item = String> + '_ {
    ips.iter()
        .map(|ip| format!("https://{ip}:{ETCD_CLIENT_PORT}"))
}

/// Comma-joined etcd endpoints. Empty input yields an empty string.
#[must_use]
pub fn etcd_endpoints(ips: &[String]) -> String {
    etcd_endpoint_urls(ips).collect::<Vec<_>>().join(",")
}

/// Parse `major.minor[.patch]` with exactly `parts` numeric components.
fn numeric_version(version: &str, parts: usize) -> Option<Vec<u32>> {
    let fields: Vec<&str> = version.split('.').collect();
    if fields.len() != parts {
        return None;
    }
    fields
        .iter()
        .map(|f| {
            if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                f.parse().ok()
            }
        })
        .collect()
}

/// Step that writes the datastore PKI into `dir` on the node.
fn etcd_cert_script(name: &str, dir: &str, certs: &ClusterCerts) -> Script {
    Script::new(
        name,
        format!(
            r"
sudo mkdir -vp {dir}

cat <<EOF > ca.pem
{ca}
EOF

cat <<EOF > etcd.pem
{cert}
EOF

cat <<EOF > etcd-key.pem
{key}
EOF

sudo mv -v ca.pem etcd.pem etcd-key.pem {dir}
",
            ca = certs.ca_cert.trim_end(),
            cert = certs.etcd_cert.trim_end(),
            key = certs.etcd_key.trim_end(),
        ),
    )
}

fn require<'a>(value: Option<&'a String>, what: &str) -> Result<&'a str> {
    value.map(String::as_str).ok_or_else(|| BootstrapError::OutOfOrder {
        operation: "script generation",
        reason: format!("{what} is not available yet"),
    })
}

/// Trimmed single-token output of a fetch step.
fn single_value(step: &str, output: &str) -> Result<String> {
    let value = output.trim();
    if value.is_empty() {
        return Err(BootstrapError::UnexpectedOutput {
            step: step.to_string(),
            reason: "empty output".into(),
        });
    }
    if value.split_whitespace().nth(1).is_some() {
        return Err(BootstrapError::UnexpectedOutput {
            step: step.to_string(),
            reason: "expected a single value".into(),
        });
    }
    Ok(value.to_string())
}
