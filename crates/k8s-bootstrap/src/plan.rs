//! Render every node's script collection without touching a host.
//!
//! Secrets are replaced by placeholders, so a plan is safe to print.

use crate::certs::ClusterCerts;
use crate::distro::{join_endpoint, ControlPlaneParams, Distro};
use crate::error::{BootstrapError, Result};
use crate::script::ScriptCollection;
use crate::state::{CloudResourceState, JoinSecrets, NodeRole};

/// Scripts one node would run, in order.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub role: NodeRole,
    pub index: usize,
    pub host: String,
    pub scripts: ScriptCollection,
}

fn placeholder_certs() -> ClusterCerts {
    ClusterCerts {
        ca_cert: "<etcd-ca.pem>".into(),
        etcd_cert: "<etcd.pem>".into(),
        etcd_key: "<etcd-key.pem>".into(),
    }
}

fn placeholder_join() -> JoinSecrets {
    JoinSecrets {
        bootstrap_token: Some("<bootstrap-token>".into()),
        certificate_key: Some("<certificate-key>".into()),
        ca_cert_hash: Some("<ca-cert-hash>".into()),
    }
}

/// Plan a full bootstrap of `resources` with `distro`.
///
/// # Errors
///
/// Returns [`BootstrapError::InvalidVersion`] or
/// [`BootstrapError::UnsupportedCni`] if the distro rejects the choices,
/// and [`BootstrapError::StateInconsistency`] for a malformed topology.
pub fn plan(
    resources: &CloudResourceState,
    distro: Distro,
    version: &str,
    cni: &str,
) -> Result<Vec<NodePlan>> {
    resources.validate()?;
    let strategy = distro.strategy();
    if !strategy.validate_version(version) {
        return Err(BootstrapError::InvalidVersion {
            distro,
            version: version.to_string(),
        });
    }
    let support = strategy.supported_cni(cni);
    if !support.valid {
        return Err(BootstrapError::UnsupportedCni {
            distro,
            name: cni.to_string(),
        });
    }

    let certs = placeholder_certs();
    let join = placeholder_join();
    let params = ControlPlaneParams {
        version,
        datastore_private_ips: &resources.private_ips.data_stores,
        public_address: &resources.public_ips.load_balancer,
        private_address: &resources.private_ips.load_balancer,
        external_cni: !support.is_default,
        join: &join,
    };

    let cp_count = resources.public_ips.control_planes.len();
    let mut plans = Vec::new();
    for (index, host) in resources.public_ips.control_planes.iter().enumerate() {
        let mut scripts = strategy.etcd_cert_transfer_script(&certs);
        if index == 0 {
            scripts.extend(strategy.control_plane0_script(&params)?);
            scripts.extend(strategy.join_secret_script());
        } else {
            scripts.extend(strategy.control_plane_n_script(&params)?);
        }
        if index + 1 == cp_count {
            scripts.extend(strategy.kubeconfig_script());
        }
        plans.push(NodePlan {
            role: NodeRole::ControlPlane,
            index,
            host: host.clone(),
            scripts,
        });
    }

    let server = join_endpoint(
        &resources.public_ips.load_balancer,
        &resources.private_ips.load_balancer,
    );
    for (index, host) in resources.public_ips.worker_planes.iter().enumerate() {
        plans.push(NodePlan {
            role: NodeRole::WorkerPlane,
            index,
            host: host.clone(),
            scripts: strategy.worker_join_script(version, server, &join)?,
        });
    }
    Ok(plans)
}
