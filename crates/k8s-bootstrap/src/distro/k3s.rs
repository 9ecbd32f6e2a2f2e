//! k3s strategy.
//!
//! Control planes point k3s straight at the external etcd with
//! `--datastore-endpoint`. Control plane 0 needs no token; the server token
//! it generates is read back and used by every later node.

use tracing::debug;

use super::{
    etcd_cert_script, etcd_endpoints, numeric_version, require, single_value, BootstrapStrategy,
    CniPlugin, CniSupport, ControlPlaneParams, Distro, K8S_API_PORT,
};
use crate::certs::ClusterCerts;
use crate::error::Result;
use crate::script::{Script, ScriptCollection};
use crate::state::JoinSecrets;

/// Directory the datastore PKI is written to.
pub const ETCD_CERT_DIR: &str = "/var/lib/etcd";

/// Oldest supported minor release.
const MIN_MINOR: u32 = 25;

const CONTROL_PLANE_RETRIES: u32 = 9;
const WORKER_RETRIES: u32 = 3;

const TOKEN_STEP: &str = "Get k3s server token";

/// k3s with an external etcd datastore.
#[derive(Debug, Clone, Copy, Default)]
pub struct K3s;

impl K3s {
    fn install_env(version: &str) -> String {
        format!("INSTALL_K3S_CHANNEL=\"{version}\"")
    }

    fn server_flags(params: &ControlPlaneParams<'_>) -> String {
        let mut flags = vec![
            format!(
                "--datastore-endpoint \"{}\"",
                etcd_endpoints(params.datastore_private_ips)
            ),
            format!("--datastore-cafile={ETCD_CERT_DIR}/ca.pem"),
            format!("--datastore-keyfile={ETCD_CERT_DIR}/etcd-key.pem"),
            format!("--datastore-certfile={ETCD_CERT_DIR}/etcd.pem"),
            "--node-taint CriticalAddonsOnly=true:NoExecute".to_string(),
        ];
        if params.external_cni {
            flags.push("--flannel-backend=none".to_string());
            flags.push("--disable-network-policy".to_string());
        }
        flags.push(format!("--tls-san {}", params.public_address));
        if !params.private_address.is_empty() && params.private_address != params.public_address {
            flags.push(format!("--tls-san {}", params.private_address));
        }
        flags.join(" \\\n    ")
    }

    fn server_script(name: String, file: &str, version: &str, args: &str) -> Script {
        Script::new(
            name,
            format!(
                r"
cat <<EOF > {file}
#!/bin/bash
curl -sfL https://get.k3s.io | {env} sh -s - server \
    {args}
EOF

sudo chmod +x {file}
sudo ./{file}
",
                env = Self::install_env(version),
            ),
        )
        .with_retries(CONTROL_PLANE_RETRIES)
    }

    fn cni_label(params: &ControlPlaneParams<'_>) -> &'static str {
        if params.external_cni {
            "without CNI"
        } else {
            "with CNI"
        }
    }
}

impl BootstrapStrategy for K3s {
    fn distro(&self) -> Distro {
        Distro::K3s
    }

    /// Accepts `1.<minor>.<patch>` with `minor >= 25` and `patch >= 1`.
    fn validate_version(&self, version: &str) -> bool {
        match numeric_version(version, 3).as_deref() {
            Some([1, minor, patch]) => *minor >= MIN_MINOR && *patch >= 1,
            _ => false,
        }
    }

    fn supported_cni(&self, name: &str) -> CniSupport {
        match CniPlugin::parse(name) {
            Some(CniPlugin::Flannel) => CniSupport::DEFAULT,
            Some(CniPlugin::Cilium | CniPlugin::None) => CniSupport::ALTERNATIVE,
            None => CniSupport::INVALID,
        }
    }

    fn prepare_join_secrets(&self, _join: &mut JoinSecrets) -> Result<bool> {
        Ok(false)
    }

    fn etcd_cert_transfer_script(&self, certs: &ClusterCerts) -> ScriptCollection {
        ScriptCollection::new().with(etcd_cert_script(
            "Database Certificates",
            ETCD_CERT_DIR,
            certs,
        ))
    }

    fn control_plane0_script(&self, params: &ControlPlaneParams<'_>) -> Result<ScriptCollection> {
        let name = format!("Start K3s Controlplane-[0] {}", Self::cni_label(params));
        let script = Self::server_script(
            name,
            "control-setup.sh",
            params.version,
            &Self::server_flags(params),
        );
        Ok(ScriptCollection::new().with(script))
    }

    fn control_plane_n_script(
        &self,
        params: &ControlPlaneParams<'_>,
    ) -> Result<ScriptCollection> {
        let token = require(params.join.bootstrap_token.as_ref(), "k3s server token")?;
        let name = format!("Start K3s Controlplane-[1..N] {}", Self::cni_label(params));
        let args = format!("--token {token} \\\n    {}", Self::server_flags(params));
        let script = Self::server_script(name, "control-setupN.sh", params.version, &args);
        Ok(ScriptCollection::new().with(script))
    }

    fn join_secret_script(&self) -> ScriptCollection {
        ScriptCollection::new().with(Script::new(
            TOKEN_STEP,
            "\nsudo cat /var/lib/rancher/k3s/server/token\n",
        ))
    }

    fn capture_join_secret(&self, join: &mut JoinSecrets, output: &str) -> Result<()> {
        let token = single_value(TOKEN_STEP, output)?;
        debug!("captured k3s server token");
        join.bootstrap_token = Some(token);
        Ok(())
    }

    fn worker_join_script(
        &self,
        version: &str,
        server_address: &str,
        join: &JoinSecrets,
    ) -> Result<ScriptCollection> {
        let token = require(join.bootstrap_token.as_ref(), "k3s server token")?;
        let script = Script::new(
            "Join the workerplane-[0..M]",
            format!(
                r"
cat <<EOF > worker-setup.sh
#!/bin/bash
curl -sfL https://get.k3s.io | {env} sh -s - agent --token {token} --server https://{server_address}:{K8S_API_PORT}
EOF

sudo chmod +x worker-setup.sh
sudo ./worker-setup.sh
",
                env = Self::install_env(version),
            ),
        )
        .with_retries(WORKER_RETRIES);
        Ok(ScriptCollection::new().with(script))
    }

    fn kubeconfig_script(&self) -> ScriptCollection {
        ScriptCollection::new().with(Script::new(
            "k3s kubeconfig",
            "\nsudo cat /etc/rancher/k3s/k3s.yaml\n",
        ))
    }
}
