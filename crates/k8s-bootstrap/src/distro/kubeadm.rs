//! kubeadm strategy.
//!
//! Every node first gets containerd and the kubeadm toolchain. Control
//! plane 0 runs `kubeadm init` from an `InitConfiguration` that points at
//! the external etcd and carries a pre-generated bootstrap token and
//! certificate key; later control planes and workers `kubeadm join`
//! through the load balancer.

use tracing::debug;

use super::{
    etcd_cert_script, etcd_endpoint_urls, numeric_version, require, single_value,
    BootstrapStrategy, CniPlugin, CniSupport, ControlPlaneParams, Distro, K8S_API_PORT,
};
use crate::certs::{generate_bootstrap_token, generate_certificate_key, ClusterCerts};
use crate::error::{BootstrapError, Result};
use crate::script::{Script, ScriptCollection};
use crate::state::JoinSecrets;

/// Directory the datastore PKI is written to.
pub const ETCD_CERT_DIR: &str = "/etcd/kubernetes/pki/etcd";

/// Oldest supported minor release.
const MIN_MINOR: u32 = 26;

const CA_HASH_STEP: &str = "fetch discovery token ca cert hash";

/// Upstream kubeadm with an external etcd.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kubeadm;

impl Kubeadm {
    /// Kernel prerequisites, containerd and the pinned kubeadm toolchain.
    fn install_tools(version: &str) -> ScriptCollection {
        ScriptCollection::new()
            .with(Script::new(
                "disable swap and some kernel module adjustments",
                r"
sudo sed -i '/ swap / s/^\(.*\)$/#\1/g' /etc/fstab
sudo swapoff -a

cat <<EOF | sudo tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF

sudo modprobe overlay
sudo modprobe br_netfilter

cat <<EOF | sudo tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF

sudo sysctl --system
",
            ))
            .with(
                Script::new(
                    "install containerd",
                    r#"
sudo apt-get update
sudo apt-get install -y ca-certificates curl gnupg

sudo install -m 0755 -d /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo gpg --dearmor --yes -o /etc/apt/keyrings/docker.gpg
sudo chmod a+r /etc/apt/keyrings/docker.gpg

echo \
  "deb [arch="$(dpkg --print-architecture)" signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu \
  "$(. /etc/os-release && echo "$VERSION_CODENAME")" stable" | \
  sudo tee /etc/apt/sources.list.d/docker.list > /dev/null

sudo apt-get update
sudo apt-get install containerd.io -y
"#,
                )
                .with_retries(3),
            )
            .with(Script::new(
                "containerd config",
                r"
sudo mkdir -p /etc/containerd
containerd config default > config.toml
sudo mv -v config.toml /etc/containerd/config.toml
",
            ))
            .with(
                Script::new(
                    "restart containerd systemd",
                    r"
sudo sed -i 's/SystemdCgroup \= false/SystemdCgroup \= true/g' /etc/containerd/config.toml
sudo systemctl restart containerd
sudo systemctl enable containerd
",
                )
                .with_retries(3),
            )
            .with(
                Script::new(
                    "install kubeadm, kubectl, kubelet",
                    format!(
                        r"
sudo apt-get update -y
sudo apt-get install -y apt-transport-https ca-certificates curl gpg

curl -fsSL https://pkgs.k8s.io/core:/stable:/v{version}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg

echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{version}/deb/ /' | sudo tee /etc/apt/sources.list.d/kubernetes.list

sudo apt-get update
sudo apt-get install -y kubelet kubeadm kubectl
sudo systemctl enable kubelet
"
                    ),
                )
                .with_retries(9),
            )
            .with(Script::new(
                "apt mark kubernetes tool as hold",
                "\nsudo apt-mark hold kubelet kubeadm kubectl\n",
            ))
    }

    /// `endpoints:` list entries for the external etcd block.
    fn external_etcd_endpoints(ips: &[String]) -> String {
        etcd_endpoint_urls(ips)
            .map(|url| format!("      - {url}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn init_configuration(params: &ControlPlaneParams<'_>, token: &str, key: &str) -> String {
        let mut sans = format!("    - \"{}\"\n", params.public_address);
        if !params.private_address.is_empty() && params.private_address != params.public_address {
            sans.push_str(&format!("    - \"{}\"\n", params.private_address));
        }
        sans.push_str("    - \"127.0.0.1\"");

        format!(
            r#"
cat <<EOF > kubeadm-config.yml
apiVersion: kubeadm.k8s.io/v1beta3
kind: InitConfiguration
bootstrapTokens:
- groups:
  - system:bootstrappers:kubeadm:default-node-token
  token: {token}
  ttl: 24h0m0s
  usages:
  - signing
  - authentication

certificateKey: {key}
nodeRegistration:
  criSocket: unix:///var/run/containerd/containerd.sock
  imagePullPolicy: IfNotPresent
  taints: null
---
apiVersion: kubeadm.k8s.io/v1beta3
kind: ClusterConfiguration
apiServer:
  timeoutForControlPlane: 4m0s
  certSANs:
{sans}
certificatesDir: /etc/kubernetes/pki
clusterName: kubernetes
controllerManager: {{}}
dns: {{}}
etcd:
  external:
    endpoints:
{endpoints}
    caFile: "{ETCD_CERT_DIR}/ca.pem"
    certFile: "{ETCD_CERT_DIR}/etcd.pem"
    keyFile: "{ETCD_CERT_DIR}/etcd-key.pem"
imageRepository: registry.k8s.io
kubernetesVersion: {version}.0
controlPlaneEndpoint: "{public}:{K8S_API_PORT}"
networking:
  dnsDomain: cluster.local
  serviceSubnet: 10.96.0.0/12
scheduler: {{}}
EOF
"#,
            endpoints = Self::external_etcd_endpoints(params.datastore_private_ips),
            version = params.version,
            public = params.public_address,
        )
    }
}

impl BootstrapStrategy for Kubeadm {
    fn distro(&self) -> Distro {
        Distro::Kubeadm
    }

    /// Accepts `1.<minor>` with `minor >= 26`; patch releases are chosen by
    /// the package repository, so a patch component is rejected.
    fn validate_version(&self, version: &str) -> bool {
        match numeric_version(version, 2).as_deref() {
            Some([1, minor]) => *minor >= MIN_MINOR,
            _ => false,
        }
    }

    /// kubeadm wires no overlay in; `none` is the default and any real
    /// plugin must be installed by the caller.
    fn supported_cni(&self, name: &str) -> CniSupport {
        match CniPlugin::parse(name) {
            Some(CniPlugin::None) => CniSupport::DEFAULT,
            Some(CniPlugin::Flannel | CniPlugin::Cilium) => CniSupport::ALTERNATIVE,
            None => CniSupport::INVALID,
        }
    }

    fn prepare_join_secrets(&self, join: &mut JoinSecrets) -> Result<bool> {
        let mut generated = false;
        if join.bootstrap_token.is_none() {
            join.bootstrap_token = Some(generate_bootstrap_token()?);
            generated = true;
        }
        if join.certificate_key.is_none() {
            join.certificate_key = Some(generate_certificate_key()?);
            generated = true;
        }
        Ok(generated)
    }

    fn etcd_cert_transfer_script(&self, certs: &ClusterCerts) -> ScriptCollection {
        ScriptCollection::new().with(etcd_cert_script(
            "save etcd certificate",
            ETCD_CERT_DIR,
            certs,
        ))
    }

    fn control_plane0_script(&self, params: &ControlPlaneParams<'_>) -> Result<ScriptCollection> {
        let token = require(params.join.bootstrap_token.as_ref(), "bootstrap token")?;
        let key = require(params.join.certificate_key.as_ref(), "certificate key")?;

        let mut scripts = Self::install_tools(params.version);
        scripts.append(
            Script::new(
                "store configuration for Controlplane0",
                Self::init_configuration(params, token, key),
            )
            .with_retries(3),
        );
        scripts.append(
            Script::new(
                "kubeadm init",
                "\nsudo kubeadm init --config kubeadm-config.yml --upload-certs\n",
            )
            .with_retries(3),
        );
        Ok(scripts)
    }

    fn control_plane_n_script(
        &self,
        params: &ControlPlaneParams<'_>,
    ) -> Result<ScriptCollection> {
        let token = require(params.join.bootstrap_token.as_ref(), "bootstrap token")?;
        let key = require(params.join.certificate_key.as_ref(), "certificate key")?;
        let hash = require(params.join.ca_cert_hash.as_ref(), "discovery token CA cert hash")?;

        let mut scripts = Self::install_tools(params.version);
        scripts.append(
            Script::new(
                "kubeadm join controlplane",
                format!(
                    "\nsudo kubeadm join {}:{K8S_API_PORT} --token {token} --discovery-token-ca-cert-hash sha256:{hash} --control-plane --certificate-key {key}\n",
                    params.join_address()
                ),
            )
            .with_retries(3),
        );
        Ok(scripts)
    }

    fn join_secret_script(&self) -> ScriptCollection {
        ScriptCollection::new().with(Script::new(
            CA_HASH_STEP,
            "\nsudo openssl x509 -in /etc/kubernetes/pki/ca.crt -noout -pubkey | openssl rsa -pubin -outform DER 2>/dev/null | sha256sum | cut -d' ' -f1\n",
        ))
    }

    fn capture_join_secret(&self, join: &mut JoinSecrets, output: &str) -> Result<()> {
        let hash = single_value(CA_HASH_STEP, output)?;
        let hash = hash.strip_prefix("sha256:").unwrap_or(&hash).to_string();
        if !hash.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(BootstrapError::UnexpectedOutput {
                step: CA_HASH_STEP.to_string(),
                reason: "hash contains unexpected characters".into(),
            });
        }
        debug!("captured discovery token CA cert hash");
        join.ca_cert_hash = Some(hash);
        Ok(())
    }

    fn worker_join_script(
        &self,
        version: &str,
        server_address: &str,
        join: &JoinSecrets,
    ) -> Result<ScriptCollection> {
        let token = require(join.bootstrap_token.as_ref(), "bootstrap token")?;
        let hash = require(join.ca_cert_hash.as_ref(), "discovery token CA cert hash")?;

        let mut scripts = Self::install_tools(version);
        scripts.append(
            Script::new(
                "Join K8s workerplane",
                format!(
                    "\nsudo kubeadm join {server_address}:{K8S_API_PORT} --token {token} --discovery-token-ca-cert-hash sha256:{hash}\n"
                ),
            )
            .with_retries(3),
        );
        Ok(scripts)
    }

    fn kubeconfig_script(&self) -> ScriptCollection {
        ScriptCollection::new().with(Script::new(
            "fetch kubeconfig",
            "\nsudo cat /etc/kubernetes/admin.conf\n",
        ))
    }
}
