//! Cluster bootstrap configuration file.
//!
//! ```yaml
//! cluster:
//!   provider: azure
//!   name: demo
//!   region: eastus
//!   type: ha
//! distro: k3s
//! version: "1.27.4"
//! cni: flannel
//! ssh:
//!   username: ubuntu
//!   private_key_path: ~/.ssh/id_ed25519
//! public:
//!   control_planes: [20.0.0.4, 20.0.0.5, 20.0.0.6]
//!   data_stores: [20.0.0.3]
//!   worker_planes: [20.0.0.2]
//!   load_balancer: 20.0.0.1
//! private:
//!   control_planes: [192.168.1.7, 192.168.1.9, 192.168.1.10]
//!   data_stores: [192.168.5.2]
//!   load_balancer: 192.168.1.1
//! retry:
//!   initial_delay: 5
//!   max_delay: 60
//!   backoff_multiplier: 2.0
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::distro::Distro;
use crate::error::{BootstrapError, Result};
use crate::executor::RetryConfig;
use crate::state::{CloudResourceState, ClusterMetadata, NetworkIps, SshInfo};

/// SSH identity as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub username: String,
    /// Path to the private key. A leading `~` expands to `$HOME`.
    pub private_key_path: PathBuf,
}

impl SshConfig {
    /// Key path with `~` expanded.
    #[must_use]
    pub fn resolved_key_path(&self) -> PathBuf {
        let raw = self.private_key_path.to_string_lossy();
        if let Some(rest) = raw.strip_prefix("~/") {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            return PathBuf::from(home).join(rest);
        }
        self.private_key_path.clone()
    }
}

/// Everything needed to bootstrap one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub cluster: ClusterMetadata,
    pub distro: Distro,
    pub version: String,
    pub cni: String,
    pub ssh: SshConfig,
    pub public: NetworkIps,
    pub private: NetworkIps,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl BootstrapConfig {
    /// Parse and validate a config document.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if the YAML is malformed or fails
    /// validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| BootstrapError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if the file cannot be read, parsed
    /// or validated.
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await.map_err(|e| {
            BootstrapError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Check the topology and that the distro accepts the version and CNI.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(BootstrapError::Config(msg)) };

        if self.cluster.provider.is_empty() || self.cluster.cluster_name.is_empty() {
            return invalid("cluster provider and name are required".into());
        }
        if self.public.control_planes.is_empty() {
            return invalid("at least one control plane is required".into());
        }
        if self.public.data_stores.is_empty() {
            return invalid("at least one datastore is required".into());
        }
        if self.public.control_planes.len() != self.private.control_planes.len() {
            return invalid(format!(
                "{} public control planes but {} private",
                self.public.control_planes.len(),
                self.private.control_planes.len()
            ));
        }
        if self.public.data_stores.len() != self.private.data_stores.len() {
            return invalid(format!(
                "{} public datastores but {} private",
                self.public.data_stores.len(),
                self.private.data_stores.len()
            ));
        }
        if self.public.load_balancer.is_empty() {
            return invalid("public load balancer address is required".into());
        }
        if self.ssh.username.is_empty() {
            return invalid("ssh username is required".into());
        }
        if let Err(msg) = self.retry.validate() {
            return invalid(msg);
        }

        let strategy = self.distro.strategy();
        if !strategy.validate_version(&self.version) {
            return invalid(format!(
                "version '{}' is not supported by {}",
                self.version, self.distro
            ));
        }
        if !strategy.supported_cni(&self.cni).valid {
            return invalid(format!(
                "CNI plugin '{}' is not supported by {}",
                self.cni, self.distro
            ));
        }
        Ok(())
    }

    /// Build the cloud resource view, reading the SSH private key.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if the key file cannot be read.
    pub async fn cloud_resources(&self) -> Result<CloudResourceState> {
        let key_path = self.ssh.resolved_key_path();
        let private_key = fs::read_to_string(&key_path).await.map_err(|e| {
            BootstrapError::Config(format!(
                "failed to read ssh key {}: {e}",
                key_path.display()
            ))
        })?;
        Ok(self.cloud_resources_with_key(private_key))
    }

    /// Build the cloud resource view with an already loaded key.
    #[must_use]
    pub fn cloud_resources_with_key(&self, private_key: String) -> CloudResourceState {
        CloudResourceState {
            metadata: self.cluster.clone(),
            ssh: SshInfo {
                username: self.ssh.username.clone(),
                private_key,
            },
            public_ips: self.public.clone(),
            private_ips: self.private.clone(),
        }
    }
}
