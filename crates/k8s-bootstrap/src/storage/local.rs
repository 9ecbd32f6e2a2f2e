//! File-backed storage.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::Storage;
use crate::state::{ClusterBootstrapState, ClusterType};

const STATE_FILE: &str = "state.json";

/// One pretty-printed JSON document per cluster under a root directory:
/// `<root>/<provider>/<cluster-type>/<name> <region>/state.json`.
///
/// Writes go to a temporary file that is then renamed over the document, so
/// a reader never sees a half-written state.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    cluster_dir: RwLock<Option<PathBuf>>,
}

impl LocalStore {
    /// Create a store rooted at `root`. Nothing is touched until
    /// [`Storage::connect`].
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            cluster_dir: RwLock::new(None),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the current cluster's document, once [`Storage::setup`] ran.
    pub async fn state_path(&self) -> Option<PathBuf> {
        self.cluster_dir
            .read()
            .await
            .as_ref()
            .map(|dir| dir.join(STATE_FILE))
    }

    async fn require_state_path(&self) -> anyhow::Result<PathBuf> {
        match self.state_path().await {
            Some(path) => Ok(path),
            None => bail!("storage used before setup"),
        }
    }
}

fn path_component(kind: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        bail!("{kind} must not be empty");
    }
    if value.contains(['/', '\\']) || value == "." || value == ".." {
        bail!("{kind} '{value}' is not a valid path component");
    }
    Ok(())
}

#[async_trait]
impl Storage for LocalStore {
    async fn setup(
        &self,
        provider: &str,
        cluster_name: &str,
        region: &str,
        cluster_type: ClusterType,
    ) -> anyhow::Result<()> {
        path_component("provider", provider)?;
        path_component("cluster name", cluster_name)?;
        path_component("region", region)?;

        let dir = self
            .root
            .join(provider)
            .join(cluster_type.to_string())
            .join(format!("{cluster_name} {region}"));
        debug!("Using state directory {}", dir.display());
        *self.cluster_dir.write().await = Some(dir);
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let path = self.require_state_path().await?;
        let dir = path
            .parent()
            .context("state path has no parent directory")?;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))
    }

    async fn read(&self) -> anyhow::Result<Option<ClusterBootstrapState>> {
        let path = self.require_state_path().await?;
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let state = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write(&self, state: &ClusterBootstrapState) -> anyhow::Result<()> {
        let path = self.require_state_path().await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        debug!("Saved bootstrap state to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::certs::ClusterCerts;
    use crate::distro::Distro;
    use crate::state::{CloudResourceState, ClusterMetadata, NetworkIps};

    fn resources() -> CloudResourceState {
        CloudResourceState {
            metadata: ClusterMetadata {
                provider: "azure".into(),
                cluster_name: "fake".into(),
                region: "eastus".into(),
                cluster_type: ClusterType::Ha,
            },
            public_ips: NetworkIps {
                control_planes: vec!["A.B.C.4".into()],
                data_stores: vec!["A.B.C.3".into()],
                worker_planes: Vec::new(),
                load_balancer: "A.B.C.1".into(),
            },
            private_ips: NetworkIps {
                control_planes: vec!["192.168.X.7".into()],
                data_stores: vec!["192.168.5.2".into()],
                worker_planes: Vec::new(),
                load_balancer: "192.168.X.1".into(),
            },
            ..CloudResourceState::default()
        }
    }

    fn state() -> ClusterBootstrapState {
        ClusterBootstrapState::new(
            &resources(),
            Distro::K3s,
            ClusterCerts {
                ca_cert: "ca".into(),
                etcd_cert: "cert".into(),
                etcd_key: "key".into(),
            },
        )
    }

    async fn store(dir: &TempDir) -> LocalStore {
        let store = LocalStore::new(dir.path());
        store
            .setup("azure", "fake", "eastus", ClusterType::Ha)
            .await
            .unwrap();
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let expected = dir.path().join("azure").join("ha").join("fake eastus").join("state.json");
        assert_eq!(store.state_path().await.unwrap(), expected);
        assert!(expected.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let mut state = state();
        state.version = Some("1.27.4".into());
        state.progress.control_planes.insert(0);
        store.write(&state).await.unwrap();

        let loaded = store.read().await.unwrap().unwrap();
        assert_eq!(loaded, state);

        let path = store.state_path().await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_replaces_previous_document() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let mut state = state();
        store.write(&state).await.unwrap();
        state.cni_plugin = Some("flannel".into());
        store.write(&state).await.unwrap();

        let loaded = store.read().await.unwrap().unwrap();
        assert_eq!(loaded.cni_plugin.as_deref(), Some("flannel"));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let path = store.state_path().await.unwrap();
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(store.read().await.is_err());
    }

    #[tokio::test]
    async fn test_use_before_setup_fails() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.connect().await.is_err());
        assert!(store.read().await.is_err());
        assert!(store.write(&state()).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store
            .setup("azure", "../escape", "eastus", ClusterType::Ha)
            .await
            .is_err());
        assert!(store.setup("", "fake", "eastus", ClusterType::Ha).await.is_err());
    }
}
