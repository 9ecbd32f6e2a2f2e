//! Storage collaborator trait.

use async_trait::async_trait;

use crate::state::{ClusterBootstrapState, ClusterType};

/// Durable home of one cluster's [`ClusterBootstrapState`].
///
/// The bootstrapper calls [`Storage::setup`] and [`Storage::connect`] once,
/// then treats [`Storage::read`] and [`Storage::write`] as its only
/// durability boundary. Encoding is the implementation's concern.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Select the document for a cluster.
    async fn setup(
        &self,
        provider: &str,
        cluster_name: &str,
        region: &str,
        cluster_type: ClusterType,
    ) -> anyhow::Result<()>;

    /// Open the backend. Fails if it is unreachable.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Load the document, or `None` if the cluster has none yet.
    async fn read(&self) -> anyhow::Result<Option<ClusterBootstrapState>>;

    /// Replace the stored document.
    async fn write(&self, state: &ClusterBootstrapState) -> anyhow::Result<()>;
}
