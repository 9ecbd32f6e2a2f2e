//! Bootstrap state machine.
//!
//! [`Bootstrapper`] owns one [`ClusterBootstrapState`] behind a single
//! async mutex. Every public operation takes the lock for its whole
//! read-modify-persist sequence, including remote script execution, so two
//! node configurations on the same instance never interleave.
//!
//! Progress is recorded pessimistically: a node's marker is written only
//! after its scripts succeeded. The in-memory document only ever mirrors
//! what was last persisted.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::certs::generate_cluster_certs;
use crate::distro::{join_endpoint, BootstrapStrategy, ControlPlaneParams, Distro};
use crate::error::{BootstrapError, Result};
use crate::executor::{execute, RemoteShell, RetryConfig};
use crate::script::ScriptCollection;
use crate::state::{BootstrapStage, CloudResourceState, ClusterBootstrapState, NodeRole};
use crate::storage::Storage;

/// Why [`Bootstrapper::setup`] is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Start a new cluster, or pick up an existing document for it.
    Create,
    /// Continue a cluster that must already have a document.
    Resume,
    /// Load the document ahead of teardown.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Resume => write!(f, "resume"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Default)]
struct Session {
    storage: Option<Arc<dyn Storage>>,
    state: Option<ClusterBootstrapState>,
}

/// Drives one cluster from provisioned machines to joined nodes.
pub struct Bootstrapper {
    resources: CloudResourceState,
    strategy: Box<dyn BootstrapStrategy>,
    shell: Arc<dyn RemoteShell>,
    retry: RetryConfig,
    session: Mutex<Session>,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("cluster", &self.resources.metadata)
            .field("distro", &self.strategy.distro())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn storage_err(operation: &'static str) -> impl FnOnce(anyhow::Error) -> BootstrapError {
    move |e| BootstrapError::Storage {
        operation,
        reason: format!("{e:#}"),
    }
}

fn not_recorded(role: NodeRole, index: usize) -> impl FnOnce(anyhow::Error) -> BootstrapError {
    move |e| BootstrapError::ProgressNotRecorded {
        role,
        index,
        reason: format!("{e:#}"),
    }
}

/// Point a kubeconfig fetched from a control plane at the load balancer.
fn rewrite_kubeconfig(raw: &str, load_balancer: &str) -> String {
    raw.replace("https://127.0.0.1:", &format!("https://{load_balancer}:"))
        .replace("https://localhost:", &format!("https://{load_balancer}:"))
}

impl Bootstrapper {
    /// Create a bootstrapper for `resources`, selecting the strategy for
    /// `distro` once.
    #[must_use]
    pub fn new(resources: CloudResourceState, distro: Distro, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            resources,
            strategy: distro.strategy(),
            shell,
            retry: RetryConfig::default(),
            session: Mutex::new(Session::default()),
        }
    }

    /// Set the backoff used between attempts of retryable steps.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn distro(&self) -> Distro {
        self.strategy.distro()
    }

    #[must_use]
    pub fn resources(&self) -> &CloudResourceState {
        &self.resources
    }

    /// Snapshot of the current document, if [`Self::setup`] has run.
    pub async fn state(&self) -> Option<ClusterBootstrapState> {
        self.session.lock().await.state.clone()
    }

    /// Current stage, if [`Self::setup`] has run.
    pub async fn stage(&self) -> Option<BootstrapStage> {
        self.session.lock().await.state.as_ref().map(ClusterBootstrapState::stage)
    }

    /// Load or initialize the document for this cluster.
    ///
    /// `Create` with no stored document generates the datastore PKI and
    /// persists a fresh document; any operation with a stored document
    /// validates it and, except for `Delete`, checks it still describes
    /// the provisioned machines and distro.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::Storage`] if the backend cannot be set up,
    ///   reached, read or written.
    /// - [`BootstrapError::StateInconsistency`] if the resources or the
    ///   stored document are inconsistent, or `Resume`/`Delete` finds no
    ///   document.
    /// - [`BootstrapError::CertGen`] if PKI generation fails.
    pub async fn setup(&self, storage: Arc<dyn Storage>, operation: Operation) -> Result<()> {
        let meta = &self.resources.metadata;
        info!(
            "Setting up {} bootstrap for {} ({} {}) [{operation}]",
            self.distro(),
            meta.cluster_name,
            meta.provider,
            meta.region
        );
        self.resources.validate()?;

        let mut session = self.session.lock().await;

        storage
            .setup(
                &meta.provider,
                &meta.cluster_name,
                &meta.region,
                meta.cluster_type,
            )
            .await
            .map_err(storage_err("setup"))?;
        storage.connect().await.map_err(storage_err("connect"))?;
        let existing = storage.read().await.map_err(storage_err("read"))?;

        let state = match (existing, operation) {
            (Some(state), op) => {
                state.validate()?;
                if op != Operation::Delete {
                    state.ensure_matches(&self.resources, self.distro())?;
                }
                info!("Loaded existing bootstrap state (stage: {})", state.stage());
                state
            }
            (None, Operation::Create) => {
                info!("Generating datastore certificates");
                let certs = generate_cluster_certs(&self.resources.private_ips.data_stores)?;
                let state = ClusterBootstrapState::new(&self.resources, self.distro(), certs);
                storage.write(&state).await.map_err(storage_err("write"))?;
                info!("✅ Initialized bootstrap state");
                state
            }
            (None, op) => {
                return Err(BootstrapError::StateInconsistency(format!(
                    "no stored state for cluster '{}' to {op}",
                    meta.cluster_name
                )));
            }
        };

        session.storage = Some(storage);
        session.state = Some(state);
        Ok(())
    }

    /// Validate and record the distro version.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::InvalidVersion`] if the distro rejects `version`;
    ///   nothing is changed.
    /// - [`BootstrapError::StateInconsistency`] if a different version is
    ///   already in use by a configured control plane.
    /// - [`BootstrapError::OutOfOrder`] before [`Self::setup`].
    /// - [`BootstrapError::Storage`] if the document cannot be written.
    pub async fn version(&self, version: &str) -> Result<()> {
        if !self.strategy.validate_version(version) {
            return Err(BootstrapError::InvalidVersion {
                distro: self.distro(),
                version: version.to_string(),
            });
        }

        let mut session = self.session.lock().await;
        let (storage, current) = Self::loaded(&session, "version")?;
        if current.version.as_deref() == Some(version) {
            debug!("Version {version} already recorded");
            return Ok(());
        }
        if current.control_planes_started() {
            return Err(BootstrapError::StateInconsistency(format!(
                "version is pinned to {} once control planes are configured",
                current.version.as_deref().unwrap_or("<unset>")
            )));
        }

        let mut state = current.clone();
        state.version = Some(version.to_string());
        state.touch();
        storage.write(&state).await.map_err(storage_err("write"))?;
        session.state = Some(state);

        info!("✅ {} version set to {version}", self.distro());
        Ok(())
    }

    /// Validate and record the CNI plugin.
    ///
    /// Returns `true` when a non-default plugin was chosen and the caller
    /// has to provision it.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::UnsupportedCni`] if the distro does not know
    ///   `name`; nothing is changed.
    /// - [`BootstrapError::StateInconsistency`] if a different plugin is
    ///   already in use by a configured control plane.
    /// - [`BootstrapError::OutOfOrder`] before [`Self::setup`].
    /// - [`BootstrapError::Storage`] if the document cannot be written.
    pub async fn cni(&self, name: &str) -> Result<bool> {
        let support = self.strategy.supported_cni(name);
        if !support.valid {
            return Err(BootstrapError::UnsupportedCni {
                distro: self.distro(),
                name: name.to_string(),
            });
        }
        let external = !support.is_default;

        let mut session = self.session.lock().await;
        let (storage, current) = Self::loaded(&session, "cni")?;
        if current.cni_plugin.as_deref() == Some(name) {
            debug!("CNI plugin {name} already recorded");
            return Ok(external);
        }
        if current.control_planes_started() {
            return Err(BootstrapError::StateInconsistency(format!(
                "CNI plugin is pinned to {} once control planes are configured",
                current.cni_plugin.as_deref().unwrap_or("<unset>")
            )));
        }

        let mut state = current.clone();
        state.cni_plugin = Some(name.to_string());
        state.touch();
        storage.write(&state).await.map_err(storage_err("write"))?;
        session.state = Some(state);

        if external {
            info!("✅ CNI plugin set to {name} (caller installs it)");
        } else {
            info!("✅ CNI plugin set to {name} (bundled)");
        }
        Ok(external)
    }

    /// Configure control plane `index`.
    ///
    /// Index 0 brings up the cluster against the external datastore and
    /// records the join material; later indices join it. Datastore
    /// certificates are transferred first unless already placed on the
    /// node. Once the last control plane completes, the admin kubeconfig is
    /// captured. Calling again for a completed index is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::NodeIndexOutOfRange`] for an unknown index.
    /// - [`BootstrapError::OutOfOrder`] before setup, version and CNI, or
    ///   for index > 0 before control plane 0 completes.
    /// - [`BootstrapError::ScriptExec`] if a step fails; markers of other
    ///   nodes are untouched and the same index can be retried.
    /// - [`BootstrapError::UnexpectedOutput`] if join material or the
    ///   kubeconfig cannot be read back.
    /// - [`BootstrapError::ProgressNotRecorded`] if the node was configured
    ///   but its marker could not be written.
    /// - [`BootstrapError::Storage`] if generated join secrets cannot be
    ///   persisted before init.
    pub async fn configure_control_plane(&self, index: usize, storage: &dyn Storage) -> Result<()> {
        const ROLE: NodeRole = NodeRole::ControlPlane;

        let mut session = self.session.lock().await;
        let mut state = Self::ready(&session, "configure_control_plane")?.clone();

        let count = state.control_plane_count();
        if index >= count {
            return Err(BootstrapError::NodeIndexOutOfRange {
                role: ROLE,
                index,
                count,
            });
        }
        if state.progress.control_planes.contains(&index) {
            info!("Control plane {index} already configured, skipping");
            return Ok(());
        }
        if index > 0 && !state.progress.control_planes.contains(&0) {
            return Err(BootstrapError::OutOfOrder {
                operation: "configure_control_plane",
                reason: format!("control plane 0 must complete before control plane {index}"),
            });
        }

        let host = state.public_ips.control_planes[index].clone();
        info!("Configuring control plane {index} ({host})");

        if !state.progress.etcd_certs_placed.contains(&index) {
            let scripts = self.strategy.etcd_cert_transfer_script(&state.certs);
            self.run(ROLE, index, &host, &state, &scripts).await?;
            state.progress.etcd_certs_placed.insert(index);
            state.touch();
            storage
                .write(&state)
                .await
                .map_err(not_recorded(ROLE, index))?;
            session.state = Some(state.clone());
            debug!("Datastore certificates placed on control plane {index}");
        }

        if index == 0 && self.strategy.prepare_join_secrets(&mut state.join)? {
            state.touch();
            storage.write(&state).await.map_err(storage_err("write"))?;
            session.state = Some(state.clone());
            debug!("Persisted generated join secrets");
        }

        // kubeadm init and join fail on a node where they already succeeded.
        if !state.progress.distro_started.contains(&index) {
            let scripts = {
                let version = state.version.as_deref().unwrap_or_default();
                let cni = state.cni_plugin.as_deref().unwrap_or_default();
                let params = ControlPlaneParams {
                    version,
                    datastore_private_ips: &state.private_ips.data_stores,
                    public_address: &state.public_ips.load_balancer,
                    private_address: &state.private_ips.load_balancer,
                    external_cni: !self.strategy.supported_cni(cni).is_default,
                    join: &state.join,
                };
                if index == 0 {
                    self.strategy.control_plane0_script(&params)?
                } else {
                    self.strategy.control_plane_n_script(&params)?
                }
            };
            self.run(ROLE, index, &host, &state, &scripts).await?;
            state.progress.distro_started.insert(index);
            state.touch();
            storage
                .write(&state)
                .await
                .map_err(not_recorded(ROLE, index))?;
            session.state = Some(state.clone());
            debug!("{} started on control plane {index}", self.distro());
        } else {
            debug!("{} already started on control plane {index}", self.distro());
        }

        if index == 0 {
            let output = self
                .run(ROLE, index, &host, &state, &self.strategy.join_secret_script())
                .await?;
            self.strategy.capture_join_secret(&mut state.join, &output)?;
        }

        state.progress.control_planes.insert(index);

        if state.control_planes_complete() && state.kubeconfig.is_none() {
            let scripts = self.strategy.kubeconfig_script();
            let raw = self.run(ROLE, index, &host, &state, &scripts).await?;
            if raw.trim().is_empty() {
                return Err(BootstrapError::UnexpectedOutput {
                    step: scripts.names().last().copied().unwrap_or_default().to_string(),
                    reason: "empty kubeconfig".into(),
                });
            }
            state.kubeconfig = Some(rewrite_kubeconfig(&raw, &state.public_ips.load_balancer));
            debug!("Captured admin kubeconfig");
        }

        state.touch();
        storage
            .write(&state)
            .await
            .map_err(not_recorded(ROLE, index))?;
        session.state = Some(state);

        info!("✅ Control plane {index} configured");
        Ok(())
    }

    /// Join worker `index` through the load balancer.
    ///
    /// Calling again for a joined index is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::NodeIndexOutOfRange`] for an unknown index.
    /// - [`BootstrapError::OutOfOrder`] before every control plane is
    ///   configured.
    /// - [`BootstrapError::ScriptExec`] if a step fails.
    /// - [`BootstrapError::ProgressNotRecorded`] if the worker joined but
    ///   its marker could not be written.
    pub async fn join_workerplane(&self, index: usize, storage: &dyn Storage) -> Result<()> {
        const ROLE: NodeRole = NodeRole::WorkerPlane;

        let mut session = self.session.lock().await;
        let mut state = Self::ready(&session, "join_workerplane")?.clone();

        let count = state.worker_count();
        if index >= count {
            return Err(BootstrapError::NodeIndexOutOfRange {
                role: ROLE,
                index,
                count,
            });
        }
        if state.progress.worker_planes.contains(&index) {
            info!("Worker {index} already joined, skipping");
            return Ok(());
        }
        if !state.control_planes_complete() {
            return Err(BootstrapError::OutOfOrder {
                operation: "join_workerplane",
                reason: format!(
                    "{} of {} control planes configured",
                    state.progress.control_planes.len(),
                    state.control_plane_count()
                ),
            });
        }

        let host = state.public_ips.worker_planes[index].clone();
        if state.private_ips.load_balancer.is_empty() {
            warn!("No private load balancer address, joining worker {index} over the public one");
        }
        let server =
            join_endpoint(&state.public_ips.load_balancer, &state.private_ips.load_balancer)
                .to_string();
        info!("Joining worker {index} ({host}) through {server}");

        let scripts = self.strategy.worker_join_script(
            state.version.as_deref().unwrap_or_default(),
            &server,
            &state.join,
        )?;
        self.run(ROLE, index, &host, &state, &scripts).await?;

        state.progress.worker_planes.insert(index);
        state.touch();
        storage
            .write(&state)
            .await
            .map_err(not_recorded(ROLE, index))?;
        session.state = Some(state);

        info!("✅ Worker {index} joined");
        Ok(())
    }

    /// Storage and document after [`Self::setup`].
    fn loaded<'a>(
        session: &'a Session,
        operation: &'static str,
    ) -> Result<(Arc<dyn Storage>, &'a ClusterBootstrapState)> {
        match (&session.storage, &session.state) {
            (Some(storage), Some(state)) => Ok((Arc::clone(storage), state)),
            _ => Err(BootstrapError::OutOfOrder {
                operation,
                reason: "setup has not completed".into(),
            }),
        }
    }

    /// Document after setup, version and CNI.
    fn ready<'a>(
        session: &'a Session,
        operation: &'static str,
    ) -> Result<&'a ClusterBootstrapState> {
        let (_, state) = Self::loaded(session, operation)?;
        if state.version.is_none() || state.cni_plugin.is_none() {
            return Err(BootstrapError::OutOfOrder {
                operation,
                reason: "version and CNI plugin must be set first".into(),
            });
        }
        Ok(state)
    }

    async fn run(
        &self,
        role: NodeRole,
        index: usize,
        host: &str,
        state: &ClusterBootstrapState,
        scripts: &ScriptCollection,
    ) -> Result<String> {
        execute(self.shell.as_ref(), host, &state.ssh, scripts, &self.retry)
            .await
            .map_err(|failure| BootstrapError::ScriptExec {
                role,
                index,
                host: host.to_string(),
                step: failure.step,
                attempts: failure.attempts,
                reason: failure.reason,
            })
    }
}
