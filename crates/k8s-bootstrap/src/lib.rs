//! HA Kubernetes bootstrap for CTO Platform.
//!
//! Turns provisioned machines (control planes, an external etcd datastore,
//! workers and a load balancer) into a running cluster by generating the
//! datastore PKI and join secrets, rendering each node's ordered shell
//! steps for the chosen distro (k3s or kubeadm), running them over a
//! [`RemoteShell`] and persisting progress after every node so a failed
//! bootstrap can be resumed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use k8s_bootstrap::{Bootstrapper, Distro, DryRunShell, LocalStore, Operation};
//!
//! let store = Arc::new(LocalStore::new("/var/lib/k8s-bootstrap"));
//! let bootstrapper = Bootstrapper::new(resources, Distro::K3s, Arc::new(DryRunShell::new()));
//!
//! bootstrapper.setup(store.clone(), Operation::Create).await?;
//! bootstrapper.version("1.27.4").await?;
//! bootstrapper.cni("flannel").await?;
//! for i in 0..3 {
//!     bootstrapper.configure_control_plane(i, store.as_ref()).await?;
//! }
//! bootstrapper.join_workerplane(0, store.as_ref()).await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod certs;
pub mod config;
pub mod distro;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod script;
pub mod state;
pub mod storage;

pub use config::BootstrapConfig;
pub use distro::{BootstrapStrategy, CniSupport, Distro};
pub use error::{BootstrapError, Result};
pub use executor::{execute, DryRunShell, RemoteShell, RetryConfig, StepFailure};
pub use orchestrator::{Bootstrapper, Operation};
pub use script::{Script, ScriptCollection, ScriptExecutor};
pub use state::{
    BootstrapStage, CloudResourceState, ClusterBootstrapState, ClusterMetadata, ClusterType,
    NetworkIps, NodeRole, SshInfo,
};
pub use storage::{LocalStore, Storage};
