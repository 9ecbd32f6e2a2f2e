//! Error types for cluster bootstrap.

use thiserror::Error;

use crate::distro::Distro;
use crate::state::NodeRole;

/// Errors that can occur while bootstrapping a cluster.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Version string rejected by the distro.
    #[error("invalid {distro} version: '{version}'")]
    InvalidVersion { distro: Distro, version: String },

    /// CNI plugin not recognized by the distro.
    #[error("unsupported CNI plugin for {distro}: '{name}'")]
    UnsupportedCni { distro: Distro, name: String },

    /// Certificate or key generation failed.
    #[error("certificate generation failed: {0}")]
    CertGen(String),

    /// Secure random source failed while generating a join secret.
    #[error("token generation failed: {0}")]
    TokenGen(String),

    /// A remote step failed after exhausting its attempts.
    #[error("{role}-{index} ({host}): step '{step}' failed after {attempts} attempt(s): {reason}")]
    ScriptExec {
        role: NodeRole,
        index: usize,
        host: String,
        step: String,
        attempts: u32,
        reason: String,
    },

    /// A fetch step ran but produced nothing usable.
    #[error("step '{step}' returned unexpected output: {reason}")]
    UnexpectedOutput { step: String, reason: String },

    /// The storage backend failed.
    #[error("storage {operation} failed: {reason}")]
    Storage {
        operation: &'static str,
        reason: String,
    },

    /// The node was configured remotely but its progress marker was not
    /// persisted. Re-running the same index is safe.
    #[error("{role}-{index} configured but progress was not persisted: {reason}")]
    ProgressNotRecorded {
        role: NodeRole,
        index: usize,
        reason: String,
    },

    /// Persisted state disagrees with itself or with the cloud resources.
    #[error("inconsistent bootstrap state: {0}")]
    StateInconsistency(String),

    /// An operation was called before its prerequisites completed.
    #[error("{operation} called out of order: {reason}")]
    OutOfOrder {
        operation: &'static str,
        reason: String,
    },

    /// Node index beyond the provisioned node count.
    #[error("{role} index {index} out of range ({count} provisioned)")]
    NodeIndexOutOfRange {
        role: NodeRole,
        index: usize,
        count: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootstrapError {
    /// Whether the caller may retry the same call without changing input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ScriptExec { .. }
                | Self::Storage { .. }
                | Self::ProgressNotRecorded { .. }
                | Self::UnexpectedOutput { .. }
        )
    }
}

/// Result alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootstrapError>;
