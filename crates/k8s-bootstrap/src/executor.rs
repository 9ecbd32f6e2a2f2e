//! Retry-aware script execution.
//!
//! [`RemoteShell`] is the transport boundary: it runs one step body on one
//! host and returns its stdout. [`execute`] layers the retry contract of
//! [`Script`] on top of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::script::{Script, ScriptCollection};
use crate::state::SshInfo;

/// Runs a single step on a remote host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `script` on `host` and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is unreachable or the step exits
    /// non-zero.
    async fn run(&self, host: &str, ssh: &SshInfo, script: &Script) -> anyhow::Result<String>;
}

/// Backoff between attempts of a retryable step.
///
/// The attempt count itself comes from each [`Script`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first re-attempt.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry without waiting.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Check the multiplier is a finite factor of at least 1.
    ///
    /// # Errors
    ///
    /// Returns a description of the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "retry backoff_multiplier must be a finite value >= 1, got {}",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = delay.as_secs_f64() * self.backoff_multiplier.max(1.0);
        Duration::try_from_secs_f64(scaled).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// A step that failed after exhausting its attempts.
#[derive(Debug, thiserror::Error)]
#[error("step '{step}' failed after {attempts} attempt(s): {reason}")]
pub struct StepFailure {
    /// Name of the failing step.
    pub step: String,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Last error reported by the shell.
    pub reason: String,
}

/// Run every step of `scripts` on `host`, in order.
///
/// A retryable step is attempted up to `1 + max_retries` times with
/// exponential backoff between attempts; any other step is attempted once.
/// The first step that exhausts its attempts aborts the remaining steps.
///
/// Returns the stdout of the last step, or an empty string for an empty
/// collection.
///
/// # Errors
///
/// Returns [`StepFailure`] for the first step that could not be completed.
pub async fn execute(
    shell: &dyn RemoteShell,
    host: &str,
    ssh: &SshInfo,
    scripts: &ScriptCollection,
    retry: &RetryConfig,
) -> Result<String, StepFailure> {
    let mut output = String::new();
    for script in scripts {
        output = run_step(shell, host, ssh, script, retry).await?;
    }
    Ok(output)
}

async fn run_step(
    shell: &dyn RemoteShell,
    host: &str,
    ssh: &SshInfo,
    script: &Script,
    retry: &RetryConfig,
) -> Result<String, StepFailure> {
    let max_attempts = script.max_attempts();
    let mut delay = retry.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(host, step = %script.name, attempt, "running step");
        match shell.run(host, ssh, script).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        "❌ {} on {host} failed after {attempt} attempt(s): {e:#}",
                        script.name
                    );
                    return Err(StepFailure {
                        step: script.name.clone(),
                        attempts: attempt,
                        reason: format!("{e:#}"),
                    });
                }

                info!(
                    "{} on {host} failed (attempt {attempt}/{max_attempts}): {e}. Retrying in {delay:?}...",
                    script.name
                );

                tokio::time::sleep(delay).await;
                delay = retry.next_delay(delay);
            }
        }
    }
}

/// Shell that logs each step instead of running it.
///
/// Step bodies carry keys and tokens, so only their names are logged.
#[derive(Debug, Clone)]
pub struct DryRunShell {
    output: String,
}

impl DryRunShell {
    /// Placeholder stdout returned for every step.
    pub const DEFAULT_OUTPUT: &'static str = "dry-run";

    #[must_use]
    pub fn new() -> Self {
        Self {
            output: Self::DEFAULT_OUTPUT.to_string(),
        }
    }

    /// Return `output` from every step instead of the default placeholder.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[async_trait]
impl RemoteShell for DryRunShell {
    async fn run(&self, host: &str, ssh: &SshInfo, script: &Script) -> anyhow::Result<String> {
        info!(
            "[dry-run] {}@{host}: {} ({}, {} attempt(s) max)",
            ssh.username,
            script.name,
            script.executor,
            script.max_attempts()
        );
        debug!("[dry-run] body is {} bytes", script.shell_script.len());
        Ok(self.output.clone())
    }
}

impl Default for DryRunShell {
    fn default() -> Self {
        Self::new()
    }
}
