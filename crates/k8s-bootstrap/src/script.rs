//! Remote script model.
//!
//! A [`Script`] is one named shell step with a declared retry policy. The
//! policy is data only: [`crate::executor::execute`] is what honours it.
//! A [`ScriptCollection`] is the ordered sequence of steps that makes up
//! one logical configuration step on one node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Interpreter the remote side runs a step body with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptExecutor {
    /// `bash` on a Linux host.
    #[default]
    LinuxBash,
}

impl fmt::Display for ScriptExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinuxBash => write!(f, "bash"),
        }
    }
}

/// A single named remote step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Human-readable step name, reported on failure.
    pub name: String,
    /// Shell body sent to the host.
    pub shell_script: String,
    /// Interpreter for the body.
    pub executor: ScriptExecutor,
    /// Whether a failed attempt may be repeated.
    pub can_retry: bool,
    /// Extra attempts allowed after the first when `can_retry` is set.
    pub max_retries: u32,
}

impl Script {
    /// Create a non-retryable bash step.
    #[must_use]
    pub fn new(name: impl Into<String>, shell_script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shell_script: shell_script.into(),
            executor: ScriptExecutor::LinuxBash,
            can_retry: false,
            max_retries: 0,
        }
    }

    /// Allow up to `max_retries` re-attempts after the first failure.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.can_retry = true;
        self.max_retries = max_retries;
        self
    }

    /// Set the interpreter.
    #[must_use]
    pub fn with_executor(mut self, executor: ScriptExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Total attempts the executor may make for this step.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.can_retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

/// Ordered, append-only sequence of [`Script`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptCollection {
    scripts: Vec<Script>,
}

impl ScriptCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step after every step already present.
    pub fn append(&mut self, script: Script) {
        self.scripts.push(script);
    }

    /// Append a step, builder style.
    #[must_use]
    pub fn with(mut self, script: Script) -> Self {
        self.append(script);
        self
    }

    /// Append every step of `other`, preserving its order.
    pub fn extend(&mut self, other: ScriptCollection) {
        self.scripts.extend(other.scripts);
    }

    /// Steps in execution order.
    #[must_use]
    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    /// Iterate over steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Script> {
        self.scripts.iter()
    }

    /// Step names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.scripts.iter().map(|s| s.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl<'a> IntoIterator for &'a ScriptCollection {
    type Item = &'a Script;
    type IntoIter = std::slice::Iter<'a, Script>;

    fn into_iter(self) -> Self::IntoIter {
        self.scripts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut scripts = ScriptCollection::new();
        assert!(scripts.is_empty());

        scripts.append(Script::new("first", "echo 1"));
        scripts.append(Script::new("second", "echo 2").with_retries(3));
        scripts.append(Script::new("third", "echo 3"));

        assert_eq!(scripts.len(), 3);
        assert_eq!(scripts.names(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_extend_keeps_both_orders() {
        let mut a = ScriptCollection::new()
            .with(Script::new("a1", ""))
            .with(Script::new("a2", ""));
        let b = ScriptCollection::new()
            .with(Script::new("b1", ""))
            .with(Script::new("b2", ""));

        a.extend(b);
        assert_eq!(a.names(), vec!["a1", "a2", "b1", "b2"]);
    }

    #[test]
    fn test_retry_policy() {
        let once = Script::new("once", "true");
        assert!(!once.can_retry);
        assert_eq!(once.max_attempts(), 1);

        let retried = Script::new("retried", "true").with_retries(9);
        assert!(retried.can_retry);
        assert_eq!(retried.max_retries, 9);
        assert_eq!(retried.max_attempts(), 10);
    }

    #[test]
    fn test_default_executor_is_bash() {
        let script = Script::new("x", "true");
        assert_eq!(script.executor, ScriptExecutor::LinuxBash);
        assert_eq!(script.executor.to_string(), "bash");
    }
}
