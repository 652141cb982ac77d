//! Durable attributes and step decisions.
//!
//! A saga step never mutates engine state directly: it reads the durable
//! [`Attributes`] of its instance and returns a [`StepOutput`] holding the
//! updates to persist and the next [`StepDecision`]. The engine applies the
//! updates before it invokes the next step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::lifecycle::LifecycleError;

/// Durable attribute keys owned by the provisioning saga.
pub mod attributes {
    /// Namespace created by the first step.
    pub const NAMESPACE_NAME: &str = "nsname";
    /// Disposition decided by the completion check.
    pub const CLEANUP_REASON: &str = "cleanup_reason";
    /// Kubeconfig of the provisioned cluster.
    pub const WORKLOAD_KUBECONFIG: &str = "workload_kubeconfig";
    /// Namespace the cluster's infrastructure lived in.
    pub const INFRA_NAMESPACE: &str = "infra_namespace";
    /// Set when credential sync fails and compensation is requested.
    pub const CREDENTIAL_SYNC_ERROR: &str = "credential_sync_error";

    /// Keys that may be set once and never reassigned.
    pub const WRITE_ONCE: &[&str] = &[NAMESPACE_NAME, CLEANUP_REASON];
}

// =============================================================================
// Cleanup reason
// =============================================================================

/// One-bit disposition threaded from the completion check to cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupReason {
    #[default]
    Unset,
    Success,
    Failed,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unset" => Ok(Self::Unset),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown cleanup reason '{}'", other)),
        }
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Pending writes produced by one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdates(Vec<(String, String)>);

impl AttributeUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Key/value state of one saga instance, persisted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn namespace_name(&self) -> Option<&str> {
        self.get(attributes::NAMESPACE_NAME)
    }

    /// Cleanup reason, `Unset` when absent or unreadable.
    pub fn cleanup_reason(&self) -> CleanupReason {
        self.get(attributes::CLEANUP_REASON)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Apply step updates.
    ///
    /// Write-once keys accept the value they already hold (a replayed step)
    /// but reject a different one. Nothing is applied when any update is
    /// rejected.
    pub fn apply(&mut self, updates: &AttributeUpdates) -> Result<(), StepError> {
        for (key, value) in updates.iter() {
            if !attributes::WRITE_ONCE.contains(&key) {
                continue;
            }
            if let Some(current) = self.get(key) {
                if current != value {
                    return Err(StepError::AttributeReassigned {
                        key: key.to_string(),
                        current: current.to_string(),
                        attempted: value.to_string(),
                    });
                }
            }
        }
        for (key, value) in updates.iter() {
            self.0.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Step results
// =============================================================================

/// What the engine should do after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision<S> {
    /// Advance to the named step.
    Next(S),
    /// Terminal success.
    Complete,
    /// Terminal failure with an explicit, human readable reason.
    ForceFail { reason: String },
}

/// Outcome of a step that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput<S> {
    pub decision: StepDecision<S>,
    pub updates: AttributeUpdates,
}

impl<S> StepOutput<S> {
    pub fn next(step: S) -> Self {
        Self {
            decision: StepDecision::Next(step),
            updates: AttributeUpdates::new(),
        }
    }

    pub fn complete() -> Self {
        Self {
            decision: StepDecision::Complete,
            updates: AttributeUpdates::new(),
        }
    }

    pub fn force_fail(reason: impl Into<String>) -> Self {
        Self {
            decision: StepDecision::ForceFail {
                reason: reason.into(),
            },
            updates: AttributeUpdates::new(),
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.updates = self.updates.set(key, value);
        self
    }
}

/// Errors that fail a saga instance.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step {step}: durable attribute '{key}' is not set")]
    MissingAttribute { step: String, key: &'static str },

    #[error("attribute '{key}' is write-once: holds '{current}', refused '{attempted}'")]
    AttributeReassigned {
        key: String,
        current: String,
        attempted: String,
    },

    #[error("setup failed in {step}: {source}")]
    Setup {
        step: String,
        #[source]
        source: LifecycleError,
    },

    #[error("failed to sync credential: {0}")]
    CredentialSync(#[source] LifecycleError),

    #[error("cleanup of namespace {namespace} failed, namespace may be leaked: {source}")]
    Compensation {
        namespace: String,
        #[source]
        source: LifecycleError,
    },

    #[error("step {step} cancelled")]
    Cancelled { step: String },
}

/// Terminal disposition of a saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SagaOutcome {
    Completed,
    ForceFailed { reason: String },
    Failed { step: String, error: String },
}

impl SagaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}
