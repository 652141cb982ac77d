//! Transition history of saga instances.
//!
//! The history is an audit trail: events are appended in causal order and
//! never edited. The [`HistoryRecorder`] port hides the storage so a
//! persistent backend can replace the in-memory one without touching the
//! saga.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::shared_kernel::SagaId;

/// Outcome reported by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Running,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// One state transition of one saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub instance_id: SagaId,
    pub step_name: String,
    pub outcome: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl TransitionEvent {
    pub fn new(instance_id: SagaId, step_name: impl Into<String>, outcome: StepStatus) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            outcome,
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Unavailable(String),

    #[error("history backend error: {0}")]
    Backend(String),
}

/// Append-only history keyed by saga instance.
///
/// Implementations must accept concurrent writers and give read-your-writes
/// consistency for a single instance: a `get` that follows a `save` for the
/// same id observes that event.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Append an event. No dedup, no merge.
    async fn save(&self, instance_id: &SagaId, event: TransitionEvent) -> Result<(), HistoryError>;

    /// Full ordered history; empty when the instance is unknown.
    async fn get(&self, instance_id: &SagaId) -> Result<Vec<TransitionEvent>, HistoryError>;
}
