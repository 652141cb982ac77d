//! Port over the cluster control plane.
//!
//! Every create is idempotent with respect to "already exists" and every
//! delete with respect to "already absent": re-running a step after a crash
//! must not surface a duplicate-resource error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{ClusterConfig, CredentialRef};

/// Observed status of the runner job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job object is not visible yet.
    NotFound,
    /// Visible but not finished.
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Maps the job's pod counters; success wins over failure.
    pub fn from_counts(succeeded: i32, failed: i32) -> Self {
        if succeeded > 0 {
            Self::Succeeded
        } else if failed > 0 {
            Self::Failed
        } else {
            Self::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("control plane request for {kind} {name} failed: {message}")]
    Api {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("failed to render cluster script: {0}")]
    Script(String),

    #[error("failed to resolve deployer image: {0}")]
    Image(String),

    #[error("invalid credential: {0}")]
    Credential(String),

    #[error("timed out after {elapsed_secs}s waiting for {what}")]
    Timeout { what: String, elapsed_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cluster client error: {0}")]
    Client(String),
}

impl LifecycleError {
    pub fn api(kind: &'static str, name: impl Into<String>, message: impl ToString) -> Self {
        Self::Api {
            kind,
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// CRUD over namespace, secret and job resources of the infrastructure
/// cluster. Implementations must be safe to share between saga instances.
#[async_trait]
pub trait ClusterLifecycle: Send + Sync {
    /// Create a namespace; an existing namespace is success.
    async fn create_namespace(&self, name: &str) -> Result<(), LifecycleError>;

    /// Render and store the cluster script, resolve the deployer image and
    /// create the runner job in `namespace`. An existing job is success.
    async fn create_completion_job(
        &self,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<(), LifecycleError>;

    /// Read-only probe of the runner job.
    async fn get_job_status(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<JobStatus, LifecycleError>;

    /// Delete a namespace and, by cascade, everything in it. A missing
    /// namespace is success.
    async fn delete_namespace(&self, name: &str) -> Result<(), LifecycleError>;

    /// Wait (bounded) for the generated kubeconfig secret and return its
    /// contents.
    async fn sync_credential(
        &self,
        source: &CredentialRef,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<String, LifecycleError>;

    /// Name of the job created by [`ClusterLifecycle::create_completion_job`].
    fn runner_job_name(&self) -> &str;
}
