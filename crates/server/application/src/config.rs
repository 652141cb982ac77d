//! Saga tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::poller::PollConfig;

/// What to do when the credential cannot be synced after the cluster was
/// built successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSyncFailurePolicy {
    /// Fail the saga and leave the namespace for manual recovery.
    #[default]
    Abort,
    /// Tear the namespace down, then force-fail the saga.
    Compensate,
}

/// Configuration of the provisioning saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaSettings {
    /// Seconds between runner job status probes.
    pub poll_interval_secs: u64,
    /// Seconds the runner job may take before the saga compensates.
    pub poll_timeout_secs: u64,
    /// Seconds between probes for the generated kubeconfig secret.
    pub secret_poll_interval_secs: u64,
    pub secret_wait_timeout_secs: u64,
    pub credential_sync_failure: CredentialSyncFailurePolicy,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            poll_timeout_secs: 30 * 60,
            secret_poll_interval_secs: 5,
            secret_wait_timeout_secs: 10 * 60,
            credential_sync_failure: CredentialSyncFailurePolicy::Abort,
        }
    }
}

impl SagaSettings {
    pub fn completion_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.poll_timeout_secs),
        )
    }

    pub fn credential_wait(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.secret_poll_interval_secs),
            Duration::from_secs(self.secret_wait_timeout_secs),
        )
    }

    pub fn with_poll(mut self, interval_secs: u64, timeout_secs: u64) -> Self {
        self.poll_interval_secs = interval_secs;
        self.poll_timeout_secs = timeout_secs;
        self
    }

    pub fn with_credential_sync_failure(mut self, policy: CredentialSyncFailurePolicy) -> Self {
        self.credential_sync_failure = policy;
        self
    }
}
