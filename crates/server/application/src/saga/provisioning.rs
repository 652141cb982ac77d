//! Provisioning Saga
//!
//! State machine that builds a virtual cluster inside a throwaway namespace
//! and always tears that namespace down once the runner job has been
//! observed:
//!
//! ```text
//! CreateNamespace -> CreateJob -> CheckCompletion -+-> SyncCredential -+-> Cleanup
//!                                                  +-------------------+
//! ```
//!
//! `CheckCompletion` writes the one-bit `cleanup_reason` attribute and both
//! of its branches merge into `Cleanup`, which turns that bit into the
//! terminal disposition. Every step appends a [`TransitionEvent`] to the
//! history before it returns, on the error path too.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use capi_server_domain::{
    attributes, Attributes, CleanupReason, ClusterConfig, ClusterLifecycle, HistoryRecorder,
    ImportOptions, JobStatus, LifecycleError, StepError, StepOutput, StepStatus, TransitionEvent,
};

use super::registry::{DurableSaga, StepContext};
use crate::config::{CredentialSyncFailurePolicy, SagaSettings};
use crate::poller::{poll_until, PollError};

/// Workflow type id under which the saga is registered.
pub const PROVISIONING_WORKFLOW: &str = "kubevirt-provisioning";

pub const CLUSTER_FAILED_REASON: &str = "Cluster creation failed, namespace cleaned up.";
pub const CREDENTIAL_SYNC_FAILED_REASON: &str = "Credential sync failed, namespace cleaned up.";
pub const NO_COMPLETION_RESULT_REASON: &str =
    "Cleanup ran without a completion result, namespace cleaned up.";

/// Alphabet of Kubernetes generated name suffixes (no vowels, no ambiguous
/// characters).
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SUFFIX_LEN: usize = 6;

// =============================================================================
// Steps and input
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningStep {
    CreateNamespace,
    CreateJob,
    CheckCompletion,
    SyncCredential,
    Cleanup,
}

impl ProvisioningStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateNamespace => "CreateNamespace",
            Self::CreateJob => "CreateJob",
            Self::CheckCompletion => "CheckCompletion",
            Self::SyncCredential => "SyncCredential",
            Self::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable input of one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningInput {
    pub cluster_config: ClusterConfig,
    #[serde(default)]
    pub import_options: ImportOptions,
}

impl ProvisioningInput {
    pub fn new(cluster_config: ClusterConfig) -> Self {
        Self {
            cluster_config,
            import_options: ImportOptions::default(),
        }
    }

    pub fn with_import_options(mut self, import_options: ImportOptions) -> Self {
        self.import_options = import_options;
        self
    }
}

/// Why the runner job check stopped polling.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to perform cluster operation")]
    JobFailed,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// `<cluster>-<6 random chars>`.
pub fn generate_namespace_name(cluster_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", cluster_name, suffix)
}

// =============================================================================
// Saga
// =============================================================================

pub struct ProvisioningSaga {
    lifecycle: Arc<dyn ClusterLifecycle>,
    history: Arc<dyn HistoryRecorder>,
    settings: SagaSettings,
}

impl fmt::Debug for ProvisioningSaga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningSaga")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

type StepResult = Result<StepOutput<ProvisioningStep>, StepError>;

impl ProvisioningSaga {
    pub fn new(
        lifecycle: Arc<dyn ClusterLifecycle>,
        history: Arc<dyn HistoryRecorder>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            lifecycle,
            history,
            settings,
        }
    }

    pub fn settings(&self) -> &SagaSettings {
        &self.settings
    }

    /// Append an event. A history outage is logged and never masks the
    /// step outcome.
    async fn record(&self, ctx: &StepContext, event: TransitionEvent) {
        if let Err(e) = self.history.save(&ctx.instance_id, event).await {
            warn!(saga_id = %ctx.instance_id, error = %e, "Failed to record transition event");
        }
    }

    async fn record_failure(&self, ctx: &StepContext, step: ProvisioningStep, err: &StepError) {
        let event = TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Failed)
            .with_detail("error", err.to_string());
        self.record(ctx, event).await;
    }

    /// Namespace written by `CreateNamespace`; its absence fails the step.
    async fn namespace<'a>(
        &self,
        ctx: &StepContext,
        step: ProvisioningStep,
        attributes: &'a Attributes,
    ) -> Result<&'a str, StepError> {
        match attributes.namespace_name() {
            Some(ns) => Ok(ns),
            None => {
                let err = StepError::MissingAttribute {
                    step: step.name().to_string(),
                    key: attributes::NAMESPACE_NAME,
                };
                self.record_failure(ctx, step, &err).await;
                Err(err)
            }
        }
    }

    async fn create_namespace(
        &self,
        ctx: &StepContext,
        attributes: &Attributes,
        config: &ClusterConfig,
    ) -> StepResult {
        let step = ProvisioningStep::CreateNamespace;
        let namespace = match attributes.namespace_name() {
            Some(existing) => existing.to_string(),
            None => generate_namespace_name(&config.cluster_name),
        };

        if let Err(source) = self.lifecycle.create_namespace(&namespace).await {
            let err = StepError::Setup {
                step: step.name().to_string(),
                source,
            };
            self.record_failure(ctx, step, &err).await;
            return Err(err);
        }

        info!(saga_id = %ctx.instance_id, %namespace, "Namespace ready");
        let event = TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Success)
            .with_detail(attributes::NAMESPACE_NAME, namespace.as_str());
        self.record(ctx, event).await;

        Ok(StepOutput::next(ProvisioningStep::CreateJob)
            .with_update(attributes::NAMESPACE_NAME, namespace))
    }

    async fn create_job(
        &self,
        ctx: &StepContext,
        attributes: &Attributes,
        config: &ClusterConfig,
    ) -> StepResult {
        let step = ProvisioningStep::CreateJob;
        let namespace = self.namespace(ctx, step, attributes).await?;

        if let Err(source) = self.lifecycle.create_completion_job(config, namespace).await {
            let err = StepError::Setup {
                step: step.name().to_string(),
                source,
            };
            self.record_failure(ctx, step, &err).await;
            return Err(err);
        }

        let job_name = self.lifecycle.runner_job_name();
        info!(saga_id = %ctx.instance_id, %namespace, job = %job_name, "Runner job created");
        let event = TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Success)
            .with_detail(attributes::NAMESPACE_NAME, namespace)
            .with_detail("job", job_name);
        self.record(ctx, event).await;

        Ok(StepOutput::next(ProvisioningStep::CheckCompletion))
    }

    async fn check_completion(&self, ctx: &StepContext, attributes: &Attributes) -> StepResult {
        let step = ProvisioningStep::CheckCompletion;
        let namespace = self.namespace(ctx, step, attributes).await?;

        // Re-invoked after the reason was persisted: record and route.
        let reason = attributes.cleanup_reason();
        let replayed = match reason {
            CleanupReason::Success => Some((StepStatus::Success, ProvisioningStep::SyncCredential)),
            CleanupReason::Failed => Some((StepStatus::Failed, ProvisioningStep::Cleanup)),
            CleanupReason::Unset => None,
        };
        if let Some((status, next)) = replayed {
            info!(saga_id = %ctx.instance_id, %namespace, cleanup_reason = reason.as_str(), "Completion already decided");
            let event = TransitionEvent::new(ctx.instance_id.clone(), step.name(), status)
                .with_detail(attributes::CLEANUP_REASON, reason.as_str())
                .with_detail("replayed", "true");
            self.record(ctx, event).await;
            return Ok(StepOutput::next(next));
        }

        let job_name = self.lifecycle.runner_job_name();
        let poll = self.settings.completion_poll();
        let running = TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Running)
            .with_detail("job", job_name)
            .with_detail("timeout_secs", poll.timeout.as_secs().to_string());
        self.record(ctx, running).await;

        let lifecycle = self.lifecycle.as_ref();
        let check = || async move {
            match lifecycle.get_job_status(namespace, job_name).await {
                Ok(JobStatus::NotFound | JobStatus::Pending) => Ok::<_, ProvisioningError>(false),
                Ok(JobStatus::Succeeded) => Ok(true),
                Ok(JobStatus::Failed) => Err(ProvisioningError::JobFailed),
                Err(e) => Err(ProvisioningError::Lifecycle(e)),
            }
        };

        match poll_until(check, poll, &ctx.cancellation).await {
            Ok(()) => {
                info!(saga_id = %ctx.instance_id, %namespace, "Runner job succeeded");
                let event =
                    TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Success)
                        .with_detail(attributes::CLEANUP_REASON, CleanupReason::Success.as_str());
                self.record(ctx, event).await;
                Ok(StepOutput::next(ProvisioningStep::SyncCredential)
                    .with_update(attributes::CLEANUP_REASON, CleanupReason::Success.as_str()))
            }
            Err(PollError::Cancelled) => {
                let err = StepError::Cancelled {
                    step: step.name().to_string(),
                };
                self.record_failure(ctx, step, &err).await;
                Err(err)
            }
            Err(e) => {
                warn!(saga_id = %ctx.instance_id, %namespace, error = %e, "Runner job did not succeed, compensating");
                let event =
                    TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Failed)
                        .with_detail("error", e.to_string())
                        .with_detail(attributes::CLEANUP_REASON, CleanupReason::Failed.as_str());
                self.record(ctx, event).await;
                Ok(StepOutput::next(ProvisioningStep::Cleanup)
                    .with_update(attributes::CLEANUP_REASON, CleanupReason::Failed.as_str()))
            }
        }
    }

    async fn sync_credential(
        &self,
        ctx: &StepContext,
        attributes: &Attributes,
        config: &ClusterConfig,
    ) -> StepResult {
        let step = ProvisioningStep::SyncCredential;
        let namespace = self.namespace(ctx, step, attributes).await?;

        let synced = tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(LifecycleError::Cancelled),
            result = self.lifecycle.sync_credential(&config.credential, config, namespace) => result,
        };

        match synced {
            Ok(kubeconfig) => {
                info!(saga_id = %ctx.instance_id, %namespace, "Workload credential synced");
                let event =
                    TransitionEvent::new(ctx.instance_id.clone(), step.name(), StepStatus::Success)
                        .with_detail("secret", config.kubeconfig_secret_name());
                self.record(ctx, event).await;
                Ok(StepOutput::next(ProvisioningStep::Cleanup)
                    .with_update(attributes::WORKLOAD_KUBECONFIG, kubeconfig)
                    .with_update(attributes::INFRA_NAMESPACE, namespace))
            }
            Err(LifecycleError::Cancelled) => {
                let err = StepError::Cancelled {
                    step: step.name().to_string(),
                };
                self.record_failure(ctx, step, &err).await;
                Err(err)
            }
            Err(source) => {
                let err = StepError::CredentialSync(source);
                self.record_failure(ctx, step, &err).await;
                match self.settings.credential_sync_failure {
                    CredentialSyncFailurePolicy::Abort => {
                        error!(saga_id = %ctx.instance_id, %namespace, error = %err, "Credential sync failed, namespace left for manual recovery");
                        Err(err)
                    }
                    CredentialSyncFailurePolicy::Compensate => {
                        warn!(saga_id = %ctx.instance_id, %namespace, error = %err, "Credential sync failed, compensating");
                        Ok(StepOutput::next(ProvisioningStep::Cleanup)
                            .with_update(attributes::CREDENTIAL_SYNC_ERROR, err.to_string()))
                    }
                }
            }
        }
    }

    async fn cleanup(&self, ctx: &StepContext, attributes: &Attributes) -> StepResult {
        let step = ProvisioningStep::Cleanup;
        let namespace = self.namespace(ctx, step, attributes).await?;
        let reason = attributes.cleanup_reason();

        if let Err(source) = self.lifecycle.delete_namespace(namespace).await {
            let err = StepError::Compensation {
                namespace: namespace.to_string(),
                source,
            };
            error!(saga_id = %ctx.instance_id, %namespace, error = %err, "Cleanup failed, namespace leaked");
            self.record_failure(ctx, step, &err).await;
            return Err(err);
        }

        let sync_error = attributes.get(attributes::CREDENTIAL_SYNC_ERROR);
        let status = match (reason, sync_error) {
            (CleanupReason::Success, None) => StepStatus::Success,
            _ => StepStatus::Failed,
        };
        let mut event = TransitionEvent::new(ctx.instance_id.clone(), step.name(), status)
            .with_detail(attributes::NAMESPACE_NAME, namespace)
            .with_detail(attributes::CLEANUP_REASON, reason.as_str());
        if let Some(sync_error) = sync_error {
            event = event.with_detail(attributes::CREDENTIAL_SYNC_ERROR, sync_error);
        }
        self.record(ctx, event).await;
        info!(saga_id = %ctx.instance_id, %namespace, cleanup_reason = %reason, "Namespace cleaned up");

        Ok(match (reason, sync_error) {
            (CleanupReason::Success, None) => StepOutput::complete(),
            (CleanupReason::Success, Some(_)) => {
                StepOutput::force_fail(CREDENTIAL_SYNC_FAILED_REASON)
            }
            (CleanupReason::Failed, _) => StepOutput::force_fail(CLUSTER_FAILED_REASON),
            (CleanupReason::Unset, _) => StepOutput::force_fail(NO_COMPLETION_RESULT_REASON),
        })
    }
}

#[async_trait]
impl DurableSaga for ProvisioningSaga {
    const TYPE_ID: &'static str = PROVISIONING_WORKFLOW;

    type Input = ProvisioningInput;
    type Step = ProvisioningStep;

    fn initial_step(&self) -> ProvisioningStep {
        ProvisioningStep::CreateNamespace
    }

    async fn execute(
        &self,
        step: ProvisioningStep,
        ctx: &StepContext,
        attributes: &Attributes,
        input: &ProvisioningInput,
    ) -> StepResult {
        let config = &input.cluster_config;
        match step {
            ProvisioningStep::CreateNamespace => self.create_namespace(ctx, attributes, config).await,
            ProvisioningStep::CreateJob => self.create_job(ctx, attributes, config).await,
            ProvisioningStep::CheckCompletion => self.check_completion(ctx, attributes).await,
            ProvisioningStep::SyncCredential => self.sync_credential(ctx, attributes, config).await,
            ProvisioningStep::Cleanup => self.cleanup(ctx, attributes).await,
        }
    }
}
