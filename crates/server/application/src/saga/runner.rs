//! In-process engine adapter.
//!
//! [`SagaRunner`] plays the durable-execution engine for the sagas in a
//! [`WorkflowRegistry`]: it owns the attribute store and status of every
//! instance, drives one step at a time and applies the step's attribute
//! updates before the next step runs. It does not retry steps.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use capi_server_domain::{attributes, AttributeUpdates, Attributes, SagaId, SagaOutcome, StepError};

use super::registry::{DynSaga, StepContext, StepJournal, WorkflowRegistry};

/// Attributes never exposed through [`InstanceSnapshot`].
const REDACTED_ATTRIBUTES: &[&str] = &[attributes::WORKLOAD_KUBECONFIG];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("unknown workflow type '{0}'")]
    UnknownWorkflow(String),

    #[error("saga instance {0} already started")]
    AlreadyStarted(SagaId),

    #[error("runner is shutting down")]
    ShuttingDown,
}

/// Lifecycle state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceStatus {
    Running { step: String },
    Completed,
    ForceFailed { reason: String },
    Failed { step: String, error: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

impl From<SagaOutcome> for InstanceStatus {
    fn from(outcome: SagaOutcome) -> Self {
        match outcome {
            SagaOutcome::Completed => Self::Completed,
            SagaOutcome::ForceFailed { reason } => Self::ForceFailed { reason },
            SagaOutcome::Failed { step, error } => Self::Failed { step, error },
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    workflow: &'static str,
    status: InstanceStatus,
    attributes: Attributes,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Read model of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: SagaId,
    pub workflow: String,
    pub status: InstanceStatus,
    pub attributes: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Journal over one entry of the runner's instance table.
struct InstanceJournal {
    id: SagaId,
    instances: Arc<DashMap<SagaId, InstanceRecord>>,
}

impl StepJournal for InstanceJournal {
    fn step_started(&self, step: &str) {
        if let Some(mut record) = self.instances.get_mut(&self.id) {
            record.status = InstanceStatus::Running {
                step: step.to_string(),
            };
            record.updated_at = Utc::now();
        }
    }

    fn attributes(&self) -> Attributes {
        self.instances
            .get(&self.id)
            .map(|r| r.attributes.clone())
            .unwrap_or_default()
    }

    fn commit(&self, updates: &AttributeUpdates) -> Result<(), StepError> {
        if updates.is_empty() {
            return Ok(());
        }
        match self.instances.get_mut(&self.id) {
            Some(mut record) => {
                record.attributes.apply(updates)?;
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl InstanceJournal {
    fn finish(&self, outcome: &SagaOutcome) {
        if let Some(mut record) = self.instances.get_mut(&self.id) {
            record.status = outcome.clone().into();
            record.updated_at = Utc::now();
        }
    }
}

pub struct SagaRunner {
    registry: Arc<WorkflowRegistry>,
    instances: Arc<DashMap<SagaId, InstanceRecord>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for SagaRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRunner")
            .field("registry", &self.registry)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl SagaRunner {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self::with_shutdown_token(registry, CancellationToken::new())
    }

    /// Instances get child tokens of `shutdown`; cancelling it cancels them
    /// all.
    pub fn with_shutdown_token(registry: Arc<WorkflowRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            instances: Arc::new(DashMap::new()),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    fn admit(
        &self,
        workflow: &str,
        id: &SagaId,
    ) -> Result<(Arc<dyn DynSaga>, StepContext, InstanceJournal), RunnerError> {
        if self.shutdown.is_cancelled() {
            return Err(RunnerError::ShuttingDown);
        }
        let saga = self
            .registry
            .get(workflow)
            .ok_or_else(|| RunnerError::UnknownWorkflow(workflow.to_string()))?;

        match self.instances.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RunnerError::AlreadyStarted(id.clone())),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                slot.insert(InstanceRecord {
                    workflow: saga.saga_type(),
                    status: InstanceStatus::Running {
                        step: String::new(),
                    },
                    attributes: Attributes::new(),
                    started_at: now,
                    updated_at: now,
                });
            }
        }

        let ctx = StepContext::new(id.clone(), self.shutdown.child_token());
        let journal = InstanceJournal {
            id: id.clone(),
            instances: self.instances.clone(),
        };
        Ok((saga, ctx, journal))
    }

    async fn drive(
        saga: Arc<dyn DynSaga>,
        ctx: StepContext,
        input: serde_json::Value,
        journal: InstanceJournal,
    ) -> SagaOutcome {
        let outcome = saga.run_dyn(&ctx, input, &journal).await;
        journal.finish(&outcome);
        if outcome.is_success() {
            info!(saga_id = %ctx.instance_id, "Saga instance finished");
        } else {
            warn!(saga_id = %ctx.instance_id, outcome = ?outcome, "Saga instance finished unsuccessfully");
        }
        outcome
    }

    /// Start an instance in the background and return immediately.
    pub fn start(
        &self,
        workflow: &str,
        id: SagaId,
        input: serde_json::Value,
    ) -> Result<(), RunnerError> {
        let (saga, ctx, journal) = self.admit(workflow, &id)?;
        info!(saga_id = %id, workflow, "Starting saga instance");
        self.tracker.spawn(Self::drive(saga, ctx, input, journal));
        Ok(())
    }

    /// Run an instance to its terminal outcome on the current task.
    pub async fn run(
        &self,
        workflow: &str,
        id: SagaId,
        input: serde_json::Value,
    ) -> Result<SagaOutcome, RunnerError> {
        let (saga, ctx, journal) = self.admit(workflow, &id)?;
        Ok(Self::drive(saga, ctx, input, journal).await)
    }

    pub fn status(&self, id: &SagaId) -> Option<InstanceStatus> {
        self.instances.get(id).map(|r| r.status.clone())
    }

    /// Durable attributes of an instance, sensitive values included.
    pub fn attributes(&self, id: &SagaId) -> Option<Attributes> {
        self.instances.get(id).map(|r| r.attributes.clone())
    }

    pub fn snapshot(&self, id: &SagaId) -> Option<InstanceSnapshot> {
        self.instances.get(id).map(|r| {
            let mut attributes = BTreeMap::new();
            for key in [
                attributes::NAMESPACE_NAME,
                attributes::CLEANUP_REASON,
                attributes::INFRA_NAMESPACE,
                attributes::CREDENTIAL_SYNC_ERROR,
            ] {
                if let Some(value) = r.attributes.get(key) {
                    attributes.insert(key.to_string(), value.to_string());
                }
            }
            for key in REDACTED_ATTRIBUTES {
                if r.attributes.contains(key) {
                    attributes.insert(key.to_string(), "<redacted>".to_string());
                }
            }
            InstanceSnapshot {
                id: id.clone(),
                workflow: r.workflow.to_string(),
                status: r.status.clone(),
                attributes,
                started_at: r.started_at,
                updated_at: r.updated_at,
            }
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Wait for every background instance to reach a terminal state.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel every running instance and wait for them to stop.
    pub async fn shutdown(&self) {
        info!(running = self.tracker.len(), "Shutting down saga runner");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
