//! Saga abstraction and the explicit workflow registry.
//!
//! A [`DurableSaga`] is written against the engine's step/attribute model:
//! it executes one named step at a time and returns attribute updates plus
//! the next step. [`DynSaga`] erases the step and input types so different
//! sagas can share one [`WorkflowRegistry`], which is built at process start
//! and handed to the engine adapter.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use capi_server_domain::{
    AttributeUpdates, Attributes, SagaId, SagaOutcome, StepDecision, StepError, StepOutput,
};

/// Per-invocation context handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: SagaId,
    /// Fires when the engine cancels the step (shutdown or step timeout).
    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(instance_id: SagaId, cancellation: CancellationToken) -> Self {
        Self {
            instance_id,
            cancellation,
        }
    }
}

/// A saga expressed as named steps over durable attributes.
#[async_trait]
pub trait DurableSaga: Send + Sync + 'static {
    /// Workflow type id used for registration.
    const TYPE_ID: &'static str;

    type Input: DeserializeOwned + Send + Sync;
    type Step: Copy + Send + Sync + Display + Debug + 'static;

    fn initial_step(&self) -> Self::Step;

    /// Run one step. Must be safe to re-invoke with the same attributes.
    async fn execute(
        &self,
        step: Self::Step,
        ctx: &StepContext,
        attributes: &Attributes,
        input: &Self::Input,
    ) -> Result<StepOutput<Self::Step>, StepError>;
}

/// Engine-side persistence of one instance, as seen by the drive loop.
pub trait StepJournal: Send + Sync {
    fn step_started(&self, step: &str);

    /// Snapshot of the durable attributes.
    fn attributes(&self) -> Attributes;

    /// Persist the updates produced by a step.
    fn commit(&self, updates: &AttributeUpdates) -> Result<(), StepError>;
}

/// Type-erased saga for storage in the registry.
#[async_trait]
pub trait DynSaga: Send + Sync {
    fn saga_type(&self) -> &'static str;

    /// Drive the saga from its initial step to a terminal outcome.
    async fn run_dyn(
        &self,
        ctx: &StepContext,
        input: serde_json::Value,
        journal: &dyn StepJournal,
    ) -> SagaOutcome;
}

#[async_trait]
impl<S: DurableSaga> DynSaga for S {
    fn saga_type(&self) -> &'static str {
        S::TYPE_ID
    }

    async fn run_dyn(
        &self,
        ctx: &StepContext,
        input: serde_json::Value,
        journal: &dyn StepJournal,
    ) -> SagaOutcome {
        let input: S::Input = match serde_json::from_value(input) {
            Ok(input) => input,
            Err(e) => {
                error!(saga_id = %ctx.instance_id, "Invalid input for {}: {}", S::TYPE_ID, e);
                return SagaOutcome::Failed {
                    step: "input".to_string(),
                    error: format!("invalid input for {}: {}", S::TYPE_ID, e),
                };
            }
        };

        let mut step = self.initial_step();
        loop {
            let step_name = step.to_string();
            journal.step_started(&step_name);

            let span = info_span!("saga_step", saga_id = %ctx.instance_id, step = %step_name);
            let attributes = journal.attributes();
            let output = match self
                .execute(step, ctx, &attributes, &input)
                .instrument(span)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    error!(saga_id = %ctx.instance_id, step = %step_name, error = %e, "Saga step failed");
                    return SagaOutcome::Failed {
                        step: step_name,
                        error: e.to_string(),
                    };
                }
            };

            if let Err(e) = journal.commit(&output.updates) {
                error!(saga_id = %ctx.instance_id, step = %step_name, error = %e, "Rejected attribute updates");
                return SagaOutcome::Failed {
                    step: step_name,
                    error: e.to_string(),
                };
            }

            match output.decision {
                StepDecision::Next(next) => {
                    info!(saga_id = %ctx.instance_id, from = %step_name, to = %next, "Saga advancing");
                    step = next;
                }
                StepDecision::Complete => {
                    info!(saga_id = %ctx.instance_id, "Saga completed");
                    return SagaOutcome::Completed;
                }
                StepDecision::ForceFail { reason } => {
                    info!(saga_id = %ctx.instance_id, %reason, "Saga force-failed");
                    return SagaOutcome::ForceFailed { reason };
                }
            }
        }
    }
}

/// Registry of sagas by workflow type id.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<String, Arc<dyn DynSaga>>,
}

impl Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.workflow_keys())
            .finish()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
        }
    }

    pub fn register<S: DurableSaga>(&self, saga: S) {
        self.workflows.insert(S::TYPE_ID.to_string(), Arc::new(saga));
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<dyn DynSaga>> {
        self.workflows.get(type_id).map(|r| r.value().clone())
    }

    pub fn has_workflow(&self, type_id: &str) -> bool {
        self.workflows.contains_key(type_id)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn workflow_keys(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }
}
