//! Provisioning saga and the in-process engine adapter that drives it.
//!
//! - [`provisioning`]: the five-step state machine
//! - [`registry`]: saga abstraction and the explicit [`WorkflowRegistry`]
//! - [`runner`]: [`SagaRunner`], which owns instance attributes and status

pub mod provisioning;
pub mod registry;
pub mod runner;

pub use provisioning::{
    generate_namespace_name, ProvisioningError, ProvisioningInput, ProvisioningSaga,
    ProvisioningStep, CLUSTER_FAILED_REASON, CREDENTIAL_SYNC_FAILED_REASON,
    NO_COMPLETION_RESULT_REASON, PROVISIONING_WORKFLOW,
};
pub use registry::{DurableSaga, DynSaga, StepContext, StepJournal, WorkflowRegistry};
pub use runner::{InstanceSnapshot, InstanceStatus, RunnerError, SagaRunner};
