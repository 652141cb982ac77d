//! # capi-server-application
//!
//! Use cases of the provisioning server: the completion poller, the
//! provisioning saga with its engine adapter, and request intake.

pub mod config;
pub mod intake;
pub mod poller;
pub mod saga;

pub use config::{CredentialSyncFailurePolicy, SagaSettings};
pub use intake::{ClusterProvisioningService, IntakeError, KUBEVIRT_PROVIDER};
pub use poller::{poll_until, PollConfig, PollError, PollResult};
pub use saga::{
    InstanceSnapshot, InstanceStatus, ProvisioningInput, ProvisioningSaga, ProvisioningStep,
    RunnerError, SagaRunner, StepContext, WorkflowRegistry, PROVISIONING_WORKFLOW,
};
