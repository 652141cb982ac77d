//! # capi-server-domain
//!
//! Domain model for provisioning virtual clusters through a saga.
//!
//! ## Modules
//!
//! - [`shared_kernel`]: identifiers shared by every layer ([`SagaId`])
//! - [`cluster`]: cluster configuration and intake payloads
//! - [`saga`]: durable attributes and step decisions
//! - [`history`]: transition events and the [`HistoryRecorder`] port
//! - [`lifecycle`]: the [`ClusterLifecycle`] port over the control plane

pub mod cluster;
pub mod history;
pub mod lifecycle;
pub mod saga;
pub mod shared_kernel;

pub use cluster::{
    ClusterConfig, ConfigValidationError, CredentialRef, ImportOptions, MachinePool,
    ProviderOptions, ProvisionRequest,
};
pub use history::{HistoryError, HistoryRecorder, StepStatus, TransitionEvent};
pub use lifecycle::{ClusterLifecycle, JobStatus, LifecycleError};
pub use saga::{
    AttributeUpdates, Attributes, CleanupReason, SagaOutcome, StepDecision, StepError,
    StepOutput, attributes,
};
pub use shared_kernel::SagaId;
