//! # capi-server-infrastructure
//!
//! Adapters for the domain ports:
//!
//! - [`providers::kubernetes`]: kube-rs [`ClusterLifecycle`](capi_server_domain::ClusterLifecycle)
//! - [`providers::in_memory`]: in-memory control plane for development mode
//! - [`persistence::history`]: in-memory [`HistoryRecorder`](capi_server_domain::HistoryRecorder)

pub mod persistence;
pub mod providers;

pub use persistence::InMemoryHistoryRecorder;
pub use providers::{InMemoryControlPlane, KubernetesLifecycleClient, KubernetesSettings};
