//! Cluster Lifecycle Client implementations.

pub mod in_memory;
pub mod kubernetes;
pub mod script;

pub use in_memory::InMemoryControlPlane;
pub use kubernetes::{KubernetesLifecycleClient, KubernetesSettings};
