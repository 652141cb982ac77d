//! Cluster configuration and intake payloads.
//!
//! [`ClusterConfig`] is the immutable saga input: it is fixed when the saga
//! starts and only ever read by the steps.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a cluster name.
///
/// Namespaces are named `<cluster>-<6 chars>` and must fit in a 63 character
/// DNS label.
pub const MAX_CLUSTER_NAME_LEN: usize = 56;

/// A pool of identical machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    #[serde(alias = "count")]
    pub machine_count: u32,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in GiB.
    #[serde(default = "default_memory")]
    pub memory: u32,
}

fn default_cpu() -> u32 {
    2
}

fn default_memory() -> u32 {
    4
}

impl MachinePool {
    pub fn new(machine_count: u32) -> Self {
        Self {
            machine_count,
            cpu: default_cpu(),
            memory: default_memory(),
        }
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_memory(mut self, memory: u32) -> Self {
        self.memory = memory;
        self
    }
}

/// Reference to the credential used to reach the infrastructure cluster.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Admin kubeconfig (YAML) of the infrastructure cluster.
    #[serde(default)]
    pub kubeconfig: String,
}

impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRef")
            .field("kubeconfig", &"<redacted>")
            .finish()
    }
}

impl CredentialRef {
    pub fn new(kubeconfig: impl Into<String>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }
}

/// Immutable input of a provisioning saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub cluster_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    /// Dedicated control plane machines; `None` means a hosted control plane.
    #[serde(default)]
    pub control_plane: Option<MachinePool>,
    #[serde(default)]
    pub worker_pools: Vec<MachinePool>,
    #[serde(default)]
    pub credential: CredentialRef,
}

fn default_kubernetes_version() -> String {
    "v1.31.0".to_string()
}

/// Reasons a [`ClusterConfig`] is rejected before a saga starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("cluster name '{name}' exceeds {max} characters")]
    ClusterNameTooLong { name: String, max: usize },

    #[error("cluster name '{0}' must be a lowercase RFC 1123 label")]
    InvalidClusterName(String),

    #[error("at least one worker pool is required")]
    NoWorkerPools,

    #[error("worker pool {index} must have at least one machine")]
    EmptyWorkerPool { index: usize },
}

impl ClusterConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: String::new(),
            kubernetes_version: default_kubernetes_version(),
            control_plane: None,
            worker_pools: Vec::new(),
            credential: CredentialRef::default(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = version.into();
        self
    }

    pub fn with_control_plane(mut self, pool: MachinePool) -> Self {
        self.control_plane = Some(pool);
        self
    }

    pub fn with_worker_pool(mut self, pool: MachinePool) -> Self {
        self.worker_pools.push(pool);
        self
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = credential;
        self
    }

    /// Name of the secret the runner job writes the workload kubeconfig to.
    pub fn kubeconfig_secret_name(&self) -> String {
        format!("{}-kubeconfig", self.cluster_name)
    }

    /// First worker pool, which sizes the generated cluster.
    pub fn primary_worker_pool(&self) -> Option<&MachinePool> {
        self.worker_pools.first()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let name = &self.cluster_name;
        if name.is_empty() {
            return Err(ConfigValidationError::EmptyClusterName);
        }
        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(ConfigValidationError::ClusterNameTooLong {
                name: name.clone(),
                max: MAX_CLUSTER_NAME_LEN,
            });
        }
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_chars || name.starts_with('-') || name.ends_with('-') {
            return Err(ConfigValidationError::InvalidClusterName(name.clone()));
        }
        if self.worker_pools.is_empty() {
            return Err(ConfigValidationError::NoWorkerPools);
        }
        if let Some(index) = self.worker_pools.iter().position(|p| p.machine_count == 0) {
            return Err(ConfigValidationError::EmptyWorkerPool { index });
        }
        Ok(())
    }
}

/// Provider specific options forwarded untouched to cluster import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportOptions(pub serde_json::Value);

/// Body of a provisioning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    #[serde(rename = "capiClusterConfig", alias = "clusterConfig")]
    pub cluster_config: ClusterConfig,
    #[serde(default)]
    pub import_options: ImportOptions,
}

/// Response returned as soon as a provisioning saga is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOptions {
    pub name: String,
    pub region: String,
    pub cluster_id: String,
}
