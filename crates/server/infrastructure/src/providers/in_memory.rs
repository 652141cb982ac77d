//! In-memory control plane.
//!
//! Behaves like the infrastructure cluster as far as the saga can observe:
//! namespaces own their secrets and jobs, creates are idempotent, deletes
//! cascade. The runner job finishes immediately with a configurable
//! outcome and, on success, publishes the workload kubeconfig secret.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use capi_server_domain::{ClusterConfig, ClusterLifecycle, CredentialRef, JobStatus, LifecycleError};

use super::script::{render_script, SCRIPT_KEY};

const DEFAULT_JOB_NAME: &str = "capi-runner";

#[derive(Debug, Default)]
struct ControlPlaneState {
    namespaces: BTreeSet<String>,
    /// (namespace, name) -> key -> value
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    jobs: BTreeMap<(String, String), JobStatus>,
}

#[derive(Debug)]
pub struct InMemoryControlPlane {
    state: RwLock<ControlPlaneState>,
    job_name: String,
    job_outcome: JobStatus,
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ControlPlaneState::default()),
            job_name: DEFAULT_JOB_NAME.to_string(),
            job_outcome: JobStatus::Succeeded,
        }
    }

    /// Status every runner job reports after creation.
    pub fn with_job_outcome(mut self, outcome: JobStatus) -> Self {
        self.job_outcome = outcome;
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.read().namespaces.contains(name)
    }

    pub fn namespace_count(&self) -> usize {
        self.state.read().namespaces.len()
    }

    pub fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.state
            .read()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|data| data.get(key).cloned())
    }

    fn workload_kubeconfig(config: &ClusterConfig) -> String {
        format!(
            "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: https://{name}.local:6443\ncontexts:\n- name: {name}\n  context:\n    cluster: {name}\n    user: {name}-admin\ncurrent-context: {name}\nusers:\n- name: {name}-admin\n  user: {{}}\n",
            name = config.cluster_name
        )
    }
}

#[async_trait]
impl ClusterLifecycle for InMemoryControlPlane {
    async fn create_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        let created = self.state.write().namespaces.insert(name.to_string());
        debug!(namespace = %name, created, "In-memory namespace ensured");
        Ok(())
    }

    async fn create_completion_job(
        &self,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<(), LifecycleError> {
        let script = render_script(config, namespace)?;
        let mut state = self.state.write();
        if !state.namespaces.contains(namespace) {
            return Err(LifecycleError::NotFound {
                kind: "namespace",
                name: namespace.to_string(),
            });
        }

        state.secrets.insert(
            (namespace.to_string(), namespace.to_string()),
            BTreeMap::from([(SCRIPT_KEY.to_string(), script)]),
        );
        state
            .jobs
            .entry((namespace.to_string(), self.job_name.clone()))
            .or_insert(self.job_outcome);
        if self.job_outcome == JobStatus::Succeeded {
            state.secrets.insert(
                (namespace.to_string(), config.kubeconfig_secret_name()),
                BTreeMap::from([("value".to_string(), Self::workload_kubeconfig(config))]),
            );
        }
        Ok(())
    }

    async fn get_job_status(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<JobStatus, LifecycleError> {
        Ok(self
            .state
            .read()
            .jobs
            .get(&(namespace.to_string(), job_name.to_string()))
            .copied()
            .unwrap_or(JobStatus::NotFound))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        let mut state = self.state.write();
        state.namespaces.remove(name);
        state.secrets.retain(|(ns, _), _| ns != name);
        state.jobs.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn sync_credential(
        &self,
        _source: &CredentialRef,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<String, LifecycleError> {
        let name = config.kubeconfig_secret_name();
        self.secret_value(namespace, &name, "value")
            .ok_or(LifecycleError::NotFound {
                kind: "secret",
                name,
            })
    }

    fn runner_job_name(&self) -> &str {
        &self.job_name
    }
}
