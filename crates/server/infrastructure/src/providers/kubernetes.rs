//! Kubernetes Cluster Lifecycle Client
//!
//! [`ClusterLifecycle`] over the infrastructure cluster using kube-rs.
//! Creates tolerate `409 Conflict` and deletes tolerate `404 Not Found`, so
//! every operation can be replayed after a crash.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Namespace, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use capi_server_application::{poll_until, PollConfig, PollError};
use capi_server_domain::{ClusterConfig, ClusterLifecycle, CredentialRef, JobStatus, LifecycleError};

use super::script::{render_script, resolve_deployer_image, SCRIPT_KEY};

pub const RUNNER_CONTAINER_NAME: &str = "capi-script-runner";
pub const SCRIPT_MOUNT_PATH: &str = "/etc/capi-script";
pub const DATA_MOUNT_PATH: &str = "/data";
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";
/// Key of the workload kubeconfig inside the generated secret.
pub const KUBECONFIG_SECRET_KEY: &str = "value";
const FIELD_MANAGER: &str = "capi-server";

// =============================================================================
// Settings
// =============================================================================

/// Connection and job settings for the infrastructure cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    /// Path to kubeconfig file (None = infer: in-cluster or `~/.kube/config`)
    pub kubeconfig_path: Option<String>,
    /// Kubeconfig context to use (None = current-context)
    pub context: Option<String>,
    pub runner_job_name: String,
    /// Image used when no entry of `deployer_images` matches.
    pub default_image: String,
    /// Deployer image per Kubernetes `major.minor`.
    pub deployer_images: BTreeMap<String, String>,
    pub run_as_user: i64,
    pub run_as_group: i64,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            kubeconfig_path: None,
            context: None,
            runner_job_name: "capi-runner".to_string(),
            default_image: "ghcr.io/appscode/capi-deployer:latest".to_string(),
            deployer_images: BTreeMap::new(),
            run_as_user: 1000,
            run_as_group: 1000,
        }
    }
}

// =============================================================================
// Error mapping
// =============================================================================

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Map a kube error on `kind`/`name` to the port's error type.
pub fn classify(kind: &'static str, name: &str, err: kube::Error) -> LifecycleError {
    if is_not_found(&err) {
        LifecycleError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else {
        LifecycleError::api(kind, name, err)
    }
}

// =============================================================================
// Resource builders
// =============================================================================

/// Opaque secret holding the rendered runner script. Named after the
/// namespace it lives in.
pub fn build_script_secret(namespace: &str, script: String) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(SCRIPT_KEY.to_string(), script)])),
        ..Default::default()
    }
}

/// Runner job: one attempt, never restarted, non-root.
pub fn build_runner_job(
    settings: &KubernetesSettings,
    config: &ClusterConfig,
    namespace: &str,
    image: &str,
) -> Job {
    let container = Container {
        name: RUNNER_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![format!("{}/{}", SCRIPT_MOUNT_PATH, SCRIPT_KEY)]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "script".to_string(),
                mount_path: SCRIPT_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(settings.run_as_user),
            run_as_group: Some(settings.run_as_group),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "script".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(namespace.to_string()),
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            name: Some(settings.runner_job_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                config.cluster_name.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Workload kubeconfig stored in the generated secret, validated.
pub fn extract_kubeconfig(secret: &Secret) -> Result<String, LifecycleError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .map(|b| b.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
                .map(|s| s.clone().into_bytes())
        })
        .ok_or_else(|| {
            LifecycleError::Credential(format!(
                "secret {} has no '{}' key",
                name, KUBECONFIG_SECRET_KEY
            ))
        })?;

    let kubeconfig = String::from_utf8(raw).map_err(|e| {
        LifecycleError::Credential(format!("secret {} is not valid UTF-8: {}", name, e))
    })?;
    Kubeconfig::from_yaml(&kubeconfig).map_err(|e| {
        LifecycleError::Credential(format!("secret {} is not a kubeconfig: {}", name, e))
    })?;
    Ok(kubeconfig)
}

// =============================================================================
// Client
// =============================================================================

/// kube-rs backed [`ClusterLifecycle`]. `Client` is a pooled, cloneable
/// handle, so one instance serves every saga.
#[derive(Clone)]
pub struct KubernetesLifecycleClient {
    client: Client,
    settings: KubernetesSettings,
    credential_wait: PollConfig,
}

impl std::fmt::Debug for KubernetesLifecycleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesLifecycleClient")
            .field("settings", &self.settings)
            .field("credential_wait", &self.credential_wait)
            .finish_non_exhaustive()
    }
}

impl KubernetesLifecycleClient {
    pub async fn new(
        settings: KubernetesSettings,
        credential_wait: PollConfig,
    ) -> Result<Self, LifecycleError> {
        let client = Self::create_client(&settings).await?;
        Ok(Self::with_client(client, settings, credential_wait))
    }

    pub fn with_client(client: Client, settings: KubernetesSettings, credential_wait: PollConfig) -> Self {
        Self {
            client,
            settings,
            credential_wait,
        }
    }

    async fn create_client(settings: &KubernetesSettings) -> Result<Client, LifecycleError> {
        let kube_config = match &settings.kubeconfig_path {
            Some(path) => {
                let options = KubeConfigOptions {
                    context: settings.context.clone(),
                    cluster: None,
                    user: None,
                };
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    LifecycleError::Client(format!("Failed to read kubeconfig from {}: {}", path, e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        LifecycleError::Client(format!("Failed to create Kubernetes config: {}", e))
                    })?
            }
            None => Config::infer().await.map_err(|e| {
                LifecycleError::Client(format!("Failed to infer Kubernetes config: {}", e))
            })?,
        };

        Client::try_from(kube_config)
            .map_err(|e| LifecycleError::Client(format!("Failed to create Kubernetes client: {}", e)))
    }

    /// Client for the cluster described by `source`; the server's own client
    /// when the reference carries no kubeconfig.
    async fn client_for(&self, source: &CredentialRef) -> Result<Client, LifecycleError> {
        if source.kubeconfig.trim().is_empty() {
            return Ok(self.client.clone());
        }
        let kubeconfig = Kubeconfig::from_yaml(&source.kubeconfig)
            .map_err(|e| LifecycleError::Credential(format!("admin kubeconfig: {}", e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| LifecycleError::Credential(format!("admin kubeconfig: {}", e)))?;
        Client::try_from(config).map_err(|e| LifecycleError::Client(e.to_string()))
    }

    /// Create the script secret, replacing the script of an existing one.
    async fn store_script(&self, namespace: &str, script: String) -> Result<(), LifecycleError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = build_script_secret(namespace, script);

        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                debug!(%namespace, "Script secret created");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                let patch = serde_json::json!({ "stringData": secret.string_data });
                secrets
                    .patch(namespace, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(|e| classify("secret", namespace, e))?;
                debug!(%namespace, "Script secret updated");
                Ok(())
            }
            Err(e) => Err(classify("secret", namespace, e)),
        }
    }
}

#[async_trait]
impl ClusterLifecycle for KubernetesLifecycleClient {
    async fn create_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace created");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                info!(namespace = %name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(classify("namespace", name, e)),
        }
    }

    async fn create_completion_job(
        &self,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<(), LifecycleError> {
        let script = render_script(config, namespace)?;
        self.store_script(namespace, script).await?;

        let image = resolve_deployer_image(
            &config.kubernetes_version,
            &self.settings.deployer_images,
            &self.settings.default_image,
        )?;
        let job = build_runner_job(&self.settings, config, namespace, &image);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);

        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(%namespace, job = %self.settings.runner_job_name, %image, "Runner job created");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                info!(%namespace, job = %self.settings.runner_job_name, "Runner job already exists");
                Ok(())
            }
            Err(e) => Err(classify("job", &self.settings.runner_job_name, e)),
        }
    }

    async fn get_job_status(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<JobStatus, LifecycleError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = jobs
            .get_opt(job_name)
            .await
            .map_err(|e| classify("job", job_name, e))?;

        Ok(match job.and_then(|j| j.status) {
            None => JobStatus::NotFound,
            Some(status) => JobStatus::from_counts(
                status.succeeded.unwrap_or(0),
                status.failed.unwrap_or(0),
            ),
        })
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace deletion requested");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(namespace = %name, "Namespace already deleted");
                Ok(())
            }
            Err(e) => Err(classify("namespace", name, e)),
        }
    }

    async fn sync_credential(
        &self,
        source: &CredentialRef,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<String, LifecycleError> {
        let client = self.client_for(source).await?;
        let secrets: Api<Secret> = Api::namespaced(client, namespace);
        let name = config.kubeconfig_secret_name();
        let found: Mutex<Option<Secret>> = Mutex::new(None);

        let secrets_ref = &secrets;
        let name_ref = name.as_str();
        let found_ref = &found;
        let check = || async move {
            match secrets_ref.get_opt(name_ref).await {
                Ok(Some(secret)) => {
                    *found_ref.lock() = Some(secret);
                    Ok(true)
                }
                Ok(None) => {
                    debug!(%namespace, secret = %name_ref, "Waiting for kubeconfig secret");
                    Ok(false)
                }
                Err(e) => Err(classify("secret", name_ref, e)),
            }
        };

        // The caller cancels by dropping this future.
        let never = CancellationToken::new();
        match poll_until(check, self.credential_wait, &never).await {
            Ok(()) => {}
            Err(PollError::Check(e)) => return Err(e),
            Err(PollError::Timeout { elapsed }) => {
                warn!(%namespace, secret = %name, "Kubeconfig secret did not appear");
                return Err(LifecycleError::Timeout {
                    what: format!("secret {}/{}", namespace, name),
                    elapsed_secs: elapsed.as_secs(),
                });
            }
            Err(PollError::Cancelled) => return Err(LifecycleError::Cancelled),
        }

        let secret = found.lock().take().ok_or_else(|| LifecycleError::NotFound {
            kind: "secret",
            name: name.clone(),
        })?;
        extract_kubeconfig(&secret)
    }

    fn runner_job_name(&self) -> &str {
        &self.settings.runner_job_name
    }
}
