//! Provisioning saga scenarios driven through the in-process runner.

use async_trait::async_trait;
use parking_lot::Mutex;
use rstest::rstest;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use capi_server_application::saga::{
    DurableSaga, ProvisioningInput, ProvisioningSaga, ProvisioningStep, StepContext,
    CLUSTER_FAILED_REASON, CREDENTIAL_SYNC_FAILED_REASON, PROVISIONING_WORKFLOW,
};
use capi_server_application::{
    ClusterProvisioningService, CredentialSyncFailurePolicy, InstanceStatus, IntakeError,
    SagaRunner, SagaSettings, WorkflowRegistry,
};
use capi_server_domain::{
    attributes, AttributeUpdates, Attributes, CleanupReason, ClusterConfig, ClusterLifecycle,
    CredentialRef, HistoryError, HistoryRecorder, ImportOptions, JobStatus, LifecycleError,
    MachinePool, ProvisionRequest, SagaId, SagaOutcome, StepDecision, StepStatus,
    TransitionEvent,
};

const WORKLOAD_KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nclusters: []\n";

// =============================================================================
// Mocks
// =============================================================================

/// Scripted control plane that records every call.
#[derive(Default)]
struct MockLifecycle {
    namespaces: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    job_statuses: Mutex<VecDeque<JobStatus>>,
    fail_create_namespace: bool,
    fail_create_job: bool,
    fail_delete: bool,
    fail_sync: bool,
}

impl MockLifecycle {
    /// Job statuses returned in order; the last one repeats.
    fn with_job_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            job_statuses: Mutex::new(statuses.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(op))
            .cloned()
            .collect()
    }

    fn log(&self, op: &str, arg: &str) {
        self.calls.lock().push(format!("{}:{}", op, arg));
    }
}

#[async_trait]
impl ClusterLifecycle for MockLifecycle {
    async fn create_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        self.log("create_namespace", name);
        if self.fail_create_namespace {
            return Err(LifecycleError::api("namespace", name, "forbidden"));
        }
        self.namespaces.lock().insert(name.to_string());
        Ok(())
    }

    async fn create_completion_job(
        &self,
        _config: &ClusterConfig,
        namespace: &str,
    ) -> Result<(), LifecycleError> {
        self.log("create_job", namespace);
        if self.fail_create_job {
            return Err(LifecycleError::Script("missing template".into()));
        }
        Ok(())
    }

    async fn get_job_status(
        &self,
        namespace: &str,
        _job_name: &str,
    ) -> Result<JobStatus, LifecycleError> {
        self.log("get_job_status", namespace);
        let mut statuses = self.job_statuses.lock();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        Ok(status.unwrap_or(JobStatus::Pending))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), LifecycleError> {
        self.log("delete_namespace", name);
        if self.fail_delete {
            return Err(LifecycleError::api("namespace", name, "connection refused"));
        }
        self.namespaces.lock().remove(name);
        Ok(())
    }

    async fn sync_credential(
        &self,
        _source: &CredentialRef,
        config: &ClusterConfig,
        namespace: &str,
    ) -> Result<String, LifecycleError> {
        self.log("sync_credential", namespace);
        if self.fail_sync {
            return Err(LifecycleError::Timeout {
                what: format!("secret {}", config.kubeconfig_secret_name()),
                elapsed_secs: 600,
            });
        }
        Ok(WORKLOAD_KUBECONFIG.to_string())
    }

    fn runner_job_name(&self) -> &str {
        "capi-runner"
    }
}

#[derive(Default)]
struct MockHistory {
    events: Mutex<HashMap<SagaId, Vec<TransitionEvent>>>,
}

#[async_trait]
impl HistoryRecorder for MockHistory {
    async fn save(&self, instance_id: &SagaId, event: TransitionEvent) -> Result<(), HistoryError> {
        self.events
            .lock()
            .entry(instance_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get(&self, instance_id: &SagaId) -> Result<Vec<TransitionEvent>, HistoryError> {
        Ok(self.events.lock().get(instance_id).cloned().unwrap_or_default())
    }
}

struct UnavailableHistory;

#[async_trait]
impl HistoryRecorder for UnavailableHistory {
    async fn save(&self, _: &SagaId, _: TransitionEvent) -> Result<(), HistoryError> {
        Err(HistoryError::Unavailable("connection reset".into()))
    }

    async fn get(&self, _: &SagaId) -> Result<Vec<TransitionEvent>, HistoryError> {
        Err(HistoryError::Unavailable("connection reset".into()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn demo_config() -> ClusterConfig {
    ClusterConfig::new("demo")
        .with_region("eu-west")
        .with_worker_pool(MachinePool::new(1))
        .with_credential(CredentialRef::new("apiVersion: v1\nkind: Config\n"))
}

fn settings() -> SagaSettings {
    SagaSettings::default().with_poll(10, 60)
}

struct Harness {
    lifecycle: Arc<MockLifecycle>,
    history: Arc<MockHistory>,
    runner: SagaRunner,
}

impl Harness {
    fn new(lifecycle: MockLifecycle, settings: SagaSettings) -> Self {
        let lifecycle = Arc::new(lifecycle);
        let history = Arc::new(MockHistory::default());
        let registry = WorkflowRegistry::new();
        registry.register(ProvisioningSaga::new(
            lifecycle.clone(),
            history.clone(),
            settings,
        ));
        Self {
            lifecycle,
            history,
            runner: SagaRunner::new(Arc::new(registry)),
        }
    }

    async fn run(&self, id: &str) -> SagaOutcome {
        let input = serde_json::to_value(ProvisioningInput::new(demo_config())).unwrap();
        self.runner
            .run(PROVISIONING_WORKFLOW, SagaId::new(id), input)
            .await
            .unwrap()
    }

    async fn events(&self, id: &str) -> Vec<(String, StepStatus)> {
        self.history
            .get(&SagaId::new(id))
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.step_name, e.outcome))
            .collect()
    }

    fn attributes(&self, id: &str) -> Attributes {
        self.runner.attributes(&SagaId::new(id)).unwrap()
    }
}

fn ev(step: &str, status: StepStatus) -> (String, StepStatus) {
    (step.to_string(), status)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_successful_build_cleans_up_and_completes() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[
            JobStatus::NotFound,
            JobStatus::Pending,
            JobStatus::Succeeded,
        ]),
        settings(),
    );

    let outcome = h.run("kubevirt-a").await;

    assert_eq!(outcome, SagaOutcome::Completed);
    assert_eq!(
        h.runner.status(&SagaId::new("kubevirt-a")),
        Some(InstanceStatus::Completed)
    );

    let attrs = h.attributes("kubevirt-a");
    let namespace = attrs.namespace_name().unwrap().to_string();
    assert!(namespace.starts_with("demo-"));
    assert_eq!(namespace.len(), "demo-".len() + 6);
    assert_eq!(attrs.cleanup_reason(), CleanupReason::Success);
    assert_eq!(attrs.get(attributes::WORKLOAD_KUBECONFIG), Some(WORKLOAD_KUBECONFIG));
    assert_eq!(attrs.get(attributes::INFRA_NAMESPACE), Some(namespace.as_str()));

    assert_eq!(h.lifecycle.calls_of("get_job_status").len(), 3);
    assert_eq!(
        h.lifecycle.calls_of("delete_namespace"),
        vec![format!("delete_namespace:{}", namespace)]
    );
    assert!(h.lifecycle.namespaces.lock().is_empty());

    assert_eq!(
        h.events("kubevirt-a").await,
        vec![
            ev("CreateNamespace", StepStatus::Success),
            ev("CreateJob", StepStatus::Success),
            ev("CheckCompletion", StepStatus::Running),
            ev("CheckCompletion", StepStatus::Success),
            ev("SyncCredential", StepStatus::Success),
            ev("Cleanup", StepStatus::Success),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_history_never_contains_workload_kubeconfig() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[JobStatus::Succeeded]),
        settings(),
    );

    h.run("kubevirt-secret").await;

    let history = h.history.get(&SagaId::new("kubevirt-secret")).await.unwrap();
    let json = serde_json::to_string(&history).unwrap();
    assert!(!json.contains("kind: Config"));

    let snapshot = h.runner.snapshot(&SagaId::new("kubevirt-secret")).unwrap();
    assert_eq!(
        snapshot.attributes.get(attributes::WORKLOAD_KUBECONFIG).map(String::as_str),
        Some("<redacted>")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_compensates_and_force_fails() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[JobStatus::Pending, JobStatus::Failed]),
        settings(),
    );

    let outcome = h.run("kubevirt-b").await;

    assert_eq!(
        outcome,
        SagaOutcome::ForceFailed {
            reason: CLUSTER_FAILED_REASON.to_string()
        }
    );
    assert_eq!(h.attributes("kubevirt-b").cleanup_reason(), CleanupReason::Failed);
    assert!(h.lifecycle.calls_of("sync_credential").is_empty());
    assert_eq!(h.lifecycle.calls_of("delete_namespace").len(), 1);

    let history = h.history.get(&SagaId::new("kubevirt-b")).await.unwrap();
    let check = history
        .iter()
        .rfind(|e| e.step_name == "CheckCompletion")
        .unwrap();
    assert_eq!(check.outcome, StepStatus::Failed);
    assert_eq!(check.detail("error"), Some("failed to perform cluster operation"));

    let cleanup = history.last().unwrap();
    assert_eq!(cleanup.step_name, "Cleanup");
    assert_eq!(cleanup.outcome, StepStatus::Failed);
    assert_eq!(cleanup.detail(attributes::CLEANUP_REASON), Some("failed"));
}

#[tokio::test(start_paused = true)]
async fn test_job_timeout_takes_compensation_path() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[JobStatus::Pending]),
        settings(),
    );
    let started = tokio::time::Instant::now();

    let outcome = h.run("kubevirt-c").await;

    assert_eq!(
        outcome,
        SagaOutcome::ForceFailed {
            reason: CLUSTER_FAILED_REASON.to_string()
        }
    );
    assert!(started.elapsed() <= Duration::from_secs(60 + 10));
    assert_eq!(h.lifecycle.calls_of("delete_namespace").len(), 1);

    let history = h.history.get(&SagaId::new("kubevirt-c")).await.unwrap();
    let check = history
        .iter()
        .rfind(|e| e.step_name == "CheckCompletion")
        .unwrap();
    assert!(check.detail("error").unwrap().contains("timed out"));
}

#[rstest]
#[case::succeeded(JobStatus::Succeeded)]
#[case::failed(JobStatus::Failed)]
#[case::never_finishes(JobStatus::Pending)]
#[tokio::test(start_paused = true)]
async fn test_exactly_one_cleanup_after_completion_check(#[case] status: JobStatus) {
    let h = Harness::new(MockLifecycle::with_job_statuses(&[status]), settings());

    h.run("kubevirt-p1").await;

    let cleanups = h
        .events("kubevirt-p1")
        .await
        .into_iter()
        .filter(|(step, _)| step == "Cleanup")
        .count();
    assert_eq!(cleanups, 1);
    assert_eq!(h.lifecycle.calls_of("delete_namespace").len(), 1);
}

// =============================================================================
// Setup and post-success failures
// =============================================================================

#[tokio::test]
async fn test_namespace_failure_aborts_without_compensation() {
    let h = Harness::new(
        MockLifecycle {
            fail_create_namespace: true,
            ..Default::default()
        },
        settings(),
    );

    let outcome = h.run("kubevirt-ns").await;

    assert!(matches!(outcome, SagaOutcome::Failed { ref step, .. } if step == "CreateNamespace"));
    assert!(h.lifecycle.calls_of("delete_namespace").is_empty());
    assert!(!h.attributes("kubevirt-ns").contains(attributes::NAMESPACE_NAME));

    let history = h.history.get(&SagaId::new("kubevirt-ns")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, StepStatus::Failed);
    assert!(history[0].detail("error").unwrap().contains("forbidden"));
}

#[tokio::test]
async fn test_job_creation_failure_aborts_without_compensation() {
    let h = Harness::new(
        MockLifecycle {
            fail_create_job: true,
            ..Default::default()
        },
        settings(),
    );

    let outcome = h.run("kubevirt-job").await;

    assert!(matches!(outcome, SagaOutcome::Failed { ref step, .. } if step == "CreateJob"));
    assert!(h.lifecycle.calls_of("get_job_status").is_empty());
    assert!(h.lifecycle.calls_of("delete_namespace").is_empty());
    assert_eq!(
        h.events("kubevirt-job").await,
        vec![
            ev("CreateNamespace", StepStatus::Success),
            ev("CreateJob", StepStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn test_credential_sync_failure_aborts_by_default() {
    let h = Harness::new(
        MockLifecycle {
            job_statuses: Mutex::new(VecDeque::from([JobStatus::Succeeded])),
            fail_sync: true,
            ..Default::default()
        },
        settings(),
    );

    let outcome = h.run("kubevirt-abort").await;

    assert!(matches!(outcome, SagaOutcome::Failed { ref step, .. } if step == "SyncCredential"));
    assert!(h.lifecycle.calls_of("delete_namespace").is_empty());
    assert_eq!(h.lifecycle.namespaces.lock().len(), 1);
}

#[tokio::test]
async fn test_credential_sync_failure_can_compensate() {
    let h = Harness::new(
        MockLifecycle {
            job_statuses: Mutex::new(VecDeque::from([JobStatus::Succeeded])),
            fail_sync: true,
            ..Default::default()
        },
        settings().with_credential_sync_failure(CredentialSyncFailurePolicy::Compensate),
    );

    let outcome = h.run("kubevirt-comp").await;

    assert_eq!(
        outcome,
        SagaOutcome::ForceFailed {
            reason: CREDENTIAL_SYNC_FAILED_REASON.to_string()
        }
    );
    let attrs = h.attributes("kubevirt-comp");
    assert_eq!(attrs.cleanup_reason(), CleanupReason::Success);
    assert!(attrs.contains(attributes::CREDENTIAL_SYNC_ERROR));
    assert_eq!(h.lifecycle.calls_of("delete_namespace").len(), 1);
    assert_eq!(
        h.events("kubevirt-comp").await.last(),
        Some(&ev("Cleanup", StepStatus::Failed))
    );
}

#[tokio::test]
async fn test_cleanup_failure_is_surfaced() {
    let h = Harness::new(
        MockLifecycle {
            job_statuses: Mutex::new(VecDeque::from([JobStatus::Failed])),
            fail_delete: true,
            ..Default::default()
        },
        settings(),
    );

    let outcome = h.run("kubevirt-leak").await;

    match outcome {
        SagaOutcome::Failed { step, error } => {
            assert_eq!(step, "Cleanup");
            assert!(error.contains("may be leaked"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        h.events("kubevirt-leak").await.last(),
        Some(&ev("Cleanup", StepStatus::Failed))
    );
}

#[tokio::test]
async fn test_history_outage_does_not_mask_outcome() {
    let registry = WorkflowRegistry::new();
    registry.register(ProvisioningSaga::new(
        Arc::new(MockLifecycle::with_job_statuses(&[JobStatus::Succeeded])),
        Arc::new(UnavailableHistory),
        settings(),
    ));
    let runner = SagaRunner::new(Arc::new(registry));
    let input = serde_json::to_value(ProvisioningInput::new(demo_config())).unwrap();

    let outcome = runner
        .run(PROVISIONING_WORKFLOW, SagaId::new("kubevirt-h"), input)
        .await
        .unwrap();

    assert_eq!(outcome, SagaOutcome::Completed);
}

// =============================================================================
// Re-invocation and cancellation
// =============================================================================

fn saga(lifecycle: Arc<MockLifecycle>) -> ProvisioningSaga {
    ProvisioningSaga::new(lifecycle, Arc::new(MockHistory::default()), settings())
}

fn step_ctx() -> StepContext {
    StepContext::new(SagaId::new("kubevirt-replay"), CancellationToken::new())
}

fn attrs_with(updates: AttributeUpdates) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.apply(&updates).unwrap();
    attrs
}

#[tokio::test]
async fn test_create_namespace_reuses_existing_name() {
    let lifecycle = Arc::new(MockLifecycle::default());
    let saga = saga(lifecycle.clone());
    let attrs = attrs_with(AttributeUpdates::new().set(attributes::NAMESPACE_NAME, "demo-bcdfgh"));
    let input = ProvisioningInput::new(demo_config());

    let output = saga
        .execute(ProvisioningStep::CreateNamespace, &step_ctx(), &attrs, &input)
        .await
        .unwrap();

    assert_eq!(output.decision, StepDecision::Next(ProvisioningStep::CreateJob));
    assert_eq!(output.updates.get(attributes::NAMESPACE_NAME), Some("demo-bcdfgh"));
    assert_eq!(
        lifecycle.calls_of("create_namespace"),
        vec!["create_namespace:demo-bcdfgh".to_string()]
    );
}

#[rstest]
#[case::failed("failed", StepStatus::Failed, ProvisioningStep::Cleanup)]
#[case::success("success", StepStatus::Success, ProvisioningStep::SyncCredential)]
#[tokio::test]
async fn test_completion_check_routes_on_persisted_reason(
    #[case] reason: &str,
    #[case] expected_status: StepStatus,
    #[case] expected_next: ProvisioningStep,
) {
    let lifecycle = Arc::new(MockLifecycle::default());
    let history = Arc::new(MockHistory::default());
    let saga = ProvisioningSaga::new(lifecycle.clone(), history.clone(), settings());
    let attrs = attrs_with(
        AttributeUpdates::new()
            .set(attributes::NAMESPACE_NAME, "demo-bcdfgh")
            .set(attributes::CLEANUP_REASON, reason),
    );
    let input = ProvisioningInput::new(demo_config())
        .with_import_options(ImportOptions(serde_json::json!({"displayName": "Demo"})));
    let ctx = step_ctx();

    let output = saga
        .execute(ProvisioningStep::CheckCompletion, &ctx, &attrs, &input)
        .await
        .unwrap();

    assert_eq!(output.decision, StepDecision::Next(expected_next));
    assert!(output.updates.is_empty());
    assert!(lifecycle.calls_of("get_job_status").is_empty());

    let events = history.get(&ctx.instance_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step_name, "CheckCompletion");
    assert_eq!(events[0].outcome, expected_status);
    assert_eq!(events[0].details.get(attributes::CLEANUP_REASON).map(String::as_str), Some(reason));
    assert_eq!(events[0].details.get("replayed").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn test_step_without_namespace_fails() {
    let saga = saga(Arc::new(MockLifecycle::default()));
    let input = ProvisioningInput::new(demo_config());

    let err = saga
        .execute(ProvisioningStep::Cleanup, &step_ctx(), &Attributes::new(), &input)
        .await
        .unwrap_err();

    assert!(err.to_string().contains(attributes::NAMESPACE_NAME));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_waiting_saga() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[JobStatus::Pending]),
        SagaSettings::default(),
    );
    let id = SagaId::new("kubevirt-cancel");
    let input = serde_json::to_value(ProvisioningInput::new(demo_config())).unwrap();

    h.runner.start(PROVISIONING_WORKFLOW, id.clone(), input).unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;
    h.runner.shutdown().await;

    match h.runner.status(&id) {
        Some(InstanceStatus::Failed { step, error }) => {
            assert_eq!(step, "CheckCompletion");
            assert!(error.contains("cancelled"));
        }
        other => panic!("unexpected status: {:?}", other),
    }
    assert!(h.lifecycle.calls_of("delete_namespace").is_empty());
    assert_eq!(
        h.events("kubevirt-cancel").await.last(),
        Some(&ev("CheckCompletion", StepStatus::Failed))
    );
}

#[tokio::test]
async fn test_duplicate_instance_is_rejected() {
    let h = Harness::new(MockLifecycle::default(), settings());
    let id = SagaId::new("kubevirt-dup");
    let input = serde_json::to_value(ProvisioningInput::new(demo_config())).unwrap();

    h.runner
        .start(PROVISIONING_WORKFLOW, id.clone(), input.clone())
        .unwrap();
    let err = h.runner.start(PROVISIONING_WORKFLOW, id, input).unwrap_err();

    assert!(err.to_string().contains("already started"));
    h.runner.shutdown().await;
}

// =============================================================================
// Intake
// =============================================================================

fn request(config: ClusterConfig) -> ProvisionRequest {
    ProvisionRequest {
        cluster_config: config,
        import_options: ImportOptions::default(),
    }
}

#[tokio::test]
async fn test_intake_starts_saga_and_returns_provider_options() {
    let h = Harness::new(
        MockLifecycle::with_job_statuses(&[JobStatus::Succeeded]),
        settings(),
    );
    let service = ClusterProvisioningService::new(Arc::new(h.runner));

    let (id, options) = service
        .provision("acme", "kubevirt", request(demo_config()))
        .unwrap();

    assert!(id.as_str().starts_with("kubevirt-"));
    assert_eq!(options.name, "KUBEVIRT");
    assert_eq!(options.region, "eu-west");
    assert_eq!(options.cluster_id, "demo");

    service.runner().wait_idle().await;
    assert_eq!(service.runner().status(&id), Some(InstanceStatus::Completed));
}

#[rstest]
#[case::unknown_provider("aws", demo_config())]
#[case::no_worker_pools("kubevirt", ClusterConfig::new("demo"))]
#[case::bad_name("kubevirt", ClusterConfig::new("Demo").with_worker_pool(MachinePool::new(1)))]
fn test_intake_rejects_invalid_requests(#[case] provider: &str, #[case] config: ClusterConfig) {
    let h = Harness::new(MockLifecycle::default(), settings());
    let service = ClusterProvisioningService::new(Arc::new(h.runner));

    let err = service.provision("acme", provider, request(config)).unwrap_err();

    assert!(matches!(
        err,
        IntakeError::UnsupportedProvider(_) | IntakeError::InvalidConfig(_)
    ));
    assert!(service.runner().is_empty());
}
