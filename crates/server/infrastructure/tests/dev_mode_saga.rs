//! Provisioning saga end-to-end against the in-memory control plane.

use std::sync::Arc;

use capi_server_application::saga::{ProvisioningInput, CLUSTER_FAILED_REASON, PROVISIONING_WORKFLOW};
use capi_server_application::{ProvisioningSaga, SagaRunner, SagaSettings, WorkflowRegistry};
use capi_server_domain::{
    attributes, ClusterConfig, HistoryRecorder, JobStatus, MachinePool, SagaId, SagaOutcome,
    StepStatus,
};
use capi_server_infrastructure::{InMemoryControlPlane, InMemoryHistoryRecorder};

fn runner(control_plane: Arc<InMemoryControlPlane>, history: Arc<InMemoryHistoryRecorder>) -> SagaRunner {
    let registry = WorkflowRegistry::new();
    registry.register(ProvisioningSaga::new(
        control_plane,
        history,
        SagaSettings::default().with_poll(1, 10),
    ));
    SagaRunner::new(Arc::new(registry))
}

fn input() -> serde_json::Value {
    let config = ClusterConfig::new("demo")
        .with_region("local")
        .with_worker_pool(MachinePool::new(1));
    serde_json::to_value(ProvisioningInput::new(config)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_dev_mode_saga_completes_and_removes_namespace() {
    let control_plane = Arc::new(InMemoryControlPlane::new());
    let history = Arc::new(InMemoryHistoryRecorder::new());
    let runner = runner(control_plane.clone(), history.clone());
    let id = SagaId::new("kubevirt-dev");

    let outcome = runner.run(PROVISIONING_WORKFLOW, id.clone(), input()).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(control_plane.namespace_count(), 0);

    let attrs = runner.attributes(&id).unwrap();
    assert!(attrs
        .get(attributes::WORKLOAD_KUBECONFIG)
        .unwrap()
        .contains("demo.local"));

    let events = history.get(&id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.step_name, "Cleanup");
    assert_eq!(last.outcome, StepStatus::Success);
    assert!(events.iter().all(|e| e.instance_id == id));
}

#[tokio::test(start_paused = true)]
async fn test_dev_mode_failed_job_is_compensated() {
    let control_plane = Arc::new(InMemoryControlPlane::new().with_job_outcome(JobStatus::Failed));
    let history = Arc::new(InMemoryHistoryRecorder::new());
    let runner = runner(control_plane.clone(), history.clone());
    let id = SagaId::new("kubevirt-dev-fail");

    let outcome = runner.run(PROVISIONING_WORKFLOW, id.clone(), input()).await.unwrap();

    assert_eq!(
        outcome,
        SagaOutcome::ForceFailed {
            reason: CLUSTER_FAILED_REASON.to_string()
        }
    );
    assert_eq!(control_plane.namespace_count(), 0);
    assert_eq!(
        history
            .get(&id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.step_name == "Cleanup")
            .count(),
        1
    );
}
