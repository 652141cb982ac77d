//! Startup module - wires adapters, the saga runner and the HTTP router.

pub mod shutdown;

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use capi_server_application::{
    ClusterProvisioningService, ProvisioningSaga, SagaRunner, WorkflowRegistry,
};
use capi_server_domain::{ClusterLifecycle, HistoryRecorder};
use capi_server_infrastructure::{
    InMemoryControlPlane, InMemoryHistoryRecorder, KubernetesLifecycleClient,
};

use crate::api::{create_router, ApiState};
use crate::config::ServerConfig;

/// Current application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialized components.
pub struct AppState {
    pub router: Router,
    pub runner: Arc<SagaRunner>,
}

/// Build the lifecycle adapter for the configured mode.
async fn create_lifecycle(config: &ServerConfig) -> anyhow::Result<Arc<dyn ClusterLifecycle>> {
    if config.dev_mode {
        info!("Development mode: using in-memory control plane");
        let control_plane =
            InMemoryControlPlane::new().with_job_name(config.kubernetes.runner_job_name.clone());
        return Ok(Arc::new(control_plane));
    }

    let client =
        KubernetesLifecycleClient::new(config.kubernetes.clone(), config.saga.credential_wait())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    info!("✓ Kubernetes client ready");
    Ok(Arc::new(client))
}

/// Wire every component without binding a socket.
pub async fn build(config: &ServerConfig, shutdown: CancellationToken) -> anyhow::Result<AppState> {
    let history: Arc<dyn HistoryRecorder> = Arc::new(InMemoryHistoryRecorder::new());
    let lifecycle = create_lifecycle(config).await?;

    let registry = WorkflowRegistry::new();
    registry.register(ProvisioningSaga::new(
        lifecycle,
        history.clone(),
        config.saga.clone(),
    ));
    info!("✓ Registered workflows: {:?}", registry.workflow_keys());

    let runner = Arc::new(SagaRunner::with_shutdown_token(
        Arc::new(registry),
        shutdown,
    ));
    let provisioning = ClusterProvisioningService::new(runner.clone());

    let router = create_router(ApiState::new(provisioning, history)).layer(TraceLayer::new_for_http());

    Ok(AppState { router, runner })
}

/// Run the server until a shutdown signal, then drain running sagas.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("Starting capi-server v{} on {}", APP_VERSION, addr);

    let state = build(&config, CancellationToken::new()).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
    info!("✓ Listening on {}", addr);

    axum::serve(listener, state.router)
        .with_graceful_shutdown(async {
            shutdown::wait_for_signal().await;
        })
        .await?;

    shutdown::drain_sagas(
        &state.runner,
        Duration::from_secs(config.shutdown_timeout_secs),
    )
    .await;

    info!("Shutting down gracefully...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_in_dev_mode() {
        let mut config = ServerConfig::from_sources("test", "CAPI_STARTUP_TEST").unwrap();
        config.dev_mode = true;

        let state = build(&config, CancellationToken::new()).await.unwrap();

        assert!(state.runner.is_empty());
        assert!(state.runner.registry().has_workflow("kubevirt-provisioning"));
    }
}
