//! Intake of provisioning requests.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use capi_server_domain::{ConfigValidationError, ProviderOptions, ProvisionRequest, SagaId};

use crate::saga::{ProvisioningInput, RunnerError, SagaRunner, PROVISIONING_WORKFLOW};

/// The only provider with a provisioning saga.
pub const KUBEVIRT_PROVIDER: &str = "kubevirt";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("provider '{0}' is not supported")]
    UnsupportedProvider(String),

    #[error("invalid cluster config: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("failed to encode saga input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to start saga: {0}")]
    Runner(#[from] RunnerError),
}

/// Accepts provisioning requests and starts one saga per request.
#[derive(Debug, Clone)]
pub struct ClusterProvisioningService {
    runner: Arc<SagaRunner>,
}

impl ClusterProvisioningService {
    pub fn new(runner: Arc<SagaRunner>) -> Self {
        Self { runner }
    }

    /// Validate the request, start the saga and return without waiting for
    /// it.
    pub fn provision(
        &self,
        owner: &str,
        provider: &str,
        request: ProvisionRequest,
    ) -> Result<(SagaId, ProviderOptions), IntakeError> {
        if provider != KUBEVIRT_PROVIDER {
            return Err(IntakeError::UnsupportedProvider(provider.to_string()));
        }
        let config = request.cluster_config;
        config.validate()?;

        let options = ProviderOptions {
            name: provider.to_uppercase(),
            region: config.region.clone(),
            cluster_id: config.cluster_name.clone(),
        };

        let saga_id = SagaId::generate(provider);
        let input = ProvisioningInput::new(config).with_import_options(request.import_options);
        self.runner
            .start(PROVISIONING_WORKFLOW, saga_id.clone(), serde_json::to_value(input)?)?;

        info!(saga_id = %saga_id, owner, cluster = %options.cluster_id, "Provisioning request accepted");
        Ok((saga_id, options))
    }

    pub fn runner(&self) -> &SagaRunner {
        &self.runner
    }
}
