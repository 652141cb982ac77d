//! Graceful shutdown.
//!
//! The HTTP listener stops on SIGINT/SIGTERM; in-flight sagas are then
//! cancelled and drained within a bounded timeout.

use std::fmt;
use std::time::Duration;
use tokio::signal;
use tokio::time::timeout;
use tracing::{error, info, warn};

use capi_server_application::SagaRunner;

/// Reason for shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM signal received
    SigTerm,
    /// SIGINT signal received (Ctrl+C)
    SigInt,
    /// No signal handler could be installed
    Unknown,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::SigTerm => write!(f, "SIGTERM"),
            ShutdownReason::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownReason::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> ShutdownReason {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => ShutdownReason::SigInt,
            Err(e) => {
                error!("Failed to register ctrl-c handler: {}", e);
                std::future::pending::<ShutdownReason>().await
            }
        }
    };

    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                ShutdownReason::SigTerm
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<ShutdownReason>().await
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<ShutdownReason>();

    let reason = tokio::select! {
        reason = ctrl_c => reason,
        reason = term => reason,
    };
    info!("Shutdown signal received: {}", reason);
    reason
}

/// Cancel every running saga and wait for them to stop.
///
/// Returns `false` when the sagas did not stop within `limit`.
pub async fn drain_sagas(runner: &SagaRunner, limit: Duration) -> bool {
    let in_flight = runner.len();
    info!(instances = in_flight, "Draining saga runner");

    match timeout(limit, runner.shutdown()).await {
        Ok(()) => {
            info!("Saga runner drained");
            true
        }
        Err(_) => {
            warn!("Saga runner drain timed out after {:?}", limit);
            false
        }
    }
}
