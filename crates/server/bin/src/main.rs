//! CAPI provisioning server
//!
//! Accepts cluster provisioning requests over HTTP and drives each one
//! through the provisioning saga.

mod api;
mod config;
mod startup;

use clap::Parser;

use crate::config::{LogFormat, ServerConfig};

/// CLI arguments for capi-server
#[derive(clap::Parser, Debug)]
#[command(name = "capi-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Virtual cluster provisioning server", long_about = None)]
struct Args {
    /// HTTP port, overrides configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Use the in-memory control plane instead of a Kubernetes cluster
    #[arg(long)]
    dev: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Build configuration
    let mut config = ServerConfig::load()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if args.debug {
        config.log_level = "debug".to_string();
    }
    if args.json_logs {
        config.log_format = LogFormat::Json;
    }
    config.dev_mode |= args.dev;

    // Initialize logging
    setup_logging(&config.log_level, config.log_format);

    // Run the application
    startup::run(config).await
}

/// Setup logging; `RUST_LOG` takes precedence over the configured level.
fn setup_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(env_filter)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");
        }
    }
}
