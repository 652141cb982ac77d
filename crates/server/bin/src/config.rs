use serde::Deserialize;
use std::env;

use capi_server_application::SagaSettings;
use capi_server_infrastructure::KubernetesSettings;

/// Prefix of environment overrides, e.g. `CAPI_HTTP_PORT` or
/// `CAPI_SAGA__POLL_TIMEOUT_SECS`.
pub const ENV_PREFIX: &str = "CAPI";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Use the in-memory control plane instead of a real cluster.
    #[serde(default)]
    pub dev_mode: bool,
    /// Upper bound on draining running sagas at shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub kubernetes: KubernetesSettings,
    #[serde(default)]
    pub saga: SagaSettings,
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl ServerConfig {
    /// Defaults, then `config/default`, then `config/{RUN_MODE}`, then
    /// `CAPI_*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        Self::from_sources(&run_mode, ENV_PREFIX)
    }

    pub fn from_sources(run_mode: &str, env_prefix: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .set_default("http_port", 8080)?
            .set_default("log_level", "info")?
            .set_default("log_format", "text")?
            .set_default("dev_mode", false)?
            .set_default("shutdown_timeout_secs", 30)?
            // Merge with config file (if exists)
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
