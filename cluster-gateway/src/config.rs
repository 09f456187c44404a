//! Gateway configuration.

use std::path::Path;
use std::time::Duration;

use cluster_common::WorkerStartupRequest;
use config::{Config as ConfigLoader, ConfigError, Environment, File};
use model_worker::config::{ControllerConfig, HeartbeatConfig, ManagerConfig, ModelConfig};
use model_worker::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub api: ApiConfig,
    /// Workers hosted in this process when `manager.mode = "local"`.
    #[serde(default)]
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// The registry this gateway serves to worker hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub heartbeat_ttl_secs: f64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ControllerSettings {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.heartbeat_ttl_secs * 1000.0) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerMode {
    #[default]
    Remote,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSettings {
    #[serde(default)]
    pub mode: ManagerMode,
    /// Controller to resolve instances from. Defaults to the registry served by this gateway.
    #[serde(default)]
    pub controller_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            mode: ManagerMode::default(),
            controller_url: None,
            request_timeout_secs: default_request_timeout(),
            generate_timeout_secs: default_generate_timeout(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ManagerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn controller(&self) -> Option<ControllerConfig> {
        self.controller_url.as_ref().map(|url| ControllerConfig {
            url: url.clone(),
            request_timeout_secs: self.request_timeout_secs,
            retries: self.retries,
            retry_backoff_ms: self.retry_backoff_ms,
        })
    }
}

/// OpenAI-compatible surface.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Accepted bearer tokens. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Most choices (`n`) one chat request may ask for.
    #[serde(default = "default_max_n")]
    pub max_n: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: Vec::new(),
            max_n: default_max_n(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl LocalConfig {
    /// Local workers are addressed by the gateway's own port.
    pub fn startup_requests(&self, port: u16) -> Vec<WorkerStartupRequest> {
        self.models
            .iter()
            .map(|m| m.startup_request("127.0.0.1", port))
            .collect()
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_n() -> usize {
    128
}
fn default_ttl() -> f64 {
    60.0
}
fn default_sweep_interval() -> f64 {
    20.0
}
fn default_request_timeout() -> u64 {
    10
}
fn default_generate_timeout() -> u64 {
    300
}
fn default_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. gateway.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(File::with_name("gateway").required(false))?
            .build()?
            .try_deserialize()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::builder(File::from(path))?.build()?.try_deserialize()
    }

    fn builder(
        file: File<config::FileSourceFile, config::FileFormat>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())?
            .add_source(file)
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.api_keys")
                    .try_parsing(true),
            ))
    }
}
