//! Configuration for the worker host.

use std::path::Path;
use std::time::Duration;

use cluster_common::{WorkerParams, WorkerStartupRequest, WorkerType};
use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for a worker host.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerHostConfig,
    /// Networked registry. Without it the host runs standalone on an embedded registry.
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Workers started with the host.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerHostConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address other cluster members use to reach this host. Defaults to `host`.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl Default for WorkerHostConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            advertise_host: None,
        }
    }
}

impl WorkerHostConfig {
    pub fn advertised(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.host == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl ControllerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout_secs: default_request_timeout(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Heartbeat loop timing. One loop runs per started worker.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: f64,
    /// Heartbeat age after which an instance is no longer selectable.
    #[serde(default = "default_ttl")]
    pub ttl_secs: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Interval used after retries are exhausted, until a heartbeat succeeds again.
    #[serde(default = "default_slow_interval")]
    pub slow_interval_secs: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            ttl_secs: default_ttl(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            slow_interval_secs: default_slow_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs_f64(self.slow_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.ttl_secs * 1000.0) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Bound on a worker becoming ready. A timed-out startup is retried once.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: f64,
    /// Bound on waiting for a free concurrency slot.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            generate_timeout_secs: default_generate_timeout(),
        }
    }
}

impl ManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.generate_timeout_secs)
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

/// One worker to start at boot.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub worker_type: WorkerType,
    #[serde(flatten)]
    pub params: WorkerParams,
}

impl ModelConfig {
    pub fn startup_request(&self, host: &str, port: u16) -> WorkerStartupRequest {
        WorkerStartupRequest {
            host: host.to_string(),
            port,
            model: self.name.clone(),
            worker_type: self.worker_type,
            params: self.params.clone(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8001
}
fn default_request_timeout() -> u64 {
    10
}
fn default_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_heartbeat_interval() -> f64 {
    20.0
}
fn default_ttl() -> f64 {
    60.0
}
fn default_slow_interval() -> f64 {
    60.0
}
fn default_startup_timeout() -> f64 {
    120.0
}
fn default_acquire_timeout_ms() -> u64 {
    1000
}
fn default_generate_timeout() -> f64 {
    300.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (WORKER__SECTION__KEY format)
    /// 2. worker.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(File::with_name("worker").required(false))?
            .build()?
            .try_deserialize()
    }

    /// Load from an explicit file, still honouring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::builder(File::from(path))?.build()?.try_deserialize()
    }

    fn builder(
        file: File<config::FileSourceFile, config::FileFormat>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(ConfigLoader::builder()
            .set_default("worker.host", default_host())?
            .set_default("worker.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())?
            .add_source(file)
            .add_source(
                Environment::with_prefix("WORKER")
                    .separator("__")
                    .try_parsing(true),
            ))
    }

    /// Startup requests for every configured model, bound to this host's advertised address.
    pub fn startup_requests(&self) -> Vec<WorkerStartupRequest> {
        let host = self.worker.advertised();
        self.models
            .iter()
            .map(|m| m.startup_request(&host, self.worker.port))
            .collect()
    }
}
