//! Configuration for env-restore.
//!
//! Loaded from a TOML file. Every section except `environments` has
//! defaults, so a file listing only environments is valid.

use crate::archive::FetchOptions;
use crate::service::ServiceSet;
use crate::transfer::TransferOptions;
use crate::utils::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Named environments (e.g. `prod`, `dev`, `dr`)
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Read chunk size in bytes (default: 256KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks buffered per destination before the reader blocks
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,

    /// Files copied concurrently by `copy`
    #[serde(default = "default_max_parallel_files")]
    pub max_parallel_files: usize,

    /// Progress log interval in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Archives (or replicas) listed concurrently
    #[serde(default = "default_fetch_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// kubectl binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// kube context; current context when unset
    #[serde(default)]
    pub context: Option<String>,

    /// ssh binary used for host locations
    #[serde(default = "default_ssh")]
    pub ssh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-call timeout in seconds
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

/// Archive and service specs of one environment, keyed by service name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub archives: BTreeMap<String, String>,
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

impl Environment {
    pub fn service_set(&self) -> Result<ServiceSet> {
        ServiceSet::from_specs(&self.services)
    }
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_chunk_size() -> usize {
    256 * 1024 // 256KB
}

fn default_channel_depth() -> usize {
    8
}

fn default_max_parallel_files() -> usize {
    4
}

fn default_report_interval_ms() -> u64 {
    2000
}

fn default_fetch_parallel() -> usize {
    8
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_rpc_timeout_secs() -> u64 {
    300
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            channel_depth: default_channel_depth(),
            max_parallel_files: default_max_parallel_files(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_fetch_parallel(),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
            ssh: default_ssh(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl TransferConfig {
    pub fn options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            channel_depth: self.channel_depth,
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(100))
    }
}

impl FetchConfig {
    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            max_parallel: self.max_parallel,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or misconfigure a workflow.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::Configuration("transfer.chunk_size must be > 0".into()));
        }
        if self.transfer.channel_depth == 0 {
            return Err(Error::Configuration("transfer.channel_depth must be > 0".into()));
        }
        if self.transfer.max_parallel_files == 0 || self.fetch.max_parallel == 0 {
            return Err(Error::Configuration("parallelism settings must be > 0".into()));
        }
        Ok(())
    }

    /// Look up a named environment.
    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.environments.keys().map(String::as_str).collect();
            Error::Configuration(format!(
                "unknown environment {name:?} (configured: {})",
                known.join(", ")
            ))
        })
    }
}
