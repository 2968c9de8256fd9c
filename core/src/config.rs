use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ContError, Result};
use crate::log::LogConfig;

/// Well-known control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/cont.sock";

/// Default location of the OCI image layout holding pulled content.
pub const DEFAULT_STORE_DIR: &str = "/var/lib/cont/oci-layout";

/// Image used for containers without an explicit mapping.
pub const DEFAULT_IMAGE: &str = "docker.io/library/nginx:latest";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket path
    pub socket_path: PathBuf,

    /// Permission bits applied to the control socket after binding
    pub socket_mode: u32,

    /// Root of the content-addressable store
    pub store_dir: PathBuf,

    /// Image for containers not listed in `containers`
    pub default_image: String,

    /// Container id → image reference
    pub containers: HashMap<String, String>,

    /// Longest accepted protocol line in bytes
    pub max_line_bytes: usize,

    /// How long shutdown waits for open sessions
    pub shutdown_grace_secs: u64,

    /// Registry access
    pub registry: RegistryConfig,

    /// Transient-failure retry policy
    pub retry: RetryConfig,

    /// Log sink
    pub log: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o666,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            default_image: DEFAULT_IMAGE.to_string(),
            containers: HashMap::new(),
            max_line_bytes: 8192,
            shutdown_grace_secs: 30,
            registry: RegistryConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file.
    ///
    /// Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ContError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: DaemonConfig = serde_yaml::from_str(&data).map_err(|e| {
            ContError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ContError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ContError::ConfigError(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.max_line_bytes == 0 {
            return Err(ContError::ConfigError(
                "max_line_bytes must be greater than 0".to_string(),
            ));
        }
        if self.default_image.trim().is_empty() {
            return Err(ContError::ConfigError(
                "default_image must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Image reference for a container id.
    pub fn image_for(&self, container_id: &str) -> &str {
        self.containers
            .get(container_id)
            .map(String::as_str)
            .unwrap_or(&self.default_image)
    }
}

/// Registry access configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP
    pub insecure: Vec<String>,

    /// Per-registry credential file (defaults to `~/.cont/auth/credentials.json`)
    pub credentials_file: Option<PathBuf>,

    /// Docker CLI config consulted for credentials (defaults to `~/.docker/config.json`)
    pub docker_config: Option<PathBuf>,

    /// Platform OS selected from image indexes (defaults to `linux`)
    pub platform_os: Option<String>,

    /// Platform architecture selected from image indexes (defaults to the host)
    pub platform_arch: Option<String>,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Ceiling for the exponential backoff
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 8000,
        }
    }
}
