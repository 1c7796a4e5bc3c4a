use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::runtime::RuntimeKind;

pub(crate) const CONFIG_FILE: &str = "agent-sandbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Reconcile loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of parallel reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Every object is re-reconciled at this interval even without events
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// How often a Pending claim re-checks for capacity
    #[serde(default = "default_pending_poll_interval")]
    pub pending_poll_interval_ms: u64,

    /// How often a provisioning sandbox polls its pod
    #[serde(default = "default_provision_poll_interval")]
    pub provision_poll_interval_ms: u64,

    /// Upper bound on any single store or runtime call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// First retry delay after a transient error
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delays never exceed this
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Provisioning attempts before a sandbox is marked Terminated
    #[serde(default = "default_max_provision_attempts")]
    pub max_provision_attempts: u32,

    /// How often `run` writes the state snapshot
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval(),
            pending_poll_interval_ms: default_pending_poll_interval(),
            provision_poll_interval_ms: default_provision_poll_interval(),
            call_timeout_secs: default_call_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            max_provision_attempts: default_max_provision_attempts(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn pending_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pending_poll_interval_ms)
    }

    pub fn provision_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provision_poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

/// Pod runtime selection and settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Which runtime backs sandboxes: "docker" or "simulated"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Docker-specific configuration
    #[serde(default)]
    pub docker: DockerConfig,

    /// Simulated runtime configuration
    #[serde(default)]
    pub simulated: SimulatedConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            docker: DockerConfig::default(),
            simulated: SimulatedConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse the provider string into a RuntimeKind enum
    pub fn get_provider(&self) -> Result<RuntimeKind> {
        self.provider.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Pull images that are not present locally
    #[serde(default = "default_true")]
    pub pull_images: bool,

    /// Prefix of the labels put on every container
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            pull_images: true,
            label_prefix: default_label_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Time a simulated pod takes to become Running
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay(),
        }
    }
}

impl SimulatedConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_resync_interval() -> u64 {
    30
}

fn default_pending_poll_interval() -> u64 {
    2000
}

fn default_provision_poll_interval() -> u64 {
    500
}

fn default_call_timeout() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    60
}

fn default_max_provision_attempts() -> u32 {
    3
}

fn default_snapshot_interval() -> u64 {
    2
}

fn default_provider() -> String {
    "docker".to_string()
}

fn default_label_prefix() -> String {
    "agent-sandbox".to_string()
}

fn default_startup_delay() -> u64 {
    200
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.controller.max_provision_attempts, 3);
        assert_eq!(config.runtime.provider, "docker");
        assert!(config.runtime.docker.pull_images);
        assert_eq!(config.controller.call_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[controller]
workers = 8
pending_poll_interval_ms = 250

[runtime]
provider = "simulated"

[runtime.simulated]
startup_delay_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.controller.workers, 8);
        assert_eq!(
            config.controller.pending_poll_interval(),
            Duration::from_millis(250)
        );
        // Unset fields keep their defaults
        assert_eq!(config.controller.backoff_max_secs, 60);
        assert_eq!(
            config.runtime.get_provider().unwrap(),
            RuntimeKind::Simulated
        );
        assert_eq!(config.runtime.simulated.startup_delay(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_provider_is_an_error() {
        let toml = r#"
[runtime]
provider = "firecracker"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.runtime.get_provider().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.controller.workers, 4);
    }
}
