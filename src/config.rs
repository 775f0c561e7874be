//! Engine configuration
//!
//! Every section has working defaults so a config file only needs to name
//! what differs. Durations are stored in milliseconds (`*_ms` fields) and
//! exposed as [`Duration`] through accessor methods.
//!
//! ```json
//! {
//!   "pool": { "max_slots": 4, "warm_slots": 2 },
//!   "admission": { "max_concurrent": 4, "mode": "blocking", "wait_timeout_ms": 60000 },
//!   "ssh": { "user": "ubuntu", "identity_file": "~/.ssh/id_rsa" },
//!   "images": { "golden-1": { "source": "22.04", "cloud_init": "podman-setup.yaml" } },
//!   "backend": { "kind": "multipass" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::exec::{RetryPolicy, SshCredentials};
use crate::vm::{FirecrackerConfig, GoldenImage, MultipassConfig};
use crate::work::Resources;

/// What an idle slot's VM does between leases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicy {
    /// Leave the VM running after reset (lowest latency, highest host cost)
    KeepRunning,
    /// Suspend the VM after reset; the next lease resumes it
    Suspend,
}

/// How `submit` behaves when every permit is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
    /// Wait up to `wait_timeout_ms` for a permit
    Blocking,
    /// Return `Busy` immediately
    NonBlocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ceiling on the number of slots (provisioned or not)
    pub max_slots: usize,
    /// Slots provisioned at start-up
    pub warm_slots: usize,
    /// Image warm slots are provisioned from; the first registered image when absent
    pub warm_image: Option<String>,
    /// Size of every slot; the pool is homogeneous
    pub slot_resources: Resources,
    /// VM names are `{name_prefix}-{slot index}`
    pub name_prefix: String,
    /// Consecutive cleanup failures before a slot is retired for good
    pub max_cleanup_failures: u32,
    pub idle_policy: IdlePolicy,
    /// Period of the background task that recreates quarantined slots
    pub maintenance_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 2,
            warm_slots: 0,
            warm_image: None,
            slot_resources: Resources::default(),
            name_prefix: "leasevisor".to_string(),
            max_cleanup_failures: 3,
            idle_policy: IdlePolicy::KeepRunning,
            maintenance_interval_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of simultaneously busy slots
    pub max_concurrent: usize,
    pub mode: AdmissionMode,
    /// Upper bound on a blocking wait
    pub wait_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            mode: AdmissionMode::Blocking,
            wait_timeout_ms: 300_000,
        }
    }
}

impl AdmissionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Upper bounds on every suspension point of a lease
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Launch or resume of a VM
    pub provision_ms: u64,
    /// Waiting for a VM to accept remote-shell connections
    pub ready_ms: u64,
    /// Each setup command
    pub setup_command_ms: u64,
    /// Stop + restore + ready check
    pub cleanup_ms: u64,
    /// Workload budget when the work item does not carry one
    pub default_workload_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provision_ms: 300_000,
            ready_ms: 180_000,
            setup_command_ms: 600_000,
            cleanup_ms: 300_000,
            default_workload_ms: 3_600_000,
        }
    }
}

impl TimeoutConfig {
    pub fn provision(&self) -> Duration {
        Duration::from_millis(self.provision_ms)
    }

    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }

    pub fn setup_command(&self) -> Duration {
        Duration::from_millis(self.setup_command_ms)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_millis(self.cleanup_ms)
    }

    pub fn default_workload(&self) -> Duration {
        Duration::from_millis(self.default_workload_ms)
    }
}

/// Retry budgets for the recoverable failure kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Back-off used for connection attempts and readiness polling
    pub backoff: RetryPolicy,
    /// Fresh slots tried after a ProvisionError / ConnectionError
    pub provision_retries: u32,
    /// Cleanup attempts before the slot is quarantined
    pub cleanup_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: RetryPolicy::default(),
            provision_retries: 1,
            cleanup_attempts: 2,
        }
    }
}

/// Log output and optional OTLP export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint; console logging only when absent
    pub otlp_endpoint: Option<String>,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

/// VM backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Multipass(MultipassConfig),
    Firecracker(FirecrackerConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Multipass(MultipassConfig::default())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    /// Credential store for the remote shell
    pub ssh: SshCredentials,
    /// Golden image registry: name → image
    pub images: BTreeMap<String, GoldenImage>,
    pub backend: BackendConfig,
    pub telemetry: TelemetryConfig,
    /// Bytes of stdout/stderr kept per stream
    pub output_limit: usize,
    /// Terminal leases kept for `status()`
    pub lease_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            admission: AdmissionConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            ssh: SshCredentials::default(),
            images: BTreeMap::new(),
            backend: BackendConfig::default(),
            telemetry: TelemetryConfig::default(),
            output_limit: 1024 * 1024,
            lease_history: 1024,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_slots == 0 {
            return Err(ConfigError::Invalid("pool.max_slots must be at least 1".into()));
        }
        if self.admission.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "admission.max_concurrent must be at least 1".into(),
            ));
        }
        if self.admission.max_concurrent > self.pool.max_slots {
            return Err(ConfigError::Invalid(format!(
                "admission.max_concurrent ({}) exceeds pool.max_slots ({})",
                self.admission.max_concurrent, self.pool.max_slots
            )));
        }
        if self.pool.warm_slots > self.pool.max_slots {
            return Err(ConfigError::Invalid(format!(
                "pool.warm_slots ({}) exceeds pool.max_slots ({})",
                self.pool.warm_slots, self.pool.max_slots
            )));
        }
        if let Some(image) = &self.pool.warm_image {
            if !self.images.contains_key(image) {
                return Err(ConfigError::Invalid(format!(
                    "pool.warm_image '{}' is not a registered image",
                    image
                )));
            }
        }
        if self.retry.cleanup_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.cleanup_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_slots, 2);
        assert_eq!(config.admission.mode, AdmissionMode::Blocking);
        assert_eq!(config.retry.provision_retries, 1);
        assert!(matches!(config.backend, BackendConfig::Multipass(_)));
    }

    #[test]
    fn test_concurrency_above_pool_rejected() {
        let mut config = EngineConfig::default();
        config.admission.max_concurrent = 5;
        config.pool.max_slots = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds pool.max_slots"));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "pool": {{ "max_slots": 3, "idle_policy": "suspend" }},
                "admission": {{ "max_concurrent": 3, "mode": "non-blocking" }},
                "images": {{ "golden-1": {{ "source": "22.04" }} }}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.pool.max_slots, 3);
        assert_eq!(config.pool.idle_policy, IdlePolicy::Suspend);
        assert_eq!(config.admission.mode, AdmissionMode::NonBlocking);
        assert_eq!(config.images["golden-1"].source, "22.04");
        // untouched sections keep their defaults
        assert_eq!(config.timeouts.cleanup(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_firecracker_backend_section() {
        let json = r#"{ "backend": { "kind": "firecracker", "binary": "/usr/bin/firecracker" } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        match config.backend {
            BackendConfig::Firecracker(fc) => {
                assert_eq!(fc.binary.to_str(), Some("/usr/bin/firecracker"));
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }
}
