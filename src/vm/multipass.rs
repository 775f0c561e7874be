//! Multipass backend
//!
//! Drives the `multipass` CLI. Every invocation has its own timeout and is
//! killed if it overruns. Machine-readable state comes from
//! `list --format json` / `info --format json`.
//!
//! | operation        | command                                         |
//! |------------------|-------------------------------------------------|
//! | launch           | `launch <image> --name --cpus --memory --disk`  |
//! | start / resume   | `start <vm>`                                    |
//! | stop             | `stop <vm>`                                     |
//! | suspend          | `suspend <vm>`                                  |
//! | snapshot         | `snapshot <vm> --name <snap>`                   |
//! | restore          | `restore --destructive <vm>.<snap>`             |
//! | delete_snapshot  | `delete --purge <vm>.<snap>`                    |
//! | delete           | `delete --purge <vm>`                           |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::{LaunchSpec, VmControl, VmInfo, VmState};
use crate::error::VmControlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipassConfig {
    /// `multipass` binary
    pub binary: PathBuf,
    /// Deadline for any single CLI invocation
    pub command_timeout_ms: u64,
}

impl Default for MultipassConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("multipass"),
            command_timeout_ms: 600_000,
        }
    }
}

/// VM control through the Multipass CLI
pub struct MultipassBackend {
    config: MultipassConfig,
}

impl MultipassBackend {
    pub fn new(config: MultipassConfig) -> Self {
        Self { config }
    }

    /// Run one multipass command, returning stdout
    async fn multipass(
        &self,
        operation: &'static str,
        name: &str,
        args: &[String],
    ) -> Result<String, VmControlError> {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        debug!(operation, vm = name, ?args, "multipass");

        let child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VmControlError::Io { operation, source })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| VmControlError::Io { operation, source })?,
            Err(_) => {
                return Err(VmControlError::Timeout {
                    operation,
                    name: name.to_string(),
                    timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found(&stderr) {
            return Err(VmControlError::NotFound {
                name: name.to_string(),
            });
        }
        Err(VmControlError::CommandFailed {
            operation,
            name: name.to_string(),
            message: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}

#[async_trait]
impl VmControl for MultipassBackend {
    fn backend(&self) -> &'static str {
        "multipass"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<VmInfo, VmControlError> {
        self.multipass("launch", &spec.name, &launch_args(spec)).await?;
        self.info(&spec.name).await
    }

    async fn start(&self, vm: &str) -> Result<(), VmControlError> {
        self.multipass("start", vm, &["start".into(), vm.into()])
            .await
            .map(drop)
    }

    async fn stop(&self, vm: &str) -> Result<(), VmControlError> {
        self.multipass("stop", vm, &["stop".into(), vm.into()])
            .await
            .map(drop)
    }

    async fn suspend(&self, vm: &str) -> Result<(), VmControlError> {
        self.multipass("suspend", vm, &["suspend".into(), vm.into()])
            .await
            .map(drop)
    }

    async fn resume(&self, vm: &str) -> Result<(), VmControlError> {
        // multipass resumes a suspended instance through `start`
        self.multipass("resume", vm, &["start".into(), vm.into()])
            .await
            .map(drop)
    }

    async fn snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError> {
        let args = vec![
            "snapshot".to_string(),
            vm.to_string(),
            "--name".to_string(),
            snapshot.to_string(),
        ];
        self.multipass("snapshot", vm, &args).await.map(drop)
    }

    async fn restore(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError> {
        let args = vec![
            "restore".to_string(),
            "--destructive".to_string(),
            format!("{}.{}", vm, snapshot),
        ];
        self.multipass("restore", vm, &args).await.map(drop)
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError> {
        let args = vec![
            "delete".to_string(),
            "--purge".to_string(),
            format!("{}.{}", vm, snapshot),
        ];
        self.multipass("delete_snapshot", vm, &args).await.map(drop)
    }

    async fn delete(&self, vm: &str) -> Result<(), VmControlError> {
        let args = vec!["delete".to_string(), "--purge".to_string(), vm.to_string()];
        self.multipass("delete", vm, &args).await.map(drop)
    }

    async fn list(&self) -> Result<Vec<VmInfo>, VmControlError> {
        let args = vec!["list".to_string(), "--format".to_string(), "json".to_string()];
        let stdout = self.multipass("list", "*", &args).await?;
        parse_list(&stdout)
    }

    async fn info(&self, vm: &str) -> Result<VmInfo, VmControlError> {
        let args = vec![
            "info".to_string(),
            vm.to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let stdout = self.multipass("info", vm, &args).await?;
        parse_info(vm, &stdout)
    }
}

fn launch_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "launch".to_string(),
        spec.image.source.clone(),
        "--name".to_string(),
        spec.name.clone(),
        "--cpus".to_string(),
        spec.resources.cpus.to_string(),
        "--memory".to_string(),
        format!("{}M", spec.resources.memory_mib),
        "--disk".to_string(),
        format!("{}G", spec.resources.disk_gib),
    ];
    if let Some(cloud_init) = &spec.image.cloud_init {
        args.push("--cloud-init".to_string());
        args.push(cloud_init.display().to_string());
    }
    args
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("does not exist")
}

fn parse_state(state: &str) -> VmState {
    match state {
        "Running" => VmState::Running,
        "Stopped" => VmState::Stopped,
        "Suspended" | "Suspending" => VmState::Suspended,
        "Starting" | "Restarting" => VmState::Starting,
        _ => VmState::Unknown,
    }
}

#[derive(Deserialize)]
struct ListOutput {
    list: Vec<ListEntry>,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    state: String,
    #[serde(default)]
    ipv4: Vec<String>,
    #[serde(default)]
    release: Option<String>,
}

#[derive(Deserialize)]
struct InfoOutput {
    #[serde(default)]
    info: std::collections::BTreeMap<String, InfoEntry>,
}

#[derive(Deserialize)]
struct InfoEntry {
    state: String,
    #[serde(default)]
    ipv4: Vec<String>,
    #[serde(default)]
    image_release: Option<String>,
}

fn parse_list(json: &str) -> Result<Vec<VmInfo>, VmControlError> {
    let parsed: ListOutput = serde_json::from_str(json).map_err(|e| VmControlError::Parse {
        what: "multipass list output",
        message: e.to_string(),
    })?;
    Ok(parsed
        .list
        .into_iter()
        // soft-deleted instances are not usable and will be purged
        .filter(|entry| entry.state != "Deleted")
        .map(|entry| VmInfo {
            name: entry.name,
            state: parse_state(&entry.state),
            ipv4: entry.ipv4.into_iter().next(),
            image: entry.release,
        })
        .collect())
}

fn parse_info(vm: &str, json: &str) -> Result<VmInfo, VmControlError> {
    let parsed: InfoOutput = serde_json::from_str(json).map_err(|e| VmControlError::Parse {
        what: "multipass info output",
        message: e.to_string(),
    })?;
    let entry = parsed
        .info
        .into_iter()
        .find(|(name, _)| name == vm)
        .map(|(_, entry)| entry)
        .filter(|entry| entry.state != "Deleted")
        .ok_or_else(|| VmControlError::NotFound {
            name: vm.to_string(),
        })?;
    Ok(VmInfo {
        name: vm.to_string(),
        state: parse_state(&entry.state),
        ipv4: entry.ipv4.into_iter().next(),
        image: entry.image_release,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::GoldenImage;
    use crate::work::Resources;

    #[test]
    fn test_parse_list() {
        let json = r#"{
            "list": [
                { "ipv4": ["192.168.64.2"], "name": "dev-vm", "release": "Ubuntu 22.04.3 LTS", "state": "Running" },
                { "ipv4": [], "name": "pg-1", "release": "Ubuntu 22.04.3 LTS", "state": "Stopped" },
                { "ipv4": [], "name": "old", "release": "", "state": "Deleted" }
            ]
        }"#;
        let vms = parse_list(json).unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].state, VmState::Running);
        assert_eq!(vms[0].ipv4.as_deref(), Some("192.168.64.2"));
        assert_eq!(vms[1].state, VmState::Stopped);
        assert!(vms[1].ipv4.is_none());
    }

    #[test]
    fn test_parse_info() {
        let json = r#"{
            "errors": [],
            "info": {
                "app-dev": {
                    "cpu_count": "4",
                    "image_release": "22.04 LTS",
                    "ipv4": ["192.168.64.7", "10.0.0.2"],
                    "snapshot_count": "1",
                    "state": "Suspended"
                }
            }
        }"#;
        let info = parse_info("app-dev", json).unwrap();
        assert_eq!(info.state, VmState::Suspended);
        assert_eq!(info.ipv4.as_deref(), Some("192.168.64.7"));
        assert_eq!(info.image.as_deref(), Some("22.04 LTS"));

        assert!(parse_info("other", json).unwrap_err().is_not_found());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(
            "info failed: The following errors occurred:\ninstance \"pg-9\" does not exist"
        ));
        assert!(!is_not_found("launch failed: Remote \"\" is unknown or unreachable."));
    }

    #[test]
    fn test_launch_args() {
        let spec = LaunchSpec {
            name: "leasevisor-0".into(),
            image_name: "golden-1".into(),
            image: GoldenImage {
                source: "22.04".into(),
                cloud_init: Some(PathBuf::from("podman-setup.yaml")),
                ..GoldenImage::default()
            },
            resources: Resources::new(2, 4096, 20),
        };
        let args = launch_args(&spec);
        assert_eq!(
            args,
            vec![
                "launch", "22.04", "--name", "leasevisor-0", "--cpus", "2", "--memory", "4096M",
                "--disk", "20G", "--cloud-init", "podman-setup.yaml"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let backend = MultipassBackend::new(MultipassConfig {
            binary: PathBuf::from("/nonexistent/multipass"),
            ..MultipassConfig::default()
        });
        let err = backend.stop("vm").await.unwrap_err();
        assert!(matches!(err, VmControlError::Io { operation: "stop", .. }));
    }
}
