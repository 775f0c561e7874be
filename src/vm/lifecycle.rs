//! Firecracker process helpers
//!
//! Spawning Firecracker processes and waiting for their API socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant};

use crate::error::VmControlError;

/// Spawn a Firecracker process serving its API on `api_socket`
///
/// The process is killed when the returned handle is dropped, so a VM can
/// never outlive the backend that owns it.
pub fn spawn_firecracker(binary: &Path, api_socket: &Path) -> Result<Child, VmControlError> {
    Command::new(binary)
        .arg("--api-sock")
        .arg(api_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| VmControlError::Io {
            operation: "spawn firecracker",
            source,
        })
}

/// Wait for the Firecracker API socket to appear
pub async fn wait_for_api_socket(
    vm: &str,
    socket_path: &Path,
    timeout: Duration,
) -> Result<(), VmControlError> {
    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(50);

    loop {
        if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(VmControlError::Timeout {
                operation: "wait for API socket",
                name: vm.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Resolve `path` against the current directory
///
/// Firecracker resolves paths relative to its own working directory, so
/// everything handed to its API is made absolute first.
pub fn to_absolute_path(path: &Path) -> Result<PathBuf, VmControlError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| VmControlError::Io {
        operation: "resolve path",
        source,
    })?;
    Ok(cwd.join(path))
}
