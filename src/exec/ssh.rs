//! SSH remote executor
//!
//! Drives the system `ssh` client rather than an in-process SSH stack, so the
//! host's OpenSSH configuration, agent and key formats all keep working.
//!
//! ```text
//!  connect:  ssh … -- true                                  (retried while ssh exits 255)
//!  run:      ssh … -- timeout -s KILL <n> sh -c '<command>'   (exactly once)
//! ```
//!
//! `ssh` exits with 255 when it cannot establish the session, so only the
//! connect probe treats 255 as unreachable. The command itself runs once and
//! its status is reported as-is, 255 included. The remote `timeout` wrapper
//! kills the command in the guest shortly after the local client is killed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{shell_quote, CommandOutput, RemoteExecutor, RetryPolicy, VmTarget};
use crate::error::ExecError;
use crate::metrics::CONNECT_RETRIES;

/// Exit status `ssh` uses for its own errors
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Seconds the remote kill trails the local timeout
const REMOTE_KILL_SLACK_SECS: u64 = 1;

/// Headroom over `ConnectTimeout` before a connect probe is abandoned
const PROBE_SLACK: Duration = Duration::from_secs(5);

/// Remote-shell credentials, read once when the executor is built
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshCredentials {
    pub user: String,
    /// Private key; a leading `~/` expands to `$HOME`
    pub identity_file: PathBuf,
    pub port: u16,
    pub connect_timeout_secs: u32,
    /// Fixed target address; the VM's reported IPv4 is used when absent
    pub host: Option<String>,
    /// Extra `-o` options passed verbatim
    pub options: Vec<String>,
    /// ssh client binary
    pub binary: PathBuf,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            identity_file: PathBuf::from("~/.ssh/id_rsa"),
            port: 22,
            connect_timeout_secs: 10,
            host: None,
            options: vec!["ServerAliveInterval=120".to_string()],
            binary: PathBuf::from("ssh"),
        }
    }
}

impl SshCredentials {
    /// Identity file with `~/` expanded
    pub fn identity_path(&self) -> PathBuf {
        match self.identity_file.strip_prefix("~") {
            Ok(rest) => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(rest),
                None => self.identity_file.clone(),
            },
            Err(_) => self.identity_file.clone(),
        }
    }
}

/// Executes commands over `ssh` with connection retries
pub struct SshExecutor {
    credentials: SshCredentials,
    retry: RetryPolicy,
}

impl SshExecutor {
    pub fn new(credentials: SshCredentials, retry: RetryPolicy) -> Self {
        Self { credentials, retry }
    }

    pub fn credentials(&self) -> &SshCredentials {
        &self.credentials
    }

    /// Arguments for one `ssh` invocation, command last
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let creds = &self.credentials;
        let mut args = vec![
            "-i".to_string(),
            creds.identity_path().display().to_string(),
            "-p".to_string(),
            creds.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", creds.connect_timeout_secs),
            // Slots are reset from snapshots; their host keys are not worth pinning
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        for opt in &creds.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(format!("{}@{}", creds.user, host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    /// Remote command line that kills `command` once `timeout` has passed
    pub fn remote_command(command: &str, timeout: Duration) -> String {
        let secs = timeout.as_secs()
            + u64::from(timeout.subsec_nanos() > 0)
            + REMOTE_KILL_SLACK_SECS;
        format!("timeout -s KILL {} sh -c {}", secs, shell_quote(command))
    }

    /// Spawn one `ssh` client and collect its output, killing it at `timeout`
    async fn invoke(
        &self,
        target: &VmTarget,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let mut child = Command::new(&self.credentials.binary)
            .args(self.ssh_args(host, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;

        let stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Some(status.map_err(ExecError::Spawn)?),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(vm = %target.vm, error = %e, "failed to kill timed-out ssh client");
                }
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let mut output = CommandOutput {
            exit_code: -1,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        let Some(status) = status else {
            return Err(ExecError::Timeout {
                target: target.to_string(),
                timeout,
                partial: Box::new(output),
            });
        };

        // A signal-terminated client has no code; report it like a shell would
        output.exit_code = status.code().unwrap_or(-1);
        Ok(output)
    }

    /// Open a session with a no-op command, retrying while ssh cannot connect
    async fn connect(&self, target: &VmTarget, host: &str) -> Result<(), ExecError> {
        let probe_timeout =
            Duration::from_secs(u64::from(self.credentials.connect_timeout_secs)) + PROBE_SLACK;
        let mut delays = self.retry.delays();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let reason = match self.invoke(target, host, "true", probe_timeout).await {
                Ok(output) if output.exit_code != SSH_CONNECTION_FAILURE => return Ok(()),
                Ok(output) => output
                    .stderr
                    .lines()
                    .last()
                    .unwrap_or("ssh exited with 255")
                    .to_string(),
                Err(ExecError::Timeout { .. }) => "connect probe timed out".to_string(),
                Err(e) => return Err(e),
            };
            match delays.next() {
                Some(delay) => {
                    CONNECT_RETRIES.inc();
                    debug!(vm = %target.vm, attempt = attempts, ?delay, %reason, "ssh unreachable, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ExecError::Connection {
                        target: target.to_string(),
                        attempts,
                        message: reason,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &VmTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let host = self
            .credentials
            .host
            .clone()
            .unwrap_or_else(|| target.host.clone());

        self.connect(target, &host).await?;
        let output = self
            .invoke(target, &host, &Self::remote_command(command, timeout), timeout)
            .await?;
        debug!(vm = %target.vm, exit_code = output.exit_code, duration_ms = output.duration_ms, "remote command finished");
        Ok(output)
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}
