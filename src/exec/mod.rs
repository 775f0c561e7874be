//! Remote execution inside leased VMs
//!
//! The engine runs setup commands and workloads through a [`RemoteExecutor`].
//! An executor connects to one VM, runs one command with a deadline and
//! returns exit code plus captured output. It retries the *connection*, never
//! the command: arbitrary commands cannot be assumed idempotent.
//!
//! ```text
//! LeaseController ──run(target, cmd, timeout)──► SshExecutor
//!                                                  │  ssh -i key user@host -- cmd
//!                                                  │  (exit 255 → reconnect w/ back-off)
//!                                                  ▼
//!                                           CommandOutput | ExecError
//! ```

pub mod retry;
pub mod ssh;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use retry::{Backoff, RetryPolicy};
pub use ssh::{SshCredentials, SshExecutor};

use crate::error::ExecError;

/// Where a command runs: the VM's name and the address to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmTarget {
    pub vm: String,
    pub host: String,
}

impl std::fmt::Display for VmTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.vm, self.host)
    }
}

/// Result of a command that ran to completion (or was cut off)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Cap both streams at `limit` bytes, keeping the tail
    pub fn truncated(mut self, limit: usize) -> Self {
        self.stdout = keep_tail(self.stdout, limit);
        self.stderr = keep_tail(self.stderr, limit);
        self
    }
}

/// Runs a single command against a VM
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `target`, terminating it after `timeout`.
    ///
    /// Dropping the returned future terminates the command on a best-effort
    /// basis; the lease controller relies on this for cancellation.
    async fn run(
        &self,
        target: &VmTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;
}

/// Prefix `command` with `export` statements for each parameter
pub fn with_params(params: &BTreeMap<String, String>, command: &str) -> String {
    if params.is_empty() {
        return command.to_string();
    }
    let exports: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("export {}={};", k, shell_quote(v)))
        .collect();
    format!("{} {}", exports.join(" "), command)
}

/// Single-quote a value for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn keep_tail(s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_params_exports_in_order() {
        let mut params = BTreeMap::new();
        params.insert("B".to_string(), "two".to_string());
        params.insert("A".to_string(), "it's".to_string());

        let cmd = with_params(&params, "make test");
        assert_eq!(cmd, r"export A='it'\''s'; export B='two'; make test");
    }

    #[test]
    fn test_with_no_params_is_verbatim() {
        assert_eq!(with_params(&BTreeMap::new(), "exit 0"), "exit 0");
    }

    #[test]
    fn test_truncate_keeps_tail_on_char_boundary() {
        let output = CommandOutput {
            exit_code: 0,
            stdout: "héllo world".to_string(),
            stderr: "ok".to_string(),
            duration_ms: 1,
        }
        .truncated(10);
        assert_eq!(output.stdout, "llo world");
        assert_eq!(output.stderr, "ok");
    }
}
