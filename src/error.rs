//! Error types for the lease engine
//!
//! Errors are grouped by the component that raises them. `LeaseError` is the
//! taxonomy recorded on a lease; the others are surfaced to callers of the
//! pool, the engine and the backends.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::exec::CommandOutput;
use crate::pool::SlotId;

/// Errors returned by a VM control backend (Multipass, Firecracker, ...)
#[derive(Debug, Error)]
pub enum VmControlError {
    /// The VM (or snapshot) does not exist. Cleanup treats this as success.
    #[error("VM '{name}' does not exist")]
    NotFound { name: String },

    /// The backend command ran and reported failure
    #[error("{operation} failed for '{name}': {message}")]
    CommandFailed {
        operation: &'static str,
        name: String,
        message: String,
    },

    /// The backend did not answer within its deadline
    #[error("{operation} for '{name}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        name: String,
        timeout: Duration,
    },

    /// The VM is in a state that does not allow the operation
    #[error("VM '{name}' is {state}, cannot {operation}")]
    InvalidState {
        name: String,
        state: String,
        operation: &'static str,
    },

    /// Backend output could not be parsed
    #[error("failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    /// The backend cannot perform this operation
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl VmControlError {
    /// True when the error means "nothing there", which idempotent cleanup accepts
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmControlError::NotFound { .. })
    }
}

/// Errors returned by a remote executor
#[derive(Debug, Error)]
pub enum ExecError {
    /// The remote shell could not be reached after all connection attempts
    #[error("cannot reach {target} after {attempts} attempt(s): {message}")]
    Connection {
        target: String,
        attempts: u32,
        message: String,
    },

    /// The command ran longer than its budget and was terminated
    #[error("command on {target} timed out after {timeout:?}")]
    Timeout {
        target: String,
        timeout: Duration,
        partial: Box<CommandOutput>,
    },

    /// The local client process could not be started
    #[error("failed to spawn remote shell client: {0}")]
    Spawn(#[source] std::io::Error),

    /// The run was abandoned because its lease was cancelled
    #[error("command on {target} cancelled")]
    Cancelled { target: String },
}

/// Errors from the snapshot/reset manager
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Vm(#[from] VmControlError),

    /// The VM never became reachable before the deadline
    #[error("VM '{vm}' not ready after {timeout:?}: {last_error}")]
    NotReady {
        vm: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("wait for '{vm}' cancelled")]
    Cancelled { vm: String },
}

/// Errors returned by the pool manager and admission controller
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No capacity right now; retry or wait
    #[error("pool is busy: {0}")]
    Busy(String),

    /// No slot of this pool can ever satisfy the request
    #[error("no slot can satisfy the request: {0}")]
    Unsatisfiable(String),

    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),

    /// The slot is not in a state that allows the operation
    #[error("slot {slot} is {state}, expected {expected}")]
    WrongState {
        slot: SlotId,
        state: String,
        expected: &'static str,
    },

    #[error("acquire cancelled")]
    Cancelled,
}

/// Error kinds recorded on a lease
#[derive(Debug, Error, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LeaseError {
    /// VM failed to launch or resume within its timeout
    #[error("provision error: {0}")]
    ProvisionError(String),

    /// Remote shell unreachable after bounded retries
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A setup command exited non-zero (or timed out)
    #[error("setup command #{index} failed with exit code {exit_code}: {command}")]
    SetupFailure {
        index: usize,
        command: String,
        exit_code: i32,
    },

    /// The workload exited non-zero
    #[error("workload failed with exit code {0}")]
    WorkloadFailure(i32),

    /// The workload exceeded its time budget
    #[error("workload timed out after {0} ms")]
    WorkloadTimeout(u64),

    /// Snapshot restore or stop/delete failed; fatal to the slot
    #[error("cleanup failed: {0}")]
    CleanupFailure(String),

    /// The slot failed cleanup too often and left the pool for good
    #[error("slot {slot} retired after {failures} consecutive failures")]
    QuarantineExhaustion { slot: SlotId, failures: u32 },

    #[error("lease cancelled")]
    Cancelled,
}

impl LeaseError {
    /// ProvisionError and ConnectionError may be retried on a fresh slot
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::ProvisionError(_) | LeaseError::ConnectionError(_)
        )
    }
}

impl From<ExecError> for LeaseError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Cancelled { .. } => LeaseError::Cancelled,
            other => LeaseError::ConnectionError(other.to_string()),
        }
    }
}

/// Errors returned by the engine's public entry points
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The same work item is already bound to an active lease
    #[error("work item '{0}' already has an active lease")]
    DuplicateWorkItem(String),

    #[error("unknown golden image '{0}'")]
    UnknownImage(String),

    #[error("invalid work item: {0}")]
    InvalidWorkItem(String),

    #[error("unknown lease {0}")]
    UnknownLease(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    VmControl(#[from] VmControlError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(LeaseError::ProvisionError("boot".into()).is_retryable());
        assert!(LeaseError::ConnectionError("ssh".into()).is_retryable());
        assert!(!LeaseError::WorkloadFailure(1).is_retryable());
        assert!(!LeaseError::CleanupFailure("restore".into()).is_retryable());
        assert!(!LeaseError::Cancelled.is_retryable());
    }

    #[test]
    fn test_exec_error_maps_to_connection() {
        let err = ExecError::Connection {
            target: "slot-0".into(),
            attempts: 3,
            message: "refused".into(),
        };
        assert!(matches!(LeaseError::from(err), LeaseError::ConnectionError(_)));

        let cancelled = ExecError::Cancelled { target: "slot-0".into() };
        assert_eq!(LeaseError::from(cancelled), LeaseError::Cancelled);
    }

    #[test]
    fn test_lease_error_serializes_with_kind_tag() {
        let json = serde_json::to_string(&LeaseError::WorkloadFailure(2)).unwrap();
        assert_eq!(json, r#"{"kind":"workload_failure","detail":2}"#);
    }
}
