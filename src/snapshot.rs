//! Snapshot/Reset Manager
//!
//! Everything that brings a slot's VM into a known state goes through here:
//!
//! ```text
//!  provision_fresh:  delete stale ─► launch ─► ready ─► stop ─► snapshot ─► start ─► ready
//!  bring_up:         resume | start | (already running) ─► ready
//!  ensure_clean:     stop ─► restore --destructive ─► start ─► ready ─► [suspend]
//! ```
//!
//! "Ready" means the backend reports the VM running with an address *and* a
//! trivial command succeeds over the remote executor. Readiness is polled
//! with back-off under a deadline and can be cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{IdlePolicy, TimeoutConfig};
use crate::error::{SnapshotError, VmControlError};
use crate::exec::{RemoteExecutor, RetryPolicy, VmTarget};
use crate::pool::Warmth;
use crate::vm::{GoldenImage, LaunchSpec, VmControl, VmState};
use crate::work::Resources;

/// Snapshot every slot is reset to between leases
pub const CLEAN_SNAPSHOT: &str = "leasevisor-clean";

/// Command used to probe a VM's remote shell
const READY_PROBE: &str = "true";

/// Result of a successful reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanState {
    /// Restored from the clean snapshot and verified ready
    Restored(Warmth),
    /// The VM no longer exists; the slot must be provisioned again
    Absent,
}

pub struct SnapshotManager {
    control: Arc<dyn VmControl>,
    executor: Arc<dyn RemoteExecutor>,
    timeouts: TimeoutConfig,
    backoff: RetryPolicy,
    idle_policy: IdlePolicy,
    /// Fixed remote-shell address overriding what the backend reports
    host_override: Option<String>,
}

impl SnapshotManager {
    pub fn new(
        control: Arc<dyn VmControl>,
        executor: Arc<dyn RemoteExecutor>,
        timeouts: TimeoutConfig,
        backoff: RetryPolicy,
        idle_policy: IdlePolicy,
        host_override: Option<String>,
    ) -> Self {
        Self {
            control,
            executor,
            timeouts,
            backoff,
            idle_policy,
            host_override,
        }
    }

    pub fn control(&self) -> &Arc<dyn VmControl> {
        &self.control
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// Poll until `vm` is running, has an address and answers a probe command
    pub async fn wait_ready(
        &self,
        vm: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<VmTarget, SnapshotError> {
        let mut last_error = String::from("no attempt completed");

        let poll = async {
            let deadline = Instant::now() + timeout;
            let mut delays = self.backoff.delays();
            let max_delay = Duration::from_millis(self.backoff.max_delay_ms);

            loop {
                match self.probe(vm, deadline).await {
                    Ok(target) => return Ok(target),
                    Err(Probe::Gone(e)) => return Err(SnapshotError::Vm(e)),
                    Err(Probe::NotYet(reason)) => {
                        debug!(vm, reason = %reason, "VM not ready yet");
                        last_error = reason;
                    }
                }
                let delay = delays.next().unwrap_or(max_delay);
                tokio::time::sleep(delay).await;
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SnapshotError::Cancelled { vm: vm.to_string() }),
            polled = tokio::time::timeout(timeout, poll) => match polled {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::NotReady {
                    vm: vm.to_string(),
                    timeout,
                    last_error: String::new(),
                }),
            },
        };

        match result {
            Err(SnapshotError::NotReady { vm, timeout, .. }) => Err(SnapshotError::NotReady {
                vm,
                timeout,
                last_error,
            }),
            other => other,
        }
    }

    async fn probe(&self, vm: &str, deadline: Instant) -> Result<VmTarget, Probe> {
        let info = match self.control.info(vm).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Err(Probe::Gone(e)),
            Err(e) => return Err(Probe::NotYet(e.to_string())),
        };
        if info.state != VmState::Running {
            return Err(Probe::NotYet(format!("state is {}", info.state)));
        }
        let host = match self.host_override.clone().or(info.ipv4) {
            Some(host) => host,
            None => return Err(Probe::NotYet("no address yet".to_string())),
        };
        let target = VmTarget {
            vm: vm.to_string(),
            host,
        };

        let budget = deadline.saturating_duration_since(Instant::now());
        match self.executor.run(&target, READY_PROBE, budget).await {
            Ok(output) if output.success() => Ok(target),
            Ok(output) => Err(Probe::NotYet(format!(
                "probe exited with {}",
                output.exit_code
            ))),
            Err(e) => Err(Probe::NotYet(e.to_string())),
        }
    }

    /// Reset `vm` to `snapshot` and verify it comes back
    ///
    /// A VM that no longer exists is reported as [`CleanState::Absent`], so
    /// resetting a deleted VM is a success.
    pub async fn ensure_clean(&self, vm: &str, snapshot: &str) -> Result<CleanState, SnapshotError> {
        let timeout = self.timeouts.cleanup();
        let reset = async {
            match self.control.stop(vm).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(CleanState::Absent),
                Err(e) => return Err(SnapshotError::Vm(e)),
            }

            if let Err(e) = self.control.restore(vm, snapshot).await {
                // NotFound may be the snapshot rather than the VM
                if e.is_not_found() && self.is_absent(vm).await {
                    return Ok(CleanState::Absent);
                }
                return Err(SnapshotError::Vm(e));
            }

            self.control.start(vm).await?;
            self.wait_ready(vm, self.timeouts.ready(), &CancellationToken::new())
                .await?;

            let warmth = match self.idle_policy {
                IdlePolicy::KeepRunning => Warmth::Running,
                IdlePolicy::Suspend => {
                    self.control.suspend(vm).await?;
                    Warmth::Suspended
                }
            };
            Ok(CleanState::Restored(warmth))
        };

        match tokio::time::timeout(timeout, reset).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Vm(VmControlError::Timeout {
                operation: "reset to snapshot",
                name: vm.to_string(),
                timeout,
            })),
        }
    }

    async fn is_absent(&self, vm: &str) -> bool {
        matches!(self.control.info(vm).await, Err(e) if e.is_not_found())
    }

    /// Bring an existing VM from `warmth` to ready
    pub async fn bring_up(
        &self,
        vm: &str,
        warmth: Warmth,
        cancel: &CancellationToken,
    ) -> Result<VmTarget, SnapshotError> {
        let timeout = self.timeouts.provision();
        let power_on = async {
            match warmth {
                Warmth::Running => Ok(()),
                Warmth::Suspended => self.control.resume(vm).await,
                Warmth::Stopped => self.control.start(vm).await,
            }
        };
        match tokio::time::timeout(timeout, power_on).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SnapshotError::Vm(VmControlError::Timeout {
                    operation: "power on",
                    name: vm.to_string(),
                    timeout,
                }))
            }
        }
        self.wait_ready(vm, self.timeouts.ready(), cancel).await
    }

    /// Launch `vm` from a golden image and record its clean snapshot
    ///
    /// A VM left under the same name (an earlier instance of the slot) is
    /// deleted first. On failure the half-built VM is deleted again.
    pub async fn provision_fresh(
        &self,
        vm: &str,
        image_name: &str,
        image: &GoldenImage,
        resources: Resources,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<VmTarget, SnapshotError> {
        self.discard(vm).await?;

        let spec = LaunchSpec {
            name: vm.to_string(),
            image_name: image_name.to_string(),
            image: image.clone(),
            resources,
        };
        info!(vm, image = image_name, %resources, "provisioning fresh VM");

        let built = async {
            let timeout = self.timeouts.provision();
            match tokio::time::timeout(timeout, self.control.launch(&spec)).await {
                Ok(launched) => launched?,
                Err(_) => {
                    return Err(SnapshotError::Vm(VmControlError::Timeout {
                        operation: "launch",
                        name: vm.to_string(),
                        timeout,
                    }))
                }
            };
            self.wait_ready(vm, self.timeouts.ready(), cancel).await?;
            self.control.stop(vm).await?;
            self.control.snapshot(vm, snapshot).await?;
            self.control.start(vm).await?;
            self.wait_ready(vm, self.timeouts.ready(), cancel).await
        }
        .await;

        if let Err(e) = &built {
            warn!(vm, error = %e, "fresh provisioning failed, deleting VM");
            if let Err(delete_err) = self.discard(vm).await {
                warn!(vm, error = %delete_err, "failed to delete half-built VM");
            }
        }
        built
    }

    /// Put a freshly reset or provisioned VM into its idle power state
    pub async fn park(&self, vm: &str) -> Warmth {
        match self.idle_policy {
            IdlePolicy::KeepRunning => Warmth::Running,
            IdlePolicy::Suspend => match self.control.suspend(vm).await {
                Ok(()) => Warmth::Suspended,
                Err(e) => {
                    warn!(vm, error = %e, "suspend failed, leaving VM running");
                    Warmth::Running
                }
            },
        }
    }

    /// Delete `vm` if it exists
    pub async fn discard(&self, vm: &str) -> Result<(), VmControlError> {
        match self.control.delete(vm).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Build a golden VM: launch, run `setup` in order, stop, snapshot
    ///
    /// Golden-image preparation only; never on the lease hot path. The VM is
    /// left stopped on success so it can be cloned or inspected.
    pub async fn prepare_golden(
        &self,
        vm: &str,
        image_name: &str,
        image: &GoldenImage,
        resources: Resources,
        setup: &[String],
        snapshot: &str,
    ) -> Result<(), SnapshotError> {
        let cancel = CancellationToken::new();
        self.discard(vm).await?;
        let spec = LaunchSpec {
            name: vm.to_string(),
            image_name: image_name.to_string(),
            image: image.clone(),
            resources,
        };
        info!(vm, image = image_name, "launching golden VM");
        self.control.launch(&spec).await?;
        let target = self.wait_ready(vm, self.timeouts.ready(), &cancel).await?;

        for (index, command) in setup.iter().enumerate() {
            info!(vm, index, command = %command, "golden setup");
            let failed = |message: String| {
                SnapshotError::Vm(VmControlError::CommandFailed {
                    operation: "golden setup",
                    name: vm.to_string(),
                    message: format!("#{} `{}`: {}", index, command, message),
                })
            };
            let output = self
                .executor
                .run(&target, command, self.timeouts.setup_command())
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !output.success() {
                return Err(failed(format!(
                    "exit code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
        }

        self.control.stop(vm).await?;
        self.create_snapshot(vm, snapshot).await?;
        Ok(())
    }

    pub async fn create_snapshot(&self, vm: &str, name: &str) -> Result<(), VmControlError> {
        info!(vm, snapshot = name, "creating snapshot");
        self.control.snapshot(vm, name).await
    }

    pub async fn delete_snapshot(&self, vm: &str, name: &str) -> Result<(), VmControlError> {
        info!(vm, snapshot = name, "deleting snapshot");
        self.control.delete_snapshot(vm, name).await
    }
}

enum Probe {
    /// The VM does not exist; waiting will not help
    Gone(VmControlError),
    NotYet(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::exec::CommandOutput;
    use crate::vm::VmInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend with one VM whose state the test scripts
    struct ScriptedVm {
        state: Mutex<Option<VmState>>,
        calls: Mutex<Vec<String>>,
        info_calls: AtomicU32,
        running_after: u32,
    }

    impl ScriptedVm {
        fn new(state: Option<VmState>, running_after: u32) -> Self {
            Self {
                state: Mutex::new(state),
                calls: Mutex::new(Vec::new()),
                info_calls: AtomicU32::new(0),
                running_after,
            }
        }

        fn record(&self, call: &str) -> Result<(), VmControlError> {
            self.calls.lock().unwrap().push(call.to_string());
            if self.state.lock().unwrap().is_none() {
                return Err(VmControlError::NotFound { name: "vm".into() });
            }
            Ok(())
        }

        fn set(&self, state: VmState) {
            *self.state.lock().unwrap() = Some(state);
        }
    }

    #[async_trait]
    impl VmControl for ScriptedVm {
        fn backend(&self) -> &'static str {
            "scripted"
        }
        async fn launch(&self, spec: &LaunchSpec) -> Result<VmInfo, VmControlError> {
            self.calls.lock().unwrap().push("launch".into());
            self.set(VmState::Running);
            self.info(&spec.name).await
        }
        async fn start(&self, _: &str) -> Result<(), VmControlError> {
            self.record("start")?;
            self.set(VmState::Running);
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<(), VmControlError> {
            self.record("stop")?;
            self.set(VmState::Stopped);
            Ok(())
        }
        async fn suspend(&self, _: &str) -> Result<(), VmControlError> {
            self.record("suspend")?;
            self.set(VmState::Suspended);
            Ok(())
        }
        async fn resume(&self, _: &str) -> Result<(), VmControlError> {
            self.record("resume")?;
            self.set(VmState::Running);
            Ok(())
        }
        async fn snapshot(&self, _: &str, _: &str) -> Result<(), VmControlError> {
            self.record("snapshot")
        }
        async fn restore(&self, _: &str, _: &str) -> Result<(), VmControlError> {
            self.record("restore")
        }
        async fn delete_snapshot(&self, _: &str, _: &str) -> Result<(), VmControlError> {
            self.record("delete_snapshot")
        }
        async fn delete(&self, _: &str) -> Result<(), VmControlError> {
            self.record("delete")?;
            *self.state.lock().unwrap() = None;
            Ok(())
        }
        async fn list(&self) -> Result<Vec<VmInfo>, VmControlError> {
            Ok(Vec::new())
        }
        async fn info(&self, vm: &str) -> Result<VmInfo, VmControlError> {
            let n = self.info_calls.fetch_add(1, Ordering::SeqCst);
            let state = self
                .state
                .lock()
                .unwrap()
                .ok_or_else(|| VmControlError::NotFound { name: vm.into() })?;
            let state = if n < self.running_after { VmState::Starting } else { state };
            Ok(VmInfo {
                name: vm.to_string(),
                state,
                ipv4: Some("10.0.0.2".into()),
                image: None,
            })
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl RemoteExecutor for AlwaysOk {
        async fn run(&self, _: &VmTarget, _: &str, _: Duration) -> Result<CommandOutput, ExecError> {
            Ok(CommandOutput::default())
        }
    }

    fn manager(control: Arc<ScriptedVm>, policy: IdlePolicy) -> SnapshotManager {
        let timeouts = TimeoutConfig {
            ready_ms: 500,
            cleanup_ms: 2_000,
            provision_ms: 2_000,
            ..TimeoutConfig::default()
        };
        SnapshotManager::new(
            control,
            Arc::new(AlwaysOk),
            timeouts,
            RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
            policy,
            None,
        )
    }

    #[tokio::test]
    async fn test_wait_ready_polls_until_running() {
        let vm = Arc::new(ScriptedVm::new(Some(VmState::Running), 3));
        let mgr = manager(vm.clone(), IdlePolicy::KeepRunning);
        let target = mgr
            .wait_ready("vm", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(target.host, "10.0.0.2");
        assert!(vm.info_calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_with_reason() {
        let vm = Arc::new(ScriptedVm::new(Some(VmState::Stopped), 0));
        let mgr = manager(vm, IdlePolicy::KeepRunning);
        let err = mgr
            .wait_ready("vm", Duration::from_millis(80), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SnapshotError::NotReady { last_error, .. } => assert!(last_error.contains("Stopped")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_cancelled() {
        let vm = Arc::new(ScriptedVm::new(Some(VmState::Stopped), 0));
        let mgr = manager(vm, IdlePolicy::KeepRunning);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = mgr
            .wait_ready("vm", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_ensure_clean_restores_and_suspends() {
        let vm = Arc::new(ScriptedVm::new(Some(VmState::Running), 0));
        let mgr = manager(vm.clone(), IdlePolicy::Suspend);
        let state = mgr.ensure_clean("vm", CLEAN_SNAPSHOT).await.unwrap();
        assert_eq!(state, CleanState::Restored(Warmth::Suspended));
        assert_eq!(
            *vm.calls.lock().unwrap(),
            vec!["stop", "restore", "start", "suspend"]
        );
    }

    #[tokio::test]
    async fn test_ensure_clean_on_missing_vm_is_absent() {
        let vm = Arc::new(ScriptedVm::new(None, 0));
        let mgr = manager(vm, IdlePolicy::KeepRunning);
        assert_eq!(
            mgr.ensure_clean("vm", CLEAN_SNAPSHOT).await.unwrap(),
            CleanState::Absent
        );
    }

    #[tokio::test]
    async fn test_provision_fresh_snapshots_while_stopped() {
        let vm = Arc::new(ScriptedVm::new(None, 0));
        let mgr = manager(vm.clone(), IdlePolicy::KeepRunning);
        mgr.provision_fresh(
            "vm",
            "golden-1",
            &GoldenImage::new("22.04"),
            Resources::default(),
            CLEAN_SNAPSHOT,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            *vm.calls.lock().unwrap(),
            vec!["delete", "launch", "stop", "snapshot", "start"]
        );
    }

    /// Executor that fails any command mentioning "broken"
    struct FailsOnBroken;

    #[async_trait]
    impl RemoteExecutor for FailsOnBroken {
        async fn run(&self, _: &VmTarget, command: &str, _: Duration) -> Result<CommandOutput, ExecError> {
            Ok(CommandOutput {
                exit_code: if command.contains("broken") { 2 } else { 0 },
                stderr: "no such package".into(),
                ..CommandOutput::default()
            })
        }
    }

    #[tokio::test]
    async fn test_prepare_golden_leaves_stopped_snapshot() {
        let vm = Arc::new(ScriptedVm::new(None, 0));
        let mgr = manager(vm.clone(), IdlePolicy::KeepRunning);
        let setup = vec!["apt-get install -y build-essential".to_string()];
        mgr.prepare_golden("golden", "jammy", &GoldenImage::new("22.04"), Resources::default(), &setup, "base")
            .await
            .unwrap();
        assert_eq!(*vm.calls.lock().unwrap(), vec!["delete", "launch", "stop", "snapshot"]);
        assert_eq!(*vm.state.lock().unwrap(), Some(VmState::Stopped));

        mgr.delete_snapshot("golden", "base").await.unwrap();
        assert_eq!(vm.calls.lock().unwrap().last().unwrap(), "delete_snapshot");
    }

    #[tokio::test]
    async fn test_prepare_golden_stops_at_failed_setup() {
        let vm = Arc::new(ScriptedVm::new(None, 0));
        let mgr = SnapshotManager::new(
            vm.clone(),
            Arc::new(FailsOnBroken),
            TimeoutConfig {
                ready_ms: 500,
                ..TimeoutConfig::default()
            },
            RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
            IdlePolicy::KeepRunning,
            None,
        );
        let setup = vec!["true-ish".to_string(), "broken step".to_string()];
        let err = mgr
            .prepare_golden("golden", "jammy", &GoldenImage::new("22.04"), Resources::default(), &setup, "base")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken step"), "{}", err);
        assert!(!vm.calls.lock().unwrap().contains(&"snapshot".to_string()));
    }
}
