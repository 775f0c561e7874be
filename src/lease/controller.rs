//! Lease Lifecycle Controller - drives one slot through one work item
//!
//! The controller runs a guarded body (provision, setup, workload, capture)
//! and then takes a single exit path that resets the slot and hands it back
//! to the pool. Every way out of the body (success, error, cancellation)
//! goes through that exit path, so a non-debug lease enters `CleaningUp`
//! exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Lease, LeaseOutcome, LeasePhase};
use crate::config::TimeoutConfig;
use crate::error::{ExecError, LeaseError, SnapshotError};
use crate::exec::{with_params, CommandOutput, RemoteExecutor, VmTarget};
use crate::metrics::{LEASES_IN_FLIGHT, LEASES_TOTAL, LEASE_DURATION, PHASE_DURATION, PROVISION_DURATION};
use crate::pool::{PoolManager, Preparation, Release, SlotDisposition, SlotHandle, Warmth};
use crate::snapshot::{SnapshotManager, CLEAN_SNAPSHOT};
use crate::vm::GoldenImage;
use crate::work::WorkItem;

/// Observable lease record shared between the controller and the engine
pub type LeaseState = Arc<watch::Sender<Lease>>;

/// Exit code recorded for a setup command that ran out of time
const SETUP_TIMEOUT_EXIT: i32 = 124;

/// Extra time given to the executor to enforce its own timeout
const EXEC_GRACE: Duration = Duration::from_secs(2);

pub struct LeaseController {
    pool: Arc<PoolManager>,
    snapshots: Arc<SnapshotManager>,
    executor: Arc<dyn RemoteExecutor>,
    timeouts: TimeoutConfig,
    provision_retries: u32,
    output_limit: usize,
}

impl LeaseController {
    pub fn new(
        pool: Arc<PoolManager>,
        executor: Arc<dyn RemoteExecutor>,
        timeouts: TimeoutConfig,
        provision_retries: u32,
        output_limit: usize,
    ) -> Self {
        Self {
            snapshots: Arc::clone(pool.snapshots()),
            pool,
            executor,
            timeouts,
            provision_retries,
            output_limit,
        }
    }

    /// Run a lease to its terminal outcome
    ///
    /// Returns once the slot is back with the pool and the lease is
    /// `Released`.
    pub async fn run(
        &self,
        item: Arc<WorkItem>,
        image: GoldenImage,
        handle: SlotHandle,
        state: LeaseState,
        cancel: CancellationToken,
    ) {
        let lease_id = state.borrow().id;
        let span = info_span!(
            "lease",
            lease_id = %lease_id,
            work_item = %item.id,
            image = %item.image,
            otel.name = "lease"
        );
        self.drive(item, image, handle, state, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        item: Arc<WorkItem>,
        image: GoldenImage,
        mut handle: SlotHandle,
        state: LeaseState,
        cancel: CancellationToken,
    ) {
        LEASES_IN_FLIGHT.inc();
        let started = Instant::now();
        info!(
            slot_id = %handle.slot(),
            vm = %handle.vm_name(),
            preparation = handle.preparation().as_str(),
            debug = item.debug,
            "lease started"
        );
        state.send_modify(|lease| {
            lease.slot = Some(handle.slot());
            lease.vm = Some(handle.vm_name().to_string());
            lease.attempts = 1;
        });

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LeaseError::Cancelled),
            result = self.guarded(&item, &image, &mut handle, &state, &cancel) => result,
        };

        match &body {
            Ok(()) => {}
            Err(LeaseError::WorkloadFailure(code)) => {
                info!(exit_code = code, "workload failed");
            }
            Err(LeaseError::WorkloadTimeout(ms)) => {
                info!(timeout_ms = ms, "workload timed out");
            }
            Err(e) => {
                warn!(error = %e, "lease failed");
                self.enter(&state, LeasePhase::Failed);
            }
        }

        // single exit path: the slot always goes back to the pool from here
        let slot = handle.slot();
        let (disposition, cleanup_error) = if item.debug {
            info!(slot_id = %slot, vm = %handle.vm_name(), "debug lease, keeping VM for inspection");
            (self.pool.release(handle, Release::Hold), None)
        } else {
            self.enter(&state, LeasePhase::CleaningUp);
            let release = self
                .pool
                .reset(handle.vm_name(), handle.clean_snapshot())
                .await;
            let mut cleanup_error = match &release {
                Release::Quarantine(reason) => Some(LeaseError::CleanupFailure(reason.clone())),
                _ => None,
            };
            let disposition = self.pool.release(handle, release);
            if disposition == SlotDisposition::Retired {
                let failures = self
                    .pool
                    .slot(slot)
                    .map(|s| s.consecutive_failures)
                    .unwrap_or_default();
                cleanup_error = Some(LeaseError::QuarantineExhaustion { slot, failures });
            }
            (disposition, cleanup_error)
        };

        // outcome and Released are published together so no observer sees
        // a terminal lease without its result
        let outcome = LeaseOutcome::from_result(&body);
        let failure = body.err();
        self.enter_with(&state, LeasePhase::Released, move |lease| {
            lease.outcome = outcome;
            lease.failure = failure;
            lease.cleanup_error = cleanup_error;
            lease.slot_disposition = Some(disposition);
            lease.finished_at = Some(Utc::now());
        });

        let elapsed = started.elapsed();
        LEASES_TOTAL.with_label_values(&[outcome.as_str()]).inc();
        LEASE_DURATION
            .with_label_values(&[outcome.as_str()])
            .observe(elapsed.as_secs_f64());
        LEASES_IN_FLIGHT.dec();
        info!(
            outcome = %outcome,
            slot_id = %slot,
            disposition = %disposition,
            duration_ms = elapsed.as_millis() as u64,
            "lease released"
        );
    }

    async fn guarded(
        &self,
        item: &WorkItem,
        image: &GoldenImage,
        handle: &mut SlotHandle,
        state: &LeaseState,
        cancel: &CancellationToken,
    ) -> Result<(), LeaseError> {
        let target = self.provision(item, image, handle, state, cancel).await?;
        self.setup(item, &target, state, cancel).await?;
        self.workload(item, &target, state, cancel).await
    }

    /// Bring the slot up, moving to another slot on retryable failures
    async fn provision(
        &self,
        item: &WorkItem,
        image: &GoldenImage,
        handle: &mut SlotHandle,
        state: &LeaseState,
        cancel: &CancellationToken,
    ) -> Result<VmTarget, LeaseError> {
        let mut retries_left = self.provision_retries;
        loop {
            self.enter(state, LeasePhase::Provisioning);
            let error = match self.bring_up(item, image, handle, cancel).await {
                Ok(target) => {
                    info!(vm = %target.vm, host = %target.host, "slot ready");
                    return Ok(target);
                }
                Err(e) if e.is_retryable() && retries_left > 0 => e,
                Err(e) => return Err(e),
            };

            retries_left -= 1;
            let from = handle.slot();
            if let Err(pool_err) = self.pool.replace(handle, error.to_string()) {
                warn!(error = %error, reason = %pool_err, "provisioning failed and no other slot is free");
                return Err(error);
            }
            warn!(error = %error, from = %from, to = %handle.slot(), "provisioning failed, retrying on another slot");
            state.send_modify(|lease| {
                lease.slot = Some(handle.slot());
                lease.vm = Some(handle.vm_name().to_string());
                lease.attempts += 1;
            });
        }
    }

    async fn bring_up(
        &self,
        item: &WorkItem,
        image: &GoldenImage,
        handle: &mut SlotHandle,
        cancel: &CancellationToken,
    ) -> Result<VmTarget, LeaseError> {
        let start = Instant::now();
        let preparation = handle.preparation();
        let vm = handle.vm_name().to_string();

        let result = match preparation {
            Preparation::Fresh => {
                let fresh = self
                    .snapshots
                    .provision_fresh(&vm, &item.image, image, handle.resources(), CLEAN_SNAPSHOT, cancel)
                    .await;
                if fresh.is_ok() {
                    self.pool.mark_provisioned(handle, &item.image);
                }
                fresh
            }
            Preparation::Warm => self.snapshots.bring_up(&vm, Warmth::Running, cancel).await,
            Preparation::Resume => self.snapshots.bring_up(&vm, Warmth::Suspended, cancel).await,
            Preparation::Start => self.snapshots.bring_up(&vm, Warmth::Stopped, cancel).await,
        };

        match result {
            Ok(target) => {
                PROVISION_DURATION
                    .with_label_values(&[preparation.as_str()])
                    .observe(start.elapsed().as_secs_f64());
                Ok(target)
            }
            Err(SnapshotError::Cancelled { .. }) => Err(LeaseError::Cancelled),
            Err(e @ SnapshotError::NotReady { .. }) => Err(LeaseError::ConnectionError(e.to_string())),
            Err(SnapshotError::Vm(e)) => Err(LeaseError::ProvisionError(e.to_string())),
        }
    }

    /// Run setup commands in order; the first failure aborts
    async fn setup(
        &self,
        item: &WorkItem,
        target: &VmTarget,
        state: &LeaseState,
        cancel: &CancellationToken,
    ) -> Result<(), LeaseError> {
        self.enter(state, LeasePhase::SettingUp);
        for (index, command) in item.setup.iter().enumerate() {
            debug!(index, command = %command, "running setup command");
            let full = with_params(&item.params, command);
            let exit_code = match self
                .exec(target, &full, self.timeouts.setup_command(), cancel)
                .await
            {
                Ok(output) if output.success() => continue,
                Ok(output) => {
                    let code = output.exit_code;
                    self.attach(state, output);
                    code
                }
                Err(ExecError::Timeout { partial, .. }) => {
                    self.attach(state, *partial);
                    SETUP_TIMEOUT_EXIT
                }
                Err(e) => return Err(e.into()),
            };
            return Err(LeaseError::SetupFailure {
                index,
                command: command.clone(),
                exit_code,
            });
        }
        Ok(())
    }

    async fn workload(
        &self,
        item: &WorkItem,
        target: &VmTarget,
        state: &LeaseState,
        cancel: &CancellationToken,
    ) -> Result<(), LeaseError> {
        self.enter(state, LeasePhase::Running);
        let timeout = item.timeout.unwrap_or_else(|| self.timeouts.default_workload());
        state.send_modify(|lease| {
            lease.deadline = chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
        });

        let command = with_params(&item.params, &item.workload);
        match self.exec(target, &command, timeout, cancel).await {
            Ok(output) => {
                self.enter(state, LeasePhase::CapturingOutput);
                let code = output.exit_code;
                self.attach(state, output);
                if code == 0 {
                    Ok(())
                } else {
                    Err(LeaseError::WorkloadFailure(code))
                }
            }
            Err(ExecError::Timeout { partial, .. }) => {
                self.enter(state, LeasePhase::CapturingOutput);
                self.attach(state, *partial);
                Err(LeaseError::WorkloadTimeout(timeout.as_millis() as u64))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one command, bounded by `timeout` and abandoned on cancellation
    async fn exec(
        &self,
        target: &VmTarget,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let run = tokio::time::timeout(timeout + EXEC_GRACE, self.executor.run(target, command, timeout));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled { target: target.to_string() }),
            result = run => match result {
                Ok(result) => result,
                Err(_) => Err(ExecError::Timeout {
                    target: target.to_string(),
                    timeout,
                    partial: Box::default(),
                }),
            },
        }
    }

    fn attach(&self, state: &LeaseState, output: CommandOutput) {
        let output = output.truncated(self.output_limit);
        state.send_modify(|lease| lease.capture(output));
    }

    fn enter(&self, state: &LeaseState, phase: LeasePhase) {
        self.enter_with(state, phase, |_| {});
    }

    /// Move to `phase` and apply `update` in the same watch publication
    fn enter_with(&self, state: &LeaseState, phase: LeasePhase, update: impl FnOnce(&mut Lease)) {
        state.send_modify(|lease| {
            update(lease);
            let previous = lease.phase;
            if let Some(spent) = lease.transition(phase) {
                PHASE_DURATION
                    .with_label_values(&[previous.as_str()])
                    .observe(spent.as_secs_f64());
            }
        });
        debug!(phase = %phase, "lease phase");
    }
}
