//! Leases - one work item bound to one slot for one execution
//!
//! A lease moves through these phases; every transition is recorded with a
//! timestamp in [`Lease::history`]:
//!
//! ```text
//! Requested ─► Provisioning ─► SettingUp ─► Running ─► CapturingOutput ─┐
//!                   │              │           │                        │
//!                   └──────────────┴───────────┴──► Failed ─────────────┤
//!                                                                       ▼
//!                                                  CleaningUp ─► Released
//! ```
//!
//! Debug leases go straight to `Released` and keep their slot `Held`.

pub mod controller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use controller::LeaseController;

use crate::error::LeaseError;
use crate::exec::CommandOutput;
use crate::pool::{SlotDisposition, SlotId};
use crate::work::WorkItem;

/// Lease identifier (UUID v7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LeaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(LeaseId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePhase {
    Requested,
    /// Launching fresh or resuming the slot's VM
    Provisioning,
    SettingUp,
    Running,
    CapturingOutput,
    CleaningUp,
    Failed,
    Released,
}

impl LeasePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeasePhase::Requested => "requested",
            LeasePhase::Provisioning => "provisioning",
            LeasePhase::SettingUp => "setting_up",
            LeasePhase::Running => "running",
            LeasePhase::CapturingOutput => "capturing_output",
            LeasePhase::CleaningUp => "cleaning_up",
            LeasePhase::Failed => "failed",
            LeasePhase::Released => "released",
        }
    }
}

impl std::fmt::Display for LeasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Pending,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl LeaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseOutcome::Pending => "pending",
            LeaseOutcome::Success => "success",
            LeaseOutcome::Failed => "failed",
            LeaseOutcome::TimedOut => "timed_out",
            LeaseOutcome::Cancelled => "cancelled",
        }
    }

    /// Outcome for a lease whose guarded body ended with `result`
    pub fn from_result(result: &Result<(), LeaseError>) -> Self {
        match result {
            Ok(()) => LeaseOutcome::Success,
            Err(LeaseError::WorkloadTimeout(_)) => LeaseOutcome::TimedOut,
            Err(LeaseError::Cancelled) => LeaseOutcome::Cancelled,
            Err(_) => LeaseOutcome::Failed,
        }
    }
}

impl std::fmt::Display for LeaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a lease's phase history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: LeasePhase,
    pub at: DateTime<Utc>,
}

/// A lease and everything recorded about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub work_item: String,
    pub image: String,
    pub debug: bool,
    /// Slot currently (or finally) bound to the lease
    pub slot: Option<SlotId>,
    pub vm: Option<String>,
    pub phase: LeasePhase,
    pub history: Vec<PhaseTransition>,
    pub outcome: LeaseOutcome,
    /// Why the lease did not succeed
    pub failure: Option<LeaseError>,
    /// Reset failure; fatal to the slot, not to the lease outcome
    pub cleanup_error: Option<LeaseError>,
    pub slot_disposition: Option<SlotDisposition>,
    /// Slots tried, including provisioning retries
    pub attempts: u32,
    /// Exit code of the workload, or of the setup command that failed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    /// When the workload's time budget runs out
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn new(id: LeaseId, item: &WorkItem) -> Self {
        let now = Utc::now();
        Self {
            id,
            work_item: item.id.clone(),
            image: item.image.clone(),
            debug: item.debug,
            slot: None,
            vm: None,
            phase: LeasePhase::Requested,
            history: vec![PhaseTransition {
                phase: LeasePhase::Requested,
                at: now,
            }],
            outcome: LeaseOutcome::Pending,
            failure: None,
            cleanup_error: None,
            slot_disposition: None,
            attempts: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: now,
            deadline: None,
            finished_at: None,
        }
    }

    /// Enter `phase`, returning how long the previous phase lasted
    pub fn transition(&mut self, phase: LeasePhase) -> Option<std::time::Duration> {
        let now = Utc::now();
        let previous = self
            .history
            .last()
            .and_then(|t| (now - t.at).to_std().ok());
        self.phase = phase;
        self.history.push(PhaseTransition { phase, at: now });
        previous
    }

    /// Attach captured command output
    pub fn capture(&mut self, output: CommandOutput) {
        self.exit_code = Some(output.exit_code);
        self.stdout = output.stdout;
        self.stderr = output.stderr;
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == LeasePhase::Released
    }

    /// How many times the lease entered `phase`
    pub fn entered(&self, phase: LeasePhase) -> usize {
        self.history.iter().filter(|t| t.phase == phase).count()
    }

    pub fn phases(&self) -> Vec<LeasePhase> {
        self.history.iter().map(|t| t.phase).collect()
    }
}
