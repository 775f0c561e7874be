//! VM control adapter
//!
//! The engine never talks to a hypervisor directly. Everything it needs from
//! one is behind the narrow [`VmControl`] trait, keyed by VM name:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  VmControl                                                   │
//! │  launch · start · stop · suspend · resume                    │
//! │  snapshot · restore · delete_snapshot · delete · list · info │
//! └───────────────┬───────────────────────────┬──────────────────┘
//!                 │                           │
//!        MultipassBackend             FirecrackerBackend
//!        (multipass CLI)              (API over Unix socket)
//! ```
//!
//! Backends must report a missing VM as [`VmControlError::NotFound`]; the
//! cleanup path relies on it to be idempotent.

pub mod config;
pub mod firecracker;
pub mod images;
pub mod lifecycle;
pub mod multipass;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use firecracker::{FirecrackerBackend, FirecrackerClient, FirecrackerConfig};
pub use images::{GoldenImage, ImageRegistry};
pub use multipass::{MultipassBackend, MultipassConfig};

use crate::error::VmControlError;
use crate::work::Resources;

/// Power state of a VM as the backend reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Starting,
    Running,
    Suspended,
    Stopped,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Starting => write!(f, "Starting"),
            VmState::Running => write!(f, "Running"),
            VmState::Suspended => write!(f, "Suspended"),
            VmState::Stopped => write!(f, "Stopped"),
            VmState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// What the backend knows about one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    /// First IPv4 address, once the guest has one
    pub ipv4: Option<String>,
    /// Image or release the VM was launched from, when known
    pub image: Option<String>,
}

/// Parameters for a fresh launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image_name: String,
    pub image: GoldenImage,
    pub resources: Resources,
}

/// Hypervisor operations the engine consumes
#[async_trait]
pub trait VmControl: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Create and boot a new VM from a golden image
    async fn launch(&self, spec: &LaunchSpec) -> Result<VmInfo, VmControlError>;

    /// Boot a stopped VM
    async fn start(&self, vm: &str) -> Result<(), VmControlError>;

    /// Power the VM off
    async fn stop(&self, vm: &str) -> Result<(), VmControlError>;

    /// Freeze the VM in memory
    async fn suspend(&self, vm: &str) -> Result<(), VmControlError>;

    /// Continue a suspended VM
    async fn resume(&self, vm: &str) -> Result<(), VmControlError>;

    /// Save the VM's state under `snapshot`
    async fn snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError>;

    /// Destructively roll the VM back to `snapshot`; the VM must be stopped
    async fn restore(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError>;

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VmControlError>;

    /// Destroy the VM and everything it owns
    async fn delete(&self, vm: &str) -> Result<(), VmControlError>;

    async fn list(&self) -> Result<Vec<VmInfo>, VmControlError>;

    async fn info(&self, vm: &str) -> Result<VmInfo, VmControlError>;
}
