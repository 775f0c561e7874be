//! LeaseVisor - leases pre-warmed, snapshot-backed VMs to untrusted work items
//!
//! Each work item gets an isolated VM from a bounded pool, runs its setup
//! commands and workload over a remote shell, and the VM is rolled back to a
//! clean snapshot before anyone else may use it.
//!
//! # Modules
//!
//! - `engine` - public entry point: submit, status, wait, cancel, reclaim
//! - `lease` - lease record and the lifecycle controller
//! - `pool` - slots, admission control and background maintenance
//! - `snapshot` - readiness, reset and fresh provisioning
//! - `vm` - backend-agnostic VM control (Multipass, Firecracker)
//! - `exec` - remote command execution (SSH) with retry/back-off
//! - `config` - engine configuration, loaded from JSON
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - logging and OpenTelemetry tracing
//!
//! # Quick Start
//!
//! ```ignore
//! use leasevisor::{Engine, EngineConfig, WorkItem};
//!
//! let engine = Engine::from_config(EngineConfig::load("leasevisor.json")?)?;
//! engine.start().await;
//!
//! let id = engine.submit(WorkItem::new("job-1", "jammy", "make test")).await?;
//! let lease = engine.wait(id).await?;
//! println!("{} exit={:?}", lease.outcome, lease.exit_code);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod lease;
pub mod metrics;
pub mod pool;
pub mod snapshot;
pub mod telemetry;
pub mod vm;
pub mod work;

// Re-export commonly used types at crate root for convenience
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, LeaseError, PoolError};
pub use lease::{Lease, LeaseId, LeaseOutcome, LeasePhase};
pub use pool::{PoolStats, SlotId, SlotState};
pub use work::{Resources, WorkItem};
