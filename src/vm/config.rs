//! Firecracker API payloads
//!
//! These structs are the JSON bodies of the Firecracker API requests the
//! backend issues.

use serde::Serialize;

/// Boot source configuration for the VM kernel
#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// vCPU and memory sizing
#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
}

/// Block device (drive) configuration
#[derive(Serialize, Debug, Clone)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// Guest network interface backed by a host tap device
#[derive(Serialize, Debug, Clone)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

/// VM action (e.g., "InstanceStart")
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

/// VM state change ("Paused" / "Resumed")
#[derive(Serialize, Debug, Clone)]
pub struct VmStateChange {
    pub state: String,
}

/// Snapshot creation configuration
#[derive(Serialize, Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_type: String,
    pub snapshot_path: String,
    pub mem_file_path: String,
}

/// Memory backend configuration for snapshot loading
#[derive(Serialize, Debug, Clone)]
pub struct MemBackend {
    pub backend_type: String,
    pub backend_path: String,
}

/// Snapshot load configuration (v1.14+ API)
#[derive(Serialize, Debug, Clone)]
pub struct SnapshotLoad {
    pub snapshot_path: String,
    pub mem_backend: MemBackend,
    pub resume_vm: bool,
}
