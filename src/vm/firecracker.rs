//! Firecracker backend
//!
//! One Firecracker process per VM, configured through its HTTP API over a
//! Unix domain socket. Each VM gets a private directory under `work_dir`:
//!
//! ```text
//! {work_dir}/{vm}/
//! ├── api.socket          ← Firecracker API
//! ├── rootfs.ext4         ← private copy of the golden rootfs
//! ├── {snap}.rootfs       ← disk state of a snapshot
//! ├── {snap}.vmstate      ← device/vCPU state (live snapshots only)
//! └── {snap}.mem          ← guest memory (live snapshots only)
//! ```
//!
//! Firecracker has no "stopped but defined" state, so a stopped VM is just
//! its directory; `start` boots a fresh process from the current rootfs.
//! Snapshots taken while stopped are disk-only; snapshots of a running VM
//! also capture memory and restore into a paused VM.
//!
//! Networking uses pre-created tap devices `{tap_prefix}{index}` with the
//! guest at `{subnet}.{index}.2` and the host at `{subnet}.{index}.1`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Method;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::*;
use super::lifecycle::{spawn_firecracker, to_absolute_path, wait_for_api_socket};
use super::{LaunchSpec, VmControl, VmInfo, VmState};
use crate::error::VmControlError;
use crate::work::Resources;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Client for communicating with Firecracker's control API
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send one API request; non-2xx responses become `CommandFailed`
    async fn send_request<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: T,
    ) -> Result<(), VmControlError> {
        let api_error = |message: String| VmControlError::CommandFailed {
            operation: "firecracker api",
            name: self.socket_path.display().to_string(),
            message,
        };

        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_string(&body).map_err(|e| VmControlError::Parse {
            what: "firecracker request",
            message: e.to_string(),
        })?;

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| api_error(format!("{}: {}", endpoint, e)))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| api_error(format!("{}: {}", endpoint, e)))?;
        let status = res.status();

        if !status.is_success() {
            let body = res
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(api_error(format!("{} returned {}: {}", endpoint, status, body)));
        }

        Ok(())
    }

    pub async fn machine_config(&self, vcpu_count: u32, mem_size_mib: u64) -> Result<(), VmControlError> {
        self.send_request(
            Method::PUT,
            "/machine-config",
            MachineConfig {
                vcpu_count,
                mem_size_mib,
            },
        )
        .await
    }

    /// Configure the boot source (kernel and boot arguments)
    pub async fn boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        boot_args: impl Into<String>,
    ) -> Result<(), VmControlError> {
        self.send_request(
            Method::PUT,
            "/boot-source",
            BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args: boot_args.into(),
            },
        )
        .await
    }

    /// Add a block device (drive) to the VM
    pub async fn add_drive(
        &self,
        drive_id: impl Into<String>,
        path_on_host: impl Into<String>,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<(), VmControlError> {
        let drive_id = drive_id.into();
        let endpoint = format!("/drives/{}", drive_id);

        self.send_request(
            Method::PUT,
            &endpoint,
            Drive {
                drive_id,
                path_on_host: path_on_host.into(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    pub async fn add_network_interface(
        &self,
        iface_id: impl Into<String>,
        host_dev_name: impl Into<String>,
        guest_mac: impl Into<String>,
    ) -> Result<(), VmControlError> {
        let iface_id = iface_id.into();
        let endpoint = format!("/network-interfaces/{}", iface_id);

        self.send_request(
            Method::PUT,
            &endpoint,
            NetworkInterface {
                iface_id,
                host_dev_name: host_dev_name.into(),
                guest_mac: guest_mac.into(),
            },
        )
        .await
    }

    /// Start the VM instance
    pub async fn start(&self) -> Result<(), VmControlError> {
        self.send_request(
            Method::PUT,
            "/actions",
            Action {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await
    }

    pub async fn pause(&self) -> Result<(), VmControlError> {
        self.set_state("Paused").await
    }

    pub async fn resume(&self) -> Result<(), VmControlError> {
        self.set_state("Resumed").await
    }

    async fn set_state(&self, state: &str) -> Result<(), VmControlError> {
        self.send_request(
            Method::PATCH,
            "/vm",
            VmStateChange {
                state: state.to_string(),
            },
        )
        .await
    }

    /// Create a full snapshot of a paused VM
    pub async fn create_snapshot(
        &self,
        snapshot_path: impl Into<String>,
        mem_file_path: impl Into<String>,
    ) -> Result<(), VmControlError> {
        self.send_request(
            Method::PUT,
            "/snapshot/create",
            SnapshotConfig {
                snapshot_type: "Full".to_string(),
                snapshot_path: snapshot_path.into(),
                mem_file_path: mem_file_path.into(),
            },
        )
        .await
    }

    /// Load a snapshot into a freshly spawned process
    pub async fn load_snapshot(
        &self,
        snapshot_path: impl Into<String>,
        mem_file_path: impl Into<String>,
        resume_vm: bool,
    ) -> Result<(), VmControlError> {
        self.send_request(
            Method::PUT,
            "/snapshot/load",
            SnapshotLoad {
                snapshot_path: snapshot_path.into(),
                mem_backend: MemBackend {
                    backend_type: "File".to_string(),
                    backend_path: mem_file_path.into(),
                },
                resume_vm,
            },
        )
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    /// Parent of every VM's private directory
    pub work_dir: PathBuf,
    /// Kernel used when the golden image does not name one
    pub kernel: PathBuf,
    pub boot_args: String,
    /// Host tap devices are `{tap_prefix}{index}`
    pub tap_prefix: String,
    /// First two octets of the per-VM /24 networks
    pub subnet: String,
    /// Deadline for the API socket to appear
    pub api_timeout_ms: u64,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./firecracker"),
            work_dir: PathBuf::from("/tmp/leasevisor-firecracker"),
            kernel: PathBuf::from("./vmlinux"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw".to_string(),
            tap_prefix: "fc-tap".to_string(),
            subnet: "172.16".to_string(),
            api_timeout_ms: 10_000,
        }
    }
}

/// Everything the backend tracks for one VM
struct FcVm {
    name: String,
    index: u32,
    image_name: String,
    kernel: PathBuf,
    boot_args: String,
    resources: Resources,
    dir: PathBuf,
    process: Option<Child>,
    client: Option<FirecrackerClient>,
    state: VmState,
    snapshots: BTreeSet<String>,
}

impl FcVm {
    fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs.ext4")
    }

    fn api_socket(&self) -> PathBuf {
        self.dir.join("api.socket")
    }

    fn snapshot_files(&self, snapshot: &str) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.rootfs", snapshot)),
            self.dir.join(format!("{}.vmstate", snapshot)),
            self.dir.join(format!("{}.mem", snapshot)),
        )
    }

    /// Notice a Firecracker process that exited on its own
    fn refresh(&mut self) {
        if let Some(child) = self.process.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(vm = %self.name, ?status, "firecracker process exited");
                self.process = None;
                self.client = None;
                self.state = VmState::Stopped;
            }
        }
    }

    fn client(&self, operation: &'static str) -> Result<&FirecrackerClient, VmControlError> {
        self.client.as_ref().ok_or_else(|| VmControlError::InvalidState {
            name: self.name.clone(),
            state: self.state.to_string(),
            operation,
        })
    }
}

/// Table entry; the index is kept outside the per-VM lock so allocation
/// never waits on a VM that is mid-boot
struct FcEntry {
    index: u32,
    vm: Arc<Mutex<FcVm>>,
}

/// VM control through Firecracker processes
pub struct FirecrackerBackend {
    config: FirecrackerConfig,
    vms: StdMutex<HashMap<String, FcEntry>>,
}

impl FirecrackerBackend {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config,
            vms: StdMutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, FcEntry>> {
        self.vms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, vm: &str) -> Result<Arc<Mutex<FcVm>>, VmControlError> {
        self.table()
            .get(vm)
            .map(|entry| Arc::clone(&entry.vm))
            .ok_or_else(|| VmControlError::NotFound {
                name: vm.to_string(),
            })
    }

    /// Add a record for `spec` with the lowest free tap/IP index
    ///
    /// The index stays taken until the entry leaves the table, either in
    /// `delete` or when the launch fails.
    fn register(&self, spec: &LaunchSpec) -> Result<Arc<Mutex<FcVm>>, VmControlError> {
        let mut table = self.table();
        if table.contains_key(&spec.name) {
            return Err(VmControlError::CommandFailed {
                operation: "launch",
                name: spec.name.clone(),
                message: "a VM with this name already exists".to_string(),
            });
        }
        let used: BTreeSet<u32> = table.values().map(|entry| entry.index).collect();
        let index = (1..).find(|i| !used.contains(i)).unwrap_or(1);
        let vm = Arc::new(Mutex::new(FcVm {
            name: spec.name.clone(),
            index,
            image_name: spec.image_name.clone(),
            kernel: spec
                .image
                .kernel
                .clone()
                .unwrap_or_else(|| self.config.kernel.clone()),
            boot_args: spec
                .image
                .boot_args
                .clone()
                .unwrap_or_else(|| self.config.boot_args.clone()),
            resources: spec.resources,
            dir: self.config.work_dir.join(&spec.name),
            process: None,
            client: None,
            state: VmState::Starting,
            snapshots: BTreeSet::new(),
        }));
        table.insert(
            spec.name.clone(),
            FcEntry {
                index,
                vm: Arc::clone(&vm),
            },
        );
        Ok(vm)
    }

    fn guest_ip(&self, index: u32) -> String {
        format!("{}.{}.2", self.config.subnet, index)
    }

    fn guest_mac(index: u32) -> String {
        format!("06:00:AC:10:{:02X}:02", index & 0xff)
    }

    /// Kernel network arguments for a VM index
    fn ip_boot_arg(&self, index: u32) -> String {
        format!(
            "ip={}::{}.{}.1:255.255.255.0::eth0:off",
            self.guest_ip(index),
            self.config.subnet,
            index
        )
    }

    /// Spawn a process, configure it and boot from the current rootfs
    async fn boot(&self, vm: &mut FcVm) -> Result<(), VmControlError> {
        let (child, client) = self.spawn_process(vm).await?;
        let configured = async {
            client
                .machine_config(vm.resources.cpus, vm.resources.memory_mib)
                .await?;
            client
                .boot_source(
                    to_absolute_path(&vm.kernel)?.display().to_string(),
                    format!("{} {}", vm.boot_args, self.ip_boot_arg(vm.index)),
                )
                .await?;
            client
                .add_drive("rootfs", vm.rootfs().display().to_string(), true, false)
                .await?;
            client
                .add_network_interface(
                    "eth0",
                    format!("{}{}", self.config.tap_prefix, vm.index),
                    Self::guest_mac(vm.index),
                )
                .await?;
            client.start().await
        }
        .await;

        // on error the child is dropped here and killed
        configured?;
        vm.process = Some(child);
        vm.client = Some(client);
        vm.state = VmState::Running;
        Ok(())
    }

    async fn spawn_process(&self, vm: &FcVm) -> Result<(Child, FirecrackerClient), VmControlError> {
        let socket = vm.api_socket();
        let _ = tokio::fs::remove_file(&socket).await;
        let child = spawn_firecracker(&self.config.binary, &socket)?;
        wait_for_api_socket(
            &vm.name,
            &socket,
            Duration::from_millis(self.config.api_timeout_ms),
        )
        .await?;
        Ok((child, FirecrackerClient::new(socket)))
    }

    async fn kill(vm: &mut FcVm) {
        vm.client = None;
        if let Some(mut child) = vm.process.take() {
            if let Err(e) = child.kill().await {
                debug!(vm = %vm.name, error = %e, "firecracker already gone");
            }
        }
        let _ = tokio::fs::remove_file(vm.api_socket()).await;
        vm.state = VmState::Stopped;
    }

    fn info_of(&self, vm: &mut FcVm) -> VmInfo {
        vm.refresh();
        VmInfo {
            name: vm.name.clone(),
            state: vm.state,
            ipv4: (vm.state == VmState::Running).then(|| self.guest_ip(vm.index)),
            image: Some(vm.image_name.clone()),
        }
    }
}

async fn copy_file(from: &Path, to: &Path, operation: &'static str) -> Result<(), VmControlError> {
    tokio::fs::copy(from, to)
        .await
        .map(drop)
        .map_err(|source| VmControlError::Io { operation, source })
}

#[async_trait]
impl VmControl for FirecrackerBackend {
    fn backend(&self) -> &'static str {
        "firecracker"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<VmInfo, VmControlError> {
        let record = self.register(spec)?;

        let mut vm = record.lock().await;
        info!(vm = %spec.name, index = vm.index, image = %spec.image_name, "launching firecracker VM");

        let launched = async {
            tokio::fs::create_dir_all(&vm.dir)
                .await
                .map_err(|source| VmControlError::Io {
                    operation: "create VM directory",
                    source,
                })?;
            let source = to_absolute_path(Path::new(&spec.image.source))?;
            copy_file(&source, &vm.rootfs(), "copy golden rootfs").await?;
            self.boot(&mut vm).await
        }
        .await;

        if let Err(e) = launched {
            Self::kill(&mut vm).await;
            let _ = tokio::fs::remove_dir_all(&vm.dir).await;
            self.table().remove(&spec.name);
            return Err(e);
        }
        Ok(self.info_of(&mut vm))
    }

    async fn start(&self, name: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        vm.refresh();
        match vm.state {
            VmState::Running => Ok(()),
            VmState::Suspended => {
                vm.client("start")?.resume().await?;
                vm.state = VmState::Running;
                Ok(())
            }
            _ => self.boot(&mut vm).await,
        }
    }

    async fn stop(&self, name: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        Self::kill(&mut vm).await;
        Ok(())
    }

    async fn suspend(&self, name: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        vm.refresh();
        if vm.state == VmState::Suspended {
            return Ok(());
        }
        vm.client("suspend")?.pause().await?;
        vm.state = VmState::Suspended;
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        vm.refresh();
        if vm.state == VmState::Running {
            return Ok(());
        }
        vm.client("resume")?.resume().await?;
        vm.state = VmState::Running;
        Ok(())
    }

    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        vm.refresh();
        let (disk, vmstate, mem) = vm.snapshot_files(snapshot);

        match vm.state {
            VmState::Running | VmState::Suspended => {
                let was_running = vm.state == VmState::Running;
                let client = vm.client("snapshot")?;
                if was_running {
                    client.pause().await?;
                }
                client
                    .create_snapshot(vmstate.display().to_string(), mem.display().to_string())
                    .await?;
                copy_file(&vm.rootfs(), &disk, "copy snapshot rootfs").await?;
                if was_running {
                    client.resume().await?;
                }
            }
            _ => {
                // disk-only snapshot; drop stale live state from an older one
                let _ = tokio::fs::remove_file(&vmstate).await;
                let _ = tokio::fs::remove_file(&mem).await;
                copy_file(&vm.rootfs(), &disk, "copy snapshot rootfs").await?;
            }
        }
        vm.snapshots.insert(snapshot.to_string());
        debug!(vm = %name, snapshot, "snapshot created");
        Ok(())
    }

    async fn restore(&self, name: &str, snapshot: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        vm.refresh();
        if vm.state != VmState::Stopped {
            return Err(VmControlError::InvalidState {
                name: name.to_string(),
                state: vm.state.to_string(),
                operation: "restore",
            });
        }
        if !vm.snapshots.contains(snapshot) {
            return Err(VmControlError::NotFound {
                name: format!("{}.{}", name, snapshot),
            });
        }

        let (disk, vmstate, mem) = vm.snapshot_files(snapshot);
        copy_file(&disk, &vm.rootfs(), "restore snapshot rootfs").await?;

        if tokio::fs::try_exists(&vmstate).await.unwrap_or(false) {
            let (child, client) = self.spawn_process(&vm).await?;
            client
                .load_snapshot(vmstate.display().to_string(), mem.display().to_string(), false)
                .await?;
            vm.process = Some(child);
            vm.client = Some(client);
            vm.state = VmState::Suspended;
        }
        Ok(())
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<(), VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        if !vm.snapshots.remove(snapshot) {
            return Err(VmControlError::NotFound {
                name: format!("{}.{}", name, snapshot),
            });
        }
        let (disk, vmstate, mem) = vm.snapshot_files(snapshot);
        for path in [disk, vmstate, mem] {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), VmControlError> {
        let record = self
            .table()
            .remove(name)
            .ok_or_else(|| VmControlError::NotFound {
                name: name.to_string(),
            })?
            .vm;
        let mut vm = record.lock().await;
        Self::kill(&mut vm).await;
        if let Err(e) = tokio::fs::remove_dir_all(&vm.dir).await {
            warn!(vm = %name, error = %e, "failed to remove VM directory");
        }
        info!(vm = %name, "firecracker VM deleted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>, VmControlError> {
        let records: Vec<Arc<Mutex<FcVm>>> = self
            .table()
            .values()
            .map(|entry| Arc::clone(&entry.vm))
            .collect();
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let mut vm = record.lock().await;
            infos.push(self.info_of(&mut vm));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn info(&self, name: &str) -> Result<VmInfo, VmControlError> {
        let record = self.get(name)?;
        let mut vm = record.lock().await;
        Ok(self.info_of(&mut vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_addressing() {
        let backend = FirecrackerBackend::new(FirecrackerConfig::default());
        assert_eq!(backend.guest_ip(3), "172.16.3.2");
        assert_eq!(
            backend.ip_boot_arg(3),
            "ip=172.16.3.2::172.16.3.1:255.255.255.0::eth0:off"
        );
        assert_eq!(FirecrackerBackend::guest_mac(10), "06:00:AC:10:0A:02");
    }

    #[tokio::test]
    async fn test_unknown_vm_is_not_found() {
        let backend = FirecrackerBackend::new(FirecrackerConfig::default());
        assert!(backend.stop("ghost").await.unwrap_err().is_not_found());
        assert!(backend.delete("ghost").await.unwrap_err().is_not_found());
        assert!(backend.info("ghost").await.unwrap_err().is_not_found());
        assert!(backend.list().await.unwrap().is_empty());
    }

    fn spec(name: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.into(),
            image_name: "golden-1".into(),
            image: super::super::GoldenImage::new("/nonexistent/rootfs.ext4"),
            resources: Resources::default(),
        }
    }

    #[tokio::test]
    async fn test_busy_vm_keeps_its_network_index() {
        let backend = FirecrackerBackend::new(FirecrackerConfig::default());
        let first = backend.register(&spec("leasevisor-0")).unwrap();

        // a launch holds the record lock across boot
        let booting = first.lock().await;
        assert_eq!(booting.index, 1);
        let second = backend.register(&spec("leasevisor-1")).unwrap();
        assert_eq!(second.lock().await.index, 2);
        drop(booting);

        assert!(backend.register(&spec("leasevisor-0")).is_err());
        backend.table().remove("leasevisor-0");
        let third = backend.register(&spec("leasevisor-2")).unwrap();
        assert_eq!(third.lock().await.index, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_get_distinct_indices() {
        let backend = Arc::new(FirecrackerBackend::new(FirecrackerConfig::default()));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    let record = backend.register(&spec(&format!("leasevisor-{i}"))).unwrap();
                    let vm = record.lock().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    vm.index
                })
            })
            .collect();
        let mut indices = BTreeSet::new();
        for task in tasks {
            assert!(indices.insert(task.await.unwrap()));
        }
        assert_eq!(indices, (1..=16).collect::<BTreeSet<u32>>());
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FirecrackerBackend::new(FirecrackerConfig {
            binary: PathBuf::from("/nonexistent/firecracker"),
            work_dir: dir.path().to_path_buf(),
            ..FirecrackerConfig::default()
        });
        let spec = LaunchSpec {
            name: "slot-0".into(),
            image_name: "golden-1".into(),
            image: super::super::GoldenImage::new("/nonexistent/rootfs.ext4"),
            resources: Resources::default(),
        };
        assert!(backend.launch(&spec).await.is_err());
        assert!(backend.info("slot-0").await.unwrap_err().is_not_found());
    }
}
