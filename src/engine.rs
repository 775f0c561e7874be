//! Engine - public entry point for leasing VMs to work items
//!
//! ```text
//!  submit(WorkItem)
//!     │ validate · resolve image · reserve work-item id
//!     ▼
//!  PoolManager::acquire / acquire_wait ──► SlotHandle (holds an admission permit)
//!     │
//!     ▼
//!  tokio::spawn(LeaseController::run) ──► watch::Sender<Lease>
//!     │                                        │
//!     ▼                                        ▼
//!  archive on Released               status() / wait() / cancel()
//! ```
//!
//! Every lease gets a child of the engine's shutdown token, so `shutdown()`
//! cancels all in-flight leases before the pool deletes its VMs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AdmissionMode, BackendConfig, EngineConfig};
use crate::error::{EngineError, PoolError};
use crate::exec::{RemoteExecutor, SshExecutor};
use crate::lease::controller::LeaseState;
use crate::lease::{Lease, LeaseController, LeaseId};
use crate::pool::{PoolManager, PoolStats, SlotDisposition, SlotId, SlotRequest};
use crate::snapshot::SnapshotManager;
use crate::vm::{
    FirecrackerBackend, ImageRegistry, MultipassBackend, VmControl, VmInfo,
};
use crate::work::WorkItem;

struct ActiveLease {
    state: LeaseState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// In-flight and recently finished leases
#[derive(Default)]
struct LeaseTable {
    active: HashMap<LeaseId, ActiveLease>,
    /// Work-item ids with a submit in progress (`None`) or a lease in flight
    work_items: HashMap<String, Option<LeaseId>>,
    archive: HashMap<LeaseId, Lease>,
    order: VecDeque<LeaseId>,
    capacity: usize,
}

impl LeaseTable {
    fn archive(&mut self, lease: Lease) {
        self.active.remove(&lease.id);
        if self.work_items.get(&lease.work_item) == Some(&Some(lease.id)) {
            self.work_items.remove(&lease.work_item);
        }
        if self.capacity == 0 {
            return;
        }
        self.order.push_back(lease.id);
        self.archive.insert(lease.id, lease);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
    }
}

fn lock(table: &Mutex<LeaseTable>) -> MutexGuard<'_, LeaseTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a work-item id if `submit` bails out before the lease exists
struct Reservation<'a> {
    table: &'a Mutex<LeaseTable>,
    work_item: String,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut table = lock(self.table);
            if table.work_items.get(&self.work_item) == Some(&None) {
                table.work_items.remove(&self.work_item);
            }
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    images: ImageRegistry,
    pool: Arc<PoolManager>,
    controller: Arc<LeaseController>,
    leases: Arc<Mutex<LeaseTable>>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over the given backend and remote executor
    pub fn new(
        config: EngineConfig,
        control: Arc<dyn VmControl>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let images = ImageRegistry::new(config.images.clone());

        let snapshots = Arc::new(SnapshotManager::new(
            control,
            Arc::clone(&executor),
            config.timeouts.clone(),
            config.retry.backoff.clone(),
            config.pool.idle_policy,
            config.ssh.host.clone(),
        ));
        let pool = Arc::new(PoolManager::new(
            config.pool.clone(),
            &config.admission,
            snapshots,
            images.clone(),
            config.retry.cleanup_attempts,
        ));
        let controller = Arc::new(LeaseController::new(
            Arc::clone(&pool),
            executor,
            config.timeouts.clone(),
            config.retry.provision_retries,
            config.output_limit,
        ));

        info!(
            backend = pool.snapshots().control().backend(),
            max_slots = config.pool.max_slots,
            max_concurrent = config.admission.max_concurrent,
            images = images.names().count(),
            "engine created"
        );

        Ok(Self {
            leases: Arc::new(Mutex::new(LeaseTable {
                capacity: config.lease_history,
                ..Default::default()
            })),
            images,
            pool,
            controller,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            config,
        })
    }

    /// Build an engine with the configured backend and the SSH executor
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let control: Arc<dyn VmControl> = match &config.backend {
            BackendConfig::Multipass(c) => Arc::new(MultipassBackend::new(c.clone())),
            BackendConfig::Firecracker(c) => Arc::new(FirecrackerBackend::new(c.clone())),
        };
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
            config.ssh.clone(),
            config.retry.backoff.clone(),
        ));
        Self::new(config, control, executor)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Pre-warm slots and start background maintenance
    ///
    /// Returns how many slots were warmed.
    pub async fn start(&self) -> usize {
        let warmed = self.pool.initialize().await;
        let task = PoolManager::start_maintenance(Arc::clone(&self.pool));
        let previous = self
            .maintenance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        warmed
    }

    fn reserve(&self, work_item: &str) -> Result<Reservation<'_>, EngineError> {
        let mut table = lock(&self.leases);
        if let Some(holder) = table.work_items.get(work_item) {
            // a lease that already published Released no longer owns the id
            let finished = holder
                .and_then(|id| table.active.get(&id))
                .is_some_and(|active| active.state.borrow().is_terminal());
            if !finished {
                return Err(EngineError::DuplicateWorkItem(work_item.to_string()));
            }
        }
        table.work_items.insert(work_item.to_string(), None);
        Ok(Reservation {
            table: &self.leases,
            work_item: work_item.to_string(),
            armed: true,
        })
    }

    /// Admit a work item and start its lease
    ///
    /// In non-blocking admission mode a saturated pool fails fast with
    /// [`PoolError::Busy`]; in blocking mode this waits up to the configured
    /// admission timeout. The returned id is valid for `status`, `wait` and
    /// `cancel` immediately.
    pub async fn submit(&self, item: WorkItem) -> Result<LeaseId, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        item.validate()?;
        let image = self.images.resolve(&item.image)?.clone();
        let reservation = self.reserve(&item.id)?;

        let id = LeaseId::new();
        let request = SlotRequest {
            lease: id,
            work_item: item.id.clone(),
            image: item.image.clone(),
            resources: item.resources,
        };
        let admission = self.pool.admission();
        let handle = match admission.mode() {
            AdmissionMode::NonBlocking => self.pool.acquire(&request),
            AdmissionMode::Blocking => {
                let wait = admission.wait_timeout();
                tokio::select! {
                    _ = self.shutdown.cancelled() => Err(PoolError::Cancelled),
                    result = self.pool.acquire_wait(&request, wait) => result,
                }
            }
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(PoolError::Cancelled) if self.shutdown.is_cancelled() => {
                return Err(EngineError::ShuttingDown)
            }
            Err(e) => {
                debug!(work_item = %item.id, error = %e, "submit rejected");
                return Err(e.into());
            }
        };

        let state: LeaseState = Arc::new(watch::channel(Lease::new(id, &item)).0);
        let cancel = self.shutdown.child_token();
        {
            let mut table = lock(&self.leases);
            table.active.insert(
                id,
                ActiveLease {
                    state: Arc::clone(&state),
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            table.work_items.insert(reservation.work_item.clone(), Some(id));
        }
        reservation.disarm();

        let task = {
            let controller = Arc::clone(&self.controller);
            let leases = Arc::clone(&self.leases);
            let item = Arc::new(item);
            tokio::spawn(async move {
                controller
                    .run(item, image, handle, Arc::clone(&state), cancel)
                    .await;
                let lease = state.borrow().clone();
                lock(&leases).archive(lease);
            })
        };
        if let Some(entry) = lock(&self.leases).active.get_mut(&id) {
            entry.task = Some(task);
        }

        Ok(id)
    }

    /// Submit `item` and wait for its lease to finish
    ///
    /// A saturated pool ([`PoolError::Busy`]) is retried with the configured
    /// back-off; every other rejection is returned as-is.
    pub async fn run(&self, item: WorkItem) -> Result<Lease, EngineError> {
        let mut delays = self.config.retry.backoff.delays();
        let id = loop {
            match self.submit(item.clone()).await {
                Err(EngineError::Pool(PoolError::Busy(reason))) => match delays.next() {
                    Some(delay) => {
                        debug!(work_item = %item.id, ?delay, %reason, "pool busy, retrying submit");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(EngineError::Pool(PoolError::Busy(reason))),
                },
                submitted => break submitted?,
            }
        };
        self.wait(id).await
    }

    /// Snapshot of a lease, in flight or archived
    pub fn status(&self, id: LeaseId) -> Result<Lease, EngineError> {
        let table = lock(&self.leases);
        if let Some(active) = table.active.get(&id) {
            return Ok(active.state.borrow().clone());
        }
        table
            .archive
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownLease(id.to_string()))
    }

    /// Wait until the lease is `Released` and return its final record
    pub async fn wait(&self, id: LeaseId) -> Result<Lease, EngineError> {
        let mut rx = {
            let table = lock(&self.leases);
            match (table.active.get(&id), table.archive.get(&id)) {
                (Some(active), _) => active.state.subscribe(),
                (None, Some(lease)) => return Ok(lease.clone()),
                (None, None) => return Err(EngineError::UnknownLease(id.to_string())),
            }
        };
        let finished = match rx.wait_for(Lease::is_terminal).await {
            Ok(lease) => Some(lease.clone()),
            Err(_) => None,
        };
        match finished {
            Some(lease) => Ok(lease),
            None => self.status(id),
        }
    }

    /// Ask an in-flight lease to stop
    ///
    /// The lease still cleans up its slot and ends `Released` with outcome
    /// `Cancelled`. Cancelling a finished lease is a no-op.
    pub fn cancel(&self, id: LeaseId) -> Result<(), EngineError> {
        let table = lock(&self.leases);
        if let Some(active) = table.active.get(&id) {
            info!(lease_id = %id, "cancelling lease");
            active.cancel.cancel();
            return Ok(());
        }
        if table.archive.contains_key(&id) {
            return Ok(());
        }
        Err(EngineError::UnknownLease(id.to_string()))
    }

    /// Return a held or quarantined slot to service
    pub async fn reclaim(&self, slot: SlotId) -> Result<SlotDisposition, EngineError> {
        Ok(self.pool.reclaim(slot).await?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Leases still in flight
    pub fn active_leases(&self) -> Vec<LeaseId> {
        lock(&self.leases).active.keys().copied().collect()
    }

    /// VMs the backend currently knows about
    pub async fn vms(&self) -> Result<Vec<VmInfo>, EngineError> {
        Ok(self.pool.snapshots().control().list().await?)
    }

    /// Launch `vm` from `image`, run `setup`, and save it as `snapshot`
    pub async fn prepare_golden(
        &self,
        image: &str,
        vm: &str,
        setup: &[String],
        snapshot: &str,
    ) -> Result<(), EngineError> {
        let golden = self.images.resolve(image)?;
        self.pool
            .snapshots()
            .prepare_golden(
                vm,
                image,
                golden,
                self.config.pool.slot_resources,
                setup,
                snapshot,
            )
            .await?;
        info!(image, vm, snapshot, "golden snapshot ready");
        Ok(())
    }

    /// Cancel every lease, wait for their cleanup, then tear the pool down
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.shutdown.cancel();

        let tasks: Vec<(LeaseId, JoinHandle<()>)> = lock(&self.leases)
            .active
            .iter_mut()
            .filter_map(|(id, active)| active.task.take().map(|t| (*id, t)))
            .collect();
        for (id, task) in tasks {
            if let Err(e) = task.await {
                warn!(lease_id = %id, error = %e, "lease task ended abnormally");
            }
        }

        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        self.pool.shutdown().await;
        if let Some(task) = maintenance {
            let _ = task.await;
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkItem;

    fn finished(work_item: &str) -> Lease {
        let mut lease = Lease::new(LeaseId::new(), &WorkItem::new(work_item, "img", "true"));
        lease.transition(crate::lease::LeasePhase::Released);
        lease
    }

    #[test]
    fn test_archive_evicts_oldest() {
        let mut table = LeaseTable {
            capacity: 2,
            ..Default::default()
        };
        let leases: Vec<Lease> = (0..3).map(|i| finished(&format!("w-{}", i))).collect();
        let ids: Vec<LeaseId> = leases.iter().map(|l| l.id).collect();
        for lease in leases {
            table.work_items.insert(lease.work_item.clone(), Some(lease.id));
            table.archive(lease);
        }

        assert!(!table.archive.contains_key(&ids[0]));
        assert!(table.archive.contains_key(&ids[1]));
        assert!(table.archive.contains_key(&ids[2]));
        assert!(table.work_items.is_empty());
    }

    #[test]
    fn test_archive_keeps_newer_owner_of_work_item() {
        let mut table = LeaseTable {
            capacity: 4,
            ..Default::default()
        };
        let old = finished("w-1");
        let newer = LeaseId::new();
        table.work_items.insert("w-1".into(), Some(newer));
        table.archive(old);
        assert_eq!(table.work_items.get("w-1"), Some(&Some(newer)));
    }

    #[test]
    fn test_zero_history_keeps_nothing() {
        let mut table = LeaseTable::default();
        let lease = finished("w-0");
        let id = lease.id;
        table.archive(lease);
        assert!(!table.archive.contains_key(&id));
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let table = Mutex::new(LeaseTable::default());
        table.lock().unwrap().work_items.insert("w-1".into(), None);
        {
            let _reservation = Reservation {
                table: &table,
                work_item: "w-1".into(),
                armed: true,
            };
        }
        assert!(table.lock().unwrap().work_items.is_empty());

        table.lock().unwrap().work_items.insert("w-2".into(), None);
        Reservation {
            table: &table,
            work_item: "w-2".into(),
            armed: true,
        }
        .disarm();
        assert!(table.lock().unwrap().work_items.contains_key("w-2"));
    }
}
