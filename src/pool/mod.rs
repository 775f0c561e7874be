//! Pool Manager - owns every VM slot and its lifecycle state
//!
//! Slots live in a single arena behind one mutex. All state transitions go
//! through `PoolManager` methods, and a slot's state changes together with
//! its lease binding under that lock.
//!
//! # Slot lifecycle
//!
//! ```text
//!                 acquire                     release(Clean)
//!   ┌──────┐  ───────────────►  ┌────────┐  ───────────────►  ┌──────┐
//!   │ Cold │                    │ Leased │                    │ Idle │
//!   └──────┘  ◄───────────────  └────────┘  ◄───────────────  └──────┘
//!      ▲       release(Absent)   │   │   │        acquire
//!      │                         │   │   └── release(Hold) ──► Held ── reclaim ──► Idle
//!      │                         │   └── release(Quarantine) ─► Quarantined
//!      │                         │                                │ maintenance
//!      │                         │                                ▼
//!      └──────── no image ───────┴─────────────────────────── Recreating ──► Idle
//!
//!   Quarantined / Recreating ── too many consecutive failures ──► Retired
//! ```
//!
//! # Selection order
//!
//! 1. idle slot of the requested image that is running (warm)
//! 2. idle slot of the requested image that is suspended
//! 3. idle slot of the requested image that is stopped
//! 4. cold slot (fresh provisioning)
//! 5. idle slot of another image (repurposed by fresh provisioning)
//!
//! Ties go to the slot idle the longest.

pub mod admission;
pub mod slot;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use admission::AdmissionController;
pub use slot::{Instance, SlotId, SlotState, SlotView, VmSlot, Warmth};

use crate::config::{AdmissionConfig, PoolConfig};
use crate::error::PoolError;
use crate::lease::LeaseId;
use crate::metrics::{CLEANUP_FAILURES, PROVISION_DURATION, SLOTS, SLOTS_RETIRED};
use crate::snapshot::{CleanState, SnapshotManager, CLEAN_SNAPSHOT};
use crate::vm::ImageRegistry;
use crate::work::Resources;

/// What a lease asks the pool for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub lease: LeaseId,
    pub work_item: String,
    pub image: String,
    pub resources: Resources,
}

/// How a claimed slot's VM has to be brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    /// Already running with the right image
    Warm,
    Resume,
    Start,
    /// Launch from the golden image
    Fresh,
}

impl Preparation {
    fn from_warmth(warmth: Warmth) -> Self {
        match warmth {
            Warmth::Running => Preparation::Warm,
            Warmth::Suspended => Preparation::Resume,
            Warmth::Stopped => Preparation::Start,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Preparation::Warm => "warm",
            Preparation::Resume => "resume",
            Preparation::Start => "start",
            Preparation::Fresh => "fresh",
        }
    }
}

/// How a lease hands its slot back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Reset to the clean snapshot and verified
    Clean(Warmth),
    /// The VM no longer exists
    Absent,
    /// Reset failed; take the slot out of rotation
    Quarantine(String),
    /// Debug lease: keep the VM live until reclaimed
    Hold,
}

/// Where a slot ended up after release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotDisposition {
    Clean,
    Quarantined,
    Retired,
    Held,
}

impl std::fmt::Display for SlotDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotDisposition::Clean => write!(f, "clean"),
            SlotDisposition::Quarantined => write!(f, "quarantined"),
            SlotDisposition::Retired => write!(f, "retired"),
            SlotDisposition::Held => write!(f, "held"),
        }
    }
}

/// Statistics about the pool state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_slots: usize,
    pub max_concurrent: usize,
    /// Admission permits not currently held
    pub available_permits: usize,
    pub slots: Vec<SlotView>,
}

impl PoolStats {
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }
}

/// The slot arena and the wake-up for waiting acquirers
struct SlotTable {
    slots: Mutex<Vec<VmSlot>>,
    available: Notify,
    max_cleanup_failures: u32,
}

impl SlotTable {
    fn lock(&self) -> MutexGuard<'_, Vec<VmSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(slots: &[VmSlot]) {
        for state in SlotState::ALL {
            let n = slots.iter().filter(|s| s.state == state).count();
            SLOTS.with_label_values(&[state.as_str()]).set(n as f64);
        }
    }

    /// Count a failure against the slot and take it out of rotation
    fn quarantine_locked(&self, slots: &mut [VmSlot], id: SlotId, reason: String) -> SlotDisposition {
        let slot = &mut slots[id.0];
        slot.consecutive_failures += 1;
        slot.lease = None;
        slot.work_item = None;
        slot.idle_since = None;

        let disposition = if slot.consecutive_failures >= self.max_cleanup_failures {
            slot.state = SlotState::Retired;
            SLOTS_RETIRED.inc();
            error!(
                slot_id = %id,
                vm = %slot.vm_name,
                failures = slot.consecutive_failures,
                reason = %reason,
                "slot retired after repeated failures; pool capacity reduced"
            );
            SlotDisposition::Retired
        } else {
            slot.state = SlotState::Quarantined;
            warn!(
                slot_id = %id,
                vm = %slot.vm_name,
                failures = slot.consecutive_failures,
                reason = %reason,
                "slot quarantined"
            );
            SlotDisposition::Quarantined
        };
        slot.last_failure = Some(reason);
        disposition
    }
}

/// Exclusive claim on one slot, holding one admission permit
///
/// Must be handed back through [`PoolManager::release`]. A handle dropped
/// without release quarantines its slot, since the VM's state is unknown.
pub struct SlotHandle {
    slot: SlotId,
    vm_name: String,
    preparation: Preparation,
    clean_snapshot: Option<String>,
    resources: Resources,
    request: SlotRequest,
    permit: Option<OwnedSemaphorePermit>,
    table: Arc<SlotTable>,
    released: bool,
}

impl SlotHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn preparation(&self) -> Preparation {
        self.preparation
    }

    /// Reset target, once the slot's VM has one
    pub fn clean_snapshot(&self) -> Option<&str> {
        self.clean_snapshot.as_deref()
    }

    /// Size of the slot
    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn request(&self) -> &SlotRequest {
        &self.request
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("slot", &self.slot)
            .field("vm_name", &self.vm_name)
            .field("preparation", &self.preparation)
            .field("lease", &self.request.lease)
            .finish()
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        {
            let mut slots = self.table.lock();
            self.table.quarantine_locked(
                &mut slots,
                self.slot,
                "slot handle dropped without release".to_string(),
            );
            SlotTable::publish(&slots);
        }
        self.table.available.notify_waiters();
    }
}

/// Thread-safe pool of VM slots
pub struct PoolManager {
    config: PoolConfig,
    table: Arc<SlotTable>,
    admission: AdmissionController,
    snapshots: Arc<SnapshotManager>,
    images: ImageRegistry,
    cleanup_attempts: u32,
    shutdown: CancellationToken,
}

impl PoolManager {
    /// Create a pool of `config.max_slots` cold slots
    pub fn new(
        config: PoolConfig,
        admission: &AdmissionConfig,
        snapshots: Arc<SnapshotManager>,
        images: ImageRegistry,
        cleanup_attempts: u32,
    ) -> Self {
        let slots: Vec<VmSlot> = (0..config.max_slots)
            .map(|i| VmSlot::new(SlotId(i), format!("{}-{}", config.name_prefix, i)))
            .collect();
        SlotTable::publish(&slots);

        Self {
            table: Arc::new(SlotTable {
                slots: Mutex::new(slots),
                available: Notify::new(),
                max_cleanup_failures: config.max_cleanup_failures.max(1),
            }),
            admission: AdmissionController::new(admission),
            snapshots,
            images,
            cleanup_attempts: cleanup_attempts.max(1),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    fn check(&self, request: &SlotRequest) -> Result<(), PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        if !self.config.slot_resources.covers(&request.resources) {
            return Err(PoolError::Unsatisfiable(format!(
                "requested {} exceeds slot size {}",
                request.resources, self.config.slot_resources
            )));
        }
        Ok(())
    }

    /// Claim a slot without waiting
    pub fn acquire(&self, request: &SlotRequest) -> Result<SlotHandle, PoolError> {
        self.check(request)?;
        let permit = self.admission.try_admit()?;
        self.claim(request, permit).map_err(|(e, _)| e)
    }

    /// Claim a slot, waiting up to `timeout` for a permit and a free slot
    ///
    /// Dropping the returned future abandons the wait; nothing is claimed.
    pub async fn acquire_wait(
        &self,
        request: &SlotRequest,
        timeout: Duration,
    ) -> Result<SlotHandle, PoolError> {
        self.check(request)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut permit = self.admission.admit_until(deadline).await?;

        loop {
            let notified = self.table.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim(request, permit) {
                Ok(handle) => return Ok(handle),
                Err((PoolError::Busy(_), returned)) => permit = returned,
                Err((e, _)) => return Err(e),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PoolError::Busy(format!(
                    "no slot became available within {:?}",
                    timeout
                )));
            }
            if self.shutdown.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
        }
    }

    /// Pick and occupy a slot for `request`; the permit comes back on failure
    fn claim(
        &self,
        request: &SlotRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<SlotHandle, (PoolError, OwnedSemaphorePermit)> {
        let mut slots = self.table.lock();
        let (index, preparation) = match select(&slots, request) {
            Ok(choice) => choice,
            Err(e) => return Err((e, permit)),
        };
        let handle = self.occupy(&mut slots, index, preparation, request.clone(), permit);
        SlotTable::publish(&slots);
        Ok(handle)
    }

    fn occupy(
        &self,
        slots: &mut [VmSlot],
        index: usize,
        preparation: Preparation,
        request: SlotRequest,
        permit: OwnedSemaphorePermit,
    ) -> SlotHandle {
        let slot = &mut slots[index];
        slot.state = SlotState::Leased;
        slot.lease = Some(request.lease);
        slot.work_item = Some(request.work_item.clone());
        slot.idle_since = None;
        if preparation == Preparation::Fresh {
            slot.instance = None;
            slot.clean_snapshot = None;
        }
        debug!(
            slot_id = %slot.id,
            vm = %slot.vm_name,
            lease_id = %request.lease,
            preparation = preparation.as_str(),
            "slot claimed"
        );

        SlotHandle {
            slot: slot.id,
            vm_name: slot.vm_name.clone(),
            preparation,
            clean_snapshot: slot.clean_snapshot.clone(),
            resources: self.config.slot_resources,
            request,
            permit: Some(permit),
            table: Arc::clone(&self.table),
            released: false,
        }
    }

    /// Move `handle` to another slot, quarantining the one it held
    ///
    /// Used when bringing up the current slot failed. The admission permit
    /// moves with the handle. On error the handle is unchanged.
    pub fn replace(&self, handle: &mut SlotHandle, reason: String) -> Result<SlotDisposition, PoolError> {
        let mut slots = self.table.lock();
        let (index, preparation) = select(&slots, &handle.request)?;

        let slot = &mut slots[index];
        slot.state = SlotState::Leased;
        slot.lease = Some(handle.request.lease);
        slot.work_item = Some(handle.request.work_item.clone());
        slot.idle_since = None;
        if preparation == Preparation::Fresh {
            slot.instance = None;
            slot.clean_snapshot = None;
        }
        let (new_id, new_vm, new_snapshot) =
            (slot.id, slot.vm_name.clone(), slot.clean_snapshot.clone());

        let old = handle.slot;
        let disposition = self.table.quarantine_locked(&mut slots, old, reason);
        SlotTable::publish(&slots);
        drop(slots);

        info!(
            lease_id = %handle.request.lease,
            from = %old,
            to = %new_id,
            "lease moved to another slot"
        );
        handle.slot = new_id;
        handle.vm_name = new_vm;
        handle.preparation = preparation;
        handle.clean_snapshot = new_snapshot;
        Ok(disposition)
    }

    /// Record that fresh provisioning of the handle's slot completed
    pub fn mark_provisioned(&self, handle: &mut SlotHandle, image: &str) {
        let mut slots = self.table.lock();
        let slot = &mut slots[handle.slot.0];
        slot.instance = Some(Instance {
            image: image.to_string(),
            warmth: Warmth::Running,
        });
        slot.clean_snapshot = Some(CLEAN_SNAPSHOT.to_string());
        handle.clean_snapshot = slot.clean_snapshot.clone();
    }

    /// Return a slot to the pool
    pub fn release(&self, mut handle: SlotHandle, release: Release) -> SlotDisposition {
        handle.released = true;
        let permit = handle.permit.take();
        let id = handle.slot;

        let disposition = {
            let mut slots = self.table.lock();
            let disposition = match release {
                Release::Clean(warmth) => {
                    let slot = &mut slots[id.0];
                    slot.lease = None;
                    slot.work_item = None;
                    slot.consecutive_failures = 0;
                    match slot.instance.as_mut() {
                        Some(instance) => {
                            instance.warmth = warmth;
                            slot.state = SlotState::Idle;
                            slot.idle_since = Some(Instant::now());
                        }
                        None => slot.state = SlotState::Cold,
                    }
                    SlotDisposition::Clean
                }
                Release::Absent => {
                    let slot = &mut slots[id.0];
                    slot.lease = None;
                    slot.work_item = None;
                    slot.instance = None;
                    slot.clean_snapshot = None;
                    slot.state = SlotState::Cold;
                    SlotDisposition::Clean
                }
                Release::Quarantine(reason) => self.table.quarantine_locked(&mut slots, id, reason),
                Release::Hold => {
                    slots[id.0].state = SlotState::Held;
                    SlotDisposition::Held
                }
            };
            SlotTable::publish(&slots);
            disposition
        };

        drop(permit);
        self.table.available.notify_waiters();
        debug!(slot_id = %id, %disposition, "slot released");
        disposition
    }

    /// Reset a slot's VM to its clean snapshot with bounded attempts
    ///
    /// A VM that never got a clean snapshot is deleted instead.
    pub async fn reset(&self, vm: &str, snapshot: Option<&str>) -> Release {
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => {
                return match self.snapshots.discard(vm).await {
                    Ok(()) => Release::Absent,
                    Err(e) => {
                        CLEANUP_FAILURES.inc();
                        Release::Quarantine(e.to_string())
                    }
                }
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=self.cleanup_attempts {
            match self.snapshots.ensure_clean(vm, snapshot).await {
                Ok(CleanState::Restored(warmth)) => return Release::Clean(warmth),
                Ok(CleanState::Absent) => {
                    info!(vm, "VM no longer exists, slot goes cold");
                    return Release::Absent;
                }
                Err(e) => {
                    CLEANUP_FAILURES.inc();
                    warn!(vm, attempt, error = %e, "cleanup attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Release::Quarantine(last_error)
    }

    /// Take an idle, cold or held slot out of rotation
    pub fn quarantine(&self, id: SlotId, reason: impl Into<String>) -> Result<SlotDisposition, PoolError> {
        let disposition = {
            let mut slots = self.table.lock();
            let slot = slots.get(id.0).ok_or(PoolError::UnknownSlot(id))?;
            if !matches!(slot.state, SlotState::Idle | SlotState::Cold | SlotState::Held) {
                return Err(PoolError::WrongState {
                    slot: id,
                    state: slot.state.to_string(),
                    expected: "idle, cold or held",
                });
            }
            let disposition = self.table.quarantine_locked(&mut slots, id, reason.into());
            SlotTable::publish(&slots);
            disposition
        };
        Ok(disposition)
    }

    /// Reset a held (debug) slot and return it to rotation
    pub async fn reclaim(&self, id: SlotId) -> Result<SlotDisposition, PoolError> {
        let permit = self.admission.admit().await?;
        let (vm, snapshot) = {
            let mut slots = self.table.lock();
            let slot = slots.get_mut(id.0).ok_or(PoolError::UnknownSlot(id))?;
            if slot.state != SlotState::Held {
                return Err(PoolError::WrongState {
                    slot: id,
                    state: slot.state.to_string(),
                    expected: "held",
                });
            }
            slot.state = SlotState::Recreating;
            slot.lease = None;
            slot.work_item = None;
            let claimed = (slot.vm_name.clone(), slot.clean_snapshot.clone());
            SlotTable::publish(&slots);
            claimed
        };
        info!(slot_id = %id, vm = %vm, "reclaiming held slot");

        let release = self.reset(&vm, snapshot.as_deref()).await;
        let disposition = {
            let mut slots = self.table.lock();
            let disposition = match release {
                Release::Clean(warmth) => {
                    let slot = &mut slots[id.0];
                    slot.consecutive_failures = 0;
                    match slot.instance.as_mut() {
                        Some(instance) => {
                            instance.warmth = warmth;
                            slot.state = SlotState::Idle;
                            slot.idle_since = Some(Instant::now());
                        }
                        None => slot.state = SlotState::Cold,
                    }
                    SlotDisposition::Clean
                }
                Release::Absent | Release::Hold => {
                    let slot = &mut slots[id.0];
                    slot.instance = None;
                    slot.clean_snapshot = None;
                    slot.state = SlotState::Cold;
                    SlotDisposition::Clean
                }
                Release::Quarantine(reason) => self.table.quarantine_locked(&mut slots, id, reason),
            };
            SlotTable::publish(&slots);
            disposition
        };
        drop(permit);
        self.table.available.notify_waiters();
        Ok(disposition)
    }

    fn warm_image(&self) -> Option<String> {
        self.config
            .warm_image
            .clone()
            .or_else(|| self.images.names().next().map(str::to_string))
    }

    /// Pre-warm `warm_slots` slots from the warm image
    ///
    /// Failures are logged and leave the slot cold. Returns the number of
    /// slots that came up.
    pub async fn initialize(&self) -> usize {
        if self.config.warm_slots == 0 {
            return 0;
        }
        let image_name = match self.warm_image() {
            Some(name) => name,
            None => {
                warn!("no golden image registered, skipping pre-warm");
                return 0;
            }
        };
        info!(count = self.config.warm_slots, image = %image_name, "pre-warming slots");

        let mut warmed = 0;
        for i in 0..self.config.warm_slots {
            let id = SlotId(i);
            let vm = {
                let mut slots = self.table.lock();
                let slot = &mut slots[i];
                if slot.state != SlotState::Cold {
                    continue;
                }
                slot.state = SlotState::Recreating;
                SlotTable::publish(&slots);
                slots[i].vm_name.clone()
            };

            match self.rebuild(&vm, &image_name, "warm").await {
                Ok(warmth) => {
                    self.settle_idle(id, &image_name, warmth);
                    warmed += 1;
                    info!(slot_id = %id, vm = %vm, "warm slot {}/{} ready", i + 1, self.config.warm_slots);
                }
                Err(e) => {
                    warn!(slot_id = %id, vm = %vm, error = %e, "failed to pre-warm slot");
                    let mut slots = self.table.lock();
                    slots[i].state = SlotState::Cold;
                    SlotTable::publish(&slots);
                }
            }
            self.table.available.notify_waiters();
        }
        info!(warmed, "pool initialized");
        warmed
    }

    /// Launch a fresh VM for a slot the pool itself is rebuilding
    async fn rebuild(&self, vm: &str, image_name: &str, kind: &str) -> Result<Warmth, String> {
        let image = self.images.resolve(image_name).map_err(|e| e.to_string())?;
        let start = Instant::now();
        self.snapshots
            .provision_fresh(
                vm,
                image_name,
                image,
                self.config.slot_resources,
                CLEAN_SNAPSHOT,
                &self.shutdown,
            )
            .await
            .map_err(|e| e.to_string())?;
        PROVISION_DURATION
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
        Ok(self.snapshots.park(vm).await)
    }

    fn settle_idle(&self, id: SlotId, image: &str, warmth: Warmth) {
        let mut slots = self.table.lock();
        let slot = &mut slots[id.0];
        slot.instance = Some(Instance {
            image: image.to_string(),
            warmth,
        });
        slot.clean_snapshot = Some(CLEAN_SNAPSHOT.to_string());
        slot.state = SlotState::Idle;
        slot.idle_since = Some(Instant::now());
        SlotTable::publish(&slots);
    }

    /// One maintenance pass: delete retired VMs, recreate quarantined slots
    ///
    /// Recreation takes an admission permit, so it never pushes the number
    /// of busy slots past the bound; without a free permit it waits for the
    /// next pass. Returns the number of slots recreated.
    pub async fn maintain(&self) -> usize {
        let retired: Vec<String> = {
            let mut slots = self.table.lock();
            slots
                .iter_mut()
                .filter(|s| s.state == SlotState::Retired && s.instance.is_some())
                .map(|s| {
                    s.instance = None;
                    s.clean_snapshot = None;
                    s.vm_name.clone()
                })
                .collect()
        };
        for vm in retired {
            if let Err(e) = self.snapshots.discard(&vm).await {
                warn!(vm = %vm, error = %e, "failed to delete retired VM");
            }
        }

        let quarantined: Vec<SlotId> = {
            let slots = self.table.lock();
            slots
                .iter()
                .filter(|s| s.state == SlotState::Quarantined)
                .map(|s| s.id)
                .collect()
        };

        let mut recreated = 0;
        for id in quarantined {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(permit) = self.admission.try_reserve() else {
                debug!("no free permit for recreation, retrying next pass");
                break;
            };
            let (vm, image) = {
                let mut slots = self.table.lock();
                let slot = &mut slots[id.0];
                if slot.state != SlotState::Quarantined {
                    continue;
                }
                slot.state = SlotState::Recreating;
                slot.clean_snapshot = None;
                let claimed = (slot.vm_name.clone(), slot.instance.take().map(|i| i.image));
                SlotTable::publish(&slots);
                claimed
            };

            match image {
                Some(image) => match self.rebuild(&vm, &image, "fresh").await {
                    Ok(warmth) => {
                        self.settle_idle(id, &image, warmth);
                        recreated += 1;
                        info!(slot_id = %id, vm = %vm, "quarantined slot recreated");
                    }
                    Err(e) => self.fail_recreation(id, e),
                },
                // never provisioned: nothing to recreate from
                None => match self.snapshots.discard(&vm).await {
                    Ok(()) => {
                        let mut slots = self.table.lock();
                        slots[id.0].state = SlotState::Cold;
                        SlotTable::publish(&slots);
                        debug!(slot_id = %id, vm = %vm, "quarantined slot reset to cold");
                    }
                    Err(e) => self.fail_recreation(id, e.to_string()),
                },
            }
            drop(permit);
            self.table.available.notify_waiters();
        }
        recreated
    }

    fn fail_recreation(&self, id: SlotId, reason: String) {
        let mut slots = self.table.lock();
        self.table.quarantine_locked(&mut slots, id, reason);
        SlotTable::publish(&slots);
    }

    /// Start the background maintenance task
    pub fn start_maintenance(pool: Arc<PoolManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.maintenance_interval());

            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        pool.maintain().await;
                    }
                }
            }
            debug!("pool maintenance stopped");
        })
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let slots = self.table.lock();
        PoolStats {
            max_slots: self.config.max_slots,
            max_concurrent: self.admission.max_concurrent(),
            available_permits: self.admission.available(),
            slots: slots.iter().map(VmSlot::view).collect(),
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<SlotView> {
        self.table.lock().get(id.0).map(VmSlot::view)
    }

    /// Graceful shutdown: refuse new work and delete every VM the pool created
    ///
    /// Leased slots are left alone; the engine cancels and drains leases first.
    pub async fn shutdown(&self) {
        info!("shutting down VM pool");
        self.shutdown.cancel();
        self.admission.close();
        self.table.available.notify_waiters();

        let vms: Vec<String> = {
            let mut slots = self.table.lock();
            let mut vms = Vec::new();
            for slot in slots.iter_mut() {
                if slot.state == SlotState::Leased {
                    warn!(slot_id = %slot.id, vm = %slot.vm_name, "slot still leased at shutdown");
                    continue;
                }
                if slot.state == SlotState::Cold && slot.instance.is_none() {
                    continue;
                }
                vms.push(slot.vm_name.clone());
                slot.instance = None;
                slot.clean_snapshot = None;
                slot.lease = None;
                slot.work_item = None;
                if slot.state != SlotState::Retired {
                    slot.state = SlotState::Cold;
                }
            }
            SlotTable::publish(&slots);
            vms
        };

        for vm in vms {
            if let Err(e) = self.snapshots.discard(&vm).await {
                warn!(vm = %vm, error = %e, "failed to delete VM during shutdown");
            }
        }
        info!("VM pool shutdown complete");
    }
}

/// Choose a slot for `request` following the selection order
fn select(slots: &[VmSlot], request: &SlotRequest) -> Result<(usize, Preparation), PoolError> {
    let same_image = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.state == SlotState::Idle)
        .filter_map(|(i, s)| {
            s.instance
                .as_ref()
                .filter(|inst| inst.image == request.image)
                .map(|inst| (i, inst.warmth, s.idle_since))
        })
        .min_by_key(|(_, warmth, since)| (warmth.rank(), *since));
    if let Some((i, warmth, _)) = same_image {
        return Ok((i, Preparation::from_warmth(warmth)));
    }

    if let Some(i) = slots.iter().position(|s| s.state == SlotState::Cold) {
        return Ok((i, Preparation::Fresh));
    }

    let repurpose = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.state == SlotState::Idle)
        .min_by_key(|(_, s)| s.idle_since)
        .map(|(i, _)| i);
    if let Some(i) = repurpose {
        return Ok((i, Preparation::Fresh));
    }

    if slots.iter().all(|s| s.state == SlotState::Retired) {
        return Err(PoolError::Unsatisfiable("every slot is retired".into()));
    }
    Err(PoolError::Busy("no free slot".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(id: usize, image: &str, warmth: Warmth, idle_for: Duration) -> VmSlot {
        let mut slot = VmSlot::new(SlotId(id), format!("vm-{}", id));
        slot.state = SlotState::Idle;
        slot.instance = Some(Instance {
            image: image.to_string(),
            warmth,
        });
        slot.idle_since = Some(Instant::now() - idle_for);
        slot
    }

    fn request(image: &str) -> SlotRequest {
        SlotRequest {
            lease: LeaseId::new(),
            work_item: "w".into(),
            image: image.into(),
            resources: Resources::default(),
        }
    }

    #[test]
    fn test_select_prefers_warm_then_suspended() {
        let slots = vec![
            idle(0, "golden-1", Warmth::Stopped, Duration::from_secs(90)),
            idle(1, "golden-1", Warmth::Suspended, Duration::from_secs(60)),
            idle(2, "golden-1", Warmth::Running, Duration::from_secs(1)),
        ];
        assert_eq!(select(&slots, &request("golden-1")).unwrap(), (2, Preparation::Warm));
        assert_eq!(
            select(&slots[..2], &request("golden-1")).unwrap(),
            (1, Preparation::Resume)
        );
    }

    #[test]
    fn test_select_ties_go_to_longest_idle() {
        let slots = vec![
            idle(0, "golden-1", Warmth::Running, Duration::from_secs(5)),
            idle(1, "golden-1", Warmth::Running, Duration::from_secs(50)),
        ];
        assert_eq!(select(&slots, &request("golden-1")).unwrap().0, 1);
    }

    #[test]
    fn test_select_cold_before_repurpose() {
        let slots = vec![
            idle(0, "golden-2", Warmth::Running, Duration::from_secs(5)),
            VmSlot::new(SlotId(1), "vm-1".into()),
        ];
        assert_eq!(select(&slots, &request("golden-1")).unwrap(), (1, Preparation::Fresh));
        assert_eq!(
            select(&slots[..1], &request("golden-1")).unwrap(),
            (0, Preparation::Fresh)
        );
    }

    #[test]
    fn test_select_busy_and_unsatisfiable() {
        let mut leased = VmSlot::new(SlotId(0), "vm-0".into());
        leased.state = SlotState::Leased;
        let mut retired = VmSlot::new(SlotId(1), "vm-1".into());
        retired.state = SlotState::Retired;

        let busy = vec![leased, retired.clone()];
        assert!(matches!(select(&busy, &request("g")), Err(PoolError::Busy(_))));

        let gone = vec![retired];
        assert!(matches!(
            select(&gone, &request("g")),
            Err(PoolError::Unsatisfiable(_))
        ));
    }
}
