//! Slot records
//!
//! A slot is one unit of pool capacity reused across many leases. The VM
//! behind it comes and goes (fresh provisioning, deletion, recreation); the
//! slot id and VM name stay fixed.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

/// Index of a slot in the pool's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Power state of an idle slot's VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warmth {
    Running,
    Suspended,
    Stopped,
}

impl Warmth {
    /// Selection rank: lower is cheaper to bring up
    pub(crate) fn rank(self) -> u8 {
        match self {
            Warmth::Running => 0,
            Warmth::Suspended => 1,
            Warmth::Stopped => 2,
        }
    }
}

/// The VM currently behind a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Golden image it was provisioned from
    pub image: String,
    pub warmth: Warmth,
}

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// No VM; provisioned on first use
    Cold,
    /// Clean and ready for a lease
    Idle,
    /// Bound to exactly one lease
    Leased,
    /// Out of rotation, waiting for recreation from the golden image
    Quarantined,
    /// Being recreated or reset by the pool itself
    Recreating,
    /// Kept live after a debug lease until reclaimed
    Held,
    /// Permanently removed after repeated failures
    Retired,
}

impl SlotState {
    pub const ALL: [SlotState; 7] = [
        SlotState::Cold,
        SlotState::Idle,
        SlotState::Leased,
        SlotState::Quarantined,
        SlotState::Recreating,
        SlotState::Held,
        SlotState::Retired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Cold => "cold",
            SlotState::Idle => "idle",
            SlotState::Leased => "leased",
            SlotState::Quarantined => "quarantined",
            SlotState::Recreating => "recreating",
            SlotState::Held => "held",
            SlotState::Retired => "retired",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pool member
#[derive(Debug, Clone)]
pub struct VmSlot {
    pub id: SlotId,
    pub vm_name: String,
    /// Absent while the slot has no VM
    pub instance: Option<Instance>,
    pub state: SlotState,
    /// Lease holding the slot (Leased, Held)
    pub lease: Option<LeaseId>,
    pub work_item: Option<String>,
    /// Reset target; set once fresh provisioning recorded it
    pub clean_snapshot: Option<String>,
    pub consecutive_failures: u32,
    pub idle_since: Option<Instant>,
    /// Why the slot was last quarantined or retired
    pub last_failure: Option<String>,
}

impl VmSlot {
    pub fn new(id: SlotId, vm_name: String) -> Self {
        Self {
            id,
            vm_name,
            instance: None,
            state: SlotState::Cold,
            lease: None,
            work_item: None,
            clean_snapshot: None,
            consecutive_failures: 0,
            idle_since: None,
            last_failure: None,
        }
    }

    /// Read-only view handed out by `PoolManager::stats`
    pub fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            vm_name: self.vm_name.clone(),
            state: self.state,
            image: self.instance.as_ref().map(|i| i.image.clone()),
            warmth: self.instance.as_ref().map(|i| i.warmth),
            lease: self.lease,
            work_item: self.work_item.clone(),
            consecutive_failures: self.consecutive_failures,
            idle_ms: self.idle_since.map(|t| t.elapsed().as_millis() as u64),
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Snapshot of one slot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub id: SlotId,
    pub vm_name: String,
    pub state: SlotState,
    pub image: Option<String>,
    pub warmth: Option<Warmth>,
    pub lease: Option<LeaseId>,
    pub work_item: Option<String>,
    pub consecutive_failures: u32,
    pub idle_ms: Option<u64>,
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_display_and_serde() {
        let id = SlotId(3);
        assert_eq!(id.to_string(), "slot-3");
        assert_eq!(serde_json::to_string(&id).unwrap(), "3");
    }

    #[test]
    fn test_warmth_rank_prefers_running() {
        let mut w = vec![Warmth::Stopped, Warmth::Running, Warmth::Suspended];
        w.sort_by_key(|w| w.rank());
        assert_eq!(w, vec![Warmth::Running, Warmth::Suspended, Warmth::Stopped]);
    }

    #[test]
    fn test_new_slot_is_cold() {
        let slot = VmSlot::new(SlotId(0), "leasevisor-0".into());
        let view = slot.view();
        assert_eq!(view.state, SlotState::Cold);
        assert!(view.image.is_none());
        assert!(view.idle_ms.is_none());
    }
}
