//! Work items - the unit of work a lease executes
//!
//! A `WorkItem` is built by the caller, validated at `submit`, and never
//! mutated afterwards; the engine only hands out shared references to it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// CPU, memory and disk of a slot (or requested by a work item)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl Default for Resources {
    /// 2 CPUs, 4 GiB RAM, 20 GiB disk
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mib: 4 * 1024,
            disk_gib: 20,
        }
    }
}

impl Resources {
    pub fn new(cpus: u32, memory_mib: u64, disk_gib: u64) -> Self {
        Self {
            cpus,
            memory_mib,
            disk_gib,
        }
    }

    /// True when a slot of size `self` can host `request`
    pub fn covers(&self, request: &Resources) -> bool {
        self.cpus >= request.cpus
            && self.memory_mib >= request.memory_mib
            && self.disk_gib >= request.disk_gib
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cpu / {} MiB / {} GiB",
            self.cpus, self.memory_mib, self.disk_gib
        )
    }
}

/// One unit of work: image + setup + workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Caller-assigned unique id
    pub id: String,
    /// Golden image the slot must be provisioned from
    pub image: String,
    /// Run in order before the workload; any non-zero exit aborts the lease
    #[serde(default)]
    pub setup: Vec<String>,
    pub workload: String,
    /// Exported to setup commands and the workload as environment variables
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    /// Skip cleanup and keep the VM for inspection
    #[serde(default)]
    pub debug: bool,
    /// Workload budget; the engine default applies when absent
    #[serde(default, rename = "timeout_ms", with = "opt_millis")]
    pub timeout: Option<Duration>,
}

impl WorkItem {
    /// Start a work item with the given id, image and workload command
    pub fn new(
        id: impl Into<String>,
        image: impl Into<String>,
        workload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            setup: Vec::new(),
            workload: workload.into(),
            params: BTreeMap::new(),
            resources: Resources::default(),
            debug: false,
            timeout: None,
        }
    }

    pub fn setup_command(mut self, command: impl Into<String>) -> Self {
        self.setup.push(command.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check the fields the engine relies on
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidWorkItem("id is empty".into()));
        }
        if self.workload.trim().is_empty() {
            return Err(EngineError::InvalidWorkItem(format!(
                "work item '{}' has an empty workload",
                self.id
            )));
        }
        if let Some(key) = self.params.keys().find(|k| !is_env_name(k)) {
            return Err(EngineError::InvalidWorkItem(format!(
                "parameter name '{}' is not a valid environment variable",
                key
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(EngineError::InvalidWorkItem("timeout must be positive".into()));
        }
        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// (De)serialize `Option<Duration>` as whole milliseconds
mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let item = WorkItem::new("job-1", "golden-1", "make test")
            .setup_command("git clone repo")
            .setup_command("cd repo")
            .param("BRANCH", "main")
            .debug(true)
            .timeout(Duration::from_secs(5));

        assert_eq!(item.setup, vec!["git clone repo", "cd repo"]);
        assert_eq!(item.params["BRANCH"], "main");
        assert!(item.debug);
        assert_eq!(item.timeout, Some(Duration::from_secs(5)));
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(WorkItem::new("", "golden-1", "exit 0").validate().is_err());
        assert!(WorkItem::new("a", "golden-1", "  ").validate().is_err());
        assert!(WorkItem::new("a", "golden-1", "exit 0")
            .param("1BAD", "x")
            .validate()
            .is_err());
        assert!(WorkItem::new("a", "golden-1", "exit 0")
            .timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_resources_cover() {
        let slot = Resources::new(2, 4096, 20);
        assert!(slot.covers(&Resources::new(1, 1024, 10)));
        assert!(slot.covers(&slot));
        assert!(!slot.covers(&Resources::new(4, 1024, 10)));
    }

    #[test]
    fn test_deserialize_from_batch_file() {
        let json = r#"{
            "id": "pg-1",
            "image": "golden-1",
            "setup": ["sudo apt install -y podman"],
            "workload": "podman run --rm postgres:15 true",
            "params": { "POSTGRES_PASSWORD": "secret" },
            "timeout_ms": 5000
        }"#;
        let item: WorkItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(item.resources, Resources::default());
        assert!(!item.debug);
    }
}
