//! Golden image registry
//!
//! Maps the image names work items refer to onto something a backend can
//! boot. Read-only once the engine is built.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A bootable reference image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldenImage {
    /// Multipass: image alias or URL (e.g. "22.04").
    /// Firecracker: path to the root filesystem image.
    pub source: String,
    /// Multipass cloud-init file applied at launch
    pub cloud_init: Option<PathBuf>,
    /// Firecracker kernel; falls back to the backend's default kernel
    pub kernel: Option<PathBuf>,
    /// Firecracker boot arguments; falls back to the backend's default
    pub boot_args: Option<String>,
}

impl GoldenImage {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

/// Name → golden image
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    images: BTreeMap<String, GoldenImage>,
}

impl ImageRegistry {
    pub fn new(images: BTreeMap<String, GoldenImage>) -> Self {
        Self { images }
    }

    pub fn resolve(&self, name: &str) -> Result<&GoldenImage, EngineError> {
        self.images
            .get(name)
            .ok_or_else(|| EngineError::UnknownImage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown() {
        let mut images = BTreeMap::new();
        images.insert("golden-1".to_string(), GoldenImage::new("22.04"));
        let registry = ImageRegistry::new(images);

        assert_eq!(registry.resolve("golden-1").unwrap().source, "22.04");
        assert!(matches!(
            registry.resolve("golden-2"),
            Err(EngineError::UnknownImage(name)) if name == "golden-2"
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["golden-1"]);
    }
}
