//! Append-only registry of promoted model versions

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::params::ModelVersion;

/// Promoted versions, oldest first. Ids are strictly increasing.
pub struct ModelRegistry {
    versions: RwLock<Vec<Arc<ModelVersion>>>,
    next_id: AtomicU64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve an id for a candidate; discarded candidates leave gaps
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a promoted version. Returns `None` if its id is not newer than the last.
    pub fn append(&self, version: ModelVersion) -> Option<Arc<ModelVersion>> {
        let mut versions = self.versions.write();
        if let Some(last) = versions.last() {
            if version.id == last.id {
                return Some(last.clone());
            }
            if version.id < last.id {
                debug!("Rejected out-of-order version v{} (last v{})", version.id, last.id);
                return None;
            }
        }
        self.next_id.fetch_max(version.id + 1, Ordering::SeqCst);
        let version = Arc::new(version);
        versions.push(version.clone());
        info!("Model version v{} registered ({} total)", version.id, versions.len());
        Some(version)
    }

    pub fn last_known_good(&self) -> Option<Arc<ModelVersion>> {
        self.versions.read().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(id: u64) -> ModelVersion {
        let mut v = ModelVersion::prior(1, 0.01, 0);
        v.id = id;
        v
    }

    #[test]
    fn test_ids_monotone() {
        let registry = ModelRegistry::new();
        assert!(registry.append(version(0)).is_some());
        assert!(registry.append(version(3)).is_some());
        assert!(registry.append(version(2)).is_none());
        assert_eq!(registry.last_known_good().unwrap().id, 3);
        assert_eq!(registry.reserve_id(), 4);
    }

    #[test]
    fn test_reappending_last_is_idempotent() {
        let registry = ModelRegistry::new();
        registry.append(version(5));
        registry.append(version(5));
        assert_eq!(registry.len(), 1);
    }
}
