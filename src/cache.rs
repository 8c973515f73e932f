use std::collections::HashMap;

use k8s_openapi::api::core::v1::PersistentVolume;
use parking_lot::RwLock;

/// Authoritative in-memory map of PV name to PV object for every PV this node owns.
///
/// The cache is multi-reader/single-writer: the [`crate::populator::Populator`] is the only
/// writer, driven by informer events. The Discoverer and Deleter only ever call the read-only
/// methods. PVs are never removed from the cache directly by the Deleter — only a subsequent
/// informer delete event does that, which is what gives create-happens-before-delete ordering.
#[derive(Debug, Default)]
pub struct VolumeCache {
    inner: RwLock<HashMap<String, PersistentVolume>>,
}

impl VolumeCache {
    pub fn new() -> Self {
        VolumeCache {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, pv: PersistentVolume) {
        if let Some(name) = pv_name(&pv) {
            self.inner.write().insert(name, pv);
        }
    }

    pub fn update(&self, pv: PersistentVolume) {
        self.add(pv);
    }

    pub fn delete(&self, name: &str) {
        self.inner.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.inner.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<PersistentVolume> {
        self.inner.read().values().cloned().collect()
    }

    pub fn list_by_class(&self, class: &str) -> Vec<PersistentVolume> {
        self.inner
            .read()
            .values()
            .filter(|pv| {
                pv.spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
                    == Some(class)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn pv_name(pv: &PersistentVolume) -> Option<String> {
    pv.metadata.name.clone()
}
