use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{api::ListParams, Api, Client};
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::cache::VolumeCache;
use crate::config::PROVISIONED_BY_ANNOTATION_KEY;

/// Keeps the [`VolumeCache`] in sync with the cluster's view of this node's PVs via a
/// list-then-watch informer. The ProvisionController must not tick until [`Populator::ready`]
/// resolves, so the cache reflects reality before any create/delete decision is made.
pub struct Populator {
    cache: Arc<VolumeCache>,
    identity: String,
    synced: AtomicBool,
    ready: Notify,
}

impl Populator {
    pub fn new(cache: Arc<VolumeCache>, identity: String) -> Self {
        Populator {
            cache,
            identity,
            synced: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }

    /// Resolves once the informer has delivered its first event batch. Safe to call any number
    /// of times, before or after sync has already completed.
    pub async fn ready(&self) {
        let notified = self.ready.notified();
        if self.synced.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Runs the informer loop until the stream ends. Intended to be spawned as its own task; it
    /// only returns if the watch stream itself is exhausted, which does not happen in normal
    /// long-running operation.
    pub async fn run(&self, client: Client) {
        let pvs: Api<PersistentVolume> = Api::all(client);
        let stream = watcher(pvs, ListParams::default());
        tokio::pin!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(event)) => self.apply_event(event),
                Ok(None) => {
                    error!("populator watch stream ended unexpectedly");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "populator watch stream error, retrying");
                }
            }
        }
    }

    fn apply_event(&self, event: Event<PersistentVolume>) {
        match &event {
            Event::Deleted(pv) => {
                if let Some(name) = &pv.metadata.name {
                    self.cache.delete(name);
                }
            }
            Event::Applied(_) | Event::Restarted(_) => {
                for pv in event.into_iter_applied() {
                    if self.owns(&pv) {
                        self.cache.update(pv);
                    }
                }
            }
        }
        self.synced.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    fn owns(&self, pv: &PersistentVolume) -> bool {
        pv.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PROVISIONED_BY_ANNOTATION_KEY))
            .map(|v| v == &self.identity)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pv_owned_by(name: &str, identity: &str) -> PersistentVolume {
        let mut annotations = BTreeMap::new();
        annotations.insert(PROVISIONED_BY_ANNOTATION_KEY.to_string(), identity.to_string());
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn apply_event_adds_owned_pv_to_cache() {
        let cache = Arc::new(VolumeCache::new());
        let populator = Populator::new(cache.clone(), "local-volume-provisioner-n1".to_string());
        populator.apply_event(Event::Applied(pv_owned_by(
            "local-pv-1",
            "local-volume-provisioner-n1",
        )));
        assert!(cache.get("local-pv-1").is_some());
    }

    #[test]
    fn apply_event_ignores_pv_owned_by_other_identity() {
        let cache = Arc::new(VolumeCache::new());
        let populator = Populator::new(cache.clone(), "local-volume-provisioner-n1".to_string());
        populator.apply_event(Event::Applied(pv_owned_by(
            "local-pv-1",
            "local-volume-provisioner-n2",
        )));
        assert!(cache.get("local-pv-1").is_none());
    }

    #[test]
    fn apply_event_delete_removes_from_cache() {
        let cache = Arc::new(VolumeCache::new());
        cache.add(pv_owned_by("local-pv-1", "local-volume-provisioner-n1"));
        let populator = Populator::new(cache.clone(), "local-volume-provisioner-n1".to_string());
        populator.apply_event(Event::Deleted(pv_owned_by(
            "local-pv-1",
            "local-volume-provisioner-n1",
        )));
        assert!(cache.get("local-pv-1").is_none());
    }

    #[test]
    fn restarted_batch_applies_only_owned_entries() {
        let cache = Arc::new(VolumeCache::new());
        let populator = Populator::new(cache.clone(), "local-volume-provisioner-n1".to_string());
        populator.apply_event(Event::Restarted(vec![
            pv_owned_by("local-pv-1", "local-volume-provisioner-n1"),
            pv_owned_by("local-pv-2", "local-volume-provisioner-n2"),
        ]));
        assert!(cache.get("local-pv-1").is_some());
        assert!(cache.get("local-pv-2").is_none());
    }
}
