use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Client;
use rand::Rng;
use tracing::{info, warn};

use crate::api_util::ApiUtil;
use crate::cache::VolumeCache;
use crate::cleanup::CleanupTracker;
use crate::config::ProvisionerConfig;
use crate::deleter::Deleter;
use crate::discoverer::Discoverer;
use crate::error::Result;
use crate::identity::ProvisionerIdentity;
use crate::populator::Populator;

/// Lifecycle stage of the [`ProvisionController`], surfaced mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    WaitingForInformerSync,
    WaitingForNodeReady,
    Running,
    Stopped,
}

/// Owns the process lifecycle: resolves this node's identity, waits for the Populator's initial
/// sync, clears the startup taint if configured, then drives the Discoverer/Deleter tick loop
/// until shutdown is requested.
pub struct ProvisionController {
    config: ProvisionerConfig,
    client: Client,
    cache: Arc<VolumeCache>,
    populator: Arc<Populator>,
    api: ApiUtil,
    tracker: CleanupTracker,
    identity: ProvisionerIdentity,
}

impl ProvisionController {
    /// Resolves the node's UID from the cluster and assembles every long-lived component. This
    /// is the `Starting` state; any failure here is fatal.
    pub async fn create(config: ProvisionerConfig, client: Client) -> Result<Self> {
        let api = ApiUtil::new(client.clone(), config.namespace.clone());
        let node = api.get_node(&config.node_name).await?;
        let node_uid = node.metadata.uid.as_deref();
        let identity = ProvisionerIdentity::new(&config.node_name, node_uid, config.use_node_name_only);

        let cache = Arc::new(VolumeCache::new());
        let populator = Arc::new(Populator::new(cache.clone(), identity.as_str().to_string()));

        info!(identity = %identity, node = %config.node_name, "provisioner identity resolved");

        Ok(ProvisionController {
            config,
            client,
            cache,
            populator,
            api,
            tracker: CleanupTracker::new(),
            identity,
        })
    }

    /// Runs the controller to completion. Spawns the Populator as a background task, waits for
    /// `WaitingForInformerSync` and `WaitingForNodeReady` to clear, then loops ticks in `Running`
    /// until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let populator = self.populator.clone();
        let client = self.client.clone();
        tokio::spawn(async move { populator.run(client).await });

        info!(state = ?ControllerState::WaitingForInformerSync, "waiting for populator initial sync");
        self.populator.ready().await;

        info!(state = ?ControllerState::WaitingForNodeReady, "checking node readiness gate");
        if self.config.remove_node_not_ready_taint {
            if let Some(taint_key) = &self.config.provisioner_not_ready_node_taint_key {
                self.wait_for_taint_removal(taint_key).await;
            }
        }

        info!(state = ?ControllerState::Running, "entering tick loop");
        self.run_loop(shutdown).await;

        info!(state = ?ControllerState::Stopped, "shutdown requested, exiting");
        Ok(())
    }

    /// Blocks `WaitingForNodeReady` until the startup taint is confirmed removed. Retries with
    /// capped exponential backoff rather than falling through to `Running` on failure, per the
    /// node-readiness gate's "only enter Running after successful taint removal" contract.
    async fn wait_for_taint_removal(&self, taint_key: &str) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.api.remove_node_taint(&self.config.node_name, taint_key).await {
                Ok(()) => {
                    info!(taint = %taint_key, "removed startup taint");
                    return;
                }
                Err(e) => {
                    warn!(
                        taint = %taint_key,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "failed to remove startup taint, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn run_loop(&self, shutdown: impl std::future::Future<Output = ()>) {
        let node = if !self.config.node_labels_for_pv.is_empty() || self.config.set_pv_owner_ref {
            match self.api.get_node(&self.config.node_name).await {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(error = %e, "failed to fetch node for PV labels/owner reference");
                    None
                }
            }
        } else {
            None
        };

        let node_labels = extract_node_labels(&self.config.node_labels_for_pv, node.as_ref());
        let owner_reference = if self.config.set_pv_owner_ref {
            node.as_ref().map(node_owner_reference)
        } else {
            None
        };

        let discoverer = Discoverer::new(
            self.identity.clone(),
            self.config.node_name.clone(),
            self.config.use_alpha_api,
            self.config.labels_for_pv.clone(),
            node_labels,
            owner_reference,
        );
        let deleter = Deleter::new(
            self.config.namespace.clone(),
            self.config.job_container_image.clone(),
            self.config.use_job_for_cleaning,
        );
        let volume_util: Arc<dyn crate::volume_util::VolumeUtil> =
            Arc::new(crate::volume_util::OsVolumeUtil);

        tokio::pin!(shutdown);
        loop {
            let tick_delay = next_tick_delay(self.config.min_resync_period);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(tick_delay) => {}
            }

            let created = discoverer
                .tick(&self.config.storage_classes, &self.cache, &volume_util, &self.api)
                .await;
            if created > 0 {
                info!(created, "discovery tick created PVs");
            }

            deleter
                .tick(
                    &self.config.storage_classes,
                    &self.cache,
                    &self.tracker,
                    &self.api,
                    &self.client,
                    &volume_util,
                )
                .await;
        }

        self.tracker.shutdown();
    }
}

/// Copies every node label whose key is in `wanted` onto the returned map; empty (not an error)
/// when there's no node to read from, matching the "owner ref / node labels disabled" case.
fn extract_node_labels(
    wanted: &[String],
    node: Option<&k8s_openapi::api::core::v1::Node>,
) -> std::collections::BTreeMap<String, String> {
    let Some(node) = node else {
        return Default::default();
    };
    let all = node.metadata.labels.clone().unwrap_or_default();
    wanted
        .iter()
        .filter_map(|k| all.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// Builds an owner reference pointing a PV at the Node it was discovered on, so the Node's
/// deletion cascades to its PVs per the cluster's garbage collector.
fn node_owner_reference(node: &k8s_openapi::api::core::v1::Node) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: node.metadata.name.clone().unwrap_or_default(),
        uid: node.metadata.uid.clone().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(false),
    }
}

/// Draws the next tick interval uniformly from `[min, 2*min]`, per the controller's jittered
/// resync policy. Split out as a free function so the jitter distribution can be tested without
/// spinning up a whole controller.
fn next_tick_delay(min_resync_period: Duration) -> Duration {
    let min_ms = min_resync_period.as_millis().max(1) as u64;
    let max_ms = min_ms.saturating_mul(2);
    let jittered = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn tick_delay_stays_within_one_to_two_times_minimum() {
        let min = Duration::from_millis(100);
        for _ in 0..500 {
            let delay = next_tick_delay(min);
            assert!(delay >= min);
            assert!(delay <= min * 2);
        }
    }

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        let mut map = BTreeMap::new();
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                uid: Some("uid-1".to_string()),
                labels: Some(map),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn extract_node_labels_filters_to_wanted_keys() {
        let node = node_with_labels(&[("topology.kubernetes.io/zone", "us-east-1a"), ("unwanted", "x")]);
        let wanted = vec!["topology.kubernetes.io/zone".to_string()];
        let extracted = extract_node_labels(&wanted, Some(&node));
        assert_eq!(
            extracted.get("topology.kubernetes.io/zone"),
            Some(&"us-east-1a".to_string())
        );
        assert!(!extracted.contains_key("unwanted"));
    }

    #[test]
    fn extract_node_labels_empty_without_a_node() {
        let wanted = vec!["topology.kubernetes.io/zone".to_string()];
        assert!(extract_node_labels(&wanted, None).is_empty());
    }

    #[test]
    fn node_owner_reference_points_at_the_node() {
        let node = node_with_labels(&[]);
        let owner = node_owner_reference(&node);
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.name, "n1");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(false));
    }
}
