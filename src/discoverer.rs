use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info, warn};

use crate::api_util::ApiUtil;
use crate::cache::VolumeCache;
use crate::config::{StorageClassConfig, StorageClassTable, VolumeMode};
use crate::identity::ProvisionerIdentity;
use crate::name::{matches_any_pattern, pv_name};
use crate::pv_builder::{build_pv, DiscoveredVolume, PvBuildContext};
use crate::volume_util::VolumeUtil;

/// Scans every configured storage class's host directory and publishes PVs for media not already
/// represented in the cache. One `Discoverer` instance is reused across ticks.
pub struct Discoverer {
    identity: ProvisionerIdentity,
    node_name: String,
    use_alpha_api: bool,
    extra_labels: BTreeMap<String, String>,
    node_labels: BTreeMap<String, String>,
    owner_reference: Option<OwnerReference>,
}

impl Discoverer {
    pub fn new(
        identity: ProvisionerIdentity,
        node_name: String,
        use_alpha_api: bool,
        extra_labels: BTreeMap<String, String>,
        node_labels: BTreeMap<String, String>,
        owner_reference: Option<OwnerReference>,
    ) -> Self {
        Discoverer {
            identity,
            node_name,
            use_alpha_api,
            extra_labels,
            node_labels,
            owner_reference,
        }
    }

    /// Runs one discovery pass across every class in `classes`. Returns the number of PVs
    /// created. A per-entry failure is logged and skipped; it never aborts the tick.
    pub async fn tick(
        &self,
        classes: &StorageClassTable,
        cache: &VolumeCache,
        volume_util: &Arc<dyn VolumeUtil>,
        api: &ApiUtil,
    ) -> usize {
        let mut created = 0;
        for (class_name, class) in classes.iter() {
            created += self
                .discover_class(class_name, class, cache, volume_util, api)
                .await;
        }
        created
    }

    async fn discover_class(
        &self,
        class_name: &str,
        class: &StorageClassConfig,
        cache: &VolumeCache,
        volume_util: &Arc<dyn VolumeUtil>,
        api: &ApiUtil,
    ) -> usize {
        let entries = match volume_util.read_dir(&class.mount_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(class = class_name, error = %e, "failed to list mount directory");
                return 0;
            }
        };

        let mut created = 0;
        for file_name in entries {
            if !matches_any_pattern(&file_name, &class.name_patterns) {
                debug!(class = class_name, file = %file_name, "skipping: name pattern mismatch");
                continue;
            }

            let host_path = class.host_dir.join(&file_name);
            let mount_path = class.mount_dir.join(&file_name);
            let Some(name) =
                name_if_not_cached(cache, self.identity.as_str(), &host_path.display().to_string())
            else {
                continue;
            };

            match self
                .discover_entry(class_name, class, &name, &file_name, &host_path, &mount_path, volume_util)
                .await
            {
                Ok(Some(volume)) => {
                    let ctx = PvBuildContext {
                        identity: &self.identity,
                        node_name: &self.node_name,
                        class,
                        use_alpha_api: self.use_alpha_api,
                        extra_labels: &self.extra_labels,
                        node_labels: self.node_labels.clone(),
                        owner_reference: self.owner_reference.clone(),
                    };
                    let pv = build_pv(&name, &volume, &ctx);
                    match api.create_pv(pv.clone()).await {
                        Ok(()) => {
                            info!(class = class_name, pv = %name, path = %host_path.display(), "created PV");
                            let _ = api
                                .emit_event(
                                    &pv,
                                    "ProvisioningSucceeded",
                                    "successfully provisioned local volume",
                                    "local-static-provisioner",
                                    false,
                                )
                                .await;
                            created += 1;
                        }
                        Err(e) => {
                            warn!(class = class_name, pv = %name, error = %e, "failed to create PV");
                            let _ = api
                                .emit_event(
                                    &pv,
                                    "ProvisioningFailed",
                                    &format!("failed to create PV: {e}"),
                                    "local-static-provisioner",
                                    true,
                                )
                                .await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(class = class_name, file = %file_name, error = %e, "failed to probe entry");
                }
            }
        }
        created
    }

    async fn discover_entry(
        &self,
        class_name: &str,
        class: &StorageClassConfig,
        name: &str,
        file_name: &str,
        host_path: &Path,
        mount_path: &Path,
        volume_util: &Arc<dyn VolumeUtil>,
    ) -> crate::error::Result<Option<DiscoveredVolume>> {
        let matches_mode = match class.volume_mode {
            VolumeMode::Filesystem => {
                let is_dir = volume_util.is_dir(mount_path)?;
                let is_mount = volume_util.is_likely_mount_point(mount_path)?;
                is_dir && is_mount
            }
            VolumeMode::Block => volume_util.is_block_device(mount_path)?,
        };

        if !matches_mode {
            debug!(class = class_name, pv = %name, "skipping: entry does not match class volume mode");
            return Ok(None);
        }

        let capacity_bytes = volume_util.capacity(mount_path)?;
        if capacity_bytes == 0 {
            debug!(class = class_name, pv = %name, "skipping: zero or unknown capacity");
            return Ok(None);
        }

        Ok(Some(DiscoveredVolume {
            class_name: class_name.to_string(),
            file_name: file_name.to_string(),
            host_path: host_path.display().to_string(),
            mount_path: mount_path.display().to_string(),
            mode: class.volume_mode,
            capacity_bytes,
        }))
    }
}

/// Returns the deterministic PV name for `host_path` unless it's already represented in the
/// cache, in which case the entry has already been discovered and must be skipped.
fn name_if_not_cached(cache: &VolumeCache, identity: &str, host_path: &str) -> Option<String> {
    let name = pv_name(identity, host_path);
    if cache.get(&name).is_some() {
        None
    } else {
        Some(name)
    }
}
