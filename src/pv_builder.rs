use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    LocalVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::config::{
    StorageClassConfig, VolumeMode, ALPHA_NODE_AFFINITY_ANNOTATION_KEY,
    NODE_HOSTNAME_KEY, PROVISIONED_BY_ANNOTATION_KEY,
};
use crate::identity::ProvisionerIdentity;

/// One medium found during a Discoverer scan, before it is published as a PV.
#[derive(Debug, Clone)]
pub struct DiscoveredVolume {
    pub class_name: String,
    pub file_name: String,
    pub host_path: String,
    pub mount_path: String,
    pub mode: VolumeMode,
    pub capacity_bytes: u64,
}

const MIB: u64 = 1024 * 1024;

/// Rounds a byte count down to the nearest mebibyte. A PV must never advertise more capacity
/// than the medium actually has, so rounding direction matters: down, never up.
pub fn round_down_capacity(bytes: u64) -> u64 {
    (bytes / MIB) * MIB
}

/// Inputs needed to build a single PV spec out of a discovered volume, beyond what the volume
/// itself carries.
pub struct PvBuildContext<'a> {
    pub identity: &'a ProvisionerIdentity,
    pub node_name: &'a str,
    pub class: &'a StorageClassConfig,
    pub use_alpha_api: bool,
    pub extra_labels: &'a BTreeMap<String, String>,
    pub node_labels: BTreeMap<String, String>,
    pub owner_reference: Option<OwnerReference>,
}

/// Builds the node affinity requiring `kubernetes.io/hostname In [node_name]`, intersected with
/// any class-configured selector terms. Requirements within a term are ANDed; multiple terms are
/// ORed, matching the cluster's own node-affinity semantics.
fn build_node_selector(ctx: &PvBuildContext) -> NodeSelector {
    let hostname_requirement = NodeSelectorRequirement {
        key: NODE_HOSTNAME_KEY.to_string(),
        operator: "In".to_string(),
        values: Some(vec![ctx.node_name.to_string()]),
    };

    if ctx.class.selector.is_empty() {
        return NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![hostname_requirement]),
                ..Default::default()
            }],
        };
    }

    let terms = ctx
        .class
        .selector
        .iter()
        .map(|term| {
            let mut match_expressions = vec![hostname_requirement.clone()];
            match_expressions.extend(term.match_expressions.iter().map(|req| {
                NodeSelectorRequirement {
                    key: req.key.clone(),
                    operator: req.operator.clone(),
                    values: if req.values.is_empty() {
                        None
                    } else {
                        Some(req.values.clone())
                    },
                }
            }));
            NodeSelectorTerm {
                match_expressions: Some(match_expressions),
                ..Default::default()
            }
        })
        .collect();

    NodeSelector {
        node_selector_terms: terms,
    }
}

/// Builds the full PV object for a discovered volume. `pv_name` is passed in rather than
/// recomputed here because callers (Discoverer, and tests) already need it before construction
/// to check the cache.
pub fn build_pv(pv_name: &str, volume: &DiscoveredVolume, ctx: &PvBuildContext) -> PersistentVolume {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        PROVISIONED_BY_ANNOTATION_KEY.to_string(),
        ctx.identity.as_str().to_string(),
    );

    let node_selector = build_node_selector(ctx);

    let node_affinity = if ctx.use_alpha_api {
        let encoded = serde_json::json!({
            "requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": node_selector.node_selector_terms.iter().map(|t| {
                    serde_json::json!({
                        "matchExpressions": t.match_expressions.clone().unwrap_or_default().iter().map(|r| {
                            serde_json::json!({
                                "key": r.key,
                                "operator": r.operator,
                                "values": r.values.clone().unwrap_or_default(),
                            })
                        }).collect::<Vec<_>>(),
                    })
                }).collect::<Vec<_>>(),
            }
        });
        annotations.insert(
            ALPHA_NODE_AFFINITY_ANNOTATION_KEY.to_string(),
            encoded.to_string(),
        );
        None
    } else {
        Some(VolumeNodeAffinity {
            required: Some(node_selector),
        })
    };

    let mut labels = ctx.extra_labels.clone();
    labels.extend(ctx.node_labels.clone());

    let rounded = round_down_capacity(volume.capacity_bytes);
    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), Quantity(rounded.to_string()));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name.to_string()),
            annotations: Some(annotations),
            labels: if labels.is_empty() { None } else { Some(labels) },
            owner_references: ctx.owner_reference.clone().map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity),
            access_modes: Some(vec![ctx.class.access_mode.clone()]),
            storage_class_name: Some(volume.class_name.clone()),
            persistent_volume_reclaim_policy: Some(ctx.class.reclaim_policy.clone()),
            volume_mode: Some(match volume.mode {
                VolumeMode::Filesystem => "Filesystem".to_string(),
                VolumeMode::Block => "Block".to_string(),
            }),
            local: Some(LocalVolumeSource {
                path: volume.host_path.clone(),
                fs_type: match volume.mode {
                    VolumeMode::Filesystem => ctx.class.fs_type.clone(),
                    VolumeMode::Block => None,
                },
            }),
            node_affinity,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawStorageClassConfig, StorageClassConfig};

    fn class(volume_mode: VolumeMode) -> StorageClassConfig {
        class_with_reclaim(volume_mode, "Delete")
    }

    fn class_with_reclaim(volume_mode: VolumeMode, reclaim_policy: &str) -> StorageClassConfig {
        StorageClassConfig::from_raw(
            "fast",
            RawStorageClassConfig {
                host_dir: "/mnt/fast".into(),
                mount_dir: "/mnt/fast".into(),
                volume_mode: Some(volume_mode),
                fs_type: None,
                access_mode: None,
                reclaim_policy: Some(reclaim_policy.to_string()),
                name_pattern: None,
                block_cleaner_command: None,
                selector: None,
            },
        )
        .unwrap()
    }

    fn discovered(mode: VolumeMode, capacity: u64) -> DiscoveredVolume {
        DiscoveredVolume {
            class_name: "fast".to_string(),
            file_name: "vol1".to_string(),
            host_path: "/mnt/fast/vol1".to_string(),
            mount_path: "/mnt/fast/vol1".to_string(),
            mode,
            capacity_bytes: capacity,
        }
    }

    #[test]
    fn s1_filesystem_pv_matches_spec_example() {
        let identity = ProvisionerIdentity::new("n1", None, true);
        let class = class(VolumeMode::Filesystem);
        let ctx = PvBuildContext {
            identity: &identity,
            node_name: "n1",
            class: &class,
            use_alpha_api: false,
            extra_labels: &BTreeMap::new(),
            node_labels: BTreeMap::new(),
            owner_reference: None,
        };
        let volume = discovered(VolumeMode::Filesystem, 107_374_182_400);
        let pv = build_pv("local-pv-deadbeef", &volume, &ctx);

        let spec = pv.spec.unwrap();
        assert_eq!(
            spec.capacity.unwrap().get("storage").unwrap().0,
            "107374182400"
        );
        assert_eq!(spec.local.unwrap().path, "/mnt/fast/vol1");
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce".to_string()]);
        assert_eq!(spec.storage_class_name.unwrap(), "fast");

        let affinity = spec.node_affinity.unwrap().required.unwrap();
        let reqs = affinity.node_selector_terms[0]
            .match_expressions
            .clone()
            .unwrap();
        assert_eq!(reqs[0].key, "kubernetes.io/hostname");
        assert_eq!(reqs[0].operator, "In");
        assert_eq!(reqs[0].values.clone().unwrap(), vec!["n1".to_string()]);

        assert_eq!(
            pv.metadata
                .annotations
                .unwrap()
                .get(PROVISIONED_BY_ANNOTATION_KEY)
                .unwrap(),
            identity.as_str()
        );
    }

    #[test]
    fn s2_block_pv_has_no_fs_type() {
        let identity = ProvisionerIdentity::new("n1", None, true);
        let class = class(VolumeMode::Block);
        let ctx = PvBuildContext {
            identity: &identity,
            node_name: "n1",
            class: &class,
            use_alpha_api: false,
            extra_labels: &BTreeMap::new(),
            node_labels: BTreeMap::new(),
            owner_reference: None,
        };
        let mut volume = discovered(VolumeMode::Block, 500_000_000_000);
        volume.host_path = "/mnt/raw/sdb".to_string();
        let pv = build_pv("local-pv-cafef00d", &volume, &ctx);

        let spec = pv.spec.unwrap();
        assert_eq!(spec.volume_mode.unwrap(), "Block");
        assert_eq!(spec.local.clone().unwrap().path, "/mnt/raw/sdb");
        assert!(spec.local.unwrap().fs_type.is_none());
    }

    #[test]
    fn alpha_api_encodes_affinity_as_annotation() {
        let identity = ProvisionerIdentity::new("n1", None, true);
        let class = class(VolumeMode::Filesystem);
        let ctx = PvBuildContext {
            identity: &identity,
            node_name: "n1",
            class: &class,
            use_alpha_api: true,
            extra_labels: &BTreeMap::new(),
            node_labels: BTreeMap::new(),
            owner_reference: None,
        };
        let volume = discovered(VolumeMode::Filesystem, 1024 * 1024 * 1024);
        let pv = build_pv("local-pv-abc", &volume, &ctx);

        assert!(pv.spec.unwrap().node_affinity.is_none());
        assert!(pv
            .metadata
            .annotations
            .unwrap()
            .contains_key(ALPHA_NODE_AFFINITY_ANNOTATION_KEY));
    }

    #[test]
    fn reclaim_policy_is_inherited_from_class() {
        let identity = ProvisionerIdentity::new("n1", None, true);
        let class = class_with_reclaim(VolumeMode::Filesystem, "Retain");
        let ctx = PvBuildContext {
            identity: &identity,
            node_name: "n1",
            class: &class,
            use_alpha_api: false,
            extra_labels: &BTreeMap::new(),
            node_labels: BTreeMap::new(),
            owner_reference: None,
        };
        let volume = discovered(VolumeMode::Filesystem, 1024 * 1024);
        let pv = build_pv("local-pv-retain", &volume, &ctx);
        assert_eq!(
            pv.spec.unwrap().persistent_volume_reclaim_policy.unwrap(),
            "Retain"
        );
    }

    #[test]
    fn capacity_rounds_down_to_mebibyte() {
        assert_eq!(round_down_capacity(1_048_576 + 1), 1_048_576);
        assert_eq!(round_down_capacity(1_048_576), 1_048_576);
        assert_eq!(round_down_capacity(0), 0);
    }
}
