use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::Toleration;
use serde::Deserialize;

use crate::error::{ProvisionerError, Result};

pub const PROVISIONED_BY_ANNOTATION_KEY: &str = "pv.kubernetes.io/provisioned-by";
pub const ALPHA_NODE_AFFINITY_ANNOTATION_KEY: &str = "volume.alpha.kubernetes.io/node-affinity";
pub const NODE_HOSTNAME_KEY: &str = "kubernetes.io/hostname";
pub const PROVISIONER_NAME_PREFIX: &str = "local-volume-provisioner";
pub const DEFAULT_BLOCK_CLEANER_COMMAND: &str = "/scripts/quick_reset.sh";
pub const LOCAL_PV_BLKDEVICE_ENV: &str = "LOCAL_PV_BLKDEVICE";
pub const LOCAL_PV_FILESYSTEM_ENV: &str = "LOCAL_PV_FILESYSTEM";
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";
pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";
pub const DEFAULT_API_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MIN_RESYNC_PERIOD_SECS: u64 = 300;

/// Storage mode a class's media is expected to be probed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

impl Default for VolumeMode {
    fn default() -> Self {
        VolumeMode::Filesystem
    }
}

/// Raw, as-authored form of a storage class entry in `storageClassMap`. Every field is optional
/// except the two paths; defaulting happens once, in [`StorageClassConfig::from_raw`], so PV
/// construction never has to fix up an unset field after the fact.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStorageClassConfig {
    pub host_dir: String,
    pub mount_dir: String,
    #[serde(default)]
    pub volume_mode: Option<VolumeMode>,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub reclaim_policy: Option<String>,
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default)]
    pub block_cleaner_command: Option<Vec<String>>,
    #[serde(default)]
    pub selector: Option<Vec<NodeSelectorTermConfig>>,
}

/// A single node-selector term, mirroring the cluster's `NodeSelectorTerm` shape closely enough
/// to translate 1:1 when building node affinity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTermConfig {
    pub match_expressions: Vec<NodeSelectorRequirementConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSelectorRequirementConfig {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Validated, defaulted storage class config — immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct StorageClassConfig {
    pub host_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub volume_mode: VolumeMode,
    pub fs_type: Option<String>,
    pub access_mode: String,
    pub reclaim_policy: String,
    pub name_patterns: Vec<String>,
    pub block_cleaner_command: Vec<String>,
    pub selector: Vec<NodeSelectorTermConfig>,
}

impl StorageClassConfig {
    pub fn from_raw(class_name: &str, raw: RawStorageClassConfig) -> Result<Self> {
        if raw.host_dir.trim().is_empty() {
            return Err(ProvisionerError::FatalConfig(format!(
                "storage class '{class_name}': hostDir must not be empty"
            )));
        }
        if raw.mount_dir.trim().is_empty() {
            return Err(ProvisionerError::FatalConfig(format!(
                "storage class '{class_name}': mountDir must not be empty"
            )));
        }

        let volume_mode = raw.volume_mode.unwrap_or_default();

        let reclaim_policy = raw
            .reclaim_policy
            .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string());
        if reclaim_policy != "Delete" && reclaim_policy != "Retain" {
            return Err(ProvisionerError::FatalConfig(format!(
                "storage class '{class_name}': reclaimPolicy must be 'Delete' or 'Retain', got '{reclaim_policy}'"
            )));
        }

        let block_cleaner_command = match raw.block_cleaner_command {
            Some(cmd) if !cmd.is_empty() => cmd,
            Some(_) => {
                return Err(ProvisionerError::FatalConfig(format!(
                    "storage class '{class_name}': blockCleanerCommand must not be empty"
                )))
            }
            None => vec![DEFAULT_BLOCK_CLEANER_COMMAND.to_string()],
        };

        let name_patterns = raw
            .name_pattern
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let name_patterns = if name_patterns.is_empty() {
            vec!["*".to_string()]
        } else {
            name_patterns
        };

        Ok(StorageClassConfig {
            host_dir: PathBuf::from(raw.host_dir),
            mount_dir: PathBuf::from(raw.mount_dir),
            volume_mode,
            fs_type: raw.fs_type,
            access_mode: raw.access_mode.unwrap_or_else(|| DEFAULT_ACCESS_MODE.to_string()),
            reclaim_policy,
            name_patterns,
            block_cleaner_command,
            selector: raw.selector.unwrap_or_default(),
        })
    }
}

/// Effective storage-class table, keyed by class name. Loaded once at startup; read-only for
/// the rest of the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct StorageClassTable {
    classes: BTreeMap<String, StorageClassConfig>,
}

impl StorageClassTable {
    pub fn from_map(raw: BTreeMap<String, RawStorageClassConfig>) -> Result<Self> {
        let mut classes = BTreeMap::new();
        for (name, raw_class) in raw {
            let validated = StorageClassConfig::from_raw(&name, raw_class)?;
            classes.insert(name, validated);
        }
        Ok(StorageClassTable { classes })
    }

    pub fn get(&self, class: &str) -> Option<&StorageClassConfig> {
        self.classes.get(class)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StorageClassConfig)> {
        self.classes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Parses the `storageClassMap` document leaf (a single self-contained YAML document, never
/// concatenated with anything else) into a validated [`StorageClassTable`].
pub fn parse_storage_class_map(yaml: &str) -> Result<StorageClassTable> {
    let raw: BTreeMap<String, RawStorageClassConfig> = serde_yaml::from_str(yaml)
        .map_err(|e| ProvisionerError::FatalConfig(format!("invalid storageClassMap: {e}")))?;
    StorageClassTable::from_map(raw)
}

/// CLI / environment surface. Each config-blob key from the spec that is a scalar or small list
/// is exposed here; `storage_class_map_path` points at the YAML document leaf.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Name of the node this provisioner instance runs on.
    #[arg(long, env = "MY_NODE_NAME")]
    pub node_name: String,

    /// Namespace this process runs in, used when creating cleanup Jobs.
    #[arg(long, env = "MY_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Container image used for Job-based cleanups.
    #[arg(long, env = "JOB_CONTAINER_IMAGE")]
    pub job_container_image: Option<String>,

    /// Path to the storageClassMap YAML document.
    #[arg(long, env = "STORAGE_CLASS_MAP_PATH")]
    pub storage_class_map_path: PathBuf,

    /// Comma-separated node-label keys to copy onto created PVs.
    #[arg(long, env = "NODE_LABELS_FOR_PV", value_delimiter = ',')]
    pub node_labels_for_pv: Vec<String>,

    /// Comma-separated `key=value` pairs added as labels to every created PV.
    #[arg(long, env = "LABELS_FOR_PV", value_delimiter = ',')]
    pub labels_for_pv: Vec<String>,

    /// Encode node affinity into the legacy alpha annotation instead of the structured field.
    #[arg(long, env = "USE_ALPHA_API", default_value_t = false)]
    pub use_alpha_api: bool,

    /// Run block-device cleanup as a cluster Job instead of an inline child process.
    #[arg(long, env = "USE_JOB_FOR_CLEANING", default_value_t = false)]
    pub use_job_for_cleaning: bool,

    /// Base resync period in seconds; actual tick interval is drawn from [period, 2*period).
    #[arg(long, env = "MIN_RESYNC_PERIOD_SECS", default_value_t = DEFAULT_MIN_RESYNC_PERIOD_SECS)]
    pub min_resync_period_secs: u64,

    /// Drop the node UID from the provisioner identity, keeping it stable across node recreation.
    #[arg(long, env = "USE_NODE_NAME_ONLY", default_value_t = false)]
    pub use_node_name_only: bool,

    /// Owner-reference created PVs to the Node object.
    #[arg(long, env = "SET_PV_OWNER_REF", default_value_t = false)]
    pub set_pv_owner_ref: bool,

    /// Remove the named taint from the node once informer sync completes.
    #[arg(long, env = "REMOVE_NODE_NOT_READY_TAINT", default_value_t = false)]
    pub remove_node_not_ready_taint: bool,

    /// Taint key to remove when `remove_node_not_ready_taint` is set.
    #[arg(long, env = "PROVISIONER_NOT_READY_NODE_TAINT_KEY")]
    pub provisioner_not_ready_node_taint_key: Option<String>,

    /// Timeout, in seconds, applied to every cluster write.
    #[arg(long, env = "API_WRITE_TIMEOUT_SECS", default_value_t = DEFAULT_API_WRITE_TIMEOUT_SECS)]
    pub api_write_timeout_secs: u64,

    /// Tolerations applied to cleanup Jobs, as a JSON array of Toleration objects.
    #[arg(long, env = "JOB_TOLERATIONS_JSON")]
    pub job_tolerations_json: Option<String>,
}

/// Fully assembled, validated configuration the controller runs with.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub node_name: String,
    pub namespace: String,
    pub job_container_image: Option<String>,
    pub storage_classes: StorageClassTable,
    pub node_labels_for_pv: Vec<String>,
    pub use_alpha_api: bool,
    pub use_job_for_cleaning: bool,
    pub min_resync_period: Duration,
    pub use_node_name_only: bool,
    pub labels_for_pv: BTreeMap<String, String>,
    pub set_pv_owner_ref: bool,
    pub remove_node_not_ready_taint: bool,
    pub provisioner_not_ready_node_taint_key: Option<String>,
    pub api_write_timeout: Duration,
    pub job_tolerations: Vec<Toleration>,
}

impl ProvisionerConfig {
    pub fn assemble(cli: Cli, storage_class_map_yaml: &str) -> Result<Self> {
        let storage_classes = parse_storage_class_map(storage_class_map_yaml)?;
        if storage_classes.is_empty() {
            return Err(ProvisionerError::FatalConfig(
                "storageClassMap must declare at least one storage class".to_string(),
            ));
        }

        if cli.use_job_for_cleaning && cli.job_container_image.is_none() {
            return Err(ProvisionerError::FatalConfig(
                "useJobForCleaning requires JOB_CONTAINER_IMAGE to be set".to_string(),
            ));
        }

        if cli.remove_node_not_ready_taint && cli.provisioner_not_ready_node_taint_key.is_none() {
            return Err(ProvisionerError::FatalConfig(
                "removeNodeNotReadyTaint requires provisionerNotReadyNodeTaintKey".to_string(),
            ));
        }

        if cli.min_resync_period_secs == 0 {
            return Err(ProvisionerError::FatalConfig(
                "minResyncPeriod must be greater than zero".to_string(),
            ));
        }

        let job_tolerations = match &cli.job_tolerations_json {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ProvisionerError::FatalConfig(format!("invalid jobTolerations: {e}"))
            })?,
            None => Vec::new(),
        };

        let mut labels_for_pv = BTreeMap::new();
        for pair in &cli.labels_for_pv {
            match pair.split_once('=') {
                Some((k, v)) => {
                    labels_for_pv.insert(k.trim().to_string(), v.trim().to_string());
                }
                None => {
                    return Err(ProvisionerError::FatalConfig(format!(
                        "labelsForPV entry '{pair}' is not in key=value form"
                    )))
                }
            }
        }

        Ok(ProvisionerConfig {
            node_name: cli.node_name,
            namespace: cli.namespace,
            job_container_image: cli.job_container_image,
            storage_classes,
            node_labels_for_pv: cli.node_labels_for_pv,
            use_alpha_api: cli.use_alpha_api,
            use_job_for_cleaning: cli.use_job_for_cleaning,
            min_resync_period: Duration::from_secs(cli.min_resync_period_secs),
            use_node_name_only: cli.use_node_name_only,
            labels_for_pv,
            set_pv_owner_ref: cli.set_pv_owner_ref,
            remove_node_not_ready_taint: cli.remove_node_not_ready_taint,
            provisioner_not_ready_node_taint_key: cli.provisioner_not_ready_node_taint_key,
            api_write_timeout: Duration::from_secs(cli.api_write_timeout_secs),
            job_tolerations,
        })
    }
}
