use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PersistentVolume, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use tokio::process::Command;
use tracing::{info, warn};

use crate::api_util::ApiUtil;
use crate::cache::VolumeCache;
use crate::cleanup::{CleanupStatus, CleanupTracker};
use crate::config::{
    StorageClassConfig, StorageClassTable, VolumeMode, LOCAL_PV_BLKDEVICE_ENV,
    LOCAL_PV_FILESYSTEM_ENV,
};
use crate::volume_util::VolumeUtil;

/// Reconciles Released PVs with Delete reclaim policy: starts a cleanup of the backing medium,
/// waits for it to finish, then deletes the PV. Retain-policy PVs are left alone entirely.
pub struct Deleter {
    namespace: String,
    job_container_image: Option<String>,
    use_job_for_cleaning: bool,
}

impl Deleter {
    pub fn new(
        namespace: String,
        job_container_image: Option<String>,
        use_job_for_cleaning: bool,
    ) -> Self {
        Deleter {
            namespace,
            job_container_image,
            use_job_for_cleaning,
        }
    }

    pub async fn tick(
        &self,
        classes: &StorageClassTable,
        cache: &VolumeCache,
        tracker: &CleanupTracker,
        api: &ApiUtil,
        client: &Client,
        volume_util: &Arc<dyn VolumeUtil>,
    ) {
        for pv in cache.list() {
            let Some(name) = pv.metadata.name.clone() else {
                continue;
            };
            if !is_delete_candidate(&pv) {
                continue;
            }

            match tracker.status(&name) {
                CleanupStatus::InFlight => continue,
                CleanupStatus::Succeeded => {
                    match api.delete_pv(&name).await {
                        Ok(()) => {
                            tracker.remove(&name);
                            info!(pv = %name, "deleted PV after successful cleanup");
                        }
                        Err(e) => warn!(pv = %name, error = %e, "failed to delete PV"),
                    }
                }
                CleanupStatus::Failed => {
                    let _ = api
                        .emit_event(
                            &pv,
                            "VolumeFailedDelete",
                            "cleanup of backing medium failed",
                            "local-static-provisioner",
                            true,
                        )
                        .await;
                    tracker.remove(&name);
                    warn!(pv = %name, "cleanup failed, will retry next tick");
                }
                CleanupStatus::None => {
                    self.start_cleanup(&pv, &name, classes, tracker, api, client, volume_util)
                        .await;
                }
            }
        }
    }

    async fn start_cleanup(
        &self,
        pv: &PersistentVolume,
        name: &str,
        classes: &StorageClassTable,
        tracker: &CleanupTracker,
        api: &ApiUtil,
        client: &Client,
        volume_util: &Arc<dyn VolumeUtil>,
    ) {
        let Some(spec) = &pv.spec else { return };
        let Some(class_name) = spec.storage_class_name.as_deref() else {
            return;
        };
        let Some(class) = classes.get(class_name) else {
            warn!(pv = %name, class = class_name, "storage class no longer configured, cannot clean");
            let _ = api
                .emit_event(
                    pv,
                    "VolumeFailedDelete",
                    "storage class no longer configured",
                    "local-static-provisioner",
                    true,
                )
                .await;
            return;
        };
        let Some(local) = spec.local.as_ref() else {
            return;
        };
        let host_path = Path::new(&local.path);
        if !host_path.exists() {
            warn!(pv = %name, path = %local.path, "backing path no longer exists, cannot clean");
            let _ = api
                .emit_event(
                    pv,
                    "VolumeFailedDelete",
                    "backing path no longer exists",
                    "local-static-provisioner",
                    true,
                )
                .await;
            return;
        }

        let mount_path = match host_path.strip_prefix(&class.host_dir) {
            Ok(relative) => class.mount_dir.join(relative),
            Err(_) => {
                warn!(pv = %name, path = %local.path, class = class_name, "backing path no longer under class hostDir, cannot clean");
                let _ = api
                    .emit_event(
                        pv,
                        "VolumeFailedDelete",
                        "backing path no longer matches class configuration",
                        "local-static-provisioner",
                        true,
                    )
                    .await;
                return;
            }
        };

        if !mode_still_matches(class, &mount_path, volume_util.as_ref()) {
            warn!(pv = %name, path = %local.path, "backing medium no longer matches PV's volume mode, cannot clean");
            let _ = api
                .emit_event(
                    pv,
                    "VolumeFailedDelete",
                    "backing medium no longer matches PV's volume mode",
                    "local-static-provisioner",
                    true,
                )
                .await;
            return;
        }

        let env_key = match class.volume_mode {
            VolumeMode::Block => LOCAL_PV_BLKDEVICE_ENV,
            VolumeMode::Filesystem => LOCAL_PV_FILESYSTEM_ENV,
        };

        if self.use_job_for_cleaning {
            self.start_job_cleanup(name, class, &local.path, env_key, tracker, client)
                .await;
        } else {
            self.start_inline_cleanup(name, class, &local.path, env_key, tracker);
        }
    }

    fn start_inline_cleanup(
        &self,
        pv_name: &str,
        class: &crate::config::StorageClassConfig,
        path: &str,
        env_key: &str,
        tracker: &CleanupTracker,
    ) {
        let Some((program, args)) = class.block_cleaner_command.split_first() else {
            return;
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(env_key, path)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                if tracker.insert_process(pv_name.to_string(), child).is_err() {
                    warn!(pv = %pv_name, "cleanup already in flight, not starting another");
                } else {
                    info!(pv = %pv_name, path, "started inline cleanup");
                }
            }
            Err(e) => warn!(pv = %pv_name, error = %e, "failed to spawn cleanup command"),
        }
    }

    async fn start_job_cleanup(
        &self,
        pv_name: &str,
        class: &crate::config::StorageClassConfig,
        path: &str,
        env_key: &str,
        tracker: &CleanupTracker,
        client: &Client,
    ) {
        let Some(image) = self.job_container_image.clone() else {
            warn!(pv = %pv_name, "useJobForCleaning set but no job container image configured");
            return;
        };

        let job = Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("cleanup-{pv_name}-")),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                ttl_seconds_after_finished: Some(600),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".to_string()),
                        containers: vec![Container {
                            name: "cleanup".to_string(),
                            image: Some(image),
                            command: Some(class.block_cleaner_command.clone()),
                            env: Some(vec![EnvVar {
                                name: env_key.to_string(),
                                value: Some(path.to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.namespace);
        let created = match jobs.create(&PostParams::default(), &job).await {
            Ok(j) => j,
            Err(e) => {
                warn!(pv = %pv_name, error = %e, "failed to create cleanup job");
                return;
            }
        };

        let jobs_for_poll = jobs.clone();
        let job_name = created.metadata.name.clone().unwrap_or_default();
        let result = tracker.insert_job(pv_name.to_string(), created, move |_| {
            let jobs = jobs_for_poll.clone();
            let job_name = job_name.clone();
            async move {
                match jobs.get(&job_name).await {
                    Ok(j) => {
                        let status = j.status?;
                        if status.succeeded.unwrap_or(0) > 0 {
                            Some(true)
                        } else if status.failed.unwrap_or(0) > 0 {
                            Some(false)
                        } else {
                            None
                        }
                    }
                    Err(_) => None,
                }
            }
        });

        if result.is_err() {
            warn!(pv = %pv_name, "cleanup job already tracked, not starting another");
        } else {
            info!(pv = %pv_name, "started job-based cleanup");
        }
    }
}

/// A PV is a cleanup candidate only once it's Released and its reclaim policy says Delete;
/// Retain-policy and still-bound PVs are left untouched.
fn is_delete_candidate(pv: &PersistentVolume) -> bool {
    let phase = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if phase != "Released" {
        return false;
    }
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some("Delete")
}

/// Re-probes the backing medium at `mount_path` against the class's configured volume mode, so a
/// PV whose medium was swapped out from under it (mount replaced by a raw device, or vice versa)
/// is never handed to a cleaner expecting the old shape.
fn mode_still_matches(class: &StorageClassConfig, mount_path: &Path, volume_util: &dyn VolumeUtil) -> bool {
    match class.volume_mode {
        VolumeMode::Filesystem => {
            let is_dir = volume_util.is_dir(mount_path).unwrap_or(false);
            let is_mount = volume_util.is_likely_mount_point(mount_path).unwrap_or(false);
            is_dir && is_mount
        }
        VolumeMode::Block => volume_util.is_block_device(mount_path).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawStorageClassConfig, StorageClassConfig};
    use crate::volume_util::FakeVolumeUtil;
    use k8s_openapi::api::core::v1::{
        LocalVolumeSource, PersistentVolumeSpec, PersistentVolumeStatus,
    };

    fn released_pv(name: &str, class: &str, reclaim: &str, path: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: Some(class.to_string()),
                persistent_volume_reclaim_policy: Some(reclaim.to_string()),
                local: Some(LocalVolumeSource {
                    path: path.to_string(),
                    fs_type: None,
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Released".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn retain_policy_is_never_a_cleanup_candidate() {
        let pv = released_pv("local-pv-1", "fast", "Retain", "/mnt/fast/vol1");
        assert!(!is_delete_candidate(&pv));
    }

    #[test]
    fn bound_pv_is_not_a_cleanup_candidate_even_with_delete_policy() {
        let mut pv = released_pv("local-pv-1", "fast", "Delete", "/mnt/fast/vol1");
        pv.status.as_mut().unwrap().phase = Some("Bound".to_string());
        assert!(!is_delete_candidate(&pv));
    }

    #[test]
    fn released_delete_pv_is_a_cleanup_candidate() {
        let pv = released_pv("local-pv-1", "fast", "Delete", "/mnt/fast/vol1");
        assert!(is_delete_candidate(&pv));
    }

    fn class_with_cleaner(cmd: Vec<String>) -> StorageClassConfig {
        StorageClassConfig::from_raw(
            "fast",
            RawStorageClassConfig {
                host_dir: "/mnt/fast".into(),
                mount_dir: "/mnt/fast".into(),
                volume_mode: None,
                fs_type: None,
                access_mode: None,
                reclaim_policy: None,
                name_pattern: None,
                block_cleaner_command: Some(cmd),
                selector: None,
            },
        )
        .unwrap()
    }

    async fn wait_until_terminal(tracker: &CleanupTracker, pv_name: &str) {
        for _ in 0..50 {
            if tracker.status(pv_name) != CleanupStatus::InFlight {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_inline_cleanup_transitions_tracker_to_succeeded() {
        let tracker = CleanupTracker::new();
        let class = class_with_cleaner(vec!["true".to_string()]);
        let deleter = Deleter::new("default".to_string(), None, false);
        deleter.start_inline_cleanup(
            "local-pv-1",
            &class,
            "/mnt/raw/sdb",
            LOCAL_PV_BLKDEVICE_ENV,
            &tracker,
        );
        assert_eq!(tracker.status("local-pv-1"), CleanupStatus::InFlight);
        wait_until_terminal(&tracker, "local-pv-1").await;
        assert_eq!(tracker.status("local-pv-1"), CleanupStatus::Succeeded);
    }

    #[tokio::test]
    async fn start_inline_cleanup_transitions_tracker_to_failed_on_nonzero_exit() {
        let tracker = CleanupTracker::new();
        let class = class_with_cleaner(vec!["false".to_string()]);
        let deleter = Deleter::new("default".to_string(), None, false);
        deleter.start_inline_cleanup(
            "local-pv-1",
            &class,
            "/mnt/raw/sdb",
            LOCAL_PV_BLKDEVICE_ENV,
            &tracker,
        );
        wait_until_terminal(&tracker, "local-pv-1").await;
        assert_eq!(tracker.status("local-pv-1"), CleanupStatus::Failed);
    }

    #[test]
    fn mode_still_matches_rejects_filesystem_class_when_probe_now_sees_a_block_device() {
        let class = class_with_cleaner(vec!["true".to_string()]);
        let util = FakeVolumeUtil::new().with_block_entry("/mnt/fast/vol1", 1024);
        assert!(!mode_still_matches(&class, Path::new("/mnt/fast/vol1"), &util));
    }

    #[test]
    fn mode_still_matches_accepts_matching_filesystem_mount() {
        let class = class_with_cleaner(vec!["true".to_string()]);
        let util = FakeVolumeUtil::new().with_filesystem_entry("/mnt/fast/vol1", 1024, true);
        assert!(mode_still_matches(&class, Path::new("/mnt/fast/vol1"), &util));
    }
}
