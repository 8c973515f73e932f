use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::Notify;

/// Observed outcome of a cleanup, as last reported by its observer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    None,
    InFlight,
    Succeeded,
    Failed,
}

/// Error returned by `insert_process`/`insert_job` when a cleanup is already tracked for a PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyPresent;

enum Backing {
    Process,
    Job,
}

struct Entry {
    status: Mutex<CleanupStatus>,
    backing: Backing,
}

/// Tracks at most one in-flight cleanup per PV name, whether it runs as a local child process or
/// a cluster Job. `insert_process`/`insert_job` are the only writers that add entries; each entry
/// owns its own `Mutex<CleanupStatus>` so the observer task updating it never has to take a lock
/// on the whole map.
///
/// Holds a [`ShutdownSignal`] so, on process shutdown, observer tasks can stop supervising without
/// killing the child process or cluster Job they were watching — those keep running; only this
/// process's bookkeeping of them ends.
pub struct CleanupTracker {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    shutdown: Arc<ShutdownSignal>,
}

impl Default for CleanupTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupTracker {
    pub fn new() -> Self {
        CleanupTracker {
            entries: Mutex::new(HashMap::new()),
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// Stops all observer tasks from further polling/waiting. Already-tracked entries keep
    /// whatever status they last observed; the underlying process or Job is left running.
    pub fn shutdown(&self) {
        self.shutdown.fire();
    }

    pub fn status(&self, pv_name: &str) -> CleanupStatus {
        match self.entries.lock().get(pv_name) {
            Some(entry) => *entry.status.lock(),
            None => CleanupStatus::None,
        }
    }

    pub fn remove(&self, pv_name: &str) {
        self.entries.lock().remove(pv_name);
    }

    /// Registers a child process cleanup for `pv_name`, spawning a background task that awaits
    /// its exit and transitions the entry's status exactly once. Fails if a cleanup is already
    /// tracked for this name.
    pub fn insert_process(
        &self,
        pv_name: String,
        mut child: Child,
    ) -> Result<(), AlreadyPresent> {
        let entry = Arc::new(Entry {
            status: Mutex::new(CleanupStatus::InFlight),
            backing: Backing::Process,
        });

        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&pv_name) {
                return Err(AlreadyPresent);
            }
            entries.insert(pv_name.clone(), entry.clone());
        }

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                outcome = child.wait() => {
                    let terminal = match outcome {
                        Ok(status) if exit_status_success(&status) => CleanupStatus::Succeeded,
                        _ => CleanupStatus::Failed,
                    };
                    *entry.status.lock() = terminal;
                }
                _ = shutdown.cancelled() => {}
            }
        });

        Ok(())
    }

    /// Registers a cluster-Job-backed cleanup for `pv_name`. `poll` is invoked by the observer
    /// loop at an interval to check the Job's phase; it should return `Some(true)` on success,
    /// `Some(false)` on terminal failure, and `None` while still running.
    pub fn insert_job<F, Fut>(
        &self,
        pv_name: String,
        job: Job,
        poll: F,
    ) -> Result<(), AlreadyPresent>
    where
        F: Fn(Job) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Option<bool>> + Send,
    {
        let entry = Arc::new(Entry {
            status: Mutex::new(CleanupStatus::InFlight),
            backing: Backing::Job,
        });

        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&pv_name) {
                return Err(AlreadyPresent);
            }
            entries.insert(pv_name.clone(), entry.clone());
        }

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let cancelled = shutdown.cancelled();
            tokio::pin!(cancelled);
            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    outcome = poll(job.clone()) => match outcome {
                        Some(true) => {
                            *entry.status.lock() = CleanupStatus::Succeeded;
                            break;
                        }
                        Some(false) => {
                            *entry.status.lock() = CleanupStatus::Failed;
                            break;
                        }
                        None => {
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub fn backing(&self, pv_name: &str) -> Option<&'static str> {
        self.entries.lock().get(pv_name).map(|e| match e.backing {
            Backing::Process => "process",
            Backing::Job => "job",
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn exit_status_success(status: &ExitStatus) -> bool {
    status.success()
}

/// Signal used by shutdown to let cleanup observer tasks stop waiting without killing their
/// underlying process or Job.
#[derive(Default)]
pub struct ShutdownSignal {
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal {
            notify: Notify::new(),
        }
    }

    pub fn fire(&self) {
        self.notify.notify_waiters();
    }

    pub async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn insert_process_transitions_to_succeeded() {
        let tracker = CleanupTracker::new();
        let child = Command::new("true").stdout(Stdio::null()).spawn().unwrap();
        tracker.insert_process("pv1".to_string(), child).unwrap();
        assert_eq!(tracker.status("pv1"), CleanupStatus::InFlight);

        for _ in 0..50 {
            if tracker.status("pv1") != CleanupStatus::InFlight {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(tracker.status("pv1"), CleanupStatus::Succeeded);
    }

    #[tokio::test]
    async fn insert_process_transitions_to_failed_on_nonzero_exit() {
        let tracker = CleanupTracker::new();
        let child = Command::new("false").stdout(Stdio::null()).spawn().unwrap();
        tracker.insert_process("pv1".to_string(), child).unwrap();

        for _ in 0..50 {
            if tracker.status("pv1") != CleanupStatus::InFlight {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(tracker.status("pv1"), CleanupStatus::Failed);
    }

    #[tokio::test]
    async fn second_insert_for_same_name_is_rejected() {
        let tracker = CleanupTracker::new();
        let child1 = Command::new("sleep")
            .arg("5")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        tracker.insert_process("pv1".to_string(), child1).unwrap();

        let child2 = Command::new("true").stdout(Stdio::null()).spawn().unwrap();
        assert_eq!(
            tracker.insert_process("pv1".to_string(), child2),
            Err(AlreadyPresent)
        );
    }

    #[test]
    fn status_of_unknown_name_is_none() {
        let tracker = CleanupTracker::new();
        assert_eq!(tracker.status("unknown"), CleanupStatus::None);
    }

    #[test]
    fn remove_clears_entry() {
        let tracker = CleanupTracker::new();
        tracker.entries.lock().insert(
            "pv1".to_string(),
            Arc::new(Entry {
                status: Mutex::new(CleanupStatus::Succeeded),
                backing: Backing::Process,
            }),
        );
        tracker.remove("pv1");
        assert_eq!(tracker.status("pv1"), CleanupStatus::None);
    }
}
