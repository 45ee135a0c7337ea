//! Lifecycle-hook jobs
//!
//! Plans may ship one-shot jobs fired on instance lifecycle events
//! (create/delete/bind/unbind). Firing creates the rendered jobs on the
//! tenant cluster; a background poller then watches their status and reports
//! completion to the progress store, forgetting each instance once all its
//! hook jobs have finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::applier::KubernetesApi;
use crate::catalog::blueprint::{JobHook, JobKind};
use crate::creator::ClusterCredentials;
use crate::progress::ProgressStore;
use crate::Result;

/// One instance whose hook jobs are being watched
struct JobWatch {
    creds: ClusterCredentials,
    instance_id: String,
    /// Names of jobs still awaiting completion
    pending: Vec<String>,
}

/// Background watcher for fired hook jobs
pub struct JobPoller {
    kubernetes: Arc<dyn KubernetesApi>,
    progress: Arc<ProgressStore>,
    interval: Duration,
    watches: Mutex<Vec<JobWatch>>,
}

impl JobPoller {
    /// Create a poller checking job status every `interval`
    pub fn new(
        kubernetes: Arc<dyn KubernetesApi>,
        progress: Arc<ProgressStore>,
        interval: Duration,
    ) -> Self {
        Self {
            kubernetes,
            progress,
            interval,
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Watch `jobs` of one instance until they complete
    pub fn watch(&self, creds: ClusterCredentials, instance_id: &str, jobs: &[Job]) {
        let pending: Vec<String> = jobs
            .iter()
            .filter_map(|j| j.metadata.name.clone())
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!(instance_id, jobs = ?pending, "watching hook jobs");
        let mut watches = self.watches.lock().expect("job watch lock poisoned");
        watches.push(JobWatch {
            creds,
            instance_id: instance_id.to_string(),
            pending,
        });
    }

    /// Number of instances currently watched
    pub fn watched_instances(&self) -> usize {
        self.watches.lock().expect("job watch lock poisoned").len()
    }

    /// Check every watched instance once, reporting finished jobs
    pub async fn poll_once(&self) {
        let snapshot: Vec<(ClusterCredentials, String)> = {
            let watches = self.watches.lock().expect("job watch lock poisoned");
            watches
                .iter()
                .map(|w| (w.creds.clone(), w.instance_id.clone()))
                .collect()
        };

        let mut finished: HashMap<String, Vec<(String, bool)>> = HashMap::new();
        for (creds, instance_id) in snapshot {
            match self
                .kubernetes
                .list_jobs_by_instance_id(&creds, &instance_id)
                .await
            {
                Ok(jobs) => {
                    let done: Vec<(String, bool)> = jobs
                        .iter()
                        .filter_map(|job| {
                            job_outcome(job)
                                .map(|ok| (job.metadata.name.clone().unwrap_or_default(), ok))
                        })
                        .collect();
                    finished.insert(instance_id, done);
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "hook job status check failed");
                }
            }
        }

        let mut watches = self.watches.lock().expect("job watch lock poisoned");
        for watch in watches.iter_mut() {
            if let Some(done) = finished.get(&watch.instance_id) {
                for (name, succeeded) in done {
                    if watch.pending.iter().any(|p| p == name) {
                        let state = if *succeeded {
                            format!("JOB_{name}_SUCCEEDED")
                        } else {
                            format!("JOB_{name}_FAILED")
                        };
                        self.progress.record(&watch.instance_id, &state, None);
                        watch.pending.retain(|p| p != name);
                    }
                }
            }
        }
        watches.retain(|w| !w.pending.is_empty());
    }

    /// Run the poll loop until shutdown
    pub fn spawn(self: Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let interval = self.interval;
        tracker.spawn(async move {
            info!(interval_secs = interval.as_secs(), "hook job poller running");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.poll_once().await,
                    _ = shutdown.cancelled() => {
                        info!("hook job poller stopping");
                        return;
                    }
                }
            }
        });
    }
}

/// `Some(true)` once the job succeeded, `Some(false)` once it failed,
/// `None` while still running
fn job_outcome(job: &Job) -> Option<bool> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(true);
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(false);
    }
    None
}

/// Create the hooks of `kind` on the cluster and register them with the
/// poller
pub async fn fire_hooks(
    kubernetes: &Arc<dyn KubernetesApi>,
    poller: &JobPoller,
    creds: &ClusterCredentials,
    hooks: &[JobHook],
    kind: JobKind,
    instance_id: &str,
    progress: &ProgressStore,
) -> Result<()> {
    if !hooks.iter().any(|h| h.kind == kind) {
        return Ok(());
    }
    let created = kubernetes
        .create_jobs(creds, hooks, kind, instance_id, progress)
        .await?;
    poller.watch(creds.clone(), instance_id, &created);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MockKubernetesApi;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn job(name: &str, succeeded: Option<i32>, failed: Option<i32>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(JobStatus {
                succeeded,
                failed,
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    fn creds() -> ClusterCredentials {
        ClusterCredentials {
            api_server_url: "https://10.0.0.1:6443".into(),
            ..ClusterCredentials::default()
        }
    }

    #[test]
    fn job_outcome_classification() {
        assert_eq!(job_outcome(&job("j", Some(1), None)), Some(true));
        assert_eq!(job_outcome(&job("j", None, Some(1))), Some(false));
        assert_eq!(job_outcome(&job("j", None, None)), None);
        assert_eq!(job_outcome(&Job::default()), None);
    }

    #[tokio::test]
    async fn completed_jobs_are_reported_and_forgotten() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_list_jobs_by_instance_id()
            .returning(|_, _| Ok(vec![job("init-db", Some(1), None)]));

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(Arc::new(kube), progress.clone(), Duration::from_secs(30));

        poller.watch(creds(), "abc", &[job("init-db", None, None)]);
        assert_eq!(poller.watched_instances(), 1);

        poller.poll_once().await;

        assert_eq!(poller.watched_instances(), 0);
        let rec = progress.read("abc").unwrap();
        assert_eq!(rec.state, "JOB_init-db_SUCCEEDED");
    }

    #[tokio::test]
    async fn failed_jobs_report_failure() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_list_jobs_by_instance_id()
            .returning(|_, _| Ok(vec![job("init-db", None, Some(1))]));

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(Arc::new(kube), progress.clone(), Duration::from_secs(30));

        poller.watch(creds(), "abc", &[job("init-db", None, None)]);
        poller.poll_once().await;

        assert_eq!(progress.read("abc").unwrap().state, "JOB_init-db_FAILED");
    }

    #[tokio::test]
    async fn running_jobs_stay_watched() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_list_jobs_by_instance_id()
            .returning(|_, _| Ok(vec![job("init-db", None, None)]));

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(Arc::new(kube), progress.clone(), Duration::from_secs(30));

        poller.watch(creds(), "abc", &[job("init-db", None, None)]);
        poller.poll_once().await;

        assert_eq!(poller.watched_instances(), 1);
        assert!(progress.read("abc").is_none());
    }

    #[tokio::test]
    async fn poll_errors_keep_the_watch() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_list_jobs_by_instance_id()
            .returning(|_, _| Err(crate::error::Error::upstream("api down")));

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(Arc::new(kube), progress, Duration::from_secs(30));

        poller.watch(creds(), "abc", &[job("init-db", None, None)]);
        poller.poll_once().await;
        assert_eq!(poller.watched_instances(), 1);
    }

    #[tokio::test]
    async fn fire_hooks_skips_when_no_hooks_of_kind() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_create_jobs().times(0);
        let kube: Arc<dyn KubernetesApi> = Arc::new(kube);

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(kube.clone(), progress.clone(), Duration::from_secs(30));

        let hooks = vec![JobHook {
            kind: JobKind::OnDelete,
            job: job("cleanup", None, None),
        }];
        fire_hooks(
            &kube,
            &poller,
            &creds(),
            &hooks,
            JobKind::OnCreate,
            "abc",
            &progress,
        )
        .await
        .unwrap();
        assert_eq!(poller.watched_instances(), 0);
    }

    #[tokio::test]
    async fn fire_hooks_creates_and_watches() {
        let mut kube = MockKubernetesApi::new();
        kube.expect_create_jobs()
            .times(1)
            .returning(|_, _, _, _, _| Ok(vec![job("init", None, None)]));
        let kube: Arc<dyn KubernetesApi> = Arc::new(kube);

        let progress = Arc::new(ProgressStore::new());
        let poller = JobPoller::new(kube.clone(), progress.clone(), Duration::from_secs(30));

        let hooks = vec![JobHook {
            kind: JobKind::OnCreate,
            job: job("init", None, None),
        }];
        fire_hooks(
            &kube,
            &poller,
            &creds(),
            &hooks,
            JobKind::OnCreate,
            "abc",
            &progress,
        )
        .await
        .unwrap();
        assert_eq!(poller.watched_instances(), 1);
    }
}
