//! Tenant cluster reaper
//!
//! After an instance is deleted the org's cluster may be empty except for
//! persistent volumes still detaching. One reaper task per delete waits out a
//! grace period, then repeatedly checks whether the cluster is really empty
//! and, once the volumes have drained, tells the creator to tear the cluster
//! down. A cluster that regrew services in the meantime is left alone.
//!
//! Reapers have no attempt cap; they run until a terminal state or process
//! shutdown. Every sleep races the shutdown token so outstanding reapers exit
//! promptly when the broker stops.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::applier::KubernetesApi;
use crate::creator::{ClusterCredentials, ClusterDirectory};

/// Reaper timing knobs
#[derive(Clone, Copy, Debug)]
pub struct ReaperConfig {
    /// Delay before the first emptiness check
    pub grace: Duration,
    /// Delay between persistent-volume drain checks
    pub pv_recheck: Duration,
}

/// How a reaper run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaperOutcome {
    /// Cluster was empty and the creator was told to delete it
    ClusterDeleted,
    /// The org still has instances; nothing was touched
    NotEmpty,
    /// An upstream call failed; the run gave up
    Failed,
    /// Process shutdown interrupted the run
    Shutdown,
}

/// Spawn a reaper for `org` on the shared task tracker
pub fn spawn_reaper(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    kubernetes: Arc<dyn KubernetesApi>,
    directory: Arc<ClusterDirectory>,
    creds: ClusterCredentials,
    org: String,
    config: ReaperConfig,
) {
    tracker.spawn(async move {
        let outcome = run_reaper(kubernetes, directory, &creds, &org, config, shutdown).await;
        info!(org, ?outcome, "reaper finished");
    });
}

/// One full reaper run; factored out of the spawn for tests
pub async fn run_reaper(
    kubernetes: Arc<dyn KubernetesApi>,
    directory: Arc<ClusterDirectory>,
    creds: &ClusterCredentials,
    org: &str,
    config: ReaperConfig,
    shutdown: CancellationToken,
) -> ReaperOutcome {
    if sleep_or_shutdown(config.grace, &shutdown).await {
        return ReaperOutcome::Shutdown;
    }

    loop {
        let services = match kubernetes.list_managed_services(creds).await {
            Ok(services) => services,
            Err(e) => {
                error!(org, error = %e, "reaper could not list services");
                return ReaperOutcome::Failed;
            }
        };
        let workloads = match kubernetes.list_managed_workloads(creds).await {
            Ok(workloads) => workloads,
            Err(e) => {
                error!(org, error = %e, "reaper could not list workloads");
                return ReaperOutcome::Failed;
            }
        };

        if !services.is_empty() || !workloads.is_empty() {
            warn!(org, "cluster still has instances, reaper stopping");
            return ReaperOutcome::NotEmpty;
        }

        if let Err(e) = kubernetes.delete_all_persistent_volume_claims(creds).await {
            error!(org, error = %e, "reaper could not delete persistent volume claims");
            return ReaperOutcome::Failed;
        }

        let volumes = match kubernetes.list_persistent_volumes(creds).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(org, error = %e, "reaper could not list persistent volumes");
                return ReaperOutcome::Failed;
            }
        };

        if volumes.is_empty() {
            info!(org, "cluster is empty, requesting deletion");
            if let Err(e) = directory.delete(org).await {
                error!(org, error = %e, "cluster deletion request failed");
                return ReaperOutcome::Failed;
            }
            return ReaperOutcome::ClusterDeleted;
        }

        warn!(org, volumes = volumes.len(), "persistent volumes still draining");
        if sleep_or_shutdown(config.pv_recheck, &shutdown).await {
            return ReaperOutcome::Shutdown;
        }
    }
}

/// Sleep for `duration`, returning true if shutdown fired first
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}
