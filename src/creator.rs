//! Tenant cluster directory
//!
//! Every organization gets its own Kubernetes cluster, provisioned on demand
//! by an external cluster-creator service. This module wraps the creator's
//! REST API and implements the get-or-create polling loop the provisioning
//! pipeline relies on. The broker never owns cluster lifetime: it holds a
//! credentials snapshot for the duration of one request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::Result;

/// Credentials snapshot for one tenant cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredentials {
    /// Cluster name (the creator keys clusters by org)
    #[serde(default)]
    pub cluster_name: String,
    /// API server URL
    pub api_server_url: String,
    /// Basic-auth username
    #[serde(default)]
    pub username: String,
    /// Basic-auth password
    #[serde(default)]
    pub password: String,
    /// Client certificate PEM
    #[serde(default)]
    pub admin_cert: Option<String>,
    /// Client key PEM
    #[serde(default)]
    pub admin_key: Option<String>,
    /// Cluster CA PEM
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Consul-compatible service registry endpoint
    #[serde(default)]
    pub consul_endpoint: String,
}

/// Creator-side state of an org's cluster
#[derive(Clone, Debug)]
pub enum ClusterState {
    /// Cluster exists and credentials are available
    Ready(ClusterCredentials),
    /// Creation is underway
    Pending,
    /// No cluster for this org
    Missing,
}

/// Raw REST operations against the cluster-creator service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterCreator: Send + Sync {
    /// `GET /clusters/{org}`
    async fn get(&self, org: &str) -> Result<ClusterState>;

    /// `PUT /clusters/{org}` - request creation, does not wait
    async fn create(&self, org: &str) -> Result<()>;

    /// `DELETE /clusters/{org}` - request teardown, does not wait
    async fn delete(&self, org: &str) -> Result<()>;

    /// `GET /clusters` - every cluster the creator holds
    async fn list(&self) -> Result<Vec<ClusterCredentials>>;

    /// `GET {api_server_url}/api/v1` liveness probe, true on any 2xx
    async fn probe_api(&self, creds: &ClusterCredentials) -> bool;
}

/// The get-or-create policy on top of a [`ClusterCreator`]
pub struct ClusterDirectory {
    creator: std::sync::Arc<dyn ClusterCreator>,
    org_quota: usize,
    poll_interval: Duration,
}

impl ClusterDirectory {
    /// Default interval between creator polls
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

    /// Create a directory enforcing `org_quota` clusters at most
    pub fn new(creator: std::sync::Arc<dyn ClusterCreator>, org_quota: usize) -> Self {
        Self {
            creator,
            org_quota,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval (tests)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current creator-side state, no side effects
    pub async fn get(&self, org: &str) -> Result<ClusterState> {
        self.creator.get(org).await
    }

    /// Fire-and-forget cluster teardown
    pub async fn delete(&self, org: &str) -> Result<()> {
        self.creator.delete(org).await
    }

    /// Obtain credentials for `org`, creating the cluster if needed.
    ///
    /// Polls the creator until the cluster is `Ready` and its API answers the
    /// probe. A create is issued at most once: observing `Missing` again
    /// after a create is fatal. Before creating, the cluster count is checked
    /// against the org quota.
    pub async fn get_or_create(&self, org: &str) -> Result<ClusterCredentials> {
        let mut created = false;
        loop {
            match self.creator.get(org).await? {
                ClusterState::Ready(creds) => {
                    if self.creator.probe_api(&creds).await {
                        info!(org, "cluster ready");
                        return Ok(creds);
                    }
                    warn!(org, "cluster reported ready but API probe failed, retrying");
                }
                ClusterState::Missing if !created => {
                    let clusters = self.creator.list().await?;
                    if clusters.len() > self.org_quota {
                        return Err(Error::QuotaExceeded(self.org_quota));
                    }
                    info!(org, "creating cluster");
                    self.creator.create(org).await?;
                    created = true;
                }
                ClusterState::Missing => {
                    error!(org, "cluster vanished after create request");
                    return Err(Error::upstream(format!(
                        "cluster for org {org} did not appear after create"
                    )));
                }
                ClusterState::Pending => {
                    info!(org, "waiting for cluster creation to finish");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// REST client for the cluster-creator service
pub struct CreatorClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl CreatorClient {
    /// Build a client against `base_url` with basic auth
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(|e| Error::config(format!("cannot build creator http client: {e}")))?;
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            http,
        })
    }

    fn cluster_url(&self, org: &str) -> String {
        format!("{}/clusters/{org}", self.base_url)
    }
}

#[async_trait]
impl ClusterCreator for CreatorClient {
    async fn get(&self, org: &str) -> Result<ClusterState> {
        let response = self
            .http
            .get(self.cluster_url(org))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let creds: ClusterCredentials = response.json().await?;
                Ok(ClusterState::Ready(creds))
            }
            StatusCode::NOT_FOUND => Ok(ClusterState::Missing),
            StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(ClusterState::Pending),
            status => Err(Error::upstream(format!(
                "creator GET {org} returned {status}"
            ))),
        }
    }

    async fn create(&self, org: &str) -> Result<()> {
        let response = self
            .http
            .put(self.cluster_url(org))
            .basic_auth(&self.username, Some(&self.password))
            .body("")
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(Error::upstream(format!(
                "unexpected cluster conflict for org {org}"
            )));
        }
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "creator PUT {org} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, org: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.cluster_url(org))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "creator DELETE {org} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClusterCredentials>> {
        let response = self
            .http
            .get(format!("{}/clusters", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "creator GET /clusters returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn probe_api(&self, creds: &ClusterCredentials) -> bool {
        let url = format!("{}/api/v1", creds.api_server_url.trim_end_matches('/'));
        let request = self
            .http
            .get(&url)
            .basic_auth(&creds.username, Some(&creds.password));

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(url, error = %e, "cluster API probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Arc;

    fn creds() -> ClusterCredentials {
        ClusterCredentials {
            cluster_name: "org-1".into(),
            api_server_url: "https://10.0.0.1:6443".into(),
            username: "admin".into(),
            password: "pw".into(),
            ..ClusterCredentials::default()
        }
    }

    fn directory(mock: MockClusterCreator) -> ClusterDirectory {
        ClusterDirectory::new(Arc::new(mock), 2).with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn ready_cluster_with_healthy_api_returns_immediately() {
        let mut mock = MockClusterCreator::new();
        mock.expect_get()
            .with(eq("org-1"))
            .times(1)
            .returning(|_| Ok(ClusterState::Ready(creds())));
        mock.expect_probe_api().times(1).returning(|_| true);

        let got = directory(mock).get_or_create("org-1").await.unwrap();
        assert_eq!(got.cluster_name, "org-1");
    }

    #[tokio::test]
    async fn missing_cluster_is_created_once_then_polled() {
        let mut mock = MockClusterCreator::new();
        let mut seq = mockall::Sequence::new();

        mock.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ClusterState::Missing));
        mock.expect_list().times(1).returning(|| Ok(vec![]));
        mock.expect_create()
            .with(eq("org-1"))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ClusterState::Pending));
        mock.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ClusterState::Ready(creds())));
        mock.expect_probe_api().returning(|_| true);

        let got = directory(mock).get_or_create("org-1").await.unwrap();
        assert_eq!(got.api_server_url, "https://10.0.0.1:6443");
    }

    #[tokio::test]
    async fn missing_after_create_is_fatal() {
        let mut mock = MockClusterCreator::new();
        mock.expect_get().returning(|_| Ok(ClusterState::Missing));
        mock.expect_list().returning(|| Ok(vec![]));
        mock.expect_create().times(1).returning(|_| Ok(()));

        let err = directory(mock).get_or_create("org-1").await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(err.to_string().contains("did not appear"));
    }

    #[tokio::test]
    async fn quota_blocks_creation() {
        let mut mock = MockClusterCreator::new();
        mock.expect_get().returning(|_| Ok(ClusterState::Missing));
        mock.expect_list()
            .returning(|| Ok(vec![creds(), creds(), creds()]));
        mock.expect_create().times(0);

        let err = directory(mock).get_or_create("org-1").await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(2)));
    }

    #[tokio::test]
    async fn unhealthy_api_keeps_polling() {
        let mut mock = MockClusterCreator::new();
        let probes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let probes_in_mock = probes.clone();

        mock.expect_get().returning(|_| Ok(ClusterState::Ready(creds())));
        mock.expect_probe_api().returning(move |_| {
            // first probe fails, second succeeds
            probes_in_mock.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1
        });

        directory(mock).get_or_create("org-1").await.unwrap();
        assert_eq!(probes.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_errors_propagate() {
        let mut mock = MockClusterCreator::new();
        mock.expect_get()
            .returning(|_| Err(Error::upstream("creator down")));

        let err = directory(mock).get_or_create("org-1").await.unwrap_err();
        assert!(err.to_string().contains("creator down"));
    }
}
