//! Kubernetes applier
//!
//! Creates, inspects and deletes the resources that make up one service
//! instance on a tenant cluster. The label pair
//! `{managed_by = "broker", service_id = <uuid>}` is both the write key
//! (stamped into every rendered manifest) and the read key (used as the list
//! selector): resources without the pair are invisible to the broker.
//!
//! Creation order is a contract: secrets, persistent-volume claims,
//! workloads, services, service accounts. Later resources reference earlier
//! ones by name. There is no rollback on partial failure; the caller observes
//! `FAILED` and reclaims via delete.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    EnvVar, PersistentVolume, PersistentVolumeClaim, Pod, ReplicationController, ResourceQuota,
    Secret, Service, ServiceAccount, ServicePort,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::catalog::blueprint::{JobHook, JobKind, KubernetesComponent, Workload};
use crate::creator::ClusterCredentials;
use crate::error::Error;
use crate::progress::ProgressStore;
use crate::registry::{ServiceRegistry, VisibilityUpdate};
use crate::Result;

pub mod client;

/// Label carrying the owning system
pub const MANAGED_BY_LABEL: &str = "managed_by";
/// Value of [`MANAGED_BY_LABEL`] for broker-owned resources
pub const MANAGED_BY_VALUE: &str = "broker";
/// Label carrying the instance uuid
pub const SERVICE_ID_LABEL: &str = "service_id";
/// All instance resources live in the default namespace of the tenant cluster
pub const NAMESPACE: &str = "default";

/// Marker variable injected into every provisioned container
const PLATFORM_ENV: (&str, &str) = ("TAP_K8S", "true");

/// Selector matching all resources of one instance
pub fn instance_selector(instance_id: &str) -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{SERVICE_ID_LABEL}={instance_id}")
}

/// Selector matching every broker-owned resource on the cluster
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

/// Effective environment of the containers behind one workload
#[derive(Clone, Debug, Serialize)]
pub struct PodEnvs {
    /// Workload name
    pub workload_name: String,
    /// Per-container environment
    pub containers: Vec<ContainerEnvs>,
}

/// One container's resolved environment
#[derive(Clone, Debug, Serialize)]
pub struct ContainerEnvs {
    /// Container name
    pub name: String,
    /// Variable name to resolved value
    pub envs: HashMap<String, String>,
}

/// Connection coordinates of one instance service
#[derive(Clone, Debug)]
pub struct ServiceCredential {
    /// Kubernetes service name
    pub name: String,
    /// Internal registry host (`<name>[-<port>].service.consul`)
    pub host: String,
    /// All declared ports
    pub ports: Vec<ServicePort>,
}

/// Externally visible description of one instance service
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Instance uuid
    pub service_id: String,
    /// Tenant organization
    pub org: String,
    /// Tenant space
    pub space: String,
    /// Kubernetes service name
    pub name: String,
    /// Whether the registry entry carries the public tag
    pub tap_public: bool,
    /// External addresses, one per exposed port
    pub uri: Vec<String>,
}

/// Phase snapshot of one instance pod
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusInfo {
    /// Pod name
    pub pod_name: String,
    /// Instance uuid from the pod's labels
    pub service_id: String,
    /// Pod phase (`Pending`, `Running`, ...)
    pub status: String,
    /// Human-readable status message
    pub status_message: String,
}

/// Operations on one tenant cluster
///
/// Every call receives the cluster credentials; the implementation builds a
/// client per call, exactly as the broker holds credentials per request.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// Create all component resources in dependency order, reporting
    /// progress per kind and per item. `extra_param` is appended (after name
    /// normalization) to every container of every workload.
    async fn fabricate(
        &self,
        creds: &ClusterCredentials,
        space: &str,
        instance_id: &str,
        extra_param: Option<EnvVar>,
        progress: &ProgressStore,
        component: &KubernetesComponent,
    ) -> Result<()>;

    /// Delete everything carrying the instance's label pair
    async fn delete_all_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<()>;

    /// Services of one instance
    async fn list_services_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<Service>>;

    /// Every broker-managed service on the cluster
    async fn list_managed_services(&self, creds: &ClusterCredentials) -> Result<Vec<Service>>;

    /// Names of every broker-managed workload on the cluster
    async fn list_managed_workloads(&self, creds: &ClusterCredentials) -> Result<Vec<String>>;

    /// Effective container environments of one instance, secret-backed
    /// variables resolved
    async fn pod_envs(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<PodEnvs>>;

    /// Connection coordinates of the instance's services
    async fn service_credentials(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<ServiceCredential>>;

    /// Current visibility view of the instance's services, public flags read
    /// from the registry
    async fn service_visibility(
        &self,
        creds: &ClusterCredentials,
        org: &str,
        space: &str,
        instance_id: &str,
    ) -> Result<Vec<ServiceInfo>>;

    /// Toggle the public tag on the instance's registry entries (UDP ports
    /// excluded) and return the resulting view
    async fn set_public_visibility(
        &self,
        creds: &ClusterCredentials,
        org: &str,
        space: &str,
        instance_id: &str,
        public: bool,
    ) -> Result<Vec<ServiceInfo>>;

    /// Health probe backing `last_operation`.
    ///
    /// Returns true when the pod list call succeeds. Per-pod readiness is
    /// intentionally not evaluated; upstream deployment flows depend on this
    /// relaxation.
    async fn health_check(&self, creds: &ClusterCredentials, instance_id: &str) -> Result<bool>;

    /// Pod phases of one instance
    async fn pods_status(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<PodStatusInfo>>;

    /// Pod phases of every managed instance, keyed by instance uuid
    async fn pods_status_all(
        &self,
        creds: &ClusterCredentials,
    ) -> Result<HashMap<String, Vec<PodStatusInfo>>>;

    /// Delete every persistent-volume claim on the cluster (reaper)
    async fn delete_all_persistent_volume_claims(&self, creds: &ClusterCredentials) -> Result<()>;

    /// Names of all persistent volumes still present (reaper)
    async fn list_persistent_volumes(&self, creds: &ClusterCredentials) -> Result<Vec<String>>;

    /// Resource quotas of the cluster
    async fn resource_quotas(&self, creds: &ClusterCredentials) -> Result<Vec<ResourceQuota>>;

    /// Read one secret by name
    async fn get_secret(&self, creds: &ClusterCredentials, key: &str) -> Result<Secret>;

    /// Create a secret
    async fn create_secret(&self, creds: &ClusterCredentials, secret: Secret) -> Result<()>;

    /// Replace a secret
    async fn update_secret(&self, creds: &ClusterCredentials, secret: Secret) -> Result<()>;

    /// Delete one secret by name
    async fn delete_secret(&self, creds: &ClusterCredentials, key: &str) -> Result<()>;

    /// Create the hook jobs of `kind` and report them to the progress store
    async fn create_jobs(
        &self,
        creds: &ClusterCredentials,
        hooks: &[JobHook],
        kind: JobKind,
        instance_id: &str,
        progress: &ProgressStore,
    ) -> Result<Vec<Job>>;

    /// Jobs of one instance (hook completion poller)
    async fn list_jobs_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<Job>>;
}

/// kube-rs backed [`KubernetesApi`] implementation
pub struct Fabricator {
    registry: std::sync::Arc<dyn ServiceRegistry>,
    domain: String,
    insecure_skip_verify: bool,
}

impl Fabricator {
    /// Create a fabricator publishing visibility through `registry`
    pub fn new(
        registry: std::sync::Arc<dyn ServiceRegistry>,
        domain: impl Into<String>,
        insecure_skip_verify: bool,
    ) -> Self {
        Self {
            registry,
            domain: domain.into(),
            insecure_skip_verify,
        }
    }

    async fn client(&self, creds: &ClusterCredentials) -> Result<Client> {
        client::client_for(creds, self.insecure_skip_verify).await
    }
}

#[async_trait]
impl KubernetesApi for Fabricator {
    async fn fabricate(
        &self,
        creds: &ClusterCredentials,
        space: &str,
        instance_id: &str,
        extra_param: Option<EnvVar>,
        progress: &ProgressStore,
        component: &KubernetesComponent,
    ) -> Result<()> {
        let client = self.client(creds).await?;
        let extra_env = build_extra_env(space, extra_param);
        let pp = PostParams::default();

        progress.record(instance_id, "IN_PROGRESS_CREATING_SECRETS", None);
        let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE);
        for (idx, secret) in component.secrets.iter().enumerate() {
            progress.record(instance_id, &format!("IN_PROGRESS_CREATING_SECRET{idx}"), None);
            if let Err(e) = secrets.create(&pp, secret).await {
                progress.record(instance_id, "FAILED", Some(e.to_string()));
                return Err(e.into());
            }
        }

        progress.record(instance_id, "IN_PROGRESS_CREATING_PERSIST_VOL_CLAIMS", None);
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), NAMESPACE);
        for (idx, claim) in component.persistent_volume_claims.iter().enumerate() {
            progress.record(
                instance_id,
                &format!("IN_PROGRESS_CREATING_PERSIST_VOL_CLAIM{idx}"),
                None,
            );
            if let Err(e) = pvcs.create(&pp, claim).await {
                progress.record(instance_id, "FAILED", Some(e.to_string()));
                return Err(e.into());
            }
        }

        progress.record(instance_id, "IN_PROGRESS_CREATING_DEPLOYMENTS", None);
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);
        let rcs: Api<ReplicationController> = Api::namespaced(client.clone(), NAMESPACE);
        for (idx, workload) in component.workloads.iter().enumerate() {
            progress.record(
                instance_id,
                &format!("IN_PROGRESS_CREATING_DEPLOYMENT{idx}"),
                None,
            );
            let mut workload = workload.clone();
            append_env(&mut workload, &extra_env);

            let result = match &workload {
                Workload::Deployment(d) => deployments.create(&pp, d).await.map(|_| ()),
                Workload::ReplicationController(rc) => rcs.create(&pp, rc).await.map(|_| ()),
            };
            if let Err(e) = result {
                progress.record(instance_id, "FAILED", Some(e.to_string()));
                return Err(e.into());
            }
        }

        progress.record(instance_id, "IN_PROGRESS_CREATING_SVCS", None);
        let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
        for (idx, svc) in component.services.iter().enumerate() {
            progress.record(instance_id, &format!("IN_PROGRESS_CREATING_SVC{idx}"), None);
            if let Err(e) = services.create(&pp, svc).await {
                progress.record(instance_id, "FAILED", Some(e.to_string()));
                return Err(e.into());
            }
        }

        progress.record(instance_id, "IN_PROGRESS_CREATING_ACCS", None);
        let accounts: Api<ServiceAccount> = Api::namespaced(client, NAMESPACE);
        for (idx, account) in component.service_accounts.iter().enumerate() {
            progress.record(instance_id, &format!("IN_PROGRESS_CREATING_ACC{idx}"), None);
            if let Err(e) = accounts.create(&pp, account).await {
                progress.record(instance_id, "FAILED", Some(e.to_string()));
                return Err(e.into());
            }
        }

        info!(instance_id, resources = component.resource_count(), "instance fabricated");
        Ok(())
    }

    async fn delete_all_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<()> {
        let client = self.client(creds).await?;
        let lp = ListParams::default().labels(&instance_selector(instance_id));
        let dp = DeleteParams::default();

        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), NAMESPACE);
        for account in accounts.list(&lp).await?.items {
            let name = account.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "deleting service account");
            accounts.delete(&name, &dp).await?;
        }

        let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
        for svc in services.list(&lp).await?.items {
            let name = svc.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "deleting service");
            services.delete(&name, &dp).await?;
        }

        // workloads are scaled to zero first so pods drain before deletion
        let scale_to_zero = serde_json::json!({ "spec": { "replicas": 0 } });
        let patch = Patch::Merge(&scale_to_zero);
        let pp = PatchParams::default();

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);
        for dep in deployments.list(&lp).await?.items {
            let name = dep.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "scaling deployment to zero and deleting");
            deployments.patch(&name, &pp, &patch).await?;
            deployments.delete(&name, &dp).await?;
        }

        let rcs: Api<ReplicationController> = Api::namespaced(client.clone(), NAMESPACE);
        for rc in rcs.list(&lp).await?.items {
            let name = rc.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "scaling replication controller to zero and deleting");
            rcs.patch(&name, &pp, &patch).await?;
            rcs.delete(&name, &dp).await?;
        }

        let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE);
        for secret in secrets.list(&lp).await?.items {
            let name = secret.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "deleting secret");
            secrets.delete(&name, &dp).await?;
        }

        // the PVC pass alone tolerates partial failure: claims may already be
        // draining while their volumes detach
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client, NAMESPACE);
        let mut failed = false;
        for claim in pvcs.list(&lp).await?.items {
            let name = claim.metadata.name.unwrap_or_default();
            debug!(instance_id, name, "deleting persistent volume claim");
            if let Err(e) = pvcs.delete(&name, &dp).await {
                error!(instance_id, name, error = %e, "persistent volume claim deletion failed");
                failed = true;
            }
        }
        if failed {
            return Err(Error::upstream(format!(
                "some persistent volume claims of instance {instance_id} could not be deleted"
            )));
        }
        Ok(())
    }

    async fn list_services_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<Service>> {
        let client = self.client(creds).await?;
        let services: Api<Service> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&instance_selector(instance_id));
        Ok(services.list(&lp).await?.items)
    }

    async fn list_managed_services(&self, creds: &ClusterCredentials) -> Result<Vec<Service>> {
        let client = self.client(creds).await?;
        let services: Api<Service> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&managed_selector());
        Ok(services.list(&lp).await?.items)
    }

    async fn list_managed_workloads(&self, creds: &ClusterCredentials) -> Result<Vec<String>> {
        let client = self.client(creds).await?;
        let lp = ListParams::default().labels(&managed_selector());

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);
        let rcs: Api<ReplicationController> = Api::namespaced(client, NAMESPACE);

        let mut names = Vec::new();
        for dep in deployments.list(&lp).await?.items {
            names.push(dep.metadata.name.unwrap_or_default());
        }
        for rc in rcs.list(&lp).await?.items {
            names.push(rc.metadata.name.unwrap_or_default());
        }
        Ok(names)
    }

    async fn pod_envs(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<PodEnvs>> {
        let client = self.client(creds).await?;
        let lp = ListParams::default().labels(&instance_selector(instance_id));

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);
        let rcs: Api<ReplicationController> = Api::namespaced(client.clone(), NAMESPACE);

        let mut workloads: Vec<Workload> = Vec::new();
        workloads.extend(
            deployments
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::Deployment),
        );
        workloads.extend(
            rcs.list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::ReplicationController),
        );
        if workloads.is_empty() {
            return Err(Error::not_found(format!(
                "no workloads associated with the instance: {instance_id}"
            )));
        }

        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        let instance_secrets = secrets.list(&lp).await?.items;

        Ok(workloads
            .iter()
            .map(|w| resolve_workload_envs(w, &instance_secrets))
            .collect())
    }

    async fn service_credentials(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<ServiceCredential>> {
        let services = self.list_services_by_instance_id(creds, instance_id).await?;
        if services.is_empty() {
            return Err(Error::not_found(format!(
                "no services associated with the instance: {instance_id}"
            )));
        }
        Ok(services.iter().map(service_credential).collect())
    }

    async fn service_visibility(
        &self,
        creds: &ClusterCredentials,
        org: &str,
        space: &str,
        instance_id: &str,
    ) -> Result<Vec<ServiceInfo>> {
        let services = self.list_services_by_instance_id(creds, instance_id).await?;
        let public_status = self
            .registry
            .public_status(&creds.consul_endpoint)
            .await?;

        Ok(services
            .iter()
            .map(|svc| {
                let name = svc.metadata.name.clone().unwrap_or_default();
                let public = public_status
                    .iter()
                    .any(|(registered, public)| *public && registered.contains(&name));
                let (_, uris) = visibility_updates(svc, public, &self.domain);
                ServiceInfo {
                    service_id: instance_id.to_string(),
                    org: org.to_string(),
                    space: space.to_string(),
                    name,
                    tap_public: public,
                    uri: uris,
                }
            })
            .collect())
    }

    async fn set_public_visibility(
        &self,
        creds: &ClusterCredentials,
        org: &str,
        space: &str,
        instance_id: &str,
        public: bool,
    ) -> Result<Vec<ServiceInfo>> {
        let services = self.list_services_by_instance_id(creds, instance_id).await?;
        let mut infos = Vec::new();

        for svc in &services {
            let (updates, uris) = visibility_updates(svc, public, &self.domain);
            self.registry
                .update_visibility(&creds.consul_endpoint, &updates)
                .await?;

            infos.push(ServiceInfo {
                service_id: instance_id.to_string(),
                org: org.to_string(),
                space: space.to_string(),
                name: svc.metadata.name.clone().unwrap_or_default(),
                tap_public: public,
                uri: uris,
            });
        }
        Ok(infos)
    }

    async fn health_check(&self, creds: &ClusterCredentials, instance_id: &str) -> Result<bool> {
        let client = self.client(creds).await?;
        let pods: Api<Pod> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&instance_selector(instance_id));

        let pod_list = pods.list(&lp).await.map_err(|e| {
            warn!(instance_id, error = %e, "pod listing failed during health check");
            Error::from(e)
        })?;
        debug!(instance_id, pods = pod_list.items.len(), "health check listed pods");

        // a successful list counts as healthy; see trait docs
        Ok(true)
    }

    async fn pods_status(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<PodStatusInfo>> {
        let client = self.client(creds).await?;
        let pods: Api<Pod> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&instance_selector(instance_id));

        Ok(pods
            .list(&lp)
            .await?
            .items
            .iter()
            .map(|p| pod_status_info(p, instance_id))
            .collect())
    }

    async fn pods_status_all(
        &self,
        creds: &ClusterCredentials,
    ) -> Result<HashMap<String, Vec<PodStatusInfo>>> {
        let client = self.client(creds).await?;
        let pods: Api<Pod> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&managed_selector());

        let mut result: HashMap<String, Vec<PodStatusInfo>> = HashMap::new();
        for pod in pods.list(&lp).await?.items {
            let service_id = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(SERVICE_ID_LABEL))
                .cloned()
                .unwrap_or_default();
            if service_id.is_empty() {
                continue;
            }
            let info = pod_status_info(&pod, &service_id);
            result.entry(service_id).or_default().push(info);
        }
        Ok(result)
    }

    async fn delete_all_persistent_volume_claims(&self, creds: &ClusterCredentials) -> Result<()> {
        let client = self.client(creds).await?;
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client, NAMESPACE);
        let dp = DeleteParams::default();

        let mut failed = false;
        for claim in pvcs.list(&ListParams::default()).await?.items {
            let name = claim.metadata.name.unwrap_or_default();
            if let Err(e) = pvcs.delete(&name, &dp).await {
                error!(name, error = %e, "persistent volume claim deletion failed");
                failed = true;
            }
        }
        if failed {
            return Err(Error::upstream("error deleting persistent volume claims"));
        }
        Ok(())
    }

    async fn list_persistent_volumes(&self, creds: &ClusterCredentials) -> Result<Vec<String>> {
        let client = self.client(creds).await?;
        let pvs: Api<PersistentVolume> = Api::all(client);
        Ok(pvs
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .map(|pv| pv.metadata.name.unwrap_or_default())
            .collect())
    }

    async fn resource_quotas(&self, creds: &ClusterCredentials) -> Result<Vec<ResourceQuota>> {
        let client = self.client(creds).await?;
        let quotas: Api<ResourceQuota> = Api::namespaced(client, NAMESPACE);
        Ok(quotas.list(&ListParams::default()).await?.items)
    }

    async fn get_secret(&self, creds: &ClusterCredentials, key: &str) -> Result<Secret> {
        let client = self.client(creds).await?;
        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        Ok(secrets.get(key).await?)
    }

    async fn create_secret(&self, creds: &ClusterCredentials, secret: Secret) -> Result<()> {
        let client = self.client(creds).await?;
        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        secrets.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn update_secret(&self, creds: &ClusterCredentials, secret: Secret) -> Result<()> {
        let client = self.client(creds).await?;
        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid_request("secret has no name"))?;
        secrets
            .replace(&name, &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, creds: &ClusterCredentials, key: &str) -> Result<()> {
        let client = self.client(creds).await?;
        let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
        secrets.delete(key, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_jobs(
        &self,
        creds: &ClusterCredentials,
        hooks: &[JobHook],
        kind: JobKind,
        instance_id: &str,
        progress: &ProgressStore,
    ) -> Result<Vec<Job>> {
        let client = self.client(creds).await?;
        let jobs: Api<Job> = Api::namespaced(client, NAMESPACE);
        let pp = PostParams::default();

        let mut created = Vec::new();
        for hook in hooks.iter().filter(|h| h.kind == kind) {
            let name = hook.job.metadata.name.clone().unwrap_or_default();
            progress.record(instance_id, &format!("JOB_{name}_CREATING"), None);
            match jobs.create(&pp, &hook.job).await {
                Ok(job) => created.push(job),
                Err(e) => {
                    progress.record(
                        instance_id,
                        &format!("JOB_{name}_FAILED"),
                        Some(e.to_string()),
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(created)
    }

    async fn list_jobs_by_instance_id(
        &self,
        creds: &ClusterCredentials,
        instance_id: &str,
    ) -> Result<Vec<Job>> {
        let client = self.client(creds).await?;
        let jobs: Api<Job> = Api::namespaced(client, NAMESPACE);
        let lp = ListParams::default().labels(&instance_selector(instance_id));
        Ok(jobs.list(&lp).await?.items)
    }
}

/// The env vars appended to every provisioned container: the platform marker
/// plus the caller's extra parameter with a normalized name
pub fn build_extra_env(space: &str, extra_param: Option<EnvVar>) -> Vec<EnvVar> {
    let mut env = vec![EnvVar {
        name: PLATFORM_ENV.0.to_string(),
        value: Some(PLATFORM_ENV.1.to_string()),
        value_from: None,
    }];

    if let Some(mut param) = extra_param {
        if !param.name.is_empty() {
            param.name = normalize_env_name(&param.name, space);
            env.push(param);
        }
    }
    env
}

/// Kubernetes env names must be C identifiers. The space guid suffix scopes
/// the name to its tenant, then `_` doubles (the suffix separator included)
/// and `-` maps to `_`.
fn normalize_env_name(name: &str, space: &str) -> String {
    let with_space = format!("{name}_{space}");
    with_space.replace('_', "__").replace('-', "_")
}

/// Append `extras` to every container of the workload's pod template
pub fn append_env(workload: &mut Workload, extras: &[EnvVar]) {
    if let Some(pod_spec) = workload.pod_spec_mut() {
        for container in &mut pod_spec.containers {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend(extras.iter().cloned());
        }
    }
}

/// Secret data key a secret-backed env var resolves through
fn secret_key_for_env(env_name: &str) -> String {
    env_name.to_lowercase().replace('_', "-")
}

fn find_secret_value(secrets: &[Secret], key: &str) -> String {
    for secret in secrets {
        if let Some(data) = &secret.data {
            if let Some(value) = data.get(key) {
                return String::from_utf8_lossy(&value.0).into_owned();
            }
        }
    }
    debug!(key, "secret key not found");
    String::new()
}

/// Effective env of every container in a workload, empty values resolved
/// through the instance's secrets
fn resolve_workload_envs(workload: &Workload, secrets: &[Secret]) -> PodEnvs {
    let containers = workload
        .containers()
        .iter()
        .map(|container| {
            let mut envs = HashMap::new();
            for env in container.env.as_deref().unwrap_or(&[]) {
                let value = match env.value.as_deref() {
                    Some(v) if !v.is_empty() => v.to_string(),
                    _ => find_secret_value(secrets, &secret_key_for_env(&env.name)),
                };
                envs.insert(env.name.clone(), value);
            }
            ContainerEnvs {
                name: container.name.clone(),
                envs,
            }
        })
        .collect();

    PodEnvs {
        workload_name: workload.name(),
        containers,
    }
}

/// Registry name of one service port: `<svc>[-<port-name>]`
pub fn registry_service_name(service: &Service, port: &ServicePort) -> String {
    let base = service.metadata.name.clone().unwrap_or_default();
    match port.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{base}-{name}"),
        _ => base,
    }
}

/// Internal host of a service as the registry resolves it
pub fn internal_host(service: &Service, port: &ServicePort) -> String {
    format!("{}.service.consul", registry_service_name(service, port))
}

/// External address of one exposed port
pub fn external_address(domain: &str, port: &ServicePort) -> String {
    let protocol = port.protocol.as_deref().unwrap_or("TCP").to_lowercase();
    format!("{protocol}.{domain}:{}", port.node_port.unwrap_or_default())
}

/// Connection coordinates derived from a service's first TCP port
fn service_credential(service: &Service) -> ServiceCredential {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    let host = ports
        .iter()
        .find(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
        .map(|p| internal_host(service, p))
        .unwrap_or_default();

    ServiceCredential {
        name: service.metadata.name.clone().unwrap_or_default(),
        host,
        ports,
    }
}

/// Registry updates and external URIs for one service; UDP ports are left
/// untouched
fn visibility_updates(
    service: &Service,
    public: bool,
    domain: &str,
) -> (Vec<VisibilityUpdate>, Vec<String>) {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();

    let mut updates = Vec::new();
    let mut uris = Vec::new();
    for port in ports {
        if port.protocol.as_deref() == Some("UDP") {
            continue;
        }
        updates.push(VisibilityUpdate {
            name: registry_service_name(service, port),
            port: port.node_port.unwrap_or_default(),
            public,
        });
        uris.push(external_address(domain, port));
    }
    (updates, uris)
}

fn pod_status_info(pod: &Pod, service_id: &str) -> PodStatusInfo {
    let status = pod.status.as_ref();
    PodStatusInfo {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        service_id: service_id.to_string(),
        status: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        status_message: status.and_then(|s| s.message.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn env(name: &str, value: Option<&str>) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
            value_from: None,
        }
    }

    fn service_with_ports(name: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn port(name: Option<&str>, protocol: &str, node_port: i32) -> ServicePort {
        ServicePort {
            name: name.map(|n| n.to_string()),
            protocol: Some(protocol.to_string()),
            node_port: Some(node_port),
            port: 5432,
            ..ServicePort::default()
        }
    }

    #[test]
    fn selectors_carry_both_labels() {
        assert_eq!(
            instance_selector("abc-def"),
            "managed_by=broker,service_id=abc-def"
        );
        assert_eq!(managed_selector(), "managed_by=broker");
    }

    #[test]
    fn extra_env_always_carries_platform_marker() {
        let env = build_extra_env("space-guid", None);
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "TAP_K8S");
        assert_eq!(env[0].value.as_deref(), Some("true"));
    }

    #[test]
    fn extra_param_name_is_normalized() {
        let extra = env("db-url_main", Some("postgres://x"));
        let built = build_extra_env("spaceguid", Some(extra));
        assert_eq!(built.len(), 2);
        // suffix first, then `_` doubles (separator included) and `-` maps to `_`
        assert_eq!(built[1].name, "db_url__main__spaceguid");
        assert_eq!(built[1].value.as_deref(), Some("postgres://x"));

        // a dashed space guid ends up underscore-mapped as well
        let built = build_extra_env("sp-guid", Some(env("key", Some("v"))));
        assert_eq!(built[1].name, "key__sp_guid");
    }

    #[test]
    fn extra_param_with_empty_name_is_dropped() {
        let built = build_extra_env("space", Some(env("", Some("v"))));
        assert_eq!(built.len(), 1);
    }

    #[test]
    fn append_env_reaches_every_container() {
        let dep: Deployment = serde_json::from_str(
            r#"{"apiVersion":"apps/v1","kind":"Deployment","metadata":{"name":"d"},
                "spec":{"selector":{},"template":{"spec":{"containers":[
                    {"name":"one","env":[{"name":"EXISTING","value":"1"}]},
                    {"name":"two"}
                ]}}}}"#,
        )
        .unwrap();
        let mut workload = Workload::Deployment(dep);

        append_env(&mut workload, &build_extra_env("sp", None));

        for container in workload.containers() {
            let names: Vec<_> = container
                .env
                .as_deref()
                .unwrap()
                .iter()
                .map(|e| e.name.as_str())
                .collect();
            assert!(names.contains(&"TAP_K8S"), "missing marker in {names:?}");
        }
        // pre-existing vars survive
        assert_eq!(workload.containers()[0].env.as_deref().unwrap()[0].name, "EXISTING");
    }

    #[test]
    fn secret_key_mapping_lowercases_and_dashes() {
        assert_eq!(secret_key_for_env("POSTGRES_PASSWORD"), "postgres-password");
        assert_eq!(secret_key_for_env("user"), "user");
    }

    #[test]
    fn empty_env_values_resolve_through_secrets() {
        let mut data = BTreeMap::new();
        data.insert(
            "postgres-password".to_string(),
            ByteString(b"hunter2".to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Secret::default()
        };

        let dep: Deployment = serde_json::from_str(
            r#"{"apiVersion":"apps/v1","kind":"Deployment","metadata":{"name":"pg"},
                "spec":{"selector":{},"template":{"spec":{"containers":[
                    {"name":"main","env":[
                        {"name":"POSTGRES_PASSWORD","value":""},
                        {"name":"POSTGRES_USER","value":"admin"},
                        {"name":"MISSING_KEY"}
                    ]}
                ]}}}}"#,
        )
        .unwrap();

        let envs = resolve_workload_envs(&Workload::Deployment(dep), &[secret]);
        assert_eq!(envs.workload_name, "pg");
        let c = &envs.containers[0];
        assert_eq!(c.envs["POSTGRES_PASSWORD"], "hunter2");
        assert_eq!(c.envs["POSTGRES_USER"], "admin");
        assert_eq!(c.envs["MISSING_KEY"], "");
    }

    #[test]
    fn registry_name_includes_port_name_when_present() {
        let svc = service_with_ports("xabc", vec![]);
        assert_eq!(
            registry_service_name(&svc, &port(Some("pg"), "TCP", 31000)),
            "xabc-pg"
        );
        assert_eq!(registry_service_name(&svc, &port(None, "TCP", 31000)), "xabc");
        assert_eq!(
            internal_host(&svc, &port(None, "TCP", 31000)),
            "xabc.service.consul"
        );
    }

    #[test]
    fn external_address_lowercases_protocol() {
        assert_eq!(
            external_address("example.com", &port(None, "TCP", 31432)),
            "tcp.example.com:31432"
        );
    }

    #[test]
    fn service_credential_uses_first_tcp_port_for_host() {
        let svc = service_with_ports(
            "xabc",
            vec![port(Some("metrics"), "UDP", 31001), port(None, "TCP", 31002)],
        );
        let cred = service_credential(&svc);
        assert_eq!(cred.name, "xabc");
        assert_eq!(cred.host, "xabc.service.consul");
        assert_eq!(cred.ports.len(), 2);
    }

    #[test]
    fn visibility_skips_udp_ports() {
        let svc = service_with_ports(
            "xabc",
            vec![
                port(Some("dns"), "UDP", 31053),
                port(Some("api"), "TCP", 31080),
            ],
        );
        let (updates, uris) = visibility_updates(&svc, true, "example.com");

        assert_eq!(updates.len(), 1, "UDP port must be left untouched");
        assert_eq!(
            updates[0],
            VisibilityUpdate {
                name: "xabc-api".into(),
                port: 31080,
                public: true,
            }
        );
        assert_eq!(uris, vec!["tcp.example.com:31080".to_string()]);
    }

    #[test]
    fn pod_status_defaults_when_phase_missing() {
        let pod = Pod::default();
        let info = pod_status_info(&pod, "abc");
        assert_eq!(info.status, "Unknown");
        assert_eq!(info.service_id, "abc");
        assert_eq!(info.status_message, "");
    }
}
