//! Blueprint and component data model
//!
//! A [`KubernetesBlueprint`] is the raw, still-parameterized form of a plan:
//! manifest strings read from the plan's `k8s/` directory plus the service's
//! credential-mapping and replica-template files. Rendering (placeholder
//! substitution + typed deserialization) turns it into a
//! [`KubernetesComponent`] ready to apply.

use std::fs;
use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PodSpec, ReplicationController, Secret, Service,
    ServiceAccount,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::Result;

/// Lifecycle event a hook job fires on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    /// After the instance's resources are applied
    OnCreate,
    /// Before the instance's resources are deleted
    OnDelete,
    /// When credentials are handed to a consumer
    OnBind,
    /// When a consumer releases its credentials
    OnUnbind,
}

/// A rendered lifecycle-hook job
#[derive(Clone, Debug)]
pub struct JobHook {
    /// Event the job fires on
    pub kind: JobKind,
    /// The job workload itself
    pub job: Job,
}

/// Wire shape of a `job*.json` catalog file
#[derive(Deserialize)]
struct JobManifest {
    #[serde(rename = "type")]
    kind: JobKind,
    job: serde_json::Value,
}

/// Raw manifest strings for one `(service, plan)` pair
#[derive(Clone, Debug, Default)]
pub struct KubernetesBlueprint {
    /// `secret*.json` manifests
    pub secrets: Vec<String>,
    /// `persistentvolumeclaim*.json` manifests
    pub persistent_volume_claims: Vec<String>,
    /// `deployment*.json` manifests
    pub deployments: Vec<String>,
    /// `replicationcontroller*.json` manifests (older catalogs)
    pub replication_controllers: Vec<String>,
    /// `service*.json` manifests
    pub services: Vec<String>,
    /// `account*.json` manifests
    pub service_accounts: Vec<String>,
    /// `(kind, job json)` pairs from `job*.json` manifests
    pub jobs: Vec<(JobKind, String)>,
    /// `credentials-mappings*.json` template
    pub credentials_mapping: Option<String>,
    /// `node_template*.json` per-replica template
    pub replica_template: Option<String>,
    /// `uri_cluster_template*.json`, loaded for catalog parity, unused
    pub uri_cluster_template: Option<String>,
}

impl KubernetesBlueprint {
    /// Read a plan's manifests from the catalog tree.
    ///
    /// The plan directory's `k8s/` holds resource manifests matched by
    /// well-known prefixes with suffix `.json`; the service directory holds
    /// the credential-mapping and replica-template files. More than one
    /// mapping or replica template is a catalog bug: it is logged and only
    /// the first is used.
    pub fn load(
        catalog_root: impl AsRef<Path>,
        service_internal_id: &str,
        plan_internal_id: &str,
    ) -> Result<Self> {
        let svc_path = catalog_root.as_ref().join(service_internal_id);
        let plan_path = svc_path.join(plan_internal_id).join("k8s");

        let mut blueprint = Self {
            secrets: read_prefixed(&plan_path, "secret")?,
            persistent_volume_claims: read_prefixed(&plan_path, "persistentvolumeclaim")?,
            deployments: read_prefixed(&plan_path, "deployment")?,
            replication_controllers: read_prefixed(&plan_path, "replicationcontroller")?,
            services: read_prefixed(&plan_path, "service")?,
            service_accounts: read_prefixed(&plan_path, "account")?,
            ..Self::default()
        };

        for raw in read_prefixed(&plan_path, "job")? {
            let manifest: JobManifest = serde_json::from_str(&raw)
                .map_err(|e| Error::template(format!("unparsable job manifest: {e}")))?;
            let job = serde_json::to_string(&manifest.job)?;
            blueprint.jobs.push((manifest.kind, job));
        }

        blueprint.credentials_mapping = read_single(&svc_path, "credentials-mappings")?;
        blueprint.replica_template = read_single(&svc_path, "node_template")?;
        blueprint.uri_cluster_template = read_single(&svc_path, "uri_cluster_template")?;

        Ok(blueprint)
    }

    /// Hook jobs of one kind
    pub fn jobs_of_kind(&self, kind: JobKind) -> impl Iterator<Item = &str> {
        self.jobs
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, j)| j.as_str())
    }
}

/// A pod-bearing workload manifest, old or new shape
///
/// Older catalogs ship `replicationcontroller` manifests, newer ones
/// `deployment`. Both render and apply the same way.
#[derive(Clone, Debug)]
pub enum Workload {
    /// apps/v1 Deployment
    Deployment(Deployment),
    /// core/v1 ReplicationController
    ReplicationController(ReplicationController),
}

impl Workload {
    /// Workload name from metadata
    pub fn name(&self) -> String {
        let meta = match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::ReplicationController(rc) => &rc.metadata,
        };
        meta.name.clone().unwrap_or_default()
    }

    /// Workload labels from metadata
    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        let meta = match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::ReplicationController(rc) => &rc.metadata,
        };
        meta.labels.clone().unwrap_or_default()
    }

    /// Shared access to the pod template's spec
    pub fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref()?.template.spec.as_ref(),
            Workload::ReplicationController(rc) => {
                rc.spec.as_ref()?.template.as_ref()?.spec.as_ref()
            }
        }
    }

    /// Mutable access to the pod template's spec
    pub fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_mut()?.template.spec.as_mut(),
            Workload::ReplicationController(rc) => {
                rc.spec.as_mut()?.template.as_mut()?.spec.as_mut()
            }
        }
    }

    /// Containers of the pod template, empty when the spec is missing
    pub fn containers(&self) -> &[Container] {
        self.pod_spec().map(|s| s.containers.as_slice()).unwrap_or(&[])
    }
}

/// The parsed, typed form of a blueprint, ready to apply
#[derive(Clone, Debug, Default)]
pub struct KubernetesComponent {
    /// Secrets, created first
    pub secrets: Vec<Secret>,
    /// Persistent-volume claims
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
    /// Deployments / replication controllers
    pub workloads: Vec<Workload>,
    /// Services
    pub services: Vec<Service>,
    /// Service accounts, created last
    pub service_accounts: Vec<ServiceAccount>,
    /// Lifecycle hooks, fired outside the main apply pipeline
    pub hooks: Vec<JobHook>,
}

impl KubernetesComponent {
    /// Number of resources the apply pipeline will create (hooks excluded)
    pub fn resource_count(&self) -> usize {
        self.secrets.len()
            + self.persistent_volume_claims.len()
            + self.workloads.len()
            + self.services.len()
            + self.service_accounts.len()
    }
}

fn read_prefixed(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::template(format!("cannot read {}: {e}", dir.display())))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::template(format!("cannot enumerate {}: {e}", dir.display())))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) && name.ends_with(".json") && entry.path().is_file() {
            names.push(name);
        }
    }
    names.sort();

    let mut contents = Vec::new();
    for name in names {
        let path = dir.join(&name);
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::template(format!("cannot read {}: {e}", path.display())))?;
        contents.push(content);
    }
    Ok(contents)
}

fn read_single(dir: &Path, prefix: &str) -> Result<Option<String>> {
    // Service-level files are optional; a missing directory means none.
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut found = read_prefixed(dir, prefix)?;
    if found.len() > 1 {
        warn!(
            prefix,
            dir = %dir.display(),
            "multiple files found, catalog structure problem, using the first"
        );
    }
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.remove(0))
    })
}
