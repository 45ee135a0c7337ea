//! Filesystem service catalog
//!
//! The catalog is a directory tree: `<root>/<service-dir>/service.json`
//! describes an offering, each `<service-dir>/<plan-dir>/plan.json` one of
//! its plans, and `<plan-dir>/k8s/` the raw manifests the plan provisions.
//! Directory names double as internal ids and locate manifests later on.
//!
//! Loading happens once at startup and is fatal on error; the dynamic
//! registry appends to the loaded snapshot at runtime.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::Result;

pub mod blueprint;
pub mod dynamic;
pub mod render;

pub use blueprint::{JobHook, JobKind, KubernetesBlueprint, KubernetesComponent, Workload};
pub use dynamic::{DynamicRegistry, DynamicService};

/// Catalog-visible description of one service offering
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Catalog-visible identifier, unique within the catalog
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Whether instances hand out credentials
    #[serde(default)]
    pub bindable: bool,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Plans, in filesystem enumeration order
    #[serde(default)]
    pub plans: Vec<PlanMetadata>,
    /// Directory name under the catalog root
    #[serde(skip)]
    pub internal_id: String,
}

/// One plan of a service offering
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Identifier, unique within its service
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Free-tier flag
    #[serde(default)]
    pub free: bool,
    /// Directory name under the service directory
    #[serde(skip)]
    pub internal_id: String,
}

/// Wire shape of the `GET /catalog` response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicesCatalog {
    /// All known offerings
    pub services: Vec<ServiceMetadata>,
    /// Catalog root the services were loaded from
    #[serde(skip)]
    root: PathBuf,
}

impl ServicesCatalog {
    /// Walk `root` and parse every `service.json` / `plan.json` pair.
    ///
    /// Callers treat errors as fatal: without its catalog the broker cannot
    /// serve any offering.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut services = Vec::new();

        for svc_entry in list_dir(root)? {
            if !svc_entry.is_dir() {
                continue;
            }
            let service = load_service_dir(&svc_entry)?;
            debug!(service = %service.name, plans = service.plans.len(), "catalog entry loaded");
            services.push(service);
        }

        Ok(Self {
            services,
            root: root.to_path_buf(),
        })
    }

    /// Catalog root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Offering by catalog-visible id
    pub fn service_by_id(&self, service_id: &str) -> Result<&ServiceMetadata> {
        self.services
            .iter()
            .find(|s| s.id == service_id)
            .ok_or_else(|| Error::not_found(format!("no such service by id: {service_id}")))
    }

    /// Offering by human name
    pub fn service_by_name(&self, name: &str) -> Result<&ServiceMetadata> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("no such service by name: {name}")))
    }

    /// True iff an offering with this name is already present
    pub fn exists_by_name(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
    }

    /// Resolve `(service, plan)` for a provisioning request
    pub fn service_and_plan(
        &self,
        service_id: &str,
        plan_id: &str,
    ) -> Result<(ServiceMetadata, PlanMetadata)> {
        let service = self.service_by_id(service_id)?;
        let plan = service
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| Error::not_found(format!("no such plan by id: {plan_id}")))?;
        Ok((service.clone(), plan.clone()))
    }

    /// Append an offering (dynamic registration)
    pub fn push(&mut self, service: ServiceMetadata) {
        self.services.push(service);
    }

    /// Remove an offering by name, returning it
    pub fn remove_by_name(&mut self, name: &str) -> Result<ServiceMetadata> {
        let idx = self
            .services
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("no such service by name: {name}")))?;
        Ok(self.services.remove(idx))
    }
}

fn load_service_dir(dir: &Path) -> Result<ServiceMetadata> {
    let mut service: ServiceMetadata = read_json(&dir.join("service.json"))?;
    service.internal_id = dir_name(dir);

    let mut plans = Vec::new();
    for plan_entry in list_dir(dir)? {
        if !plan_entry.is_dir() {
            continue;
        }
        let plan_file = plan_entry.join("plan.json");
        if !plan_file.is_file() {
            debug!(dir = %plan_entry.display(), "skipping directory without plan.json");
            continue;
        }
        let mut plan: PlanMetadata = read_json(&plan_file)?;
        plan.internal_id = dir_name(&plan_entry);
        plans.push(plan);
    }
    service.plans = plans;
    Ok(service)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::config(format!("cannot read catalog dir {}: {e}", dir.display())))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::config(format!("cannot enumerate {}: {e}", dir.display())))?;
        paths.push(entry.path());
    }
    Ok(paths)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::fs;
    use std::path::Path;

    /// Lay down a minimal catalog: one service with one plan whose `k8s/`
    /// dir holds the given `(file name, content)` pairs.
    pub fn write_catalog(
        root: &Path,
        service_json: &str,
        plan_json: &str,
        k8s_files: &[(&str, &str)],
        service_files: &[(&str, &str)],
    ) {
        let svc_dir = root.join("svcdir");
        let plan_dir = svc_dir.join("plandir");
        let k8s_dir = plan_dir.join("k8s");
        fs::create_dir_all(&k8s_dir).unwrap();

        fs::write(svc_dir.join("service.json"), service_json).unwrap();
        fs::write(plan_dir.join("plan.json"), plan_json).unwrap();
        for (name, content) in k8s_files {
            fs::write(k8s_dir.join(name), content).unwrap();
        }
        for (name, content) in service_files {
            fs::write(svc_dir.join(name), content).unwrap();
        }
    }

    pub const SERVICE_JSON: &str = r#"{
        "id": "S1",
        "name": "postgres",
        "description": "relational database",
        "bindable": true,
        "tags": ["database", "sql"]
    }"#;

    pub const PLAN_JSON: &str = r#"{
        "id": "P1",
        "name": "simple",
        "description": "single node",
        "free": true
    }"#;
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{write_catalog, PLAN_JSON, SERVICE_JSON};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_populates_metadata_and_internal_ids() {
        let tmp = TempDir::new().unwrap();
        write_catalog(tmp.path(), SERVICE_JSON, PLAN_JSON, &[], &[]);

        let catalog = ServicesCatalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.services.len(), 1);

        let svc = &catalog.services[0];
        assert_eq!(svc.id, "S1");
        assert_eq!(svc.name, "postgres");
        assert!(svc.bindable);
        assert_eq!(svc.internal_id, "svcdir");
        assert_eq!(svc.plans.len(), 1);
        assert_eq!(svc.plans[0].id, "P1");
        assert_eq!(svc.plans[0].internal_id, "plandir");
        assert!(svc.plans[0].free);
    }

    #[test]
    fn lookups_resolve_service_and_plan() {
        let tmp = TempDir::new().unwrap();
        write_catalog(tmp.path(), SERVICE_JSON, PLAN_JSON, &[], &[]);
        let catalog = ServicesCatalog::load(tmp.path()).unwrap();

        let (svc, plan) = catalog.service_and_plan("S1", "P1").unwrap();
        assert_eq!(svc.name, "postgres");
        assert_eq!(plan.name, "simple");

        assert!(matches!(
            catalog.service_and_plan("S1", "P2"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            catalog.service_and_plan("S9", "P1"),
            Err(Error::NotFound(_))
        ));
        assert!(catalog.exists_by_name("postgres"));
        assert!(!catalog.exists_by_name("redis"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            ServicesCatalog::load(&missing),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn malformed_service_json_is_an_error() {
        let tmp = TempDir::new().unwrap();
        write_catalog(tmp.path(), "{ not json", PLAN_JSON, &[], &[]);
        assert!(matches!(
            ServicesCatalog::load(tmp.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn plain_files_at_root_are_ignored() {
        let tmp = TempDir::new().unwrap();
        write_catalog(tmp.path(), SERVICE_JSON, PLAN_JSON, &[], &[]);
        std::fs::write(tmp.path().join("README.md"), "notes").unwrap();

        let catalog = ServicesCatalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.services.len(), 1);
    }

    #[test]
    fn remove_by_name_drops_the_offering() {
        let tmp = TempDir::new().unwrap();
        write_catalog(tmp.path(), SERVICE_JSON, PLAN_JSON, &[], &[]);
        let mut catalog = ServicesCatalog::load(tmp.path()).unwrap();

        let removed = catalog.remove_by_name("postgres").unwrap();
        assert_eq!(removed.id, "S1");
        assert!(catalog.services.is_empty());
        assert!(matches!(
            catalog.remove_by_name("postgres"),
            Err(Error::NotFound(_))
        ));
    }
}
