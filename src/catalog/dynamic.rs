//! Runtime catalog extension
//!
//! Users can register a service offering at runtime from a container + port
//! description; the broker synthesizes a blueprint from a fixed reference
//! template and appends the offering to the live catalog. Registrations are
//! held in memory only and vanish on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service, ServicePort};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::Error;
use crate::Result;

use super::blueprint::KubernetesBlueprint;
use super::{PlanMetadata, ServiceMetadata, ServicesCatalog};

const TEMPLATE_DEPLOYMENT: &str = include_str!("../../templates/dynamic/deployment.json");
const TEMPLATE_SERVICE: &str = include_str!("../../templates/dynamic/service.json");
const TEMPLATE_ACCOUNT: &str = include_str!("../../templates/dynamic/account.json");

/// User-supplied description of a runtime-registered offering
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicService {
    /// Offering name, unique within the live catalog
    pub service_name: String,
    /// Name of the single plan
    pub plan_name: String,
    /// Free-tier flag of the plan
    #[serde(default)]
    pub is_plan_free: bool,
    /// Containers grafted onto the reference deployment
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Ports replacing the reference service's ports
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,
    /// Credential-mapping document returned on bind
    #[serde(default)]
    pub credential_mappings: serde_json::Value,
}

/// Blueprints of runtime-registered offerings, keyed by service id
///
/// Blueprint lookups consult this map before the filesystem catalog.
#[derive(Default)]
pub struct DynamicRegistry {
    blueprints: RwLock<HashMap<String, KubernetesBlueprint>>,
}

impl DynamicRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Blueprint for a dynamic service id, if registered
    pub fn blueprint(&self, service_id: &str) -> Option<KubernetesBlueprint> {
        let blueprints = self.blueprints.read().expect("dynamic lock poisoned");
        blueprints.get(service_id).cloned()
    }

    /// Synthesize a blueprint for `request` and append the offering to the
    /// live catalog.
    ///
    /// Registration and unregistration serialize on the catalog write lock;
    /// lookups proceed in parallel under read locks.
    pub fn register(
        &self,
        catalog: &RwLock<ServicesCatalog>,
        request: DynamicService,
    ) -> Result<ServiceMetadata> {
        let mut catalog = catalog.write().expect("catalog lock poisoned");
        if catalog.exists_by_name(&request.service_name) {
            return Err(Error::conflict(format!(
                "service with name {} already exists",
                request.service_name
            )));
        }

        let plan = PlanMetadata {
            id: Uuid::new_v4().to_string(),
            name: request.plan_name.clone(),
            description: request.plan_name.clone(),
            free: request.is_plan_free,
            internal_id: format!("dynamic{}", request.plan_name),
        };
        let service = ServiceMetadata {
            id: Uuid::new_v4().to_string(),
            name: request.service_name.clone(),
            description: request.service_name.clone(),
            bindable: true,
            tags: vec![request.service_name.clone()],
            plans: vec![plan],
            internal_id: format!("dynamic{}", request.service_name),
        };

        let blueprint = synthesize_blueprint(&request)?;

        catalog.push(service.clone());
        let mut blueprints = self.blueprints.write().expect("dynamic lock poisoned");
        blueprints.insert(service.id.clone(), blueprint);

        info!(service = %service.name, id = %service.id, "dynamic service registered");
        Ok(service)
    }

    /// Remove an offering registered through [`register`](Self::register)
    pub fn unregister(&self, catalog: &RwLock<ServicesCatalog>, name: &str) -> Result<()> {
        let mut catalog = catalog.write().expect("catalog lock poisoned");
        let service = catalog.remove_by_name(name)?;

        let mut blueprints = self.blueprints.write().expect("dynamic lock poisoned");
        blueprints.remove(&service.id);

        info!(service = %name, "dynamic service unregistered");
        Ok(())
    }
}

/// Build a blueprint from the reference template and the user's specs
fn synthesize_blueprint(request: &DynamicService) -> Result<KubernetesBlueprint> {
    let mut deployment: Deployment = serde_json::from_str(TEMPLATE_DEPLOYMENT)?;
    let mut service: Service = serde_json::from_str(TEMPLATE_SERVICE)?;

    let pod_spec = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| Error::template("reference deployment template has no pod spec"))?;

    let reference = pod_spec
        .containers
        .first()
        .cloned()
        .ok_or_else(|| Error::template("reference deployment template has no container"))?;

    pod_spec.containers = request
        .containers
        .iter()
        .map(|user| {
            let mut container = reference.clone();
            container.name = user.name.clone();
            container.image = user.image.clone();
            container.ports = user.ports.clone();
            if let Some(user_env) = &user.env {
                container
                    .env
                    .get_or_insert_with(Vec::new)
                    .extend(user_env.iter().cloned());
            }
            container
        })
        .collect();

    if let Some(spec) = service.spec.as_mut() {
        spec.ports = Some(request.service_ports.clone());
    }

    Ok(KubernetesBlueprint {
        deployments: vec![serde_json::to_string(&deployment)?],
        services: vec![serde_json::to_string(&service)?],
        service_accounts: vec![TEMPLATE_ACCOUNT.to_string()],
        credentials_mapping: Some(serde_json::to_string(&request.credential_mappings)?),
        ..KubernetesBlueprint::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::render::{render_component, RenderParams};
    use serde_json::json;

    fn catalog() -> RwLock<ServicesCatalog> {
        RwLock::new(ServicesCatalog::default())
    }

    fn request(name: &str) -> DynamicService {
        serde_json::from_value(json!({
            "serviceName": name,
            "planName": "free",
            "isPlanFree": true,
            "containers": [
                {"name": "redis", "image": "redis:7", "ports": [{"containerPort": 6379}],
                 "env": [{"name": "REDIS_PASS", "value": "$random0"}]}
            ],
            "servicePorts": [{"port": 6379, "protocol": "TCP", "targetPort": 6379}],
            "credentialMappings": {"host": "$hostname", "port": "$port_6379"}
        }))
        .unwrap()
    }

    #[test]
    fn register_appends_offering_and_blueprint() {
        let catalog = catalog();
        let registry = DynamicRegistry::new();

        let service = registry.register(&catalog, request("redis")).unwrap();
        assert_eq!(service.name, "redis");
        assert_eq!(service.plans.len(), 1);
        assert!(service.plans[0].free);
        assert!(service.bindable);

        let snapshot = catalog.read().unwrap();
        assert!(snapshot.exists_by_name("redis"));
        assert!(registry.blueprint(&service.id).is_some());
    }

    #[test]
    fn register_rejects_name_collision() {
        let catalog = catalog();
        let registry = DynamicRegistry::new();

        registry.register(&catalog, request("redis")).unwrap();
        let err = registry.register(&catalog, request("redis")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn unregister_removes_both_entries() {
        let catalog = catalog();
        let registry = DynamicRegistry::new();

        let service = registry.register(&catalog, request("redis")).unwrap();
        registry.unregister(&catalog, "redis").unwrap();

        assert!(!catalog.read().unwrap().exists_by_name("redis"));
        assert!(registry.blueprint(&service.id).is_none());

        assert!(matches!(
            registry.unregister(&catalog, "redis"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn synthesized_blueprint_grafts_user_containers() {
        let blueprint = synthesize_blueprint(&request("redis")).unwrap();

        let deployment: Deployment = serde_json::from_str(&blueprint.deployments[0]).unwrap();
        let containers = &deployment.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "redis");
        assert_eq!(containers[0].image.as_deref(), Some("redis:7"));

        // template env survives, user env is appended
        let env = containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "MANAGED_BY"));
        assert!(env.iter().any(|e| e.name == "REDIS_PASS"));

        let service: Service = serde_json::from_str(&blueprint.services[0]).unwrap();
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 6379);

        assert!(blueprint
            .credentials_mapping
            .as_deref()
            .unwrap()
            .contains("$hostname"));
    }

    #[test]
    fn synthesized_blueprint_renders_like_any_other() {
        let blueprint = synthesize_blueprint(&request("redis")).unwrap();
        let component = render_component(
            &blueprint,
            &RenderParams {
                instance_id: "aaaabbbb-cccc-dddd-eeee-ffff00001111".into(),
                org: "o1".into(),
                space: "sp1".into(),
                catalog_service_id: "S-dyn".into(),
                catalog_plan_id: "P-dyn".into(),
            },
        )
        .unwrap();

        assert_eq!(component.resource_count(), 3);
        let labels = component.services[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("managed_by").unwrap(), "broker");
        assert_eq!(
            labels.get("service_id").unwrap(),
            "aaaabbbb-cccc-dddd-eeee-ffff00001111"
        );
    }
}
