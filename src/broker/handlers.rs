//! Route handlers and the instance state machine
//!
//! Provisioning drives one instance through the progress states
//! `IN_PROGRESS_STARTED` → `IN_PROGRESS_METADATA_OK` →
//! (`IN_PROGRESS_IN_BACKGROUND_JOB`) → `IN_PROGRESS_BLUEPRINT_OK` → per-kind
//! creation states → `IN_PROGRESS_KUBERNETES_OK`, with `FAILED` terminal at
//! any step. `last_operation` folds the current record, a 20-minute ceiling
//! and the instance health probe into the three externally visible states.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use k8s_openapi::api::core::v1::{EnvVar, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::catalog::blueprint::{JobKind, KubernetesBlueprint};
use crate::catalog::render::{render_component, RenderParams};
use crate::catalog::{DynamicService, PlanMetadata, ServiceMetadata};
use crate::creator::{ClusterCredentials, ClusterState};
use crate::credentials::render_credentials;
use crate::error::Error;
use crate::jobs::fire_hooks;
use crate::progress::ProgressRecord;
use crate::reaper::{spawn_reaper, ReaperConfig};
use crate::Result;

use super::{ApiError, BrokerContext};

/// Wall-clock ceiling on a single provisioning run
const PROVISIONING_CEILING: Duration = Duration::from_secs(20 * 60);

// =============================================================================
// Wire types
// =============================================================================

/// `PUT /v2/service_instances/{id}` body
#[derive(Clone, Debug, Deserialize)]
pub struct ProvisionRequest {
    /// Tenant organization
    pub organization_guid: String,
    /// Tenant space
    pub space_guid: String,
    /// Catalog service id
    pub service_id: String,
    /// Catalog plan id
    pub plan_id: String,
    /// Optional extra env var injected into every container
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Accepted for wire compatibility; visibility is toggled via its own route
    #[serde(default)]
    pub visibility: bool,
}

/// `PUT /v2/service_instances/{id}` response
#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    /// Placeholder; dashboards are not served by this broker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

/// `GET .../last_operation` response
#[derive(Debug, Serialize)]
pub struct LastOperationResponse {
    /// `in progress`, `succeeded` or `failed`
    pub state: String,
    /// Last recorded progress state, when known
    pub description: Option<String>,
}

/// Query parameters of `DELETE /v2/service_instances/{id}`
#[derive(Debug, Deserialize)]
pub struct DeprovisionQuery {
    /// Catalog service id (used to locate delete hooks)
    pub service_id: Option<String>,
    /// Catalog plan id
    pub plan_id: Option<String>,
    /// Tenant organization
    pub org_id: String,
    /// Tenant space
    #[serde(default)]
    pub space_id: Option<String>,
}

/// `PUT .../service_bindings/{binding_id}` body
#[derive(Debug, Deserialize)]
pub struct BindRequest {
    /// Catalog service id
    pub service_id: Option<String>,
    /// Catalog plan id
    pub plan_id: Option<String>,
    /// Tenant organization
    pub organization_guid: Option<String>,
    /// Tenant space
    pub space_guid: Option<String>,
    /// Consumer application (unused, wire compatibility)
    #[serde(default)]
    pub app_guid: Option<String>,
    /// Bind parameters (unused, wire compatibility)
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// `PUT`/`DELETE /v2/dynamicservice` body
#[derive(Debug, Deserialize)]
pub struct DynamicServiceRequest {
    /// Tenant organization (unused, wire compatibility)
    #[serde(default)]
    pub organization_guid: Option<String>,
    /// Tenant space (unused, wire compatibility)
    #[serde(default)]
    pub space_guid: Option<String>,
    /// Whether to re-register the broker with the platform (out of scope)
    #[serde(default, rename = "updateBroker")]
    pub update_broker: bool,
    /// The offering description
    #[serde(rename = "dynamicService")]
    pub dynamic_service: DynamicService,
}

/// `POST /rest/kubernetes/service/visibility` body
#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    /// Tenant organization
    pub organization_guid: String,
    /// Tenant space
    pub space_guid: String,
    /// Instance uuid
    pub service_id: String,
    /// Desired public flag
    pub visibility: bool,
}

/// Query parameters carrying the tenant org
#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    /// Tenant organization
    pub org_id: Option<String>,
}

// =============================================================================
// Probes and catalog
// =============================================================================

/// Liveness probe
pub async fn index() -> impl IntoResponse {
    Json(json!("I'm OK"))
}

/// `GET /v2/catalog`
pub async fn catalog(State(ctx): State<BrokerContext>) -> Result<impl IntoResponse, ApiError> {
    let catalog = ctx.catalog.read().expect("catalog lock poisoned").clone();
    Ok(Json(catalog))
}

/// `GET /v2/catalog/{service_id}`
pub async fn service_details(
    State(ctx): State<BrokerContext>,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service = {
        let catalog = ctx.catalog.read().expect("catalog lock poisoned");
        catalog.service_by_id(&service_id)?.clone()
    };
    Ok(Json(service))
}

// =============================================================================
// Provisioning
// =============================================================================

/// `PUT /v2/service_instances/{instance_id}`
pub async fn provision(
    State(ctx): State<BrokerContext>,
    Path(instance_id): Path<String>,
    Json(request): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.progress.record(&instance_id, "IN_PROGRESS_STARTED", None);

    let lookup = {
        let catalog = ctx.catalog.read().expect("catalog lock poisoned");
        catalog.service_and_plan(&request.service_id, &request.plan_id)
    };
    let (service, plan) = match lookup {
        Ok(found) => found,
        Err(e) => {
            ctx.progress
                .record(&instance_id, "FAILED", Some(e.to_string()));
            return Err(e.into());
        }
    };
    ctx.progress
        .record(&instance_id, "IN_PROGRESS_METADATA_OK", None);
    info!(
        instance_id,
        service = %service.name,
        plan = %plan.name,
        "provisioning instance"
    );

    let extra_param = parse_extra_param(request.parameters.as_ref()).map_err(|e| {
        ctx.progress
            .record(&instance_id, "FAILED", Some(e.to_string()));
        ApiError(e)
    })?;

    let response = ProvisionResponse {
        dashboard_url: Some("UrlNotYetSupported".to_string()),
    };

    if ctx.settings.accept_incomplete {
        let background_ctx = ctx.clone();
        let background_id = instance_id.clone();
        ctx.tracker.spawn(async move {
            background_ctx
                .progress
                .record(&background_id, "IN_PROGRESS_IN_BACKGROUND_JOB", None);
            if let Err(e) = provision_pipeline(
                &background_ctx,
                &background_id,
                &service,
                &plan,
                &request.organization_guid,
                &request.space_guid,
                extra_param,
            )
            .await
            {
                error!(instance_id = %background_id, error = %e, "background provisioning failed");
            }
        });
        return Ok((StatusCode::ACCEPTED, Json(response)));
    }

    provision_pipeline(
        &ctx,
        &instance_id,
        &service,
        &plan,
        &request.organization_guid,
        &request.space_guid,
        extra_param,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Render, obtain a cluster and apply; shared by sync and async modes
async fn provision_pipeline(
    ctx: &BrokerContext,
    instance_id: &str,
    service: &ServiceMetadata,
    plan: &PlanMetadata,
    org: &str,
    space: &str,
    extra_param: Option<EnvVar>,
) -> Result<()> {
    let result = async {
        let blueprint = lookup_blueprint(ctx, service, plan)?;
        let params = RenderParams {
            instance_id: instance_id.to_string(),
            org: org.to_string(),
            space: space.to_string(),
            catalog_service_id: service.id.clone(),
            catalog_plan_id: plan.id.clone(),
        };
        let component = render_component(&blueprint, &params)?;
        ctx.progress
            .record(instance_id, "IN_PROGRESS_BLUEPRINT_OK", None);

        let creds = ctx.directory.get_or_create(org).await?;

        ctx.kubernetes
            .fabricate(
                &creds,
                space,
                instance_id,
                extra_param,
                &ctx.progress,
                &component,
            )
            .await?;

        if let Err(e) = fire_hooks(
            &ctx.kubernetes,
            &ctx.jobs,
            &creds,
            &component.hooks,
            JobKind::OnCreate,
            instance_id,
            &ctx.progress,
        )
        .await
        {
            warn!(instance_id, error = %e, "create hooks failed");
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            ctx.progress
                .record(instance_id, "IN_PROGRESS_KUBERNETES_OK", None);
            Ok(())
        }
        Err(e) => {
            ctx.progress
                .record(instance_id, "FAILED", Some(format!("{e}")));
            Err(e)
        }
    }
}

/// Dynamic blueprints shadow the filesystem catalog
fn lookup_blueprint(
    ctx: &BrokerContext,
    service: &ServiceMetadata,
    plan: &PlanMetadata,
) -> Result<KubernetesBlueprint> {
    if let Some(blueprint) = ctx.dynamic.blueprint(&service.id) {
        return Ok(blueprint);
    }
    let root: PathBuf = {
        let catalog = ctx.catalog.read().expect("catalog lock poisoned");
        catalog.root().to_path_buf()
    };
    KubernetesBlueprint::load(root, &service.internal_id, &plan.internal_id)
}

/// The `parameters` document is a single env var injected into every
/// container of the instance
fn parse_extra_param(parameters: Option<&serde_json::Value>) -> Result<Option<EnvVar>> {
    match parameters {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => {
            let var: EnvVar = serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid_request(format!("bad extra parameters: {e}")))?;
            Ok(if var.name.is_empty() { None } else { Some(var) })
        }
    }
}

// =============================================================================
// Last operation
// =============================================================================

/// What `last_operation` should answer, before consulting the health probe
enum OperationState {
    Failed(String),
    InProgress,
    NeedsHealthCheck,
}

fn classify(record: &ProgressRecord, age: Duration, ceiling: Duration) -> OperationState {
    if record.state.starts_with("FAIL") || record.error.is_some() {
        return OperationState::Failed("instance provisioning failed".into());
    }
    if age > ceiling {
        return OperationState::Failed("instance provisioning took too long".into());
    }
    if record.state == "IN_PROGRESS_KUBERNETES_OK" {
        return OperationState::NeedsHealthCheck;
    }
    OperationState::InProgress
}

/// `GET /v2/service_instances/{instance_id}/last_operation`
pub async fn last_operation(
    State(ctx): State<BrokerContext>,
    Path(instance_id): Path<String>,
    Query(query): Query<OrgQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(record) = ctx.progress.read(&instance_id) else {
        // in-memory progress means a broker restart forgets instances; this
        // answer is only expected during initial platform deployment
        warn!(instance_id, "no progress data for instance");
        return Ok(Json(LastOperationResponse {
            state: "failed".into(),
            description: None,
        }));
    };

    let state = match classify(&record, record.at.elapsed(), PROVISIONING_CEILING) {
        OperationState::Failed(reason) => {
            error!(instance_id, reason, "last operation reports failure");
            "failed"
        }
        OperationState::InProgress => "in progress",
        OperationState::NeedsHealthCheck => match resolve_cluster(&ctx, query.org_id.as_deref()).await {
            Ok(creds) => match ctx.kubernetes.health_check(&creds, &instance_id).await {
                Ok(true) => "succeeded",
                Ok(false) | Err(_) => "in progress",
            },
            Err(_) => "in progress",
        },
    };

    info!(instance_id, state, "last operation");
    Ok(Json(LastOperationResponse {
        state: state.into(),
        description: Some(record.state),
    }))
}

async fn resolve_cluster(ctx: &BrokerContext, org: Option<&str>) -> Result<ClusterCredentials> {
    let org = org.ok_or_else(|| Error::invalid_request("org_id query parameter required"))?;
    match ctx.directory.get(org).await? {
        ClusterState::Ready(creds) => Ok(creds),
        _ => Err(Error::gone(format!("no cluster for org {org}"))),
    }
}

// =============================================================================
// Deprovisioning
// =============================================================================

/// `DELETE /v2/service_instances/{instance_id}`
pub async fn deprovision(
    State(ctx): State<BrokerContext>,
    Path(instance_id): Path<String>,
    Query(query): Query<DeprovisionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = match ctx.directory.get(&query.org_id).await {
        Ok(ClusterState::Ready(creds)) => creds,
        Ok(_) => {
            warn!(instance_id, org = %query.org_id, "cluster does not exist, nothing to delete");
            return Ok((StatusCode::GONE, Json(json!({}))));
        }
        Err(e) => return Err(e.into()),
    };

    fire_delete_hooks(&ctx, &creds, &query, &instance_id).await;

    ctx.kubernetes
        .delete_all_by_instance_id(&creds, &instance_id)
        .await?;

    spawn_reaper(
        &ctx.tracker,
        ctx.shutdown.clone(),
        ctx.kubernetes.clone(),
        ctx.directory.clone(),
        creds,
        query.org_id.clone(),
        ReaperConfig {
            grace: ctx.settings.reaper_grace(),
            pv_recheck: ctx.settings.pv_recheck_interval(),
        },
    );

    info!(instance_id, "instance deleted");
    Ok((StatusCode::OK, Json(json!({}))))
}

/// Fire `onDelete` hooks before resources disappear. Failures are logged;
/// deletion proceeds regardless.
async fn fire_delete_hooks(
    ctx: &BrokerContext,
    creds: &ClusterCredentials,
    query: &DeprovisionQuery,
    instance_id: &str,
) {
    let (Some(service_id), Some(plan_id)) = (&query.service_id, &query.plan_id) else {
        return;
    };
    let lookup = {
        let catalog = ctx.catalog.read().expect("catalog lock poisoned");
        catalog.service_and_plan(service_id, plan_id)
    };
    let Ok((service, plan)) = lookup else {
        warn!(instance_id, service_id = %service_id, "unknown offering, skipping delete hooks");
        return;
    };

    let component = lookup_blueprint(ctx, &service, &plan).and_then(|bp| {
        render_component(
            &bp,
            &RenderParams {
                instance_id: instance_id.to_string(),
                org: query.org_id.clone(),
                space: query.space_id.clone().unwrap_or_default(),
                catalog_service_id: service.id.clone(),
                catalog_plan_id: plan.id.clone(),
            },
        )
    });
    match component {
        Ok(component) => {
            if let Err(e) = fire_hooks(
                &ctx.kubernetes,
                &ctx.jobs,
                creds,
                &component.hooks,
                JobKind::OnDelete,
                instance_id,
                &ctx.progress,
            )
            .await
            {
                warn!(instance_id, error = %e, "delete hooks failed");
            }
        }
        Err(e) => warn!(instance_id, error = %e, "could not render delete hooks"),
    }
}

// =============================================================================
// Binding
// =============================================================================

/// `PUT /v2/service_instances/{instance_id}/service_bindings/{binding_id}`
pub async fn bind(
    State(ctx): State<BrokerContext>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(request): Json<BindRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(service_id), Some(plan_id)) = (&request.service_id, &request.plan_id) else {
        return Err(Error::invalid_request("service_id and plan_id are required").into());
    };
    let org = request
        .organization_guid
        .as_deref()
        .ok_or_else(|| Error::invalid_request("organization_guid is required"))?;

    let (service, plan) = {
        let catalog = ctx.catalog.read().expect("catalog lock poisoned");
        catalog.service_and_plan(service_id, plan_id)?
    };
    info!(instance_id, binding_id, service = %service.name, plan = %plan.name, "binding instance");

    let creds = match ctx.directory.get(org).await? {
        ClusterState::Ready(creds) => creds,
        _ => return Err(Error::upstream(format!("no cluster for org {org}")).into()),
    };

    let pod_envs = ctx.kubernetes.pod_envs(&creds, &instance_id).await?;
    let svc_creds = ctx
        .kubernetes
        .service_credentials(&creds, &instance_id)
        .await?;
    let blueprint = lookup_blueprint(&ctx, &service, &plan)?;

    let fragment = render_credentials(&service.name, &svc_creds, &pod_envs, &blueprint)?;
    let credentials: serde_json::Value = serde_json::from_str(&fragment)
        .map_err(|e| Error::template(format!("rendered credentials are not valid JSON: {e}")))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "credentials": credentials })),
    ))
}

/// `DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}`
///
/// Bindings hold no broker state, so there is nothing to release.
pub async fn unbind(
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> impl IntoResponse {
    info!(instance_id, binding_id, "unbind");
    (StatusCode::GONE, Json(json!({})))
}

// =============================================================================
// Dynamic services
// =============================================================================

/// `PUT /v2/dynamicservice`
pub async fn register_dynamic_service(
    State(ctx): State<BrokerContext>,
    Json(request): Json<DynamicServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = ctx.dynamic.register(&ctx.catalog, request.dynamic_service)?;
    Ok((StatusCode::CREATED, Json(service)))
}

/// `DELETE /v2/dynamicservice`
pub async fn unregister_dynamic_service(
    State(ctx): State<BrokerContext>,
    Json(request): Json<DynamicServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.dynamic
        .unregister(&ctx.catalog, &request.dynamic_service.service_name)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Pod status
// =============================================================================

/// `GET /v2/{org_id}/service/{instance_id}/status`
pub async fn pods_status(
    State(ctx): State<BrokerContext>,
    Path((org_id, instance_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    let statuses = ctx.kubernetes.pods_status(&creds, &instance_id).await?;
    Ok(Json(statuses))
}

/// `GET /v2/{org_id}/services/status`
pub async fn pods_status_all(
    State(ctx): State<BrokerContext>,
    Path(org_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    let statuses = ctx.kubernetes.pods_status_all(&creds).await?;
    Ok(Json(statuses))
}

// =============================================================================
// Platform routes (JWT realm)
// =============================================================================

/// `GET /rest/kubernetes/{org_id}/secret/{key}`
pub async fn get_secret(
    State(ctx): State<BrokerContext>,
    Path((org_id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    let secret = ctx.kubernetes.get_secret(&creds, &key).await?;
    Ok(Json(secret))
}

/// `POST /rest/kubernetes/{org_id}/secret/{key}`
pub async fn create_secret(
    State(ctx): State<BrokerContext>,
    Path((org_id, _key)): Path<(String, String)>,
    Json(secret): Json<Secret>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    ctx.kubernetes.create_secret(&creds, secret).await?;
    Ok(StatusCode::OK)
}

/// `PUT /rest/kubernetes/{org_id}/secret/{key}`
pub async fn update_secret(
    State(ctx): State<BrokerContext>,
    Path((org_id, _key)): Path<(String, String)>,
    Json(secret): Json<Secret>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    ctx.kubernetes.update_secret(&creds, secret).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /rest/kubernetes/{org_id}/secret/{key}`
pub async fn delete_secret(
    State(ctx): State<BrokerContext>,
    Path((org_id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    ctx.kubernetes.delete_secret(&creds, &key).await?;
    Ok(StatusCode::OK)
}

/// `GET /rest/kubernetes/{org_id}/{space_id}/service/{instance_id}`
pub async fn service_visibility(
    State(ctx): State<BrokerContext>,
    Path((org_id, space_id, instance_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&org_id)).await?;
    let infos = ctx
        .kubernetes
        .service_visibility(&creds, &org_id, &space_id, &instance_id)
        .await?;
    Ok(Json(infos))
}

/// `POST /rest/kubernetes/service/visibility`
pub async fn set_visibility(
    State(ctx): State<BrokerContext>,
    Json(request): Json<VisibilityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, Some(&request.organization_guid)).await?;
    let infos = ctx
        .kubernetes
        .set_public_visibility(
            &creds,
            &request.organization_guid,
            &request.space_guid,
            &request.service_id,
            request.visibility,
        )
        .await?;
    Ok(Json(infos))
}

/// `GET /rest/quota`
///
/// Answers with the used memory of the cluster's first resource quota, the
/// bare value with 202 Accepted.
pub async fn quota(
    State(ctx): State<BrokerContext>,
    Query(query): Query<OrgQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let creds = resolve_cluster(&ctx, query.org_id.as_deref()).await?;
    let quotas = ctx.kubernetes.resource_quotas(&creds).await?;

    let used_memory = quotas
        .first()
        .and_then(|q| q.status.as_ref())
        .and_then(|s| s.used.as_ref())
        .and_then(|used| used.get("memory"))
        .map(|q| q.0.clone());
    Ok((StatusCode::ACCEPTED, Json(json!(used_memory))))
}
