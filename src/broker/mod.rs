//! Broker HTTP API
//!
//! The axum application: shared state, the router with its two auth realms
//! (`/v2` behind basic auth for the service-broker protocol, `/rest` behind
//! JWT bearer auth for platform operations) and the error-to-status mapping.

use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Json, Router};
use jsonwebtoken::DecodingKey;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::applier::KubernetesApi;
use crate::catalog::{DynamicRegistry, ServicesCatalog};
use crate::config::BrokerSettings;
use crate::creator::ClusterDirectory;
use crate::error::Error;
use crate::jobs::JobPoller;
use crate::progress::ProgressStore;

pub mod auth;
pub mod handlers;

/// Shared state for every handler
#[derive(Clone)]
pub struct BrokerContext {
    /// Broker configuration
    pub settings: Arc<BrokerSettings>,
    /// Live catalog (filesystem snapshot plus dynamic registrations)
    pub catalog: Arc<RwLock<ServicesCatalog>>,
    /// Dynamic-service blueprints
    pub dynamic: Arc<DynamicRegistry>,
    /// Per-instance progress log
    pub progress: Arc<ProgressStore>,
    /// Tenant cluster directory
    pub directory: Arc<ClusterDirectory>,
    /// Kubernetes applier
    pub kubernetes: Arc<dyn KubernetesApi>,
    /// Hook-job completion poller
    pub jobs: Arc<JobPoller>,
    /// Tracker for background work (async provisions, reapers, poller)
    pub tracker: TaskTracker,
    /// Process shutdown signal
    pub shutdown: CancellationToken,
    /// JWT verification key, when configured
    pub jwt_key: Option<DecodingKey>,
}

/// Error wrapper carrying the HTTP mapping
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Gone(_) => StatusCode::GONE,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the full broker router
pub fn broker_router(ctx: BrokerContext) -> Router {
    let basic_routes = Router::new()
        .route("/catalog", get(handlers::catalog))
        .route("/catalog/{service_id}", get(handlers::service_details))
        .route("/service_instances/{instance_id}", put(handlers::provision))
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(handlers::last_operation),
        )
        .route(
            "/service_instances/{instance_id}",
            delete(handlers::deprovision),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(handlers::bind),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            delete(handlers::unbind),
        )
        .route("/dynamicservice", put(handlers::register_dynamic_service))
        .route(
            "/dynamicservice",
            delete(handlers::unregister_dynamic_service),
        )
        .route(
            "/{org_id}/service/{instance_id}/status",
            get(handlers::pods_status),
        )
        .route("/{org_id}/services/status", get(handlers::pods_status_all))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::basic_auth));

    let jwt_routes = Router::new()
        .route(
            "/kubernetes/{org_id}/secret/{key}",
            get(handlers::get_secret)
                .post(handlers::create_secret)
                .put(handlers::update_secret)
                .delete(handlers::delete_secret),
        )
        .route(
            "/kubernetes/{org_id}/{space_id}/service/{instance_id}",
            get(handlers::service_visibility),
        )
        .route(
            "/kubernetes/service/visibility",
            post(handlers::set_visibility),
        )
        .route("/quota", get(handlers::quota))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::jwt_auth));

    Router::new()
        .route("/", get(handlers::index))
        .nest("/v2", basic_routes)
        .nest("/rest", jwt_routes)
        .with_state(ctx)
}
