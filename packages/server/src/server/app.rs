//! Application state and router wiring.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::kernel::instance::InstanceManager;
use crate::kernel::jobs::{JobPublisher, JobStore};
use crate::kernel::runtime::RuntimeClient;
use crate::server::middleware::require_bearer;
use crate::server::routes::{
    cleanup_preview, create_instance, create_instance_stream, delete_instance, enqueue_instance,
    get_capacity, health_handler, instance_env, instance_logs, instance_status, job_events,
    list_instances, list_jobs, list_locations, list_versions, restart_instance, reset_instance,
    update_version,
};

/// Shared application state, injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runtime: Arc<RuntimeClient>,
    pub instances: Arc<InstanceManager>,
    pub store: Arc<dyn JobStore>,
    pub publisher: Arc<JobPublisher>,
    /// Plain HTTP client for registry tag lookups.
    pub http: reqwest::Client,
}

/// Build the Axum application router.
///
/// Every route except `/health` sits behind the bearer-token middleware.
pub fn build_app(state: AppState) -> Router {
    let token = state.config.api_auth_token.clone();

    let protected = Router::new()
        .route("/versions", get(list_versions))
        .route("/docker-versions", get(list_versions))
        .route("/locations", get(list_locations))
        .route("/server-locations", get(list_locations))
        .route("/instances", get(list_instances))
        .route("/capacity", get(get_capacity))
        .route("/cleanup-preview", get(cleanup_preview))
        .route("/jobs", get(list_jobs))
        .route("/enqueue-instance", post(enqueue_instance))
        .route("/job/:job_id/events", get(job_events))
        .route("/create-instance", post(create_instance))
        .route("/create-instance-stream", get(create_instance_stream))
        .route("/delete-instance/:name", delete(delete_instance))
        .route("/instance/:name/status", get(instance_status))
        .route("/instance/:name/restart", post(restart_instance))
        .route("/instance/:name/reset", post(reset_instance))
        .route("/instance/:name/update-version", post(update_version))
        .route("/instance/:name/env", get(instance_env))
        .route("/instance/:name/logs", get(instance_logs))
        .layer(middleware::from_fn(
            move |request: axum::extract::Request, next: middleware::Next| {
                require_bearer(token.clone(), request, next)
            },
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(Extension(state.clone()))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PUT])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    if config.allowed_origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}
