use std::collections::BTreeMap;

use axum::extract::Extension;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    checks: BTreeMap<String, String>,
    timestamp: f64,
}

/// Health check endpoint — the only public route.
///
/// `status` is `ok` only when the API, Redis and the container daemon all
/// answer; any failing dependency degrades it without failing the request.
pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    let mut checks = BTreeMap::new();
    checks.insert("api".to_string(), "ok".to_string());
    checks.insert(
        "redis".to_string(),
        match state.store.ping().await {
            Ok(()) => "ok".to_string(),
            Err(_) => "error".to_string(),
        },
    );
    checks.insert(
        "docker".to_string(),
        match state.runtime.ping().await {
            Ok(()) => "ok".to_string(),
            Err(_) => "error".to_string(),
        },
    );

    let status = if checks.values().all(|v| v == "ok") {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        checks,
        timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
    })
}
