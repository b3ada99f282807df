//! Read-only informational endpoints: versions, locations, instance listing,
//! capacity and the eviction preview.

use axum::extract::Extension;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::kernel::cleanup::is_expired;
use crate::kernel::instance::InstanceView;
use crate::kernel::registry::fetch_engine_versions;
use crate::server::app::AppState;
use crate::server::error::ApiError;

pub async fn list_versions(Extension(state): Extension<AppState>) -> Json<Value> {
    let versions = fetch_engine_versions(&state.http).await;
    Json(json!({ "versions": versions }))
}

pub async fn list_locations() -> Json<Value> {
    Json(json!({
        "locations": [
            { "id": "vinhedo", "name": "Vinhedo, São Paulo - Brasil", "active": true }
        ]
    }))
}

pub async fn list_instances(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let instances = state.instances.list().await?;
    Ok(Json(json!({ "instances": instances })))
}

pub async fn get_capacity(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.instances.capacity().await?;
    Ok(Json(serde_json::to_value(snapshot).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

#[derive(Serialize)]
struct CleanupPreviewEntry {
    #[serde(flatten)]
    instance: InstanceView,
    will_be_deleted: bool,
    days_remaining: Option<i64>,
}

/// What the next sweeps will remove, and how long each instance has left.
pub async fn cleanup_preview(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let max_age = state.config.cleanup_max_age_days;
    let entries: Vec<CleanupPreviewEntry> = state
        .instances
        .list()
        .await?
        .into_iter()
        .map(|instance| CleanupPreviewEntry {
            will_be_deleted: is_expired(instance.age_days, max_age),
            days_remaining: instance.age_days.map(|age| (max_age - age).max(0)),
            instance,
        })
        .collect();
    Ok(Json(json!({ "instances": entries })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_math_matches_the_sweeper() {
        let max_age = 5;
        for (age, deleted, remaining) in [
            (Some(0), false, Some(5)),
            (Some(4), false, Some(1)),
            (Some(5), true, Some(0)),
            (Some(9), true, Some(0)),
            (None, false, None),
        ] {
            assert_eq!(is_expired(age, max_age), deleted);
            assert_eq!(age.map(|a| (max_age - a).max(0)), remaining);
        }
    }
}
