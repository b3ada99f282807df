//! Instance CRUD and operations: synchronous create, delete, status, restart,
//! reset, version rollover, env view and logs.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::instance::{
    generate_encryption_key, instance_url, validate_instance_name, validate_version,
};
use crate::kernel::RuntimeError;
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub name: String,
    pub version: Option<String>,
}

/// Synchronous create — no queue, no readiness probe. The caller gets the
/// container back as soon as it has started.
pub async fn create_instance(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = validate_instance_name(&request.name)?;
    let version = validate_version(
        request
            .version
            .as_deref()
            .unwrap_or(&state.config.default_version),
    )?;

    let capacity = state.instances.capacity().await?;
    if !capacity.can_create {
        return Err(ApiError::conflict(format!(
            "VPS sem recursos. {}/{} instâncias ativas.",
            capacity.active_instances, capacity.max_instances
        )));
    }

    if state.instances.exists(&name).await? {
        return Err(ApiError::bad_request(format!(
            "Instância '{name}' já existe"
        )));
    }

    let encryption_key = generate_encryption_key();
    state
        .instances
        .create(&name, &version, &encryption_key, None)
        .await?;

    Ok(Json(json!({
        "instance_id": name,
        "url": instance_url(&state.config, &name),
        "status": "running",
        "location": "vinhedo",
        "container_status": "running",
    })))
}

pub async fn delete_instance(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.instances.remove(&name).await {
        Ok(()) => Ok(Json(json!({
            "message": "Instância excluída com sucesso",
            "instance_id": name,
        }))),
        Err(RuntimeError::NotFound) => Err(ApiError::not_found(format!(
            "Instância '{name}' não encontrada"
        ))),
        Err(err) => Err(err.into()),
    }
}

pub async fn instance_status(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.instances.status(&name).await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

pub async fn restart_instance(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.instances.restart(&name).await?;
    Ok(Json(json!({
        "message": "Instância reiniciada",
        "instance_id": name,
    })))
}

#[derive(Deserialize)]
pub struct VersionRequest {
    pub version: Option<String>,
}

/// Destroy and recreate with a fresh encryption key. Prior data is gone.
pub async fn reset_instance(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Json(request): Json<VersionRequest>,
) -> Result<Json<Value>, ApiError> {
    let version = validate_version(request.version.as_deref().unwrap_or("latest"))?;
    state.instances.reset(&name, &version).await?;
    Ok(Json(json!({
        "message": "Instância resetada",
        "instance_id": name,
        "url": instance_url(&state.config, &name),
    })))
}

/// Version rollover preserving encryption key, data volume and created_at.
pub async fn update_version(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Json(request): Json<VersionRequest>,
) -> Result<Json<Value>, ApiError> {
    let version = validate_version(request.version.as_deref().unwrap_or("latest"))?;
    state.instances.rebuild(&name, &version).await?;
    Ok(Json(json!({
        "message": format!("Versão atualizada para {version}"),
        "instance_id": name,
    })))
}

/// Read-only view of the container's current environment.
pub async fn instance_env(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let env = state.instances.env(&name).await?;
    Ok(Json(json!({ "instance_id": name, "env": env })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    50
}

pub async fn instance_logs(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let logs = state.instances.logs(&name, query.tail).await?;
    Ok(Json(json!({ "instance_id": name, "logs": logs })))
}
