//! Instance lifecycle operations against the container daemon.
//!
//! There is no instance registry: every operation queries the daemon by the
//! deterministic container name or the managed label set, so listing,
//! capacity and age always reflect reality.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, ENGINE_IMAGE};
use crate::kernel::runtime::{ContainerBrief, ContainerSpec, RuntimeClient, RuntimeError};

use super::spec::{
    build_env, build_labels, container_name, drift_keys, env_from_list, env_to_list,
    extract_encryption_key, generate_encryption_key, instance_url, parse_mem_string, volume_name,
    ENGINE_DATA_DIR,
};

/// RAM set aside for the proxy, broker, KV store and the OS itself.
pub const RESERVED_RAM_MB: i64 = 768;
/// Hard budget per engine instance.
pub const PER_INSTANCE_RAM_MB: i64 = 384;

pub const MANAGED_LABEL: &str = "app.type=engine";

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub name: String,
    pub status: String,
    pub url: String,
    pub location: String,
    pub version: String,
    pub container_id: String,
    pub created_at: Option<String>,
    pub age_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VpsInfo {
    pub total_ram_mb: i64,
    pub total_cpus: i64,
    pub reserved_ram_mb: i64,
    pub per_instance_ram_mb: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacitySnapshot {
    pub max_instances: i64,
    pub active_instances: i64,
    pub can_create: bool,
    pub instances: Vec<InstanceView>,
    pub vps: VpsInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryView {
    pub usage_mb: f64,
    pub limit_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatusView {
    pub instance_id: String,
    pub status: String,
    pub url: String,
    pub location: String,
    pub version: String,
    pub uptime: String,
    pub memory: MemoryView,
}

/// Capacity is RAM-bound only: CPU shares are relative weights, so CPU never
/// gates admission.
pub fn compute_max_instances(total_ram_mb: i64) -> i64 {
    ((total_ram_mb - RESERVED_RAM_MB) / PER_INSTANCE_RAM_MB).max(1)
}

/// Build the API view of one managed container, preferring the
/// `app.created_at` label over the daemon's own creation time.
pub fn view_from_brief(config: &Config, brief: &ContainerBrief, now: DateTime<Utc>) -> InstanceView {
    let name = brief
        .labels
        .get("app.instance")
        .cloned()
        .unwrap_or_default();

    let created_at = brief
        .labels
        .get("app.created_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            brief
                .created_unix
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        });

    InstanceView {
        instance_id: name.clone(),
        url: instance_url(config, &name),
        name,
        status: brief.state.clone(),
        location: "vinhedo".to_string(),
        version: image_tag(&brief.image),
        container_id: brief.id.chars().take(12).collect(),
        created_at: created_at.map(|dt| dt.to_rfc3339()),
        age_days: created_at.map(|dt| (now - dt).num_days()),
    }
}

fn image_tag(image: &str) -> String {
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => tag.to_string(),
        _ => "unknown".to_string(),
    }
}

pub struct InstanceManager {
    runtime: Arc<RuntimeClient>,
    config: Arc<Config>,
}

impl InstanceManager {
    pub fn new(runtime: Arc<RuntimeClient>, config: Arc<Config>) -> Self {
        Self { runtime, config }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.runtime.inspect(&container_name(name)).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Pull the engine image and start a fresh container for the instance.
    ///
    /// `created_at` is only passed by `rebuild`, which preserves the original
    /// stamp; first creation stamps now.
    pub async fn create(
        &self,
        name: &str,
        version: &str,
        encryption_key: &str,
        created_at: Option<String>,
    ) -> Result<(), RuntimeError> {
        self.runtime.pull(ENGINE_IMAGE, version).await?;

        let created_at = created_at.unwrap_or_else(|| Utc::now().to_rfc3339());
        let env = build_env(&self.config, name, encryption_key);
        let labels = build_labels(&self.config, name, &created_at);

        let mem_limit = parse_mem_string(&self.config.instance_mem_limit)
            .map_err(|e| RuntimeError::Fatal(e.to_string()))?;
        let mem_reservation = parse_mem_string(&self.config.instance_mem_reservation)
            .map_err(|e| RuntimeError::Fatal(e.to_string()))?;

        let spec = ContainerSpec {
            name: container_name(name),
            image: format!("{ENGINE_IMAGE}:{version}"),
            env: env_to_list(&env),
            labels: labels.into_iter().collect(),
            binds: vec![format!("{}:{}", volume_name(name), ENGINE_DATA_DIR)],
            network: Some(self.config.docker_network.clone()),
            mem_limit: Some(mem_limit),
            mem_reservation: Some(mem_reservation),
            cpu_shares: Some(self.config.instance_cpu_shares),
            ..Default::default()
        };

        self.runtime.run(spec).await?;
        info!(instance = name, version, "instance container started");
        Ok(())
    }

    /// Force-remove the container and its data volume.
    pub async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.runtime.remove(&container_name(name), true).await?;
        if let Err(err) = self.runtime.remove_volume(&volume_name(name)).await {
            // The volume may be gone already; that is not a failure.
            warn!(instance = name, error = %err, "data volume removal failed");
        }
        info!(instance = name, "instance removed");
        Ok(())
    }

    /// Recreate the container on a new version, preserving the encryption key,
    /// the `created_at` stamp and the data volume.
    pub async fn rebuild(&self, name: &str, version: &str) -> Result<(), RuntimeError> {
        let details = self.runtime.inspect(&container_name(name)).await?;
        let Some(key) = extract_encryption_key(&details.env) else {
            return Err(RuntimeError::Fatal(format!(
                "instance '{name}' has no encryption key; refusing to rebuild"
            )));
        };
        let created_at = details.labels.get("app.created_at").cloned();

        // Container only — the named volume stays.
        self.runtime.remove(&container_name(name), false).await?;
        self.create(name, version, &key, created_at).await?;
        info!(instance = name, version, "instance rebuilt");
        Ok(())
    }

    /// Destroy the instance (container + volume) and recreate it with a fresh
    /// encryption key. Prior data becomes unreadable by design.
    pub async fn reset(&self, name: &str, version: &str) -> Result<String, RuntimeError> {
        self.remove(name).await?;
        let key = generate_encryption_key();
        self.create(name, version, &key, None).await?;
        Ok(key)
    }

    pub async fn restart(&self, name: &str) -> Result<(), RuntimeError> {
        self.runtime.restart(&container_name(name), 15).await
    }

    pub async fn list(&self) -> Result<Vec<InstanceView>, RuntimeError> {
        let briefs = self.runtime.list(MANAGED_LABEL).await?;
        let now = Utc::now();
        Ok(briefs
            .iter()
            .map(|brief| view_from_brief(&self.config, brief, now))
            .collect())
    }

    pub async fn capacity(&self) -> Result<CapacitySnapshot, RuntimeError> {
        let host = self.runtime.info().await?;
        let instances = self.list().await?;

        let total_ram_mb = host.total_ram_bytes / (1024 * 1024);
        let max_instances = compute_max_instances(total_ram_mb);
        let active_instances = instances.iter().filter(|i| i.status == "running").count() as i64;

        Ok(CapacitySnapshot {
            max_instances,
            active_instances,
            can_create: active_instances < max_instances,
            instances,
            vps: VpsInfo {
                total_ram_mb,
                total_cpus: host.cpu_count,
                reserved_ram_mb: RESERVED_RAM_MB,
                per_instance_ram_mb: PER_INSTANCE_RAM_MB,
            },
        })
    }

    /// Rebuild every managed instance whose env differs from the current
    /// projection. Returns how many were rebuilt.
    pub async fn reconcile_all(&self) -> Result<usize, RuntimeError> {
        let instances = self.list().await?;
        let mut rebuilt = 0;

        for view in &instances {
            let details = match self.runtime.inspect(&container_name(&view.name)).await {
                Ok(details) => details,
                Err(RuntimeError::NotFound) => continue,
                Err(err) => {
                    warn!(instance = %view.name, error = %err, "inspect failed during reconcile");
                    continue;
                }
            };

            let Some(key) = extract_encryption_key(&details.env) else {
                warn!(instance = %view.name, "no encryption key; skipping reconcile");
                continue;
            };

            let projection = build_env(&self.config, &view.name, &key);
            let current = env_from_list(&details.env);
            let drifted = drift_keys(&projection, &current);
            if drifted.is_empty() {
                continue;
            }

            info!(
                instance = %view.name,
                keys = ?drifted,
                "env drift detected; rebuilding"
            );
            match self.rebuild(&view.name, &view.version).await {
                Ok(()) => rebuilt += 1,
                Err(err) => warn!(instance = %view.name, error = %err, "reconcile rebuild failed"),
            }
        }

        Ok(rebuilt)
    }

    pub async fn status(&self, name: &str) -> Result<InstanceStatusView, RuntimeError> {
        let details = self.runtime.inspect(&container_name(name)).await?;
        let memory = match self.runtime.stats_once(&container_name(name)).await {
            Ok(mem) => MemoryView {
                usage_mb: round1(mem.usage_bytes as f64 / 1024.0 / 1024.0),
                limit_mb: round1(mem.limit_bytes as f64 / 1024.0 / 1024.0),
            },
            // Stats are unavailable on stopped containers.
            Err(_) => MemoryView {
                usage_mb: 0.0,
                limit_mb: 0.0,
            },
        };

        Ok(InstanceStatusView {
            instance_id: name.to_string(),
            status: details.status,
            url: instance_url(&self.config, name),
            location: "vinhedo".to_string(),
            version: image_tag(&details.image),
            uptime: details.started_at.unwrap_or_default(),
            memory,
        })
    }

    pub async fn logs(&self, name: &str, tail: u32) -> Result<String, RuntimeError> {
        self.runtime
            .logs(&container_name(name), tail.min(200))
            .await
    }

    pub async fn env(&self, name: &str) -> Result<BTreeMap<String, String>, RuntimeError> {
        let details = self.runtime.inspect(&container_name(name)).await?;
        Ok(env_from_list(&details.env))
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
