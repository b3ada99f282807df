//! Typed façade over the container daemon.
//!
//! Every daemon interaction in the service goes through this client so that
//! bollard types stay contained here and errors come back classified as
//! [`RuntimeError`]. There is deliberately no in-process cache: the daemon is
//! the single source of truth for container state.

use std::collections::HashMap;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, EndpointSettings, HostConfig, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use thiserror::Error;

/// Classified daemon errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient runtime failure: {0}")]
    Transient(String),
    #[error("runtime error: {0}")]
    Fatal(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as E;
        match err {
            E::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound,
            E::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            E::DockerResponseServerError {
                status_code,
                message,
            } if status_code >= 500 => RuntimeError::Transient(message),
            E::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Fatal(format!("{status_code}: {message}")),
            // Anything that is not an explicit daemon response is treated as a
            // connection-level hiccup.
            other => RuntimeError::Transient(other.to_string()),
        }
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    /// Full image reference including tag.
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub command: Option<Vec<String>>,
    /// Volume/bind mounts in `source:target[:mode]` form.
    pub binds: Vec<String>,
    /// `(container_port, host_port)` TCP publications.
    pub ports: Vec<(u16, u16)>,
    pub network: Option<String>,
    pub mem_limit: Option<i64>,
    pub mem_reservation: Option<i64>,
    pub cpu_shares: Option<i64>,
}

/// Summary of one container from a list call.
#[derive(Debug, Clone)]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    /// Daemon-side creation time, unix seconds.
    pub created_unix: Option<i64>,
}

/// Detailed view of one container from an inspect call.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub started_at: Option<String>,
    pub networks: Vec<String>,
    pub host_ports: Vec<u16>,
}

/// One-shot memory statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryUsage {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
}

/// Host totals used for capacity math.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub total_ram_bytes: i64,
    pub cpu_count: i64,
}

pub struct RuntimeClient {
    docker: Docker,
}

impl RuntimeClient {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Pull `image:tag`, draining the progress stream.
    pub async fn pull(&self, image: &str, tag: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    /// Create and start a container with restart policy `unless-stopped`.
    pub async fn run(&self, spec: ContainerSpec) -> Result<(), RuntimeError> {
        let mut port_bindings: PortMap = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: spec.network.clone(),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            memory: spec.mem_limit,
            memory_reservation: spec.mem_reservation,
            cpu_shares: spec.cpu_shares,
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            cmd: spec.command.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let state = response.state.as_ref();
        let config = response.config.as_ref();
        let host_ports = response
            .host_config
            .as_ref()
            .and_then(|hc| hc.port_bindings.as_ref())
            .map(collect_host_ports)
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: response.id.clone().unwrap_or_default(),
            name: response
                .name
                .clone()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            status: status_label(state.and_then(|s| s.status)),
            image: config
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            env: config.and_then(|c| c.env.clone()).unwrap_or_default(),
            labels: config.and_then(|c| c.labels.clone()).unwrap_or_default(),
            started_at: state.and_then(|s| s.started_at.clone()),
            networks: response
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .map(|nets| nets.keys().cloned().collect())
                .unwrap_or_default(),
            host_ports,
        })
    }

    /// List containers (including stopped ones) matching a label filter.
    pub async fn list(&self, label_filter: &str) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter.to_string()]);
        self.list_with(Some(filters)).await
    }

    /// List every container on the host.
    pub async fn list_all(&self) -> Result<Vec<ContainerBrief>, RuntimeError> {
        self.list_with(None).await
    }

    async fn list_with(
        &self,
        filters: Option<HashMap<String, Vec<String>>>,
    ) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let options = ListContainersOptions {
            all: true,
            filters: filters.unwrap_or_default(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerBrief {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_else(|| "unknown".to_string()),
                labels: c.labels.unwrap_or_default(),
                created_unix: c.created,
            })
            .collect())
    }

    /// Single memory-stats sample.
    pub async fn stats_once(&self, name: &str) -> Result<MemoryUsage, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(name, Some(options));
        match stream.next().await {
            Some(stats) => {
                let stats = stats?;
                Ok(MemoryUsage {
                    usage_bytes: stats.memory_stats.usage.unwrap_or(0),
                    limit_bytes: stats.memory_stats.limit.unwrap_or(0),
                })
            }
            None => Err(RuntimeError::Transient("empty stats stream".to_string())),
        }
    }

    /// Last `tail` log lines, stdout and stderr interleaved.
    pub async fn logs(&self, name: &str, tail: u32) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }

    /// Force-remove a container, optionally with its anonymous volumes.
    pub async fn remove(&self, name: &str, with_volumes: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: with_volumes,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn restart(&self, name: &str, timeout_secs: isize) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(name, Some(RestartContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    /// Create the named bridge network unless it already exists.
    pub async fn network_get_or_create(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match RuntimeError::from(err) {
                RuntimeError::NotFound => {
                    self.docker
                        .create_network(CreateNetworkOptions {
                            name: name.to_string(),
                            driver: "bridge".to_string(),
                            ..Default::default()
                        })
                        .await?;
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    pub async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn info(&self) -> Result<HostInfo, RuntimeError> {
        let info = self.docker.info().await?;
        Ok(HostInfo {
            total_ram_bytes: info.mem_total.unwrap_or(0),
            cpu_count: info.ncpu.unwrap_or(0),
        })
    }

    /// Names of containers publishing the given host port.
    pub async fn containers_binding_port(&self, port: u16) -> Result<Vec<String>, RuntimeError> {
        let mut holders = Vec::new();
        for brief in self.list_all().await? {
            let details = match self.inspect(&brief.name).await {
                Ok(details) => details,
                Err(RuntimeError::NotFound) => continue,
                Err(err) => return Err(err),
            };
            if details.host_ports.contains(&port) {
                holders.push(brief.name);
            }
        }
        Ok(holders)
    }
}

fn status_label(status: Option<ContainerStateStatusEnum>) -> String {
    use ContainerStateStatusEnum::*;
    match status {
        Some(RUNNING) => "running",
        Some(EXITED) => "exited",
        Some(CREATED) => "created",
        Some(RESTARTING) => "restarting",
        Some(PAUSED) => "paused",
        Some(REMOVING) => "removing",
        Some(DEAD) => "dead",
        Some(EMPTY) | None => "unknown",
    }
    .to_string()
}

fn collect_host_ports(bindings: &PortMap) -> Vec<u16> {
    let mut ports = Vec::new();
    for binds in bindings.values().flatten() {
        for bind in binds {
            if let Some(port) = bind.host_port.as_deref().and_then(|p| p.parse().ok()) {
                ports.push(port);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_label_maps_known_states() {
        assert_eq!(
            status_label(Some(ContainerStateStatusEnum::RUNNING)),
            "running"
        );
        assert_eq!(
            status_label(Some(ContainerStateStatusEnum::EXITED)),
            "exited"
        );
        assert_eq!(status_label(None), "unknown");
    }

    #[test]
    fn collect_host_ports_parses_bindings() {
        let mut bindings: PortMap = HashMap::new();
        bindings.insert(
            "6379/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("6379".to_string()),
            }]),
        );
        bindings.insert("80/tcp".to_string(), None);
        assert_eq!(collect_host_ports(&bindings), vec![6379]);
    }

    #[test]
    fn server_errors_are_classified_by_status() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(
            RuntimeError::from(not_found),
            RuntimeError::NotFound
        ));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(matches!(
            RuntimeError::from(conflict),
            RuntimeError::Conflict(_)
        ));

        let hiccup = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon restarting".to_string(),
        };
        assert!(matches!(
            RuntimeError::from(hiccup),
            RuntimeError::Transient(_)
        ));
    }
}
