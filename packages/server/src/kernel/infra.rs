//! Idempotent provisioning of the shared infrastructure.
//!
//! Runs once at startup, re-entrant: shared network, reverse proxy, Redis,
//! AMQP broker, the fallback site for orphaned subdomains, and a pre-pull of
//! the engine image. Each step probes for a usable existing instance before
//! recreating anything, and every failure is logged and swallowed so a broken
//! dependency cannot keep the HTTP surface down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::{Config, ENGINE_IMAGE};
use crate::kernel::runtime::{ContainerSpec, RuntimeClient, RuntimeError};

const PROXY_IMAGE: &str = "traefik:v3.6";
const REDIS_IMAGE: &str = "redis:7-alpine";
const BROKER_IMAGE: &str = "rabbitmq:3-management-alpine";
const FALLBACK_IMAGE: &str = "nginx:alpine";

const PROXY_NAME: &str = "traefik";
const REDIS_NAME: &str = "redis";
const BROKER_NAME: &str = "rabbitmq";
const FALLBACK_NAME: &str = "engine-fallback";
const BROKER_VOLUME: &str = "rabbitmq-data";

/// Retry an async predicate until it returns true or attempts run out.
pub async fn wait_for<F, Fut>(attempts: u32, interval: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..attempts {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

async fn tcp_reachable(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(3),
            tokio::net::TcpStream::connect((host, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

pub async fn bootstrap(runtime: &Arc<RuntimeClient>, config: &Arc<Config>) {
    fn log_step(label: &str, result: Result<()>) {
        if let Err(err) = result {
            error!(step = label, error = %err, "bootstrap step failed; continuing");
        }
    }

    log_step("network", ensure_network(runtime, config).await);
    log_step("proxy", ensure_proxy(runtime, config).await);
    log_step("redis", ensure_redis(runtime, config).await);
    log_step("broker", ensure_broker(runtime, config).await);
    log_step("fallback", ensure_fallback(runtime, config).await);
    log_step("image-pull", pre_pull_engine_image(runtime, config).await);
}

async fn ensure_network(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    runtime.network_get_or_create(&config.docker_network).await?;
    Ok(())
}

/// Remove containers squatting on ports we are about to claim.
async fn kill_port_holders(runtime: &RuntimeClient, ports: &[u16]) -> Result<()> {
    for &port in ports {
        for holder in runtime.containers_binding_port(port).await? {
            info!(container = %holder, port, "removing port holder");
            if let Err(err) = runtime.remove(&holder, false).await {
                warn!(container = %holder, error = %err, "port holder removal failed");
            }
        }
    }
    Ok(())
}

/// Prefer an externally-managed running proxy: attach it to the shared
/// network and leave it alone. Only create our own when none exists.
async fn ensure_proxy(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    let containers = runtime.list_all().await?;
    let existing = containers.iter().find(|c| {
        c.state == "running"
            && (c.image.to_lowercase().contains("traefik")
                || c.name.to_lowercase().contains("traefik"))
    });

    if let Some(proxy) = existing {
        let details = runtime.inspect(&proxy.name).await?;
        if details.networks.contains(&config.docker_network) {
            info!(container = %proxy.name, "proxy already on the shared network");
        } else {
            match runtime
                .connect_network(&config.docker_network, &proxy.name)
                .await
            {
                Ok(()) => info!(container = %proxy.name, network = %config.docker_network, "proxy attached to network"),
                Err(err) => warn!(container = %proxy.name, error = %err, "proxy network attach failed"),
            }
        }
        // A stopped container of ours under the canonical name would shadow
        // the external proxy on the next restart.
        if proxy.name != PROXY_NAME {
            remove_stopped(runtime, PROXY_NAME).await;
        }
        return Ok(());
    }

    info!("no running proxy found; creating one");
    remove_stopped(runtime, PROXY_NAME).await;
    kill_port_holders(runtime, &[80, 443]).await?;
    runtime.pull("traefik", "v3.6").await?;

    let resolver = &config.traefik_cert_resolver;
    let command = vec![
        "--providers.docker=true".to_string(),
        "--providers.docker.exposedbydefault=false".to_string(),
        format!("--providers.docker.network={}", config.docker_network),
        "--entrypoints.web.address=:80".to_string(),
        "--entrypoints.websecure.address=:443".to_string(),
        "--entrypoints.web.http.redirections.entrypoint.to=websecure".to_string(),
        "--entrypoints.web.http.redirections.entrypoint.scheme=https".to_string(),
        format!("--certificatesresolvers.{resolver}.acme.dnschallenge=true"),
        format!("--certificatesresolvers.{resolver}.acme.dnschallenge.provider=cloudflare"),
        format!(
            "--certificatesresolvers.{resolver}.acme.email={}",
            config.acme_email
        ),
        format!("--certificatesresolvers.{resolver}.acme.storage=/letsencrypt/acme.json"),
    ];

    runtime
        .run(ContainerSpec {
            name: PROXY_NAME.to_string(),
            image: PROXY_IMAGE.to_string(),
            env: vec![format!("CF_DNS_API_TOKEN={}", config.cf_dns_api_token)],
            command: Some(command),
            binds: vec![
                "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
                "traefik-letsencrypt:/letsencrypt".to_string(),
            ],
            ports: vec![(80, 80), (443, 443)],
            network: Some(config.docker_network.clone()),
            ..Default::default()
        })
        .await?;

    if wait_for(5, Duration::from_secs(2), || tcp_reachable("127.0.0.1", 80)).await {
        info!("proxy created and answering on port 80");
    } else {
        warn!("proxy created but port 80 not confirmed");
    }
    Ok(())
}

async fn ensure_redis(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    let port = config.redis_port;
    match runtime.inspect(REDIS_NAME).await {
        Ok(details) if details.status == "running" && details.host_ports.contains(&port) => {
            return Ok(());
        }
        Ok(details) => {
            if details.status != "running" {
                // Try a plain start first; recreate only if the port mapping
                // is wrong.
                if runtime.start(REDIS_NAME).await.is_ok() {
                    let restarted = runtime.inspect(REDIS_NAME).await?;
                    if restarted.host_ports.contains(&port) {
                        return Ok(());
                    }
                }
            }
            info!("redis container unusable; recreating with the expected port");
            runtime.remove(REDIS_NAME, false).await?;
        }
        Err(RuntimeError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    kill_port_holders(runtime, &[port]).await?;
    runtime.pull("redis", "7-alpine").await?;
    runtime
        .run(ContainerSpec {
            name: REDIS_NAME.to_string(),
            image: REDIS_IMAGE.to_string(),
            command: Some(vec![
                "redis-server".to_string(),
                "--maxmemory".to_string(),
                "100mb".to_string(),
                "--maxmemory-policy".to_string(),
                "allkeys-lru".to_string(),
            ]),
            binds: vec!["redis-data:/data".to_string()],
            ports: vec![(6379, port)],
            network: Some(config.docker_network.clone()),
            mem_limit: Some(128 * 1024 * 1024),
            ..Default::default()
        })
        .await?;

    if wait_for(10, Duration::from_secs(1), || {
        tcp_reachable(&config.redis_host, port)
    })
    .await
    {
        info!("redis created and reachable");
    } else {
        warn!("redis created but connection not confirmed");
    }
    Ok(())
}

async fn ensure_broker(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    let port = config.rabbitmq_port;
    match runtime.inspect(BROKER_NAME).await {
        Ok(details) if details.status == "running" => return Ok(()),
        Ok(_) => {
            if runtime.start(BROKER_NAME).await.is_ok() {
                return Ok(());
            }
            info!("broker container will not start; recreating");
            runtime.remove(BROKER_NAME, false).await?;
            // Credentials are baked into the data volume on first boot; a
            // stale volume with old credentials blocks authentication.
            if let Err(err) = runtime.remove_volume(BROKER_VOLUME).await {
                if !matches!(err, RuntimeError::NotFound) {
                    warn!(error = %err, "stale broker volume removal failed");
                }
            }
        }
        Err(RuntimeError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    kill_port_holders(runtime, &[port, 15672]).await?;
    runtime.pull("rabbitmq", "3-management-alpine").await?;
    runtime
        .run(ContainerSpec {
            name: BROKER_NAME.to_string(),
            image: BROKER_IMAGE.to_string(),
            env: vec![
                format!("RABBITMQ_DEFAULT_USER={}", config.rabbitmq_user),
                format!("RABBITMQ_DEFAULT_PASS={}", config.rabbitmq_password),
            ],
            binds: vec![format!("{BROKER_VOLUME}:/var/lib/rabbitmq")],
            ports: vec![(5672, port), (15672, 15672)],
            network: Some(config.docker_network.clone()),
            mem_limit: Some(256 * 1024 * 1024),
            ..Default::default()
        })
        .await?;

    if wait_for(15, Duration::from_secs(2), || {
        tcp_reachable(&config.rabbitmq_host, port)
    })
    .await
    {
        info!("broker created and reachable");
    } else {
        warn!("broker created but connection not confirmed");
    }
    Ok(())
}

/// Catch-all nginx answering every instance subdomain that has no container,
/// at the lowest router priority.
async fn ensure_fallback(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    let fallback_dir = Path::new("fallback");
    let html = fallback_dir.join("index.html");
    let nginx_conf = fallback_dir.join("nginx.conf");
    if !html.exists() || !nginx_conf.exists() {
        warn!("fallback assets missing; skipping fallback site");
        return Ok(());
    }

    match runtime.inspect(FALLBACK_NAME).await {
        Ok(details) if details.status == "running" => {
            if !details.networks.contains(&config.docker_network) {
                runtime
                    .connect_network(&config.docker_network, FALLBACK_NAME)
                    .await?;
            }
            return Ok(());
        }
        Ok(_) => runtime.remove(FALLBACK_NAME, false).await?,
        Err(RuntimeError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let escaped_domain = config.base_domain.replace('.', "\\.");
    let mut labels = std::collections::HashMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{FALLBACK_NAME}.rule"),
        format!("HostRegexp(`[a-z0-9-]+\\.{escaped_domain}`)"),
    );
    labels.insert(
        format!("traefik.http.routers.{FALLBACK_NAME}.priority"),
        "1".to_string(),
    );
    if config.ssl_enabled {
        labels.insert(
            format!("traefik.http.routers.{FALLBACK_NAME}.entrypoints"),
            "websecure".to_string(),
        );
        labels.insert(
            format!("traefik.http.routers.{FALLBACK_NAME}.tls.certresolver"),
            config.traefik_cert_resolver.clone(),
        );
    }
    labels.insert(
        format!("traefik.http.services.{FALLBACK_NAME}.loadbalancer.server.port"),
        "80".to_string(),
    );
    labels.insert("app.type".to_string(), "fallback".to_string());

    let absolute = |p: &Path| {
        std::fs::canonicalize(p)
            .map(|abs| abs.to_string_lossy().into_owned())
            .unwrap_or_else(|_| p.to_string_lossy().into_owned())
    };

    runtime.pull("nginx", "alpine").await?;
    runtime
        .run(ContainerSpec {
            name: FALLBACK_NAME.to_string(),
            image: FALLBACK_IMAGE.to_string(),
            labels,
            binds: vec![
                format!("{}:/usr/share/nginx/html/index.html:ro", absolute(&html)),
                format!("{}:/etc/nginx/conf.d/default.conf:ro", absolute(&nginx_conf)),
            ],
            network: Some(config.docker_network.clone()),
            mem_limit: Some(32 * 1024 * 1024),
            cpu_shares: Some(128),
            ..Default::default()
        })
        .await?;
    info!("fallback site created (catch-all for orphaned subdomains)");
    Ok(())
}

async fn pre_pull_engine_image(runtime: &RuntimeClient, config: &Config) -> Result<()> {
    info!(image = ENGINE_IMAGE, tag = %config.default_version, "pre-pulling engine image");
    runtime.pull(ENGINE_IMAGE, &config.default_version).await?;
    info!("engine image ready");
    Ok(())
}

async fn remove_stopped(runtime: &RuntimeClient, name: &str) {
    if let Ok(details) = runtime.inspect(name).await {
        if details.status != "running" {
            info!(container = name, status = %details.status, "removing stale container");
            if let Err(err) = runtime.remove(name, false).await {
                warn!(container = name, error = %err, "stale container removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn wait_for_stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let ok = wait_for(10, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n >= 2 }
        })
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_gives_up_after_attempts() {
        let ok = wait_for(3, Duration::from_millis(1), || async { false }).await;
        assert!(!ok);
    }
}
