//! Shared helpers for integration tests.
//!
//! Everything here is wired against the in-memory job store; no container
//! daemon, broker or Redis is required to run these tests.

use std::sync::Arc;

use server_core::kernel::instance::InstanceManager;
use server_core::kernel::jobs::{JobPublisher, JobStore, MemoryJobStore};
use server_core::kernel::runtime::RuntimeClient;
use server_core::server::{build_app, AppState};
use server_core::Config;

#[allow(dead_code)]
pub fn test_config() -> Config {
    Config {
        api_auth_token: Some("test-token".into()),
        base_domain: "n8n.example.com".into(),
        acme_email: "admin@example.com".into(),
        docker_network: "n8n-public".into(),
        server_port: 0,
        rabbitmq_host: "127.0.0.1".into(),
        rabbitmq_port: 5672,
        rabbitmq_user: "guest".into(),
        rabbitmq_password: "guest".into(),
        redis_host: "127.0.0.1".into(),
        redis_port: 6379,
        cf_dns_api_token: String::new(),
        traefik_cert_resolver: "letsencrypt".into(),
        ssl_enabled: true,
        allowed_origins: vec!["*".into()],
        default_version: "1.123.20".into(),
        default_timezone: "America/Sao_Paulo".into(),
        instance_mem_limit: "384m".into(),
        instance_mem_reservation: "192m".into(),
        instance_cpu_shares: 512,
        readiness_max_attempts: 3,
        readiness_poll_interval: 1,
        ssl_wait_seconds: 0,
        cleanup_max_age_days: 5,
        cleanup_interval_seconds: 3600,
        job_ttl: 600,
        job_cleanup_ttl: 300,
        sse_max_duration: 300,
    }
}

/// Build the full router over an in-memory job store.
///
/// The runtime client and publisher connect lazily, so constructing them here
/// performs no I/O.
#[allow(dead_code)]
pub fn test_app(config: Config, store: Arc<dyn JobStore>) -> axum::Router {
    let config = Arc::new(config);
    let runtime = Arc::new(RuntimeClient::connect().expect("client construction is offline"));
    let instances = Arc::new(InstanceManager::new(runtime.clone(), config.clone()));
    let state = AppState {
        publisher: Arc::new(JobPublisher::new(config.amqp_addr())),
        config,
        runtime,
        instances,
        store,
        http: reqwest::Client::new(),
    };
    build_app(state)
}

#[allow(dead_code)]
pub fn memory_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new())
}
