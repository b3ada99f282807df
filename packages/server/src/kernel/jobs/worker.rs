//! Provisioning worker — consumes instance-creation jobs from the broker.
//!
//! A single consumer with `prefetch = 1`: one job runs to completion before
//! the next is fetched, so intake order is preserved and at most one container
//! creation is in flight per process. The message is acked exactly once, after
//! the terminal event has been written to the job store; a crash before the
//! ack makes the broker redeliver.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::kernel::instance::{
    container_name, generate_encryption_key, instance_url, InstanceManager,
};
use crate::kernel::runtime::{RuntimeClient, RuntimeError};

use super::events::{JobEvent, JobPayload, JobState};
use super::queue::{declare_queue, QUEUE_NAME};
use super::store::JobStore;

/// Lines of container log attached to a "container stopped" error event.
const CRASH_LOG_TAIL: u32 = 30;

pub struct ProvisioningWorker {
    config: Arc<Config>,
    instances: Arc<InstanceManager>,
    runtime: Arc<RuntimeClient>,
    store: Arc<dyn JobStore>,
    probe: reqwest::Client,
}

impl ProvisioningWorker {
    pub fn new(
        config: Arc<Config>,
        instances: Arc<InstanceManager>,
        runtime: Arc<RuntimeClient>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        // The proxy may still be provisioning the certificate while the
        // engine is already up, so certificate errors must not fail the probe.
        let probe = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .context("probe client build failed")?;
        Ok(Self {
            config,
            instances,
            runtime,
            store,
            probe,
        })
    }

    /// Consume until the shutdown token fires. Reconnects forever: 5s after a
    /// broker transport loss, 10s after anything unexpected.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = QUEUE_NAME, "provisioning worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.consume_loop(&shutdown).await {
                Ok(()) => break, // graceful shutdown
                Err(err) if err.downcast_ref::<lapin::Error>().is_some() => {
                    warn!(error = %err, "broker connection lost; reconnecting in 5s");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "worker loop failed; retrying in 10s");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                    }
                }
            }
        }
        info!("provisioning worker stopped");
    }

    async fn consume_loop(&self, shutdown: &CancellationToken) -> Result<()> {
        let conn =
            Connection::connect(&self.config.amqp_addr(), ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        declare_queue(&channel).await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let mut consumer = channel
            .basic_consume(
                QUEUE_NAME,
                "provisioning-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("waiting for instance-creation jobs");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = conn.close(200, "shutdown").await;
                    return Ok(());
                }
                delivery = consumer.next() => delivery,
            };
            match delivery {
                Some(Ok(delivery)) => self.process_delivery(delivery).await?,
                Some(Err(err)) => return Err(err.into()),
                None => anyhow::bail!("consumer stream closed"),
            }
        }
    }

    /// Decode and execute one job, then ack. The ack is intentionally the
    /// very last step so a crash mid-job leads to redelivery.
    async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        match serde_json::from_slice::<JobPayload>(&delivery.data) {
            Ok(payload) => {
                let job_id = payload.job_id;
                info!(job_id = %job_id, name = %payload.name, version = %payload.version, "processing job");
                if let Err(err) = self.provision(&payload).await {
                    // Top-level catch: anything unexpected still terminates the
                    // job with an error event before the ack.
                    error!(job_id = %job_id, error = %err, "job failed unexpectedly");
                    self.fail(job_id, format!("Erro inesperado: {err}")).await;
                }
            }
            Err(err) => {
                // Undecodable payloads are dropped; redelivering them would
                // loop forever.
                error!(error = %err, "discarding malformed job payload");
            }
        }
        delivery
            .ack(BasicAckOptions::default())
            .await
            .context("ack failed")?;
        Ok(())
    }

    /// Append a terminal error event and mark the job failed, best-effort.
    async fn fail(&self, job_id: Uuid, message: String) {
        if let Err(err) = self.store.append(job_id, JobEvent::error(message)).await {
            warn!(job_id = %job_id, error = %err, "error event write failed");
        }
        if let Err(err) = self.store.set_state(job_id, JobState::Error).await {
            warn!(job_id = %job_id, error = %err, "error state write failed");
        }
    }

    async fn provision(&self, payload: &JobPayload) -> Result<()> {
        let job_id = payload.job_id;
        let name = payload.name.as_str();

        self.store.set_state(job_id, JobState::Running).await?;
        self.store
            .append(
                job_id,
                JobEvent::info("Downloading image and creating container…"),
            )
            .await?;

        // Duplicate guard: intake checks too, but a queued job may race a
        // synchronous create for the same name.
        if self.instances.exists(name).await.unwrap_or(false) {
            self.fail(job_id, format!("Instância '{name}' já existe"))
                .await;
            return Ok(());
        }

        let encryption_key = generate_encryption_key();

        if let Err(err) = self
            .instances
            .create(name, &payload.version, &encryption_key, None)
            .await
        {
            // Leave nothing half-created behind. A name conflict means the
            // container belongs to someone else — never remove that one.
            if !matches!(err, RuntimeError::Conflict(_)) {
                if let Err(cleanup_err) = self.instances.remove(name).await {
                    if !matches!(cleanup_err, RuntimeError::NotFound) {
                        warn!(instance = name, error = %cleanup_err, "partial container cleanup failed");
                    }
                }
            }
            self.fail(job_id, format!("Erro ao criar container: {err}"))
                .await;
            return Ok(());
        }

        self.store
            .append(job_id, JobEvent::info("Container created, waiting for engine…"))
            .await?;

        if !self.wait_until_ready(payload).await? {
            return Ok(());
        }

        // Grace period for the proxy to finish certificate issuance.
        tokio::time::sleep(Duration::from_secs(self.config.ssl_wait_seconds)).await;

        let url = instance_url(&self.config, name);
        self.store
            .append(
                job_id,
                JobEvent::complete(
                    "Instance created successfully",
                    name,
                    &url,
                    &payload.location,
                ),
            )
            .await?;
        self.store.set_state(job_id, JobState::Complete).await?;
        info!(job_id = %job_id, instance = name, url, "job complete");
        Ok(())
    }

    /// Poll the container and its public URL until the engine answers 200.
    ///
    /// Returns `Ok(false)` when a terminal error event was appended (container
    /// died or the probe timed out). A timed-out container is left running for
    /// operator inspection — it may still become ready.
    async fn wait_until_ready(&self, payload: &JobPayload) -> Result<bool> {
        let job_id = payload.job_id;
        let name = payload.name.as_str();
        let interval = self.config.readiness_poll_interval;
        let max_attempts = self.config.readiness_max_attempts;
        let public_url = format!("{}/", instance_url(&self.config, name));

        for attempt in 1..=max_attempts {
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let details = match self.runtime.inspect(&container_name(name)).await {
                Ok(details) => details,
                Err(err) => {
                    self.fail(job_id, format!("Erro ao consultar container: {err}"))
                        .await;
                    return Ok(false);
                }
            };

            if details.status == "exited" {
                let logs = self
                    .runtime
                    .logs(&container_name(name), CRASH_LOG_TAIL)
                    .await
                    .unwrap_or_default();
                self.fail(job_id, format!("Container parou.\n{logs}")).await;
                return Ok(false);
            }

            if details.status == "running" {
                match self.probe.get(&public_url).send().await {
                    Ok(response) if response.status() == reqwest::StatusCode::OK => {
                        self.store
                            .append(job_id, JobEvent::info("Engine reachable"))
                            .await?;
                        return Ok(true);
                    }
                    // Not up yet (or the proxy route is still propagating).
                    Ok(_) | Err(_) => {}
                }
            }

            if attempt % 10 == 0 {
                let elapsed = u64::from(attempt) * interval;
                self.store
                    .append(job_id, JobEvent::info(format!("Waiting for engine ({elapsed}s)…")))
                    .await?;
            }
        }

        let total = u64::from(max_attempts) * interval;
        self.fail(
            job_id,
            format!("Timeout: engine did not become reachable within {total} seconds"),
        )
        .await;
        Ok(false)
    }
}
