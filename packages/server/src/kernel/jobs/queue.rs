//! Durable publisher for provisioning jobs.
//!
//! One connection + channel guarded by a mutex so concurrent publishes
//! serialize; the consumer side (worker) owns its own connection. Messages are
//! persistent and the queue durable, so enqueued jobs survive a broker
//! restart.

use anyhow::{Context, Result};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::info;

use super::events::JobPayload;

pub const QUEUE_NAME: &str = "instance_creation";

/// Declare the durable queue on a fresh channel. Used by both the publisher
/// and the worker so whichever side connects first creates it.
pub async fn declare_queue(channel: &Channel) -> Result<()> {
    channel
        .queue_declare(
            QUEUE_NAME,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("queue declare failed")?;
    Ok(())
}

pub struct JobPublisher {
    addr: String,
    state: Mutex<Option<(Connection, Channel)>>,
}

impl JobPublisher {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            state: Mutex::new(None),
        }
    }

    /// Publish a persistent job message, reconnecting if the channel is gone.
    pub async fn publish(&self, payload: &JobPayload) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let mut guard = self.state.lock().await;

        if !guard
            .as_ref()
            .is_some_and(|(conn, _)| conn.status().connected())
        {
            let conn = Connection::connect(&self.addr, ConnectionProperties::default())
                .await
                .context("broker connection failed")?;
            let channel = conn.create_channel().await?;
            declare_queue(&channel).await?;
            *guard = Some((conn, channel));
        }

        let Some((_, channel)) = guard.as_ref() else {
            anyhow::bail!("broker channel unavailable");
        };

        let publish = channel
            .basic_publish(
                "",
                QUEUE_NAME,
                BasicPublishOptions::default(),
                &body,
                // delivery_mode 2 = persistent
                BasicProperties::default().with_delivery_mode(2),
            )
            .await;

        match publish {
            Ok(confirm) => {
                confirm.await?;
                info!(job_id = %payload.job_id, queue = QUEUE_NAME, "job published");
                Ok(())
            }
            Err(err) => {
                // Drop the broken channel so the next publish reconnects.
                *guard = None;
                Err(err).context("publish failed")
            }
        }
    }

    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        if let Some((conn, _)) = guard.take() {
            let _ = conn.close(200, "shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn payload_round_trips_as_json() {
        let payload = JobPayload {
            job_id: Uuid::new_v4(),
            name: "alice".to_string(),
            version: "1.123.20".to_string(),
            location: "vinhedo".to_string(),
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let decoded: JobPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded.job_id, payload.job_id);
        assert_eq!(decoded.name, "alice");
        assert_eq!(decoded.version, "1.123.20");
        assert_eq!(decoded.location, "vinhedo");
    }
}
