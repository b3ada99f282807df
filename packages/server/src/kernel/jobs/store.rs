//! Job-state store — bridge between the worker and SSE followers.
//!
//! State and events live in Redis under `job:<id>:state` / `job:<id>:events`
//! with a TTL, so that any number of HTTP processes can follow the same job.
//! The in-memory backend exists for tests and mirrors the same contract:
//! events are totally ordered per job and `since` is an idempotent indexed
//! read.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::events::{JobEvent, JobState};

/// Summary row for the active-jobs listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub state: JobState,
    pub last_message: String,
    pub event_count: usize,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Mark a job as pending. Must succeed before the job is published.
    async fn init(&self, job_id: Uuid) -> Result<()>;

    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<()>;

    /// `JobState::Unknown` when the key is missing or expired.
    async fn get_state(&self, job_id: Uuid) -> Result<JobState>;

    /// Append one event and refresh the log's TTL.
    async fn append(&self, job_id: Uuid, event: JobEvent) -> Result<()>;

    /// Events from `index` (inclusive) to the end, in append order.
    async fn since(&self, job_id: Uuid, index: usize) -> Result<Vec<JobEvent>>;

    /// Shorten both keys' TTL once a terminal event has been observed.
    async fn shorten(&self, job_id: Uuid) -> Result<()>;

    /// Jobs currently pending or running.
    async fn active_jobs(&self) -> Result<Vec<ActiveJob>>;

    /// Backend connectivity check for /health.
    async fn ping(&self) -> Result<()>;
}

fn state_key(job_id: Uuid) -> String {
    format!("job:{job_id}:state")
}

fn events_key(job_id: Uuid) -> String {
    format!("job:{job_id}:events")
}

/// Redis-backed store. Connects lazily so a slow Redis bootstrap cannot block
/// HTTP startup.
pub struct RedisJobStore {
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
    job_ttl: u64,
    cleanup_ttl: u64,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, job_ttl: u64, cleanup_ttl: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
            job_ttl,
            cleanup_ttl,
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .context("redis connection failed")?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn init(&self, job_id: Uuid) -> Result<()> {
        self.set_state(job_id, JobState::Pending).await
    }

    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(state_key(job_id), state.as_str(), self.job_ttl)
            .await?;
        Ok(())
    }

    async fn get_state(&self, job_id: Uuid) -> Result<JobState> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(state_key(job_id)).await?;
        Ok(raw
            .map(|s| JobState::parse(&s))
            .unwrap_or(JobState::Unknown))
    }

    async fn append(&self, job_id: Uuid, event: JobEvent) -> Result<()> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&event)?;
        let key = events_key(job_id);
        let _: () = conn.rpush(&key, encoded).await?;
        let _: () = conn.expire(&key, self.job_ttl as i64).await?;
        Ok(())
    }

    async fn since(&self, job_id: Uuid, index: usize) -> Result<Vec<JobEvent>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(events_key(job_id), index as isize, -1).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).context("malformed job event"))
            .collect()
    }

    async fn shorten(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let ttl = self.cleanup_ttl as i64;
        let _: () = conn.expire(state_key(job_id), ttl).await?;
        let _: () = conn.expire(events_key(job_id), ttl).await?;
        Ok(())
    }

    async fn active_jobs(&self) -> Result<Vec<ActiveJob>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys("job:*:state").await?;
        let mut jobs = Vec::new();
        for key in keys {
            let Some(job_id) = key
                .strip_prefix("job:")
                .and_then(|rest| rest.strip_suffix(":state"))
            else {
                continue;
            };
            let raw: Option<String> = conn.get(&key).await?;
            let state = raw
                .map(|s| JobState::parse(&s))
                .unwrap_or(JobState::Unknown);
            if !matches!(state, JobState::Pending | JobState::Running) {
                continue;
            }
            let events: Vec<String> = conn
                .lrange(format!("job:{job_id}:events"), 0, -1)
                .await?;
            let last_message = events
                .last()
                .and_then(|item| serde_json::from_str::<JobEvent>(item).ok())
                .map(|ev| ev.message)
                .unwrap_or_default();
            jobs.push(ActiveJob {
                job_id: job_id.to_string(),
                state,
                last_message,
                event_count: events.len(),
            });
        }
        Ok(jobs)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory store with the same ordering contract, for tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, (JobState, Vec<JobEvent>)>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn init(&self, job_id: Uuid) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job_id, (JobState::Pending, Vec::new()));
        Ok(())
    }

    async fn set_state(&self, job_id: Uuid, state: JobState) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        jobs.entry(job_id)
            .or_insert_with(|| (state, Vec::new()))
            .0 = state;
        Ok(())
    }

    async fn get_state(&self, job_id: Uuid) -> Result<JobState> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|(state, _)| *state)
            .unwrap_or(JobState::Unknown))
    }

    async fn append(&self, job_id: Uuid, event: JobEvent) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        jobs.entry(job_id)
            .or_insert_with(|| (JobState::Pending, Vec::new()))
            .1
            .push(event);
        Ok(())
    }

    async fn since(&self, job_id: Uuid, index: usize) -> Result<Vec<JobEvent>> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|(_, events)| events.iter().skip(index).cloned().collect())
            .unwrap_or_default())
    }

    async fn shorten(&self, _job_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn active_jobs(&self) -> Result<Vec<ActiveJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|(_, (state, _))| matches!(state, JobState::Pending | JobState::Running))
            .map(|(job_id, (state, events))| ActiveJob {
                job_id: job_id.to_string(),
                state: *state,
                last_message: events.last().map(|ev| ev.message.clone()).unwrap_or_default(),
                event_count: events.len(),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_returned_in_append_order() {
        let store = MemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store.init(job_id).await.unwrap();
        for i in 0..5 {
            store
                .append(job_id, JobEvent::info(format!("step {i}")))
                .await
                .unwrap();
        }
        let events = store.since(job_id, 0).await.unwrap();
        let messages: Vec<_> = events.iter().map(|ev| ev.message.as_str()).collect();
        assert_eq!(messages, ["step 0", "step 1", "step 2", "step 3", "step 4"]);
    }

    #[tokio::test]
    async fn chained_since_reads_concatenate_to_full_log() {
        let store = MemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store.init(job_id).await.unwrap();
        for i in 0..7 {
            store
                .append(job_id, JobEvent::info(format!("event {i}")))
                .await
                .unwrap();
        }

        let first = store.since(job_id, 0).await.unwrap();
        let rest = store.since(job_id, first.len()).await.unwrap();
        let mut combined = first;
        combined.extend(rest);
        assert_eq!(combined, store.since(job_id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn since_past_the_end_is_empty() {
        let store = MemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store.init(job_id).await.unwrap();
        store.append(job_id, JobEvent::info("only")).await.unwrap();
        assert!(store.since(job_id, 1).await.unwrap().is_empty());
        assert!(store.since(job_id, 99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_job_reads_as_unknown() {
        let store = MemoryJobStore::new();
        assert_eq!(
            store.get_state(Uuid::new_v4()).await.unwrap(),
            JobState::Unknown
        );
    }

    #[tokio::test]
    async fn active_jobs_excludes_terminal_states() {
        let store = MemoryJobStore::new();
        let running = Uuid::new_v4();
        let done = Uuid::new_v4();
        store.init(running).await.unwrap();
        store.set_state(running, JobState::Running).await.unwrap();
        store
            .append(running, JobEvent::info("Criando container..."))
            .await
            .unwrap();
        store.init(done).await.unwrap();
        store.set_state(done, JobState::Complete).await.unwrap();

        let active = store.active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, running.to_string());
        assert_eq!(active[0].last_message, "Criando container...");
        assert_eq!(active[0].event_count, 1);
    }
}
