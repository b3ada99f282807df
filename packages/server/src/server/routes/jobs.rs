//! Asynchronous provisioning intake: enqueue, poll and the SSE follow.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Extension, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::instance::{validate_instance_name, validate_version};
use crate::kernel::jobs::{default_location, JobEvent, JobPayload, JobState};
use crate::server::app::AppState;
use crate::server::error::ApiError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Active (pending/running) jobs currently in the store.
pub async fn list_jobs(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let jobs = state.store.active_jobs().await?;
    Ok(Json(json!({ "jobs": jobs })))
}

#[derive(Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub name: String,
    pub version: Option<String>,
    pub location: Option<String>,
}

/// Validate, admission-check and publish one provisioning job.
///
/// Shared by the JSON intake and the SSE intake so both fail identically.
async fn enqueue_job(state: &AppState, request: EnqueueRequest) -> Result<JobPayload, ApiError> {
    let name = validate_instance_name(&request.name)?;
    let version = validate_version(
        request
            .version
            .as_deref()
            .unwrap_or(&state.config.default_version),
    )?;
    let location = request.location.unwrap_or_else(default_location);

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

    let payload = JobPayload {
        job_id: Uuid::new_v4(),
        name,
        version,
        location,
    };

    // The job must be visible to followers before it can be consumed.
    state.store.init(payload.job_id).await?;
    state
        .publisher
        .publish(&payload)
        .await
        .map_err(|err| ApiError::internal(format!("Erro ao enfileirar job: {err}")))?;

    Ok(payload)
}

pub async fn enqueue_instance(
    Extension(state): Extension<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<Value>, ApiError> {
    let payload = enqueue_job(&state, request).await?;
    Ok(Json(json!({ "job_id": payload.job_id, "name": payload.name })))
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: usize,
}

/// Incremental poll of a job's event log.
pub async fn job_events(
    Extension(state): Extension<AppState>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    // Anything that is not a job id is simply a job we do not know.
    let job_id = Uuid::parse_str(&job_id)
        .map_err(|_| ApiError::not_found("Job não encontrado ou expirado"))?;
    let job_state = state.store.get_state(job_id).await?;
    if job_state == JobState::Unknown {
        return Err(ApiError::not_found("Job não encontrado ou expirado"));
    }

    let events = state.store.since(job_id, query.since).await?;
    if job_state.is_terminal() {
        let _ = state.store.shorten(job_id).await;
    }

    Ok(Json(json!({
        "state": job_state,
        "events": events,
        "next_index": query.since + events.len(),
    })))
}

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub name: String,
    pub version: Option<String>,
    pub location: Option<String>,
}

/// Enqueue and follow a provisioning job over SSE.
///
/// Fast failures (validation, capacity, duplicate) surface as a single error
/// frame. After that the follower polls the job store every 500 ms and
/// forwards each event verbatim, closing on the terminal one. Dropping the
/// connection kills only this poll loop; the worker carries on.
pub async fn create_instance_stream(
    Extension(state): Extension<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<JobEvent>(32);

    tokio::spawn(follow_job(state, query, tx));

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn follow_job(state: AppState, query: StreamQuery, tx: mpsc::Sender<JobEvent>) {
    let request = EnqueueRequest {
        name: query.name,
        version: query.version,
        location: query.location,
    };

    let payload = match enqueue_job(&state, request).await {
        Ok(payload) => payload,
        Err(err) => {
            let _ = tx.send(JobEvent::error(err.detail)).await;
            return;
        }
    };

    let job_id = payload.job_id;
    let started = tokio::time::Instant::now();
    let max_duration = Duration::from_secs(state.config.sse_max_duration);
    let mut index = 0usize;

    loop {
        let events = match state.store.since(job_id, index).await {
            Ok(events) => events,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "follower read failed");
                let _ = tx
                    .send(JobEvent::error(format!("Erro ao ler eventos: {err}")))
                    .await;
                return;
            }
        };

        for event in events {
            index += 1;
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() {
                // Follower disconnected; the job is unaffected.
                return;
            }
            if terminal {
                let _ = state.store.shorten(job_id).await;
                return;
            }
        }

        if started.elapsed() > max_duration {
            let _ = tx
                .send(JobEvent::error(format!(
                    "Timeout: criação demorou mais de {}s",
                    state.config.sse_max_duration
                )))
                .await;
            let _ = state.store.shorten(job_id).await;
            return;
        }

        match state.store.get_state(job_id).await {
            Ok(JobState::Unknown) => {
                let _ = tx.send(JobEvent::error("Job perdido ou expirado")).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "follower state read failed");
            }
        }

        tokio::select! {
            // Client gone — stop polling promptly.
            _ = tx.closed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}
