//! Contract tests for the worker/follower bridge.
//!
//! A producer task plays the worker role against the in-memory job store
//! while a follower polls `since` by index, exactly like the SSE loop. The
//! store's ordering guarantees are what make the real pipeline safe to poll
//! from any number of followers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use server_core::kernel::jobs::{EventStatus, JobEvent, JobState, JobStore, MemoryJobStore};
use uuid::Uuid;

async fn play_worker(store: Arc<MemoryJobStore>, job_id: Uuid) {
    store.set_state(job_id, JobState::Running).await.unwrap();
    store
        .append(job_id, JobEvent::info("Downloading image and creating container…"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .append(job_id, JobEvent::info("Container created, waiting for engine…"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .append(
            job_id,
            JobEvent::complete(
                "Instance created successfully",
                "alice",
                "https://alice.n8n.example.com",
                "vinhedo",
            ),
        )
        .await
        .unwrap();
    store.set_state(job_id, JobState::Complete).await.unwrap();
}

/// Poll by index until a terminal event shows up, like the SSE follower.
async fn follow(store: &MemoryJobStore, job_id: Uuid) -> Vec<JobEvent> {
    let mut collected = Vec::new();
    let mut index = 0usize;
    loop {
        let events = store.since(job_id, index).await.unwrap();
        for event in events {
            index += 1;
            let terminal = event.is_terminal();
            collected.push(event);
            if terminal {
                return collected;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn follower_sees_every_event_in_order_with_one_terminal() {
    let store = Arc::new(MemoryJobStore::new());
    let job_id = Uuid::new_v4();
    store.init(job_id).await.unwrap();

    let producer = tokio::spawn(play_worker(store.clone(), job_id));
    let events = follow(&store, job_id).await;
    producer.await.unwrap();

    let messages: Vec<_> = events.iter().map(|ev| ev.message.as_str()).collect();
    assert_eq!(
        messages,
        [
            "Downloading image and creating container…",
            "Container created, waiting for engine…",
            "Instance created successfully",
        ]
    );

    let terminals = events.iter().filter(|ev| ev.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert_eq!(events.last().unwrap().status, EventStatus::Complete);
    assert_eq!(store.get_state(job_id).await.unwrap(), JobState::Complete);
}

#[tokio::test]
async fn two_followers_read_identical_logs() {
    let store = Arc::new(MemoryJobStore::new());
    let job_id = Uuid::new_v4();
    store.init(job_id).await.unwrap();

    let producer = tokio::spawn(play_worker(store.clone(), job_id));
    let (first, second) = tokio::join!(follow(&store, job_id), follow(&store, job_id));
    producer.await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn failed_job_ends_in_a_single_error_event() {
    let store = Arc::new(MemoryJobStore::new());
    let job_id = Uuid::new_v4();
    store.init(job_id).await.unwrap();
    store.set_state(job_id, JobState::Running).await.unwrap();
    store
        .append(job_id, JobEvent::info("Downloading image and creating container…"))
        .await
        .unwrap();
    store
        .append(job_id, JobEvent::error("Erro ao criar container: conflito"))
        .await
        .unwrap();
    store.set_state(job_id, JobState::Error).await.unwrap();

    let events = follow(&store, job_id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].status, EventStatus::Error);
    assert_eq!(store.get_state(job_id).await.unwrap(), JobState::Error);
}
