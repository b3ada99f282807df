//! Integration tests for the HTTP surface.
//!
//! Covers the auth gate, intake validation (which must reject before any
//! runtime call) and the job polling endpoint, all against the in-memory job
//! store. Paths that need a live daemon or broker are exercised elsewhere.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use server_core::kernel::jobs::{JobEvent, JobState, JobStore};
use tower::ServiceExt;
use uuid::Uuid;

use common::{memory_store, test_app, test_config};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app(test_config(), memory_store());
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert!(json["status"] == "ok" || json["status"] == "degraded");
    assert_eq!(json["checks"]["api"], "ok");
    assert!(json["timestamp"].is_f64());
}

#[tokio::test]
async fn missing_token_is_401() {
    let app = test_app(test_config(), memory_store());
    let response = app.oneshot(get("/instances", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_token_is_403() {
    let app = test_app(test_config(), memory_store());
    let response = app.oneshot(get("/instances", Some("nope"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["detail"], "Token inválido");
}

#[tokio::test]
async fn unconfigured_token_fails_closed() {
    let mut config = test_config();
    config.api_auth_token = None;
    let app = test_app(config, memory_store());
    let response = app
        .oneshot(get("/instances", Some("anything")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn invalid_name_is_rejected_before_any_runtime_call() {
    let app = test_app(test_config(), memory_store());
    let response = app
        .oneshot(post_json(
            "/enqueue-instance",
            "test-token",
            &serde_json::json!({"name": "Alice!", "version": "latest"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(
        json["detail"],
        "Nome deve conter apenas letras minusculas, numeros e hifens (2-32 chars)"
    );
}

#[tokio::test]
async fn invalid_version_is_rejected_at_intake() {
    let app = test_app(test_config(), memory_store());
    let response = app
        .oneshot(post_json(
            "/create-instance",
            "test-token",
            &serde_json::json!({"name": "alice", "version": "2.0"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = test_app(test_config(), memory_store());
    let uri = format!("/job/{}/events?since=0", Uuid::new_v4());
    let response = app.oneshot(get(&uri, Some("test-token"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["detail"], "Job não encontrado ou expirado");
}

#[tokio::test]
async fn job_events_paginate_by_index() {
    let store = memory_store();
    let job_id = Uuid::new_v4();
    store.init(job_id).await.unwrap();
    store.set_state(job_id, JobState::Running).await.unwrap();
    store
        .append(job_id, JobEvent::info("Downloading image and creating container…"))
        .await
        .unwrap();
    store
        .append(job_id, JobEvent::info("Container created, waiting for engine…"))
        .await
        .unwrap();

    let app = test_app(test_config(), store);

    let uri = format!("/job/{job_id}/events?since=0");
    let response = app
        .clone()
        .oneshot(get(&uri, Some("test-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["state"], "running");
    assert_eq!(json["events"].as_array().unwrap().len(), 2);
    assert_eq!(json["next_index"], 2);

    let uri = format!("/job/{job_id}/events?since=2");
    let response = app.oneshot(get(&uri, Some("test-token"))).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["events"].as_array().unwrap().len(), 0);
    assert_eq!(json["next_index"], 2);
}

#[tokio::test]
async fn locations_are_static() {
    let app = test_app(test_config(), memory_store());
    let response = app
        .oneshot(get("/locations", Some("test-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["locations"][0]["id"], "vinhedo");
}

#[tokio::test]
async fn active_jobs_listing_reads_the_store() {
    let store = memory_store();
    let job_id = Uuid::new_v4();
    store.init(job_id).await.unwrap();
    store.set_state(job_id, JobState::Running).await.unwrap();
    store
        .append(job_id, JobEvent::info("Criando container..."))
        .await
        .unwrap();

    let app = test_app(test_config(), store);
    let response = app.oneshot(get("/jobs", Some("test-token"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_id"], job_id.to_string());
    assert_eq!(jobs[0]["last_message"], "Criando container...");
}
