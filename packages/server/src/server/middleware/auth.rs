//! Shared bearer-token authentication.
//!
//! Single-token scheme: missing header is 401, wrong token is 403, and a
//! server without a configured token fails closed with 500 instead of
//! granting open access.

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::server::error::ApiError;

pub async fn require_bearer(
    configured: Option<String>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    match check_bearer(configured.as_deref(), header.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

fn check_bearer(configured: Option<&str>, header: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = configured.filter(|t| !t.is_empty()) else {
        return Err(ApiError::internal(
            "Token da API nao configurado no servidor",
        ));
    };
    let Some(header) = header else {
        return Err(ApiError::unauthorized("Não autenticado"));
    };
    let Some(provided) = header.strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized("Não autenticado"));
    };
    if provided != expected {
        return Err(ApiError::forbidden("Token inválido"));
    }
    Ok(())
}
