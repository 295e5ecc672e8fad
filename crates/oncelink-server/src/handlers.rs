use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{Error, Result},
    lifecycle::secret_path,
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub url: String,
}

/// The body is parsed by hand so every malformed payload maps to 400,
/// including one that overruns the router's body limit.
pub async fn create_secret(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<CreateResponse>> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Error::BadRequest(format!(
                "secret exceeds {} byte limit",
                state.engine.max_secret_bytes()
            ))
        } else {
            Error::BadRequest("invalid request".into())
        }
    })?;
    let req: CreateRequest = serde_json::from_slice(&body)
        .map_err(|_| Error::BadRequest("invalid request".into()))?;

    let id = state.engine.create(&req.secret)?;
    Ok(Json(CreateResponse {
        url: format!("{}{}", state.public_url, secret_path(id)),
    }))
}

// ── Reveal ────────────────────────────────────────────────────────────────────

pub async fn get_secret(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    reveal(&state, &id)
}

/// `GET /secret/` carries an empty id, which is malformed rather than unknown.
pub async fn get_secret_without_id(State(state): State<AppState>) -> Result<Response> {
    reveal(&state, "")
}

fn reveal(state: &AppState, raw_id: &str) -> Result<Response> {
    let mut body = state.engine.reveal(raw_id)?;
    body.push(b'\n');
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}
