use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tracing::warn;

use super::controller::{DeployRequest, PreviewController};
use super::github::is_valid_github_token;
use super::models::{Credential, DeviceMode, RepoRef};
use super::ws;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: PreviewController,
    /// Used when a deploy request does not carry its own token.
    pub default_token: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeployBody {
    /// `owner/repo` or a GitHub URL.
    pub repo: String,
    pub branch: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct DeviceBody {
    pub mode: String,
}

#[derive(Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/deploy", post(deploy))
        .route("/api/stop", post(stop))
        .route("/api/status", get(status))
        .route("/api/console", get(console))
        .route("/api/device", put(set_device))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn deploy(
    State(state): State<SharedState>,
    Json(body): Json<DeployBody>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = body.branch.as_deref().unwrap_or("main");
    let repo = RepoRef::parse(&body.repo, branch).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Invalid repository '{}': expected owner/repo or a GitHub URL",
            body.repo
        ))
    })?;
    let token = body
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| state.default_token.clone())
        .ok_or_else(|| ApiError::Unauthorized("No GitHub token provided or configured".into()))?;
    if !is_valid_github_token(&token) {
        warn!("GitHub token does not have a recognized prefix");
    }

    let outcome = state.controller.deploy(DeployRequest {
        repo,
        credential: Credential::new(token),
    });
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn stop(State(state): State<SharedState>) -> impl IntoResponse {
    state.controller.stop();
    Json(state.controller.snapshot())
}

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.controller.snapshot())
}

/// Plain console text, or the entries after `since` as JSON.
async fn console(
    State(state): State<SharedState>,
    Query(query): Query<ConsoleQuery>,
) -> Response {
    match query.since {
        Some(seq) => Json(state.controller.console().entries_since(seq)).into_response(),
        None => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            state.controller.console().text(),
        )
            .into_response(),
    }
}

async fn set_device(
    State(state): State<SharedState>,
    Json(body): Json<DeviceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = DeviceMode::from_str(&body.mode).map_err(ApiError::BadRequest)?;
    Ok(Json(state.controller.set_device_mode(mode)))
}
