/**
 * HTTP API - Caller-facing surface of the kernel
 *
 * ROLE:
 * The seam used by the GUI / CLI: inspect discovered devices, manage the
 * directory, preview an intent's compiled commands and dispatch them.
 *
 * OPERATION:
 * - axum router, JSON in and out
 * - Compile failures answer 422 with a typed kind; nothing is sent
 * - Dispatch reports one outcome per command, per target device
 *
 * SECURITY:
 * - x-api-key header required on every route except /health
 * - Key from BASTION_API_KEY; unset key denies all access
 */

use crate::channel::{DeliveryOutcome, SharedChannelManager};
use crate::compiler::{compile, preview, CompileError, CompiledCommand, StructuredIntent};
use crate::directory::{AliasEntry, AliasError, Directory, GroupEntry};
use crate::health::{HealthTracker, KernelHealth};
use crate::services::ServiceEntry;
use crate::sessions::{DeviceSession, SessionState};
use crate::state::Shared;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub directory: Shared<Directory>,
    pub channels: SharedChannelManager,
    pub health_tracker: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/aliases", get(list_aliases).post(add_alias))
        .route("/aliases/{name}", delete(delete_alias))
        .route("/groups", get(list_groups).post(add_group))
        .route("/groups/{name}", delete(delete_group))
        .route("/services", get(list_services))
        .route("/policy/preview", post(preview_policy))
        .route("/policy/dispatch", post(dispatch_policy))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("BASTION_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("[http] BASTION_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected request to {} without valid key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl ToString) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": kind, "message": message.to_string() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<CompileError> for ApiError {
    fn from(e: CompileError) -> Self {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.kind(), &e)
    }
}

impl From<AliasError> for ApiError {
    fn from(e: AliasError) -> Self {
        match &e {
            AliasError::Conflict { existing_alias, existing_address, .. } => ApiError {
                status: StatusCode::CONFLICT,
                body: serde_json::json!({
                    "error": "conflict",
                    "message": e.to_string(),
                    "existing_alias": existing_alias,
                    "existing_address": existing_address,
                }),
            },
            AliasError::NameTaken(_) => ApiError::new(StatusCode::CONFLICT, "name_taken", &e),
            AliasError::InvalidAlias(_) => ApiError::new(StatusCode::BAD_REQUEST, "invalid_alias", &e),
            AliasError::UnknownMember(_) => ApiError::new(StatusCode::BAD_REQUEST, "unknown_member", &e),
            AliasError::EmptyGroup(_) => ApiError::new(StatusCode::BAD_REQUEST, "empty_group", &e),
        }
    }
}

#[derive(Serialize)]
struct SessionView {
    device_id: String,
    alias: Option<String>,
    agent_id: String,
    hostname: String,
    state: SessionState,
    last_seen: String,
    seen_ago_seconds: i64,
    last_error: Option<String>,
}

fn to_view(s: &DeviceSession, directory: &Directory, now: OffsetDateTime) -> SessionView {
    let alias = match s.device_id.ip() {
        std::net::IpAddr::V4(ip) => directory.alias_for(ip).map(str::to_string),
        std::net::IpAddr::V6(_) => None,
    };
    SessionView {
        device_id: s.device_id.to_string(),
        alias,
        agent_id: s.agent_id.clone(),
        hostname: s.hostname.clone(),
        state: s.state,
        last_seen: s.last_seen.format(&Rfc3339).unwrap_or_default(),
        seen_ago_seconds: (now - s.last_seen).whole_seconds().max(0),
        last_error: s.last_error.clone(),
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.directory, &app.channels))
}

// GET /devices
async fn get_devices(State(app): State<AppState>) -> Json<Vec<SessionView>> {
    let sessions = app.channels.sessions().snapshot();
    let now = OffsetDateTime::now_utc();
    let directory = app.directory.read();
    Json(sessions.iter().map(|s| to_view(s, &directory, now)).collect())
}

// GET /aliases
async fn list_aliases(State(app): State<AppState>) -> Json<Vec<AliasEntry>> {
    Json(app.directory.read().aliases())
}

#[derive(Debug, Deserialize)]
struct AliasRequest {
    name: String,
    address: Ipv4Addr,
    #[serde(default)]
    replace: bool,
}

// POST /aliases
async fn add_alias(
    State(app): State<AppState>,
    Json(req): Json<AliasRequest>,
) -> Result<(StatusCode, Json<AliasEntry>), ApiError> {
    {
        let mut directory = app.directory.write();
        if req.replace {
            directory.replace_alias(&req.name, req.address)?;
        } else {
            directory.register_alias(&req.name, req.address)?;
        }
    }
    info!("[http] alias {} -> {}", req.name.trim(), req.address);
    Ok((StatusCode::CREATED, Json(AliasEntry { alias: req.name.trim().to_string(), address: req.address })))
}

// DELETE /aliases/{name}
async fn delete_alias(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match app.directory.write().remove_alias(&name) {
        Some(address) => Ok(Json(serde_json::json!({ "status": "deleted", "address": address }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /groups
async fn list_groups(State(app): State<AppState>) -> Json<Vec<GroupEntry>> {
    Json(app.directory.read().groups())
}

#[derive(Debug, Deserialize)]
struct GroupRequest {
    name: String,
    members: Vec<String>,
}

// POST /groups
async fn add_group(
    State(app): State<AppState>,
    Json(req): Json<GroupRequest>,
) -> Result<(StatusCode, Json<GroupEntry>), ApiError> {
    let members = app.directory.write().register_group(&req.name, &req.members)?;
    Ok((StatusCode::CREATED, Json(GroupEntry { name: req.name.trim().to_string(), members })))
}

// DELETE /groups/{name}
async fn delete_group(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match app.directory.write().remove_group(&name) {
        Some(_) => Ok(Json(serde_json::json!({ "status": "deleted" }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /services
async fn list_services(State(app): State<AppState>) -> Json<Vec<ServiceEntry>> {
    Json(app.directory.read().services().list())
}

#[derive(Debug, Deserialize)]
struct PolicyRequest {
    intent: StructuredIntent,
    #[serde(default)]
    fallback_target: Option<String>,
}

#[derive(Serialize)]
struct PreviewResponse {
    commands: Vec<CompiledCommand>,
    preview: String,
}

// POST /policy/preview
async fn preview_policy(
    State(app): State<AppState>,
    Json(req): Json<PolicyRequest>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let directory = app.directory.read();
    let commands = compile(&req.intent, req.fallback_target.as_deref(), &directory)?;
    let preview = preview(&commands, &directory);
    Ok(Json(PreviewResponse { commands, preview }))
}

#[derive(Debug, Serialize)]
struct CommandReport {
    raw_text: String,
    #[serde(flatten)]
    outcome: DeliveryOutcome,
}

#[derive(Debug, Serialize)]
struct TargetReport {
    target: Ipv4Addr,
    alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
    commands: Vec<CommandReport>,
}

#[derive(Serialize)]
struct DispatchResponse {
    dispatch_id: String,
    targets: Vec<TargetReport>,
}

/// Commands per target device, targets ascending, command order kept
fn group_by_target(commands: &[CompiledCommand]) -> Vec<(Ipv4Addr, Vec<String>)> {
    let mut grouped: Vec<(Ipv4Addr, Vec<String>)> = Vec::new();
    for cmd in commands {
        match grouped.iter_mut().find(|(target, _)| *target == cmd.target_device()) {
            Some((_, texts)) => texts.push(cmd.raw_text().to_string()),
            None => grouped.push((cmd.target_device(), vec![cmd.raw_text().to_string()])),
        }
    }
    grouped.sort_by_key(|(target, _)| *target);
    grouped
}

// POST /policy/dispatch
async fn dispatch_policy(
    State(app): State<AppState>,
    Json(req): Json<PolicyRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let (grouped, aliases) = {
        let directory = app.directory.read();
        let commands = compile(&req.intent, req.fallback_target.as_deref(), &directory)?;
        let grouped = group_by_target(&commands);
        let aliases: Vec<Option<String>> = grouped
            .iter()
            .map(|(target, _)| directory.alias_for(*target).map(str::to_string))
            .collect();
        (grouped, aliases)
    };

    let dispatch_id = Uuid::new_v4().to_string();
    info!("[http] dispatch {} to {} device(s)", dispatch_id, grouped.len());

    // devices are independent; each one keeps its own command order
    let mut tasks = JoinSet::new();
    for (index, (target, texts)) in grouped.into_iter().enumerate() {
        let channels = app.channels.clone();
        tasks.spawn(async move {
            let result = channels.dispatch(target, &texts).await;
            (index, target, texts, result)
        });
    }

    let mut targets: Vec<(usize, TargetReport)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let Ok((index, target, texts, result)) = joined else {
            warn!("[http] dispatch task for {} panicked", dispatch_id);
            continue;
        };
        let alias = aliases.get(index).cloned().flatten();
        let report = match result {
            Ok(outcomes) => TargetReport {
                target,
                alias,
                error: None,
                commands: texts
                    .into_iter()
                    .zip(outcomes)
                    .map(|(raw_text, outcome)| CommandReport { raw_text, outcome })
                    .collect(),
            },
            Err(e) => TargetReport {
                target,
                alias,
                error: Some(serde_json::json!({ "error": e.kind(), "message": e.to_string() })),
                commands: Vec::new(),
            },
        };
        targets.push((index, report));
    }
    targets.sort_by_key(|(index, _)| *index);

    Ok(Json(DispatchResponse {
        dispatch_id,
        targets: targets.into_iter().map(|(_, report)| report).collect(),
    }))
}
