/// HTTP request handlers
use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    async_trait,
    extract::{FromRequestParts, Json, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::StreamExt;
use ida_freeze_config::{
    now_utc, parse_timestamp, ActionKind, ActionStatus, ChangeKind, ChangeMode,
};
use ida_freeze_core::{Area, ChangeFilter, FreezeError, NewDataChange, StartRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::controller::{ActionController, Actor};

pub const USER_HEADER: &str = "x-ida-user";
pub const PROJECTS_HEADER: &str = "x-ida-projects";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: ActionController,
    pub start_time: Instant,
    /// Poll interval of data change streams
    pub stream_poll: Duration,
}

impl AppState {
    pub fn new(controller: ActionController) -> Self {
        Self {
            controller,
            start_time: Instant::now(),
            stream_poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Freeze(#[from] FreezeError),
}

fn status_of(err: &FreezeError) -> StatusCode {
    match err {
        FreezeError::Conflict(_) | FreezeError::Suspended(_) | FreezeError::LeaseConflict { .. } => {
            StatusCode::CONFLICT
        }
        FreezeError::ServiceOffline => StatusCode::SERVICE_UNAVAILABLE,
        FreezeError::Forbidden(_) => StatusCode::FORBIDDEN,
        FreezeError::NotFound(_) => StatusCode::NOT_FOUND,
        FreezeError::InvalidRequest(_)
        | FreezeError::EmptyScope(_)
        | FreezeError::TooManyFiles { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Freeze(err) => (status_of(err), err.kind()),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse::new(kind, self.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity as asserted by the authenticating front end.
pub struct Caller(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let user = header(USER_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("Missing caller identity".to_string()))?;
        let projects = header(PROJECTS_HEADER)
            .map(|v| split_list(&v))
            .unwrap_or_default();
        Ok(Caller(Actor::new(user, projects)))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_since(value: Option<&str>) -> Result<chrono::DateTime<chrono::Utc>, FreezeError> {
    match value {
        None => Ok(now_utc()),
        Some(value) => parse_timestamp(value).map_err(|e| {
            FreezeError::InvalidRequest(format!("Invalid timestamp {value}: {e}"))
        }),
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub project: String,
    pub pathname: String,
    #[serde(default)]
    pub batch: bool,
}

async fn start(
    state: AppState,
    actor: Actor,
    kind: ActionKind,
    request: ActionRequest,
) -> ApiResult<Response> {
    let request = StartRequest {
        project: request.project,
        pathname: request.pathname,
        kind,
        user: actor.user.clone(),
        batch: request.batch,
    };
    let action = state.controller.start(&actor, request).await?;
    Ok((StatusCode::ACCEPTED, Json(action)).into_response())
}

pub async fn freeze(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Response> {
    start(state, actor, ActionKind::Freeze, request).await
}

pub async fn unfreeze(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Response> {
    start(state, actor, ActionKind::Unfreeze, request).await
}

pub async fn delete(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Response> {
    start(state, actor, ActionKind::Delete, request).await
}

pub async fn retry(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    let action = state.controller.retry(&actor, &pid).await?;
    Ok((StatusCode::ACCEPTED, Json(action)).into_response())
}

pub async fn clear(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.clear(&actor, &pid)?).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    /// Comma separated project list
    pub projects: Option<String>,
}

impl ActionFilter {
    fn projects(&self) -> Vec<String> {
        self.projects.as_deref().map(split_list).unwrap_or_default()
    }
}

pub async fn clear_all(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(filter): Query<ActionFilter>,
) -> ApiResult<Response> {
    let cleared = state
        .controller
        .clear_all(&actor, filter.status, &filter.projects())?;
    Ok(Json(cleared).into_response())
}

pub async fn cancel(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.cancel(&actor, &pid).await?).into_response())
}

pub async fn get_action(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.status(&actor, &pid)?).into_response())
}

pub async fn list_actions(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(filter): Query<ActionFilter>,
) -> ApiResult<Response> {
    let actions = state
        .controller
        .list(&actor, filter.status, &filter.projects())?;
    Ok(Json(actions).into_response())
}

pub async fn count_actions(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(filter): Query<ActionFilter>,
) -> ApiResult<Response> {
    let count = state
        .controller
        .count(&actor, filter.status, &filter.projects())?;
    Ok(Json(json!({ "count": count })).into_response())
}

pub async fn action_files(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.action_files(&actor, &pid)?).into_response())
}

pub async fn get_file(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.file(&actor, &pid)?).into_response())
}

pub async fn file_by_node(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(node): Path<i64>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.file_by_node(&actor, node)?).into_response())
}

pub async fn file_by_pathname(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<Response> {
    let file = state
        .controller
        .file_by_pathname(&actor, &query.project, &query.pathname)?;
    Ok(Json(file).into_response())
}

pub async fn frozen_pids(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.frozen_pids(&actor, &project)?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub area: Option<Area>,
    pub scope: Option<String>,
}

pub async fn inventory(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<InventoryQuery>,
) -> ApiResult<Response> {
    let inventory = state
        .controller
        .inventory(&actor, &project, query.area, query.scope.as_deref())
        .await?;
    Ok(Json(inventory).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub project: String,
    pub pathname: String,
}

pub async fn scope_ok(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<Response> {
    state
        .controller
        .scope_ok(&actor, &query.project, &query.pathname)?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn suspend(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
) -> ApiResult<StatusCode> {
    state.controller.suspend(&actor, &project)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unsuspend(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
) -> ApiResult<StatusCode> {
    state.controller.unsuspend(&actor, &project)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn offline(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<StatusCode> {
    state.controller.set_offline(&actor, true)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn online(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<StatusCode> {
    state.controller.set_offline(&actor, false)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_change(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(change): Json<NewDataChange>,
) -> ApiResult<Response> {
    let record = state.controller.record_change(&actor, change)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeQuery {
    pub user: Option<String>,
    pub change: Option<ChangeKind>,
    pub mode: Option<ChangeMode>,
    pub limit: Option<usize>,
}

impl ChangeQuery {
    fn filter(&self) -> ChangeFilter {
        ChangeFilter {
            user: self.user.clone(),
            change: self.change,
            mode: self.mode,
        }
    }
}

pub async fn list_changes(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<ChangeQuery>,
) -> ApiResult<Response> {
    let changes = state
        .controller
        .changes(&actor, &project, &query.filter(), query.limit)?;
    Ok(Json(changes).into_response())
}

pub async fn last_change(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<ChangeQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.last_change(&actor, &project, &query.filter())?).into_response())
}

pub async fn init_details(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.controller.init_details(&actor, &project)?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub since: Option<String>,
    pub limit: Option<usize>,
}

pub async fn changes_since(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Response> {
    let since = match query.since.as_deref() {
        Some(since) => parse_since(Some(since))?,
        None => {
            return Err(FreezeError::InvalidRequest("Missing since timestamp".to_string()).into())
        }
    };
    let changes = state
        .controller
        .changes_since(&actor, &project, since, query.limit)?;
    Ok(Json(changes).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PathnameQuery {
    pub pathname: String,
}

pub async fn last_add(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<PathnameQuery>,
) -> ApiResult<Response> {
    match state.controller.last_add(&actor, &project, &query.pathname)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(FreezeError::NotFound(format!("no add of {}", query.pathname)).into()),
    }
}

/// Server-sent stream of data changes after `since` (default now)
pub async fn stream_changes(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(project): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Response> {
    let since = parse_since(query.since.as_deref())?;
    let changes = state
        .controller
        .watch_changes(&actor, &project, since, state.stream_poll)?;

    let stream = changes.filter_map(|change| async move {
        match serde_json::to_string(&change) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().event("change").data(json))),
            Err(e) => {
                tracing::warn!("Failed to encode data change: {}", e);
                None
            }
        }
    });

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response())
}
