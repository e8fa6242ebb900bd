use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::ApiError,
    leaderboard::{Leaderboard, RankedEntry},
    maze::{MazeCatalog, MazeSummary},
    metrics::MetricsRegistry,
    models::{
        CreateSubmissionResponse, Direction, MoveStatus, Position, SessionStatus,
        SubmissionRequest, SubmissionStatus, SubmissionStatusResponse,
    },
    queue::{QueuedJob, Scheduler},
    ratelimit::UserRateLimiter,
    session::{SessionRegistry, constant_time_eq},
    store::SubmissionStore,
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    store: Arc<SubmissionStore>,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
    rate_limiter: UserRateLimiter,
    sessions: Arc<SessionRegistry>,
    mazes: Arc<MazeCatalog>,
    leaderboard: Leaderboard,
}

#[allow(clippy::too_many_arguments)]
pub fn routes(
    config: Arc<AppConfig>,
    store: Arc<SubmissionStore>,
    scheduler: Scheduler,
    metrics_registry: Arc<MetricsRegistry>,
    sessions: Arc<SessionRegistry>,
    mazes: Arc<MazeCatalog>,
    leaderboard: Leaderboard,
) -> Router {
    let rate_limiter = UserRateLimiter::new(
        config.submit_rate_per_minute,
        config.submit_rate_burst,
    );
    let state = AppState {
        config,
        store,
        scheduler,
        metrics: metrics_registry,
        rate_limiter,
        sessions,
        mazes,
        leaderboard,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/mazes", get(list_mazes))
        .route("/v1/mazes/{id}", get(get_maze))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/look", post(look))
        .route("/v1/sessions/{id}/move", post(move_session))
        .route("/v1/sessions/{id}/abandon", post(abandon_session))
        .route("/v1/submissions", post(create_submission).get(list_submissions))
        .route("/v1/submissions/{id}", get(get_submission))
        .route("/v1/leaderboard", get(get_leaderboard))
        .route("/v1/leaderboard/ws", get(leaderboard_ws))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

// ---- maze catalog ----

async fn list_mazes(State(state): State<AppState>) -> Json<Vec<MazeSummary>> {
    Json(state.mazes.list())
}

async fn get_maze(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MazeSummary>, ApiError> {
    state
        .mazes
        .list()
        .into_iter()
        .find(|m| m.id == id)
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// ---- sessions ----

#[derive(Debug, Deserialize)]
struct SessionCreateRequest {
    maze_id: String,
}

#[derive(Debug, Serialize)]
struct SessionCreateResponse {
    session_id: Uuid,
    token: String,
    position: Position,
    turns: u32,
}

#[derive(Debug, Serialize)]
struct SessionStateResponse {
    session_id: Uuid,
    maze_id: String,
    status: SessionStatus,
    position: Position,
    turns: u32,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    direction: Direction,
}

#[derive(Debug, Serialize)]
struct MoveResponse {
    status: MoveStatus,
    position: Position,
    turns: u32,
}

#[derive(Debug, Serialize)]
struct LookResponse {
    north: char,
    south: char,
    east: char,
    west: char,
    current: char,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SessionCreateRequest>,
) -> Result<(StatusCode, Json<SessionCreateResponse>), ApiError> {
    let user = authenticate(&state.config, &headers)?;
    let maze = state
        .mazes
        .get(&request.maze_id)
        .ok_or(ApiError::NotFound)?;

    let start = maze.start();
    let (session_id, token) = state.sessions.create(&user, &request.maze_id, maze);
    Ok((
        StatusCode::CREATED,
        Json(SessionCreateResponse {
            session_id,
            token,
            position: start,
            turns: 0,
        }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let session = authorize_session(&state, &headers, &id)?;
    let session = session.lock().await;
    Ok(Json(SessionStateResponse {
        session_id: id,
        maze_id: session.maze_id.clone(),
        status: session.status(),
        position: session.position(),
        turns: session.turns(),
    }))
}

async fn look(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<LookResponse>, ApiError> {
    let session = authorize_session(&state, &headers, &id)?;
    let view = session.lock().await.look();
    Ok(Json(LookResponse {
        north: view.north.as_look_char(),
        south: view.south.as_look_char(),
        east: view.east.as_look_char(),
        west: view.west.as_look_char(),
        current: view.current.as_look_char(),
    }))
}

async fn move_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<MoveResponse>, ApiError> {
    let session = authorize_session(&state, &headers, &id)?;
    let mut session = session.lock().await;
    let report = session
        .move_(request.direction)
        .map_err(|err| ApiError::InvalidState(err.to_string()))?;
    Ok(Json(MoveResponse {
        status: report.status,
        position: report.position,
        turns: report.turns,
    }))
}

async fn abandon_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let session = authorize_session(&state, &headers, &id)?;
    session
        .lock()
        .await
        .abandon()
        .map_err(|err| ApiError::InvalidState(err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- submissions ----

#[derive(Debug, Deserialize)]
struct SubmissionListQuery {
    maze_id: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

async fn create_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmissionRequest>,
) -> Result<(StatusCode, Json<CreateSubmissionResponse>), ApiError> {
    let user = authenticate(&state.config, &headers)?;
    if !state.rate_limiter.allow(&user).await {
        return Err(ApiError::RateLimited);
    }

    validate_submission(&state.config, &request)?;
    if state.mazes.get(&request.maze_id).is_none() {
        return Err(ApiError::NotFound);
    }

    let id = Uuid::new_v4();
    let limits = state.config.default_limits.clone().normalized();
    let record = state
        .store
        .create_record(id, user.clone(), request.maze_id.clone());
    state.store.insert(record);

    if let Err(err) = state.scheduler.submit(QueuedJob {
        id,
        user,
        maze_id: request.maze_id,
        code: request.code,
        limits,
    }) {
        state.store.remove(&id);
        return Err(err);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateSubmissionResponse {
            id,
            status: SubmissionStatus::Pending,
        }),
    ))
}

async fn get_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionStatusResponse>, ApiError> {
    let user = authenticate(&state.config, &headers)?;
    let record = state.store.get(&id).ok_or(ApiError::NotFound)?;
    if record.user != user {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(record.into()))
}

async fn list_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SubmissionListQuery>,
) -> Result<Json<Vec<SubmissionStatusResponse>>, ApiError> {
    let user = authenticate(&state.config, &headers)?;
    let limit = query.limit.min(100);
    let records = state
        .store
        .list_for_user(&user, limit)
        .into_iter()
        .filter(|r| {
            query
                .maze_id
                .as_ref()
                .is_none_or(|maze_id| &r.maze_id == maze_id)
        })
        .map(Into::into)
        .collect();
    Ok(Json(records))
}

// ---- leaderboard ----

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    maze_id: String,
    #[serde(default = "default_board_limit")]
    limit: usize,
}

fn default_board_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct LeaderboardResponse {
    maze_id: String,
    entries: Vec<RankedEntry>,
}

async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let limit = query.limit.min(500);
    let entries = state.leaderboard.top(&query.maze_id, limit).await?;
    Ok(Json(LeaderboardResponse {
        maze_id: query.maze_id,
        entries,
    }))
}

async fn leaderboard_ws(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let leaderboard = state.leaderboard.clone();
    upgrade.on_upgrade(move |socket| stream_score_events(socket, leaderboard))
}

async fn stream_score_events(mut socket: WebSocket, leaderboard: Leaderboard) {
    let mut events = leaderboard.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "leaderboard subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---- shared helpers ----

fn authenticate(config: &AppConfig, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    for (candidate_key, user) in &config.api_keys {
        if constant_time_eq(key.as_bytes(), candidate_key.as_bytes()) {
            return Ok(user.clone());
        }
    }
    Err(ApiError::Unauthorized)
}

fn authorize_session(
    state: &AppState,
    headers: &HeaderMap,
    id: &Uuid,
) -> Result<Arc<tokio::sync::Mutex<crate::session::Session>>, ApiError> {
    let token = headers
        .get("x-session-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    state
        .sessions
        .authorize(id, token)
        .ok_or(ApiError::Forbidden)
}

fn validate_submission(config: &AppConfig, request: &SubmissionRequest) -> Result<(), ApiError> {
    if request.code.trim().is_empty() {
        return Err(ApiError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > config.max_code_bytes {
        return Err(ApiError::InvalidRequest(format!(
            "code exceeds {} bytes",
            config.max_code_bytes
        )));
    }
    if request.maze_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("maze_id is empty".to_string()));
    }
    Ok(())
}
