use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fog_common::{FogStateSnapshot, Hub, Identity};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::archive::FogArchive;
use crate::config::Config;
use crate::recorder::{self, RecorderRegistry};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub archive: Arc<Mutex<FogArchive>>,
    pub valkey: redis::aio::MultiplexedConnection,
    pub config: Arc<Config>,
    pub recorders: Arc<RecorderRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/fog/{session}/{map}", get(get_fog).put(put_fog))
        .route("/api/sessions/{session}/maps", get(get_session_maps))
        .route("/api/sessions/{session}/peers", get(get_session_peers))
        .route("/ws/{session}", get(ws_upgrade))
        .with_state(state)
}

/// Start the session's recorder unless one is already running. Call after the
/// connection's presence is tracked.
pub async fn ensure_recorder(state: &AppState, session_id: &str) {
    let started = state
        .recorders
        .ensure(session_id, || {
            recorder::run(
                state.hub.clone(),
                state.archive.clone(),
                state.recorders.clone(),
                session_id.to_string(),
                state.config.persist_debounce,
            )
        })
        .await;
    if started {
        tracing::debug!("Spawned recorder for session {}", session_id);
    }
}

async fn get_fog(
    State(state): State<AppState>,
    Path((session, map)): Path<(String, String)>,
) -> impl IntoResponse {
    let snapshot = {
        let mut archive = state.archive.lock().await;
        archive.get_snapshot(&session, &map).await
    };

    match snapshot {
        Some(snapshot) => (
            [(header::CACHE_CONTROL, "no-cache, must-revalidate")],
            Json(snapshot),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_fog(
    State(state): State<AppState>,
    Path((session, map)): Path<(String, String)>,
    Json(snapshot): Json<FogStateSnapshot>,
) -> impl IntoResponse {
    if let Err((status, message)) = admit_put(&state.hub, &session, &snapshot) {
        tracing::warn!("Refused fog PUT for {}/{}: {}", session, map, message);
        return (status, Json(serde_json::json!({ "error": message }))).into_response();
    }

    state
        .archive
        .lock()
        .await
        .put_snapshot(&session, &map, snapshot)
        .await;
    tracing::info!("Stored fog for {}/{} via API", session, map);
    StatusCode::NO_CONTENT.into_response()
}

/// Direct writes are for sessions nobody is connected to. A live session's
/// recorder persists the mirrored state and would overwrite them.
fn admit_put(hub: &Hub, session_id: &str, snapshot: &FogStateSnapshot) -> Result<(), (StatusCode, String)> {
    snapshot
        .validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    if !hub.presence(session_id).is_empty() {
        return Err((
            StatusCode::CONFLICT,
            format!("session {} is live, publish fog through its channel", session_id),
        ));
    }
    Ok(())
}

async fn get_session_maps(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> impl IntoResponse {
    let maps = state.archive.lock().await.list_maps(&session).await;
    Json(serde_json::json!({
        "session_id": session,
        "maps": maps
    }))
}

async fn get_session_peers(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "session_id": session,
        "peers": state.hub.presence(&session)
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let pong: redis::RedisResult<String> = redis::cmd("PING")
        .query_async(&mut state.valkey.clone())
        .await;
    let valkey_ok = pong.is_ok();

    let recorders = state.recorders.len().await;

    Json(serde_json::json!({
        "status": if valkey_ok { "ok" } else { "degraded" },
        "valkey": valkey_ok,
        "sessions": state.hub.topic_count(),
        "recorders": recorders
    }))
}

#[derive(Deserialize)]
struct ConnectQuery {
    user_id: Option<String>,
    #[serde(default)]
    dm: bool,
}

impl ConnectQuery {
    fn identity(self) -> Identity {
        match self.user_id.filter(|id| !id.trim().is_empty()) {
            Some(user_id) => Identity::new(user_id, self.dm),
            None => Identity::anonymous(),
        }
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    let identity = query.identity();
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state, session, identity))
}
