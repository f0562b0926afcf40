//! Ambient HTTP/WS front-end (out of scope per spec §1, carried here only
//! as the thin transport the core is exercised through). Grounded on the
//! teacher's `R<T>`-wrapped JSON responses and `ws_user`
//! event-fan-out-over-websocket pattern in `server/mod.rs`.

use crate::session::{ConfigOverrides, SessionManager};
use crate::store::{Page, TaskFilter};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
}

#[derive(Serialize)]
struct R<T: Serialize> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> R<T> {
    fn ok(data: T) -> Json<R<T>> {
        Json(R { ok: true, data: Some(data), error: None })
    }
}

fn err_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<R<()>>) {
    (status, Json(R { ok: false, data: None, error: Some(message.into()) }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/start", post(start_task))
        .route("/sessions/{id}/stop", post(stop_task))
        .route("/sessions/{id}/ws", get(ws_subscribe))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_session(State(s): State<AppState>) -> impl IntoResponse {
    R::ok(serde_json::json!({"session_id": s.sessions.create_session()}))
}

#[derive(Deserialize)]
struct StartBody {
    description: String,
    #[serde(default)]
    max_steps: Option<u32>,
    #[serde(default)]
    device_id: Option<String>,
}

async fn start_task(State(s): State<AppState>, Path(session_id): Path<String>, Json(body): Json<StartBody>) -> impl IntoResponse {
    let overrides = ConfigOverrides { max_steps: body.max_steps, device_id: body.device_id, language: None };
    match s.sessions.start(&session_id, body.description, overrides).await {
        Ok(task_id) => R::ok(serde_json::json!({"task_id": task_id})).into_response(),
        Err(crate::errors::AgentError::SessionBusy) => err_response(StatusCode::CONFLICT, "session already has a running task").into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stop_task(State(s): State<AppState>, Path(session_id): Path<String>) -> impl IntoResponse {
    s.sessions.stop(&session_id);
    R::ok("stop signalled")
}

#[derive(Deserialize)]
struct ListTasksQuery {
    session_id: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn list_tasks(State(s): State<AppState>, Query(q): Query<ListTasksQuery>) -> impl IntoResponse {
    let filter = TaskFilter { session_id: q.session_id, status: None };
    let page = Page { offset: q.offset.unwrap_or(0), limit: q.limit.unwrap_or(50) };
    match s.sessions.list_tasks(filter, page).await {
        Ok(tasks) => R::ok(tasks).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_task(State(s): State<AppState>, Path(task_id): Path<String>) -> impl IntoResponse {
    match s.sessions.query(&task_id).await {
        Ok(Some(task)) => R::ok(task).into_response(),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "no such task").into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_subscribe(ws: WebSocketUpgrade, State(s): State<AppState>, Path(session_id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, s, session_id))
}

async fn handle_subscriber(mut socket: WebSocket, state: AppState, session_id: String) {
    info!(session_id, "event subscriber connected");
    let mut rx = state.sessions.subscribe(&session_id);
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let json = serde_json::to_string(&event).unwrap_or_default();
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
    info!(session_id, "event subscriber disconnected");
}
