//! Mock relay REST server
//!
//! Serves `/health` and the `/rooms/{roomId}/...` endpoints the poll
//! transport uses, on a random local port. Bearer tokens map to fixed
//! identities; unknown tokens get 401.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use consult_rtc::signaling::protocol::{
    JoinRequest, JoinResponse, MessagesResponse, RelayRecord, RoomStatus, SignalRequest,
};
use consult_rtc::Role;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Default)]
struct RelayState {
    /// token -> (user id, role)
    users: HashMap<String, (String, Role)>,
    /// room -> members
    rooms: HashMap<String, Vec<(String, Role)>>,
    records: HashMap<String, Vec<RelayRecord>>,
    joins: usize,
    signals: usize,
}

type Shared = Arc<Mutex<RelayState>>;

fn relay_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn caller(state: &Shared, headers: &HeaderMap) -> Option<(String, Role)> {
    let token = headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    state.lock().users.get(token).cloned()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid token").into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn join(
    State(state): State<Shared>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(_request): Json<JoinRequest>,
) -> Response {
    let Some((user_id, role)) = caller(&state, &headers) else {
        return unauthorized();
    };
    let mut relay = state.lock();
    relay.joins += 1;
    let members = relay.rooms.entry(room).or_default();
    members.retain(|(id, _)| *id != user_id);
    members.push((user_id.clone(), role));
    Json(JoinResponse { user_id }).into_response()
}

async fn leave(State(state): State<Shared>, Path(room): Path<String>, headers: HeaderMap) -> Response {
    let Some((user_id, _)) = caller(&state, &headers) else {
        return unauthorized();
    };
    if let Some(members) = state.lock().rooms.get_mut(&room) {
        members.retain(|(id, _)| *id != user_id);
    }
    StatusCode::OK.into_response()
}

async fn signal(
    State(state): State<Shared>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SignalRequest>,
) -> Response {
    let Some((user_id, role)) = caller(&state, &headers) else {
        return unauthorized();
    };
    let mut relay = state.lock();
    relay.signals += 1;
    relay.records.entry(room).or_default().push(RelayRecord {
        user_id,
        user_role: Some(role),
        timestamp: relay_clock(),
        signal: request.signal,
        target_id: request.target_id,
    });
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct Since {
    since: Option<f64>,
}

async fn messages(
    State(state): State<Shared>,
    Path(room): Path<String>,
    Query(query): Query<Since>,
    headers: HeaderMap,
) -> Response {
    if caller(&state, &headers).is_none() {
        return unauthorized();
    }
    let since = query.since.unwrap_or_default();
    let server_time = relay_clock();
    let messages: Vec<RelayRecord> = state
        .lock()
        .records
        .get(&room)
        .map(|records| {
            records
                .iter()
                .filter(|r| r.timestamp > since && r.timestamp <= server_time)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Json(MessagesResponse {
        messages,
        server_time,
    })
    .into_response()
}

async fn status(State(state): State<Shared>, Path(room): Path<String>, headers: HeaderMap) -> Response {
    if caller(&state, &headers).is_none() {
        return unauthorized();
    }
    let relay = state.lock();
    let members = relay.rooms.get(&room);
    let present = |role: Role| members.map_or(false, |m| m.iter().any(|(_, r)| *r == role));
    Json(RoomStatus {
        has_active_call: members.map_or(false, |m| !m.is_empty()),
        doctor_joined: present(Role::Doctor),
        patient_joined: present(Role::Patient),
    })
    .into_response()
}

/// Mock relay on a random local port
pub struct MockRelayServer {
    addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl MockRelayServer {
    /// Start serving; `users` maps bearer tokens to identities
    pub async fn start(users: &[(&str, &str, Role)]) -> std::io::Result<Self> {
        let state: Shared = Arc::new(Mutex::new(RelayState {
            users: users
                .iter()
                .map(|(token, id, role)| (token.to_string(), (id.to_string(), *role)))
                .collect(),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/health", get(health))
            .route("/rooms/:room/join", post(join))
            .route("/rooms/:room/leave", post(leave))
            .route("/rooms/:room/signal", post(signal))
            .route("/rooms/:room/messages", get(messages))
            .route("/rooms/:room/status", get(status))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        info!("Mock relay listening on {}", addr);

        Ok(Self { addr, state, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn joins(&self) -> usize {
        self.state.lock().joins
    }

    pub fn signals(&self) -> usize {
        self.state.lock().signals
    }

    pub fn members(&self, room: &str) -> usize {
        self.state.lock().rooms.get(room).map_or(0, |m| m.len())
    }
}

impl Drop for MockRelayServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
