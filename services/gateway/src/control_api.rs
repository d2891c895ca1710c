//! HTTP control API for the gateway.
//!
//! Routes:
//!   PUT    /connection                    - add a connection, start its engine
//!   GET    /connection                    - list connections
//!   GET    /connection/{uuid}             - read connection + queue status
//!   DELETE /connection/{uuid}             - stop engine, destroy state
//!   PUT    /connection/{uuid}/send        - queue an outbound message
//!   GET    /connection/{uuid}/status/{id} - read a stored message
//!   GET    /healthz                       - liveness
//!
//! Body parsing is done by hand from `serde_json::Value` so malformed input
//! is consistently a 400, matching the error contract (unknown ids are 400,
//! storage failures are 500).

use crate::config::TwitterAppConfig;
use crate::engine::{ConnectionEngine, SharedStore};
use axum::routing::get;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use courier_core::{Connection, ConnectionStatus, MsgPool, Priority, Status, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: SharedStore,
    pub pool: Arc<MsgPool>,
    /// conn uuid → running engine. Mutated only by the add/delete paths.
    pub engines: RwLock<HashMap<String, ConnectionEngine>>,
    pub twitter: Option<TwitterAppConfig>,
}

impl AppState {
    pub fn new(store: Store, twitter: Option<TwitterAppConfig>) -> Arc<Self> {
        Arc::new(AppState {
            store: Arc::new(Mutex::new(store)),
            pool: Arc::new(MsgPool::new()),
            engines: RwLock::new(HashMap::new()),
            twitter,
        })
    }
}

// ---------------------------------------------------------------------------
// Request/Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ConnectionListResponse {
    connections: Vec<Connection>,
}

#[derive(Debug, Serialize)]
struct ReadConnectionResponse {
    connection: Connection,
    status: ConnectionStatus,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    address: String,
    #[serde(default)]
    text: String,
    priority: Option<Priority>,
}

fn store_error_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::MissingConnection(_) | StoreError::MissingMessage(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn add_connection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let mut connection: Connection = match serde_json::from_value(body) {
        Ok(connection) => connection,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid JSON, please check the body of your request: {e}"),
            )
                .into_response();
        }
    };
    if let Err(e) = connection.validate_new() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let engine = match ConnectionEngine::start(
        connection.clone(),
        state.store.clone(),
        state.pool.clone(),
        state.twitter.as_ref(),
    ) {
        Ok(engine) => engine,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let saved = { state.store.lock().await.save_connection(&connection) };
    if let Err(e) = saved {
        engine.stop().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    state
        .engines
        .write()
        .await
        .insert(connection.uuid.clone(), engine);
    info!(conn = %connection.uuid, "connection added");
    Json(connection).into_response()
}

async fn list_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = { state.store.lock().await.load_all_connections() };
    match connections {
        Ok(connections) => Json(ConnectionListResponse { connections }).into_response(),
        Err(e) => (store_error_status(&e), e.to_string()).into_response(),
    }
}

async fn read_connection(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    let connection = match store.load_connection(&uuid) {
        Ok(connection) => connection,
        Err(e) => return (store_error_status(&e), e.to_string()).into_response(),
    };
    match store.connection_status(&uuid) {
        Ok(status) => Json(ReadConnectionResponse { connection, status }).into_response(),
        Err(e) => (store_error_status(&e), e.to_string()).into_response(),
    }
}

async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    // Stop the engine first; the store guarantees nothing about deleting a
    // connection with live workers.
    let engine = state.engines.write().await.remove(&uuid);
    if let Some(engine) = engine {
        engine.stop().await;
    }

    let mut store = state.store.lock().await;
    let connection = match store.load_connection(&uuid) {
        Ok(connection) => connection,
        Err(e) => return (store_error_status(&e), e.to_string()).into_response(),
    };
    let status = match store.connection_status(&uuid) {
        Ok(status) => status,
        Err(e) => return (store_error_status(&e), e.to_string()).into_response(),
    };
    if let Err(e) = store.delete_connection(&connection) {
        return (store_error_status(&e), e.to_string()).into_response();
    }
    info!(conn = %uuid, "connection deleted");
    Json(status).into_response()
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let outgoing = {
        let engines = state.engines.read().await;
        match engines.get(&uuid) {
            Some(engine) => engine.outgoing(),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("No connection with uuid: {uuid}"),
                )
                    .into_response();
            }
        }
    };

    let request: SendMessageRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid JSON, please check the body of your request: {e}"),
            )
                .into_response();
        }
    };
    if request.address.is_empty() || request.text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Must specify `address` and `text`".to_owned(),
        )
            .into_response();
    }

    let mut msg = state.pool.acquire();
    msg.conn_uuid.push_str(&uuid);
    msg.address.push_str(&request.address);
    msg.text.push_str(&request.text);
    msg.priority = request.priority.unwrap_or(Priority::Low);
    msg.status = Status::Queued;
    msg.created = Utc::now();

    let written = { state.store.lock().await.write_to_outbox(&mut msg) };
    if let Err(e) = written {
        let response = (store_error_status(&e), e.to_string()).into_response();
        state.pool.release(msg);
        return response;
    }

    let id = msg.id;
    let body = match serde_json::to_value(&msg) {
        Ok(body) => body,
        Err(e) => {
            state.pool.release(msg);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    state.pool.release(msg);

    // Hand the id to the dispatcher. The message is already durable; if the
    // engine is mid-shutdown the id is replayed on next start.
    let _ = outgoing.send(id).await;

    info!(conn = %uuid, id, "message queued");
    Json(body).into_response()
}

async fn read_message(
    State(state): State<Arc<AppState>>,
    Path((uuid, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(id) = id.parse::<u64>() else {
        return (
            StatusCode::BAD_REQUEST,
            format!("message id must be an integer, was `{id}`"),
        )
            .into_response();
    };

    let loaded = { state.store.lock().await.get_msg(&uuid, id) };
    match loaded {
        Ok(msg) => {
            let body = match serde_json::to_value(&msg) {
                Ok(body) => body,
                Err(e) => {
                    state.pool.release(msg);
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
                }
            };
            state.pool.release(msg);
            Json(body).into_response()
        }
        Err(e) => (store_error_status(&e), e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/connection",
            get(list_connections).put(add_connection),
        )
        .route(
            "/connection/{uuid}",
            get(read_connection).delete(delete_connection),
        )
        .route("/connection/{uuid}/send", axum::routing::put(send_message))
        .route("/connection/{uuid}/status/{id}", get(read_message))
        .with_state(state)
}
