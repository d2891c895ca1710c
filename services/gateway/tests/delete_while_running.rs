//! Deleting a connection with a busy queue.
//!
//! DELETE must stop the engine within a bounded time, destroy the persistent
//! state, and leave the gateway answering 400 for the vanished uuid.

use courier_core::{Bucket, Store};
use gateway::control_api::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Harness helpers (duplicated across test files to keep each self-contained)
// ---------------------------------------------------------------------------

async fn start_gateway(db_path: &std::path::Path) -> (SocketAddr, Arc<AppState>) {
    let store = Store::open(db_path).unwrap();
    let state = AppState::new(store, None);
    let router = control_api::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

/// A sink that accepts everything; deliveries are irrelevant here.
async fn start_sink() -> SocketAddr {
    let router = axum::Router::new().route(
        "/sink",
        axum::routing::post(|| async { axum::http::StatusCode::OK }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("sink error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

// ---------------------------------------------------------------------------
// Test
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_stops_workers_and_destroys_state() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let sink_addr = start_sink().await;
    let (addr, state) = start_gateway(db.path()).await;
    let client = reqwest::Client::new();

    // Slow single sender, so most of the queue is still pending at delete.
    let connection: serde_json::Value = client
        .put(format!("http://{addr}/connection"))
        .json(&serde_json::json!({
            "senders":   { "type": "echo", "count": 1, "config": { "pause": "400" } },
            "receivers": { "type": "http", "count": 1, "config": { "url": format!("http://{sink_addr}/sink") } }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let uuid = connection["uuid"].as_str().unwrap().to_owned();

    for i in 0..10 {
        let response = client
            .put(format!("http://{addr}/connection/{uuid}/send"))
            .json(&serde_json::json!({ "address": "u", "text": format!("m{i}") }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    // Delete while the queue is hot; must complete within a bounded time.
    let response = timeout(
        Duration::from_secs(5),
        client
            .delete(format!("http://{addr}/connection/{uuid}"))
            .send(),
    )
    .await
    .expect("delete did not return in time")
    .unwrap();
    assert_eq!(response.status(), 200);
    let final_status: serde_json::Value = response.json().await.unwrap();
    assert!(final_status["outgoing_queued"].is_u64());
    assert!(final_status["sent_results"].is_u64());

    // Every worker task has exited and the engine is gone.
    assert!(state.engines.read().await.is_empty());

    // The persistent tree is gone too.
    {
        let store = state.store.lock().await;
        assert!(store.load_connection(&uuid).is_err());
        assert_eq!(store.bucket_size(&uuid, Bucket::Outbox).unwrap(), 0);
        assert_eq!(store.bucket_size(&uuid, Bucket::Sent).unwrap(), 0);
    }

    // A subsequent read answers 400.
    let response = client
        .get(format!("http://{addr}/connection/{uuid}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
