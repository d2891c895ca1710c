//! Receiver failure path.
//!
//! A receiver URL that answers 500 must not stall the pipeline: the inbound
//! message still reaches state H, with the status code and response body
//! recorded in its log.

use courier_core::{Bucket, Status, Store};
use gateway::control_api::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

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

/// A sink that always fails with 500 and a recognizable body.
async fn start_failing_sink() -> SocketAddr {
    let router = axum::Router::new().route(
        "/sink",
        axum::routing::post(|| async {
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "sink exploded")
        }),
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
async fn failed_forward_still_reaches_handled_with_the_failure_logged() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let sink_addr = start_failing_sink().await;
    let (addr, state) = start_gateway(db.path()).await;
    let client = reqwest::Client::new();

    let connection: serde_json::Value = client
        .put(format!("http://{addr}/connection"))
        .json(&serde_json::json!({
            "senders":   { "type": "echo", "count": 1, "config": {} },
            "receivers": { "type": "http", "count": 1, "config": { "url": format!("http://{sink_addr}/sink") } }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let uuid = connection["uuid"].as_str().unwrap().to_owned();

    let response = client
        .put(format!("http://{addr}/connection/{uuid}/send"))
        .json(&serde_json::json!({ "address": "u", "text": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Wait for the echo reply to be handled despite the failing sink.
    let mut handled_ids = Vec::new();
    for _ in 0..100 {
        handled_ids = {
            let store = state.store.lock().await;
            store.bucket_keys(&uuid, Bucket::Handled).unwrap()
        };
        if !handled_ids.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(handled_ids.len(), 1);

    let store = state.store.lock().await;
    let msg = store.get_msg(&uuid, handled_ids[0]).unwrap();
    assert_eq!(msg.status, Status::Handled);
    assert!(msg.finished.is_some());
    assert!(msg.log.contains("500"), "log was: {}", msg.log);
    assert!(msg.log.contains("sink exploded"), "log was: {}", msg.log);
    assert_eq!(store.bucket_size(&uuid, Bucket::Inbox).unwrap(), 0);
}
