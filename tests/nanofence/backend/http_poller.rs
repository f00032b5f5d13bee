/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use nanofence::nanofence::backend::{
    spawn_reset_listener, BackendError, BackendHandle, NodeHealth, NodeHealthPoller,
};
use nanofence::nanofence::observability::health::HealthState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn list_nodes(
    State(available): State<Arc<AtomicBool>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !available.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(serde_json::json!([
        {"name": "n1", "health": "offline"},
        {"name": "n2", "health": "online"},
        {"name": "n3", "health": "rebooting"}
    ])))
}

async fn serve_backend(available: Arc<AtomicBool>) -> String {
    let router = Router::new()
        .route("/v1/nodes", get(list_nodes))
        .with_state(available);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn poller_recovers_once_the_backend_answers() {
    let available = Arc::new(AtomicBool::new(false));
    let endpoint = serve_backend(Arc::clone(&available)).await;
    let handle = BackendHandle::http(&endpoint, Duration::from_secs(2)).expect("backend handle");

    let health = HealthState::new();
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (reset_tx, mut reset_rx) = mpsc::channel(1);
    let poller = NodeHealthPoller::new(
        handle.clone(),
        Duration::from_secs(5),
        events_tx,
        reset_tx,
        health.clone(),
    );
    let cancel = CancellationToken::new();

    let err = poller.poll_once(&cancel).await.expect_err("backend down");
    assert!(matches!(err, BackendError::Status { code: 503, .. }), "{err:?}");
    assert_eq!(health.consecutive_failures(), 1);
    assert!(!health.readiness_report().is_ready());
    assert_eq!(reset_rx.try_recv(), Ok(()));
    assert!(events_rx.try_recv().is_err());

    // The poller keeps working across a client reset.
    handle.reset().expect("reset");
    available.store(true, Ordering::SeqCst);
    let published = poller.poll_once(&cancel).await.expect("backend up");
    assert_eq!(published, 3);
    assert!(health.readiness_report().is_ready());

    let mut seen = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        seen.push((event.key, event.node.health));
    }
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        vec![
            ("n1".to_string(), NodeHealth::Offline),
            ("n2".to_string(), NodeHealth::Online),
            ("n3".to_string(), NodeHealth::Unknown),
        ]
    );
}

#[tokio::test]
async fn reset_requests_recycle_the_http_client() {
    let available = Arc::new(AtomicBool::new(true));
    let endpoint = serve_backend(available).await;
    let handle = BackendHandle::http(&endpoint, Duration::from_secs(2)).expect("backend handle");
    let cancel = CancellationToken::new();
    let (reset_tx, reset_rx) = mpsc::channel(1);
    let listener = spawn_reset_listener(handle.clone(), reset_rx, cancel.clone());

    reset_tx.send(()).await.expect("request reset");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let nodes = handle.list_nodes().await.expect("list after reset");
    assert_eq!(nodes.len(), 3);

    cancel.cancel();
    listener.await.expect("listener exits");
}
