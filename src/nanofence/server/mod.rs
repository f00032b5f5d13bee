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

//! Operational HTTP endpoints: Prometheus metrics and health probes.

use crate::nanofence::logger::{log_error, log_info};
use crate::nanofence::observability::health::{self, HealthState};
use crate::nanofence::observability::metrics;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::error::Error;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "server";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn router(health: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(readiness))
        .route("/readyz", get(readiness))
        .route("/livez", get(liveness))
        .with_state(health)
}

async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn readiness(State(health): State<HealthState>) -> Response {
    let report = health.readiness_report();
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn liveness() -> Response {
    (StatusCode::OK, Json(health::liveness_report())).into_response()
}

/// Binds `addr` and serves the operational endpoints until `cancel` fires.
/// Returns the bound address, which differs from `addr` for port 0.
pub async fn spawn(
    addr: SocketAddr,
    health: HealthState,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let address = bound.to_string();
    log_info(
        COMPONENT,
        "Serving operational endpoints",
        &[("address", address.as_str())],
    );

    let app = router(health);
    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            let error = err.to_string();
            log_error(
                COMPONENT,
                "Operational server stopped",
                &[("error", error.as_str())],
            );
        }
    });
    Ok((bound, handle))
}
