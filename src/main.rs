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

use nanofence::nanofence::backend::{spawn_reset_listener, BackendHandle, NodeHealthPoller};
use nanofence::nanofence::config::FencingConfig;
use nanofence::nanofence::controller::{
    ActionReconciler, CacheEnqueuer, ControllerRuntime, FencingSettings, NodeFencingController,
    Reconciler,
};
use nanofence::nanofence::k8s::{ClusterApi, KubeCluster};
use nanofence::nanofence::logger::{log_error, log_info, set_log_format, set_log_level};
use nanofence::nanofence::observability::{self, health::HealthState};
use nanofence::nanofence::server;
use nanofence::nanofence::util::error::with_context;
use nanofence::nanofence::util::ExpiringCache;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";
const NODE_CACHE: &str = "backend_nodes";
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        let error = err.to_string();
        log_error(
            COMPONENT,
            "nanofence exited with error",
            &[("error", error.as_str())],
        );
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = FencingConfig::from_env()?;
    set_log_format(config.log_format);
    set_log_level(config.log_level);
    observability::tracing::init();

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::try_default()
            .await
            .map_err(|err| with_context(err, "connecting to the Kubernetes API"))?,
    );
    let backend = BackendHandle::http(&config.backend_endpoint, config.backend_timeout)
        .map_err(|err| with_context(err, "creating the storage backend client"))?;

    let cancel = CancellationToken::new();
    let health = HealthState::new();
    let cache = ExpiringCache::with_sweep_interval(
        NODE_CACHE,
        config.cache_ttl,
        config.cache_sweep_interval,
    );
    let runtime = ControllerRuntime::new();
    let enqueuer = CacheEnqueuer::new(cache.clone(), runtime.work_queue());
    let controller = NodeFencingController::new(
        cache.clone(),
        cluster,
        backend.clone(),
        FencingSettings::from_config(&config),
    );
    let reconciler: Arc<dyn Reconciler> = Arc::new(ActionReconciler::new(Arc::new(controller)));

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (reset_tx, reset_rx) = mpsc::channel(1);

    let (_, server_task) = server::spawn(config.listen, health.clone(), cancel.clone()).await?;
    let mut tasks = vec![
        server_task,
        cache.spawn_sweeper(cancel.clone()),
        enqueuer.spawn(events_rx, cancel.clone()),
        spawn_reset_listener(backend.clone(), reset_rx, cancel.clone()),
    ];
    tasks.extend(runtime.spawn_workers(config.workers, reconciler, cancel.clone()));
    let poller = NodeHealthPoller::new(backend, config.poll_interval, events_tx, reset_tx, health);
    let poll_interval = humantime::format_duration(poller.interval()).to_string();
    tasks.push(poller.spawn(cancel.clone()));

    let workers = config.workers.to_string();
    let ttl = humantime::format_duration(config.cache_ttl).to_string();
    log_info(
        COMPONENT,
        "Node fencing controller started",
        &[
            ("backend", config.backend_endpoint.as_str()),
            ("poll_interval", poll_interval.as_str()),
            ("cache_ttl", ttl.as_str()),
            ("workers", workers.as_str()),
            ("driver", config.driver.as_str()),
        ],
    );

    shutdown_signal().await;
    log_info(COMPONENT, "Shutting down", &[]);
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
