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

use std::sync::Arc;
use std::time::Duration;

use nanofence::nanofence::backend::{spawn_reset_listener, BackendNode, NodeHealthPoller};
use nanofence::nanofence::controller::{
    ActionPolicy, ActionReconciler, CacheEnqueuer, ControllerRuntime, FencingSettings,
    NodeFencingController, Reconciler,
};
use nanofence::nanofence::k8s::ClusterApi;
use nanofence::nanofence::observability::health::HealthState;
use nanofence::nanofence::test_support::{FencingFixture, TEST_DRIVER, TEST_LABEL};
use nanofence::nanofence::util::ExpiringCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timing knobs for a pipeline run.
#[derive(Clone, Copy)]
pub struct PipelineTiming {
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub policy: ActionPolicy,
}

impl Default for PipelineTiming {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            policy: ActionPolicy::new(Duration::from_secs(60), Duration::from_secs(1)),
        }
    }
}

/// Poller, enqueuer, work queue and fencing workers wired over a fixture,
/// the way the binary wires them over the real cluster and backend.
pub struct Pipeline {
    pub fixture: FencingFixture,
    pub cache: ExpiringCache<BackendNode>,
    pub health: HealthState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(fixture: FencingFixture) -> Self {
        Self::start_with(fixture, PipelineTiming::default())
    }

    pub fn start_with(fixture: FencingFixture, timing: PipelineTiming) -> Self {
        let cancel = CancellationToken::new();
        let health = HealthState::new();
        let backend = fixture.backend.handle();
        let cluster: Arc<dyn ClusterApi> = Arc::new(fixture.cluster.clone());

        let cache =
            ExpiringCache::with_sweep_interval("pipeline_nodes", timing.cache_ttl, timing.sweep_interval);
        let runtime = ControllerRuntime::new();
        let enqueuer = CacheEnqueuer::new(cache.clone(), runtime.work_queue());
        let settings = FencingSettings {
            fencing_label: TEST_LABEL.to_string(),
            driver: TEST_DRIVER.to_string(),
            policy: timing.policy,
        };
        let controller =
            NodeFencingController::new(cache.clone(), cluster, backend.clone(), settings);
        let reconciler: Arc<dyn Reconciler> = Arc::new(ActionReconciler::new(Arc::new(controller)));

        let (events_tx, events_rx) = mpsc::channel(64);
        let (reset_tx, reset_rx) = mpsc::channel(1);

        let mut tasks = vec![
            cache.spawn_sweeper(cancel.clone()),
            enqueuer.spawn(events_rx, cancel.clone()),
            spawn_reset_listener(backend.clone(), reset_rx, cancel.clone()),
        ];
        tasks.extend(runtime.spawn_workers(2, reconciler, cancel.clone()));
        let poller =
            NodeHealthPoller::new(backend, POLL_INTERVAL, events_tx, reset_tx, health.clone());
        tasks.push(poller.spawn(cancel.clone()));

        Self {
            fixture,
            cache,
            health,
            cancel,
            tasks,
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.expect("pipeline task panicked");
        }
    }
}

/// Advances paused time by `secs` seconds, letting every ready task run.
pub async fn advance_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
