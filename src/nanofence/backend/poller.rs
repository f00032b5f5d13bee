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

use super::client::{BackendError, BackendHandle};
use super::types::BackendNode;
use crate::nanofence::config::clamp_poll_interval;
use crate::nanofence::logger::{log_debug, log_warn};
use crate::nanofence::observability::health::HealthState;
use crate::nanofence::observability::metrics::observe_node_poll;
use crate::nanofence::observability::tracing::with_span;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "node-poller";

/// Change notification for one backend node, published on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub key: String,
    pub node: BackendNode,
}

impl From<BackendNode> for NodeEvent {
    fn from(node: BackendNode) -> Self {
        Self {
            key: node.key().to_string(),
            node,
        }
    }
}

/// Periodically lists backend nodes and republishes each of them.
///
/// A failed list leaves downstream state untouched and raises a reset
/// request so the owner can recycle the backend client.
pub struct NodeHealthPoller {
    backend: BackendHandle,
    interval: Duration,
    events: mpsc::Sender<NodeEvent>,
    reset: mpsc::Sender<()>,
    health: HealthState,
}

impl NodeHealthPoller {
    pub fn new(
        backend: BackendHandle,
        requested_interval: Duration,
        events: mpsc::Sender<NodeEvent>,
        reset: mpsc::Sender<()>,
        health: HealthState,
    ) -> Self {
        let (interval, clamped) = clamp_poll_interval(requested_interval);
        if clamped {
            let requested = humantime::format_duration(requested_interval).to_string();
            let effective = humantime::format_duration(interval).to_string();
            log_warn(
                COMPONENT,
                "Poll interval below floor; clamping",
                &[
                    ("requested", requested.as_str()),
                    ("effective", effective.as_str()),
                ],
            );
        }
        Self {
            backend,
            interval,
            events,
            reset,
            health,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Polls immediately, then once per interval until cancelled or until
    /// nobody listens for events any more.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.poll_once(&cancel).await;
                    if self.events.is_closed() {
                        break;
                    }
                }
            }
        }
        log_debug(COMPONENT, "Node health poller stopped", &[]);
    }

    /// Runs one poll cycle. Returns the number of nodes published.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize, BackendError> {
        with_span(COMPONENT, "poll", async {
            let nodes = match observe_node_poll(self.backend.list_nodes()).await {
                Ok(nodes) => nodes,
                Err(err) => {
                    self.handle_failure(&err);
                    return Err(err);
                }
            };
            self.health.record_poll_success();

            let total = nodes.len();
            let mut published = 0;
            for node in nodes {
                let event = NodeEvent::from(node);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = self.events.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                        published += 1;
                    }
                }
            }
            let total = total.to_string();
            let published_label = published.to_string();
            log_debug(
                COMPONENT,
                "Published backend nodes",
                &[("nodes", total.as_str()), ("published", published_label.as_str())],
            );
            Ok(published)
        })
        .await
    }

    fn handle_failure(&self, err: &BackendError) {
        let error = err.to_string();
        self.health.record_poll_failure(&error);
        let failures = self.health.consecutive_failures().to_string();
        log_warn(
            COMPONENT,
            "Failed to list backend nodes; keeping cached state",
            &[
                ("error", error.as_str()),
                ("consecutive_failures", failures.as_str()),
            ],
        );
        // A full channel already holds a pending reset.
        let _ = self.reset.try_send(());
    }
}
