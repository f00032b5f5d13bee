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

use crate::nanofence::backend::{BackendNode, NodeEvent};
use crate::nanofence::controller::runtime::WorkQueue;
use crate::nanofence::logger::{log_debug, log_info};
use crate::nanofence::util::ExpiringCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "enqueuer";

/// Feeds node notifications into the expiring cache and the work queue.
///
/// A notification is written and enqueued when its key is absent (never
/// seen or expired) or its value changed. Identical republishes leave the
/// entry and its deadline alone, so an unchanged node is re-evaluated once
/// per TTL through expiry rather than on every poll.
///
/// The evaluation after expiry comes from the next poll, which finds the key
/// absent and re-inserts it. The eviction handler's own request usually finds
/// no cached node and ends as a stale no-op; it only matters when a poll has
/// already re-inserted the key by the time a worker picks it up.
pub struct CacheEnqueuer {
    cache: ExpiringCache<BackendNode>,
    queue: WorkQueue,
}

impl CacheEnqueuer {
    /// Also registers the cache eviction handler, which enqueues evicted
    /// keys without re-inserting them. The value is gone by then, so that
    /// request cannot evaluate the node on its own.
    pub fn new(cache: ExpiringCache<BackendNode>, queue: WorkQueue) -> Self {
        let evictions = queue.clone();
        cache.set_eviction_handler(move |key: &str, _node: BackendNode| {
            log_debug(COMPONENT, "Cache entry expired; enqueueing", &[("key", key)]);
            evictions.add(key);
        });
        Self { cache, queue }
    }

    /// Returns whether the event produced a reconcile request.
    pub fn handle(&self, event: NodeEvent) -> bool {
        if self.cache.get(&event.key).as_ref() == Some(&event.node) {
            return false;
        }
        let health = event.node.health.as_str();
        log_info(
            COMPONENT,
            "Node state changed; enqueueing",
            &[("key", event.key.as_str()), ("health", health)],
        );
        self.cache.put(event.key.clone(), event.node);
        self.queue.add(event.key);
        true
    }

    pub fn spawn(
        self,
        mut events: mpsc::Receiver<NodeEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            self.handle(event);
                        }
                        None => break,
                    },
                }
            }
        })
    }
}
