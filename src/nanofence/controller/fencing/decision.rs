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

use crate::nanofence::backend::{BackendNode, NodeHealth};
use crate::nanofence::k8s::{ClusterApi, ClusterError};
use crate::nanofence::logger::{log_debug, log_info};
use crate::nanofence::util::ExpiringCache;
use std::sync::Arc;

const COMPONENT: &str = "fencing-decision";

/// Decides whether a backend node warrants fencing.
#[derive(Clone)]
pub struct FencingDecisionEngine {
    cache: ExpiringCache<BackendNode>,
    cluster: Arc<dyn ClusterApi>,
}

impl FencingDecisionEngine {
    pub fn new(cache: ExpiringCache<BackendNode>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cache, cluster }
    }

    /// Cached backend view of `key`. `None` marks the request as stale.
    pub fn lookup(&self, key: &str) -> Option<BackendNode> {
        self.cache.get(key)
    }

    /// Fencing is required only for an offline backend node that still has a
    /// cluster counterpart of the same name.
    pub async fn require_action(&self, node: &BackendNode) -> Result<bool, ClusterError> {
        match node.health {
            NodeHealth::Offline => {}
            NodeHealth::Online | NodeHealth::Unknown => {
                log_debug(
                    COMPONENT,
                    "Backend node not offline; nothing to do",
                    &[("node", node.name.as_str()), ("health", node.health.as_str())],
                );
                return Ok(false);
            }
        }

        if self.cluster.get_node(&node.name).await?.is_none() {
            log_info(
                COMPONENT,
                "Offline backend node has no cluster node; ignoring",
                &[("node", node.name.as_str())],
            );
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanofence::k8s::types::Node;
    use crate::nanofence::k8s::InMemoryCluster;
    use std::time::Duration;

    fn engine() -> (FencingDecisionEngine, ExpiringCache<BackendNode>, InMemoryCluster) {
        let cache = ExpiringCache::new("decision-test", Duration::from_secs(60));
        let cluster = InMemoryCluster::new();
        let engine = FencingDecisionEngine::new(cache.clone(), Arc::new(cluster.clone()));
        (engine, cache, cluster)
    }

    #[tokio::test(start_paused = true)]
    async fn absent_key_is_stale() {
        let (engine, cache, _cluster) = engine();
        assert!(engine.lookup("n1").is_none());

        cache.put("n1", BackendNode::new("n1", NodeHealth::Offline));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(engine.lookup("n1").is_none());
    }

    #[tokio::test]
    async fn only_offline_nodes_with_cluster_counterpart_need_action() {
        let (engine, _cache, cluster) = engine();
        let offline = BackendNode::new("n1", NodeHealth::Offline);

        assert!(!engine.require_action(&offline).await.unwrap());

        cluster.upsert_node(Node::new("n1"));
        assert!(engine.require_action(&offline).await.unwrap());
        assert!(!engine
            .require_action(&BackendNode::new("n1", NodeHealth::Online))
            .await
            .unwrap());
        assert!(!engine
            .require_action(&BackendNode::new("n1", NodeHealth::Unknown))
            .await
            .unwrap());
    }
}
