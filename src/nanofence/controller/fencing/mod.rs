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

//! Node fencing: evicts opted-in pods from nodes the storage backend reports
//! offline, once their backend volumes are healthy enough to move.

pub mod decision;
pub mod executor;
pub mod resolver;

use crate::nanofence::backend::{BackendError, BackendHandle, BackendNode};
use crate::nanofence::config::FencingConfig;
use crate::nanofence::controller::action::ActionPolicy;
use crate::nanofence::controller::reconcile::{
    ActionCheck, ActionController, ActionFuture, ActionManager,
};
use crate::nanofence::k8s::{ClusterApi, ClusterError};
use crate::nanofence::logger::log_info;
use crate::nanofence::observability::metrics::{self, PodFencingResult};
use crate::nanofence::util::error::ErrorList;
use crate::nanofence::util::ExpiringCache;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

pub use decision::FencingDecisionEngine;
pub use executor::{FenceReport, FencingExecutor};
pub use resolver::{FencingTarget, Resolution, ResolvedClaim, TargetResolver};

const COMPONENT: &str = "node-fencing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FencingError {
    Cluster(ClusterError),
    Backend(BackendError),
    /// The pod was not fully fenced; one entry per failed delete.
    /// `stranded` names the attachments left behind by a deleted pod.
    Partial {
        pod: String,
        failures: ErrorList,
        stranded: Vec<String>,
    },
    /// Aggregated failures of one fencing round on a node.
    Failed { node: String, failures: ErrorList },
}

impl Display for FencingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FencingError::Cluster(err) => write!(f, "{err}"),
            FencingError::Backend(err) => write!(f, "{err}"),
            FencingError::Partial { pod, failures, .. } => {
                write!(f, "pod {pod} not fully fenced: {failures}")
            }
            FencingError::Failed { node, failures } => {
                write!(f, "fencing node {node} failed: {failures}")
            }
        }
    }
}

impl Error for FencingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FencingError::Cluster(err) => Some(err),
            FencingError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ClusterError> for FencingError {
    fn from(err: ClusterError) -> Self {
        FencingError::Cluster(err)
    }
}

impl From<BackendError> for FencingError {
    fn from(err: BackendError) -> Self {
        FencingError::Backend(err)
    }
}

/// Tunables of the node fencing controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencingSettings {
    pub fencing_label: String,
    pub driver: String,
    pub policy: ActionPolicy,
}

impl FencingSettings {
    pub fn from_config(config: &FencingConfig) -> Self {
        Self {
            fencing_label: config.fencing_label.clone(),
            driver: config.driver.clone(),
            policy: ActionPolicy::new(config.action_timeout, config.action_backoff),
        }
    }
}

/// Action controller keyed by backend node name.
pub struct NodeFencingController {
    cache: ExpiringCache<BackendNode>,
    decision: FencingDecisionEngine,
    resolver: Arc<TargetResolver>,
    executor: Arc<FencingExecutor>,
    policy: ActionPolicy,
}

impl NodeFencingController {
    pub fn new(
        cache: ExpiringCache<BackendNode>,
        cluster: Arc<dyn ClusterApi>,
        backend: BackendHandle,
        settings: FencingSettings,
    ) -> Self {
        let decision = FencingDecisionEngine::new(cache.clone(), Arc::clone(&cluster));
        let resolver = TargetResolver::new(
            Arc::clone(&cluster),
            backend,
            settings.fencing_label,
            settings.driver.clone(),
        );
        let executor = FencingExecutor::new(cluster, settings.driver);
        Self {
            cache,
            decision,
            resolver: Arc::new(resolver),
            executor: Arc::new(executor),
            policy: settings.policy,
        }
    }
}

impl ActionController for NodeFencingController {
    type Object = BackendNode;
    type Error = FencingError;

    fn kind(&self) -> &'static str {
        "NodeFencing"
    }

    fn get_object<'a>(&'a self, key: &'a str) -> ActionFuture<'a, Option<BackendNode>, FencingError> {
        let node = self.decision.lookup(key);
        Box::pin(async move { Ok(node) })
    }

    fn require_action<'a>(
        &'a self,
        node: &'a BackendNode,
    ) -> ActionFuture<'a, bool, FencingError> {
        Box::pin(async move {
            self.decision
                .require_action(node)
                .await
                .map_err(FencingError::from)
        })
    }

    fn build_action_manager(
        &self,
        node: BackendNode,
    ) -> Box<dyn ActionManager<Error = FencingError>> {
        Box::new(NodeFencingAction {
            node,
            cache: self.cache.clone(),
            resolver: Arc::clone(&self.resolver),
            executor: Arc::clone(&self.executor),
            stranded: Mutex::new(BTreeSet::new()),
        })
    }

    fn policy(&self) -> ActionPolicy {
        self.policy
    }
}

/// Fencing of one offline node: resolve targets, fence them, verify.
///
/// Attachments whose delete failed after their pod was deleted are no longer
/// reachable through pod resolution, so the action keeps them and retries
/// them every round until they are gone.
pub struct NodeFencingAction {
    node: BackendNode,
    cache: ExpiringCache<BackendNode>,
    resolver: Arc<TargetResolver>,
    executor: Arc<FencingExecutor>,
    stranded: Mutex<BTreeSet<String>>,
}

impl NodeFencingAction {
    fn lock_stranded(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.stranded.lock().expect("stranded attachments lock poisoned")
    }

    async fn fence(&self) -> Result<(), FencingError> {
        let node = self.node.name.as_str();
        let mut failures = ErrorList::new();

        let leftover: Vec<String> = self.lock_stranded().iter().cloned().collect();
        if !leftover.is_empty() {
            let report = self.executor.retry_stranded(node, &leftover).await;
            let mut stranded = self.lock_stranded();
            for name in &leftover {
                stranded.remove(name);
            }
            stranded.extend(report.stranded);
            failures.extend(report.failures);
        }

        let resolution = self.resolver.resolve(node).await?;
        for _ in &resolution.unhealthy {
            metrics::record_fencing_pod(PodFencingResult::SkippedUnhealthy);
        }

        failures.extend(resolution.errors);
        if !resolution.targets.is_empty() {
            let count = resolution.targets.len().to_string();
            log_info(
                COMPONENT,
                "Fencing pods on offline node",
                &[("node", node), ("pods", count.as_str())],
            );
        }
        let report = self.executor.fence_all(node, &resolution.targets).await;
        self.lock_stranded().extend(report.stranded);
        failures.extend(report.failures);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FencingError::Failed {
                node: node.to_string(),
                failures,
            })
        }
    }

    async fn verify(&self) -> Result<ActionCheck, FencingError> {
        let node = self.node.name.as_str();
        match self.cache.get(node) {
            None => {
                log_info(
                    COMPONENT,
                    "Node left the cache; deferring to the next poll",
                    &[("node", node)],
                );
                return Ok(ActionCheck::Done);
            }
            Some(current) if !current.is_offline() => {
                log_info(
                    COMPONENT,
                    "Node no longer offline",
                    &[("node", node), ("health", current.health.as_str())],
                );
                return Ok(ActionCheck::Done);
            }
            Some(_) => {}
        }

        let tracked = self.lock_stranded().clone();
        let outstanding = self.executor.outstanding(node, &tracked).await?;
        let waiting = outstanding.len();
        *self.lock_stranded() = outstanding;
        if waiting > 0 {
            let waiting = waiting.to_string();
            log_info(
                COMPONENT,
                "Attachments still stranded on node",
                &[("node", node), ("attachments", waiting.as_str())],
            );
            return Ok(ActionCheck::Retry);
        }

        let resolution = self.resolver.resolve(node).await?;
        if resolution.has_pending_work() {
            Ok(ActionCheck::Retry)
        } else {
            Ok(ActionCheck::Done)
        }
    }
}

impl ActionManager for NodeFencingAction {
    type Error = FencingError;

    fn run(&self) -> ActionFuture<'_, (), FencingError> {
        Box::pin(self.fence())
    }

    fn check(&self) -> ActionFuture<'_, ActionCheck, FencingError> {
        Box::pin(self.verify())
    }
}
