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

//! Finds the pods on a node that may be fenced and what to detach for them.
//!
//! A pod is a fencing target when it opted in through the fencing label,
//! mounts at least one claim owned by the storage backend and every one of
//! those backend volumes currently reports healthy. Pods are never fenced
//! partially: one unhealthy or unreadable volume excludes the whole pod.

use super::FencingError;
use crate::nanofence::backend::{BackendError, BackendHandle, VolumeKey};
use crate::nanofence::k8s::types::{PersistentVolumeClaim, Pod, VolumeAttachment};
use crate::nanofence::k8s::{ClusterApi, ClusterError};
use crate::nanofence::logger::{log_debug, log_info, log_warn};
use crate::nanofence::util::error::ErrorList;
use std::sync::Arc;

const COMPONENT: &str = "fencing-resolver";

/// A backend-owned claim of a target pod and the attachments referencing
/// its volume on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClaim {
    pub claim: String,
    pub volume: VolumeKey,
    pub attachments: Vec<VolumeAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencingTarget {
    pub pod: Pod,
    pub claims: Vec<ResolvedClaim>,
}

/// Output of one resolution pass over a node.
#[derive(Debug, Default)]
pub struct Resolution {
    pub targets: Vec<FencingTarget>,
    /// Pods held back because one of their volumes is unhealthy.
    pub unhealthy: Vec<String>,
    /// Pods that could not be resolved this pass.
    pub errors: ErrorList,
}

impl Resolution {
    /// Whether another fencing round could still change something.
    pub fn has_pending_work(&self) -> bool {
        !self.targets.is_empty() || !self.errors.is_empty()
    }
}

pub struct TargetResolver {
    cluster: Arc<dyn ClusterApi>,
    backend: BackendHandle,
    fencing_label: String,
    driver: String,
}

impl TargetResolver {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        backend: BackendHandle,
        fencing_label: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            backend,
            fencing_label: fencing_label.into(),
            driver: driver.into(),
        }
    }

    pub async fn resolve(&self, node: &str) -> Result<Resolution, FencingError> {
        let pods = self.cluster.list_pods_on_node(node).await?;
        let mut resolution = Resolution::default();
        let mut candidates = Vec::new();

        for pod in pods {
            let pod_key = pod.key();
            if pod.node_name() != Some(node) {
                continue;
            }
            if !pod.fencing_enabled(&self.fencing_label) {
                log_debug(
                    COMPONENT,
                    "Pod has not opted into fencing",
                    &[("node", node), ("pod", pod_key.as_str())],
                );
                continue;
            }

            let claims = match self.backend_claims(&pod).await {
                Ok(claims) => claims,
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Failed to resolve pod claims",
                        &[("pod", pod_key.as_str()), ("error", error.as_str())],
                    );
                    resolution.errors.push(&pod_key, err);
                    continue;
                }
            };
            if claims.is_empty() {
                log_debug(
                    COMPONENT,
                    "Pod mounts no backend volumes",
                    &[("node", node), ("pod", pod_key.as_str())],
                );
                continue;
            }

            match self.first_unhealthy(&claims).await {
                Ok(None) => candidates.push((pod, claims)),
                Ok(Some(volume)) => {
                    let volume = volume.to_string();
                    log_info(
                        COMPONENT,
                        "Backend volume unhealthy; leaving pod in place",
                        &[("pod", pod_key.as_str()), ("volume", volume.as_str())],
                    );
                    resolution.unhealthy.push(pod_key);
                }
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Failed to query backend volume health",
                        &[("pod", pod_key.as_str()), ("error", error.as_str())],
                    );
                    resolution.errors.push(&pod_key, err);
                }
            }
        }

        if candidates.is_empty() {
            return Ok(resolution);
        }

        let attachments = self.cluster.list_attachments_on_node(node).await?;
        for (pod, claims) in candidates {
            let claims = claims
                .into_iter()
                .map(|(claim, volume)| {
                    let matching = attachments
                        .iter()
                        .filter(|attachment| attachment.volume_name() == Some(volume.name.as_str()))
                        .cloned()
                        .collect();
                    ResolvedClaim {
                        claim,
                        volume,
                        attachments: matching,
                    }
                })
                .collect();
            resolution.targets.push(FencingTarget { pod, claims });
        }
        Ok(resolution)
    }

    /// Claims of `pod` owned by the backend, with their backend volume keys.
    async fn backend_claims(&self, pod: &Pod) -> Result<Vec<(String, VolumeKey)>, ClusterError> {
        let mut owned = Vec::new();
        for claim_name in pod.claim_names() {
            let Some(claim) = self.cluster.get_claim(pod.namespace(), claim_name).await? else {
                log_debug(
                    COMPONENT,
                    "Claim not found; skipping",
                    &[("namespace", pod.namespace()), ("claim", claim_name)],
                );
                continue;
            };
            if let Some(volume) = self.backend_volume(&claim).await? {
                owned.push((claim_name.to_string(), volume));
            }
        }
        Ok(owned)
    }

    /// Backend volume behind `claim`, or `None` for unbound or foreign claims.
    async fn backend_volume(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<Option<VolumeKey>, ClusterError> {
        let Some(volume_name) = claim.volume_name() else {
            return Ok(None);
        };

        let owned = match claim.provisioner() {
            Some(provisioner) => provisioner == self.driver,
            None => match self.cluster.get_persistent_volume(volume_name).await? {
                Some(volume) => volume.driver() == Some(self.driver.as_str()),
                None => {
                    // May also be a transient read miss; either way the claim
                    // does not block fencing.
                    log_warn(
                        COMPONENT,
                        "Bound volume not found; treating claim as not backend-owned",
                        &[
                            ("namespace", claim.namespace()),
                            ("claim", claim.name()),
                            ("volume", volume_name),
                        ],
                    );
                    false
                }
            },
        };

        Ok(owned.then(|| VolumeKey::new(claim.namespace(), volume_name)))
    }

    async fn first_unhealthy(
        &self,
        claims: &[(String, VolumeKey)],
    ) -> Result<Option<VolumeKey>, BackendError> {
        for (_, key) in claims {
            let volume = self.backend.get_volume(key).await?;
            if !volume.healthy {
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanofence::backend::NodeHealth;
    use crate::nanofence::k8s::FailurePoint;
    use crate::nanofence::test_support::{
        attachment, claim, fenced_pod, persistent_volume, pod, FencingFixture, TEST_DRIVER,
        TEST_LABEL,
    };

    fn resolver(fixture: &FencingFixture) -> TargetResolver {
        TargetResolver::new(
            Arc::new(fixture.cluster.clone()),
            fixture.backend.handle(),
            TEST_LABEL,
            TEST_DRIVER,
        )
    }

    fn target_names(resolution: &Resolution) -> Vec<String> {
        resolution
            .targets
            .iter()
            .map(|target| target.pod.key())
            .collect()
    }

    #[tokio::test]
    async fn only_opted_in_pods_with_backend_claims_are_targets() {
        let fixture = FencingFixture::new();
        fixture
            .node("n1", NodeHealth::Offline)
            .backend_claim("apps", "c1", "n1", true)
            .backend_claim("apps", "c2", "n1", true)
            .backend_claim("apps", "c3", "n1", true)
            .pod(fenced_pod("apps", "p1", "n1", &["c1"]))
            .pod(pod("apps", "p2", "n1", None, &["c2"]))
            .pod(pod("apps", "p3", "n1", Some("maybe"), &["c3"]))
            .pod(fenced_pod("apps", "p4", "n1", &[]))
            .pod(fenced_pod("apps", "p5", "n2", &["c1"]));

        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert_eq!(target_names(&resolution), vec!["apps/p1"]);

        let claims = &resolution.targets[0].claims;
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].volume, VolumeKey::new("apps", "pv-c1"));
        assert_eq!(claims[0].attachments[0].name(), "va-c1");
        assert!(resolution.errors.is_empty());
    }

    #[tokio::test]
    async fn one_unhealthy_volume_excludes_the_whole_pod() {
        let fixture = FencingFixture::new();
        fixture
            .node("n1", NodeHealth::Offline)
            .backend_claim("apps", "c1", "n1", true)
            .backend_claim("apps", "c2", "n1", false)
            .backend_claim("apps", "c3", "n1", true)
            .pod(fenced_pod("apps", "p1", "n1", &["c1", "c2", "c3"]));

        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert!(resolution.targets.is_empty());
        assert_eq!(resolution.unhealthy, vec!["apps/p1".to_string()]);
        assert!(!resolution.has_pending_work());

        fixture.backend.set_volume_health("apps", "pv-c2", true);
        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert_eq!(target_names(&resolution), vec!["apps/p1"]);
        assert_eq!(resolution.targets[0].claims.len(), 3);
    }

    #[tokio::test]
    async fn ownership_falls_back_to_the_bound_volume_driver() {
        let fixture = FencingFixture::new();
        fixture.node("n1", NodeHealth::Offline);
        let cluster = &fixture.cluster;
        // Unannotated claims: one on a backend volume, one on a foreign
        // volume and one whose volume record is missing.
        cluster.upsert_claim(claim("apps", "owned", "pv-owned", None));
        cluster.upsert_volume(persistent_volume("pv-owned", TEST_DRIVER));
        cluster.upsert_claim(claim("apps", "foreign", "pv-foreign", None));
        cluster.upsert_volume(persistent_volume("pv-foreign", "ebs.csi.aws.com"));
        cluster.upsert_claim(claim("apps", "orphan", "pv-orphan", None));
        cluster.upsert_attachment(attachment("va-owned", "n1", "pv-owned", TEST_DRIVER));
        fixture.backend.set_volume_health("apps", "pv-owned", true);

        fixture
            .pod(fenced_pod("apps", "mixed", "n1", &["owned", "foreign", "orphan"]))
            .pod(fenced_pod("apps", "foreign-only", "n1", &["foreign", "orphan"]));

        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert_eq!(target_names(&resolution), vec!["apps/mixed"]);
        let claims: Vec<&str> = resolution.targets[0]
            .claims
            .iter()
            .map(|claim| claim.claim.as_str())
            .collect();
        assert_eq!(claims, vec!["owned"]);
    }

    #[tokio::test]
    async fn foreign_provisioner_annotation_wins_over_volume_driver() {
        let fixture = FencingFixture::new();
        fixture.node("n1", NodeHealth::Offline);
        fixture
            .cluster
            .upsert_claim(claim("apps", "c1", "pv-c1", Some("other.csi.io")));
        fixture
            .cluster
            .upsert_volume(persistent_volume("pv-c1", TEST_DRIVER));
        fixture.backend.set_volume_health("apps", "pv-c1", true);
        fixture.pod(fenced_pod("apps", "p1", "n1", &["c1"]));

        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert!(resolution.targets.is_empty());
    }

    #[tokio::test]
    async fn lookup_failures_exclude_the_pod_and_ask_for_retry() {
        let fixture = FencingFixture::new();
        fixture
            .node("n1", NodeHealth::Offline)
            .backend_claim("apps", "c1", "n1", true)
            .backend_claim("apps", "c2", "n1", true)
            .pod(fenced_pod("apps", "p1", "n1", &["c1"]))
            .pod(fenced_pod("apps", "p2", "n1", &["c2"]));
        fixture.backend.set_volume_failing("apps", "pv-c1", true);
        fixture.cluster.fail(
            FailurePoint::GetClaim {
                namespace: "apps".to_string(),
                name: "c2".to_string(),
            },
            1,
        );

        let resolution = resolver(&fixture).resolve("n1").await.expect("resolve");
        assert!(resolution.targets.is_empty());
        assert_eq!(resolution.errors.len(), 2);
        assert!(resolution.has_pending_work());
    }

    #[tokio::test]
    async fn listing_failures_fail_the_pass() {
        let fixture = FencingFixture::new();
        fixture.cluster.fail(
            FailurePoint::ListPods {
                node: "n1".to_string(),
            },
            1,
        );
        let err = resolver(&fixture).resolve("n1").await.expect_err("error");
        assert!(matches!(err, FencingError::Cluster(ClusterError::Api(_))));
    }
}
