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

use super::resolver::FencingTarget;
use super::FencingError;
use crate::nanofence::k8s::{ClusterApi, ClusterError};
use crate::nanofence::logger::{log_debug, log_info, log_warn};
use crate::nanofence::observability::metrics::{self, AttachmentResult, PodFencingResult};
use crate::nanofence::util::error::ErrorList;
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

const COMPONENT: &str = "fencing-executor";

/// Result of one fencing round on a node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FenceReport {
    /// Pods deleted together with all of their backend attachments.
    pub fenced: usize,
    /// Backend attachments whose delete failed after their pod was deleted.
    pub stranded: Vec<String>,
    pub failures: ErrorList,
}

impl FenceReport {
    pub fn into_result(self, node: &str) -> Result<usize, FencingError> {
        if self.failures.is_empty() {
            Ok(self.fenced)
        } else {
            Err(FencingError::Failed {
                node: node.to_string(),
                failures: self.failures,
            })
        }
    }
}

/// Deletes fencing targets and their attachments.
pub struct FencingExecutor {
    cluster: Arc<dyn ClusterApi>,
    driver: String,
}

impl FencingExecutor {
    pub fn new(cluster: Arc<dyn ClusterApi>, driver: impl Into<String>) -> Self {
        Self {
            cluster,
            driver: driver.into(),
        }
    }

    /// Fences every target independently and reports what is left behind.
    pub async fn fence_all(&self, node: &str, targets: &[FencingTarget]) -> FenceReport {
        let results = join_all(targets.iter().map(|target| self.fence_pod(target))).await;

        let mut report = FenceReport::default();
        for result in results {
            match result {
                Ok(()) => report.fenced += 1,
                Err(FencingError::Partial {
                    pod,
                    failures,
                    stranded,
                }) => {
                    report.failures.push(&pod, failures);
                    report.stranded.extend(stranded);
                }
                Err(other) => report.failures.push(node, other),
            }
        }
        report
    }

    /// Deletes attachments stranded by earlier rounds. Attachments that are
    /// gone by now count as deleted.
    pub async fn retry_stranded(&self, node: &str, names: &[String]) -> FenceReport {
        let mut report = FenceReport::default();
        for name in names {
            if let Err(err) = self.delete_attachment(node, name).await {
                report.failures.push(&format!("volumeattachment {name}"), err);
                report.stranded.push(name.clone());
            }
        }
        report
    }

    /// Names in `stranded` that still exist on `node`.
    pub async fn outstanding(
        &self,
        node: &str,
        stranded: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, FencingError> {
        if stranded.is_empty() {
            return Ok(BTreeSet::new());
        }
        let attachments = self.cluster.list_attachments_on_node(node).await?;
        Ok(attachments
            .iter()
            .map(|attachment| attachment.name())
            .filter(|name| stranded.contains(*name))
            .map(str::to_string)
            .collect())
    }

    /// Deletes the pod without grace, then each of its attachments owned by
    /// the backend driver. A pod that is already gone counts as deleted; an
    /// attachment that is already gone is skipped.
    pub async fn fence_pod(&self, target: &FencingTarget) -> Result<(), FencingError> {
        let pod = &target.pod;
        let pod_key = pod.key();

        match self.cluster.delete_pod(pod.namespace(), pod.name()).await {
            Ok(()) => log_info(COMPONENT, "Deleted pod", &[("pod", pod_key.as_str())]),
            Err(err) if err.is_not_found() => {
                log_debug(COMPONENT, "Pod already deleted", &[("pod", pod_key.as_str())])
            }
            Err(err) => {
                metrics::record_fencing_pod(PodFencingResult::Failed);
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to delete pod; leaving its attachments",
                    &[("pod", pod_key.as_str()), ("error", error.as_str())],
                );
                let mut failures = ErrorList::new();
                failures.push("pod delete", err);
                return Err(FencingError::Partial {
                    pod: pod_key,
                    failures,
                    stranded: Vec::new(),
                });
            }
        }

        let mut failures = ErrorList::new();
        let mut stranded = Vec::new();
        for claim in &target.claims {
            if claim.attachments.is_empty() {
                metrics::record_fencing_attachment(AttachmentResult::Missing);
                let volume = claim.volume.to_string();
                log_debug(
                    COMPONENT,
                    "No attachment for volume",
                    &[("pod", pod_key.as_str()), ("volume", volume.as_str())],
                );
                continue;
            }

            for attachment in &claim.attachments {
                let name = attachment.name();
                if attachment.attacher() != self.driver {
                    metrics::record_fencing_attachment(AttachmentResult::Foreign);
                    log_info(
                        COMPONENT,
                        "Leaving attachment of foreign driver",
                        &[("attachment", name), ("attacher", attachment.attacher())],
                    );
                    continue;
                }

                if let Err(err) = self.delete_attachment(&pod_key, name).await {
                    failures.push(&format!("volumeattachment {name}"), err);
                    stranded.push(name.to_string());
                }
            }
        }

        if failures.is_empty() {
            metrics::record_fencing_pod(PodFencingResult::Fenced);
            Ok(())
        } else {
            metrics::record_fencing_pod(PodFencingResult::Failed);
            Err(FencingError::Partial {
                pod: pod_key,
                failures,
                stranded,
            })
        }
    }

    async fn delete_attachment(&self, owner: &str, name: &str) -> Result<(), ClusterError> {
        match self.cluster.delete_attachment(name).await {
            Ok(()) => {
                metrics::record_fencing_attachment(AttachmentResult::Deleted);
                log_info(
                    COMPONENT,
                    "Deleted attachment",
                    &[("owner", owner), ("attachment", name)],
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                metrics::record_fencing_attachment(AttachmentResult::Missing);
                Ok(())
            }
            Err(err) => {
                metrics::record_fencing_attachment(AttachmentResult::Failed);
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to delete attachment",
                    &[("attachment", name), ("error", error.as_str())],
                );
                Err(err)
            }
        }
    }
}
