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

//! Indexed in-memory cluster used by tests and local dry runs.

use super::cluster::{ClusterApi, ClusterError, ClusterFuture};
use super::types::{Node, PersistentVolume, PersistentVolumeClaim, Pod, VolumeAttachment};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation that can be told to fail via [`InMemoryCluster::fail`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    ListPods { node: String },
    ListAttachments { node: String },
    GetClaim { namespace: String, name: String },
    GetVolume { name: String },
    DeletePod { namespace: String, name: String },
    DeleteAttachment { name: String },
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    pods_by_node: HashMap<String, BTreeSet<String>>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    attachments: BTreeMap<String, VolumeAttachment>,
    attachments_by_node: HashMap<String, BTreeSet<String>>,
    failures: HashMap<FailurePoint, usize>,
    deleted_pods: Vec<String>,
    deleted_attachments: Vec<String>,
}

impl ClusterState {
    fn take_failure(&mut self, point: FailurePoint) -> Result<(), ClusterError> {
        match self.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ClusterError::Api(format!("injected failure for {point:?}")))
            }
            _ => Ok(()),
        }
    }

    fn unindex_pod(&mut self, key: &str) {
        if let Some(node) = self.pods.get(key).and_then(|pod| pod.spec.node_name.clone()) {
            if let Some(keys) = self.pods_by_node.get_mut(&node) {
                keys.remove(key);
            }
        }
    }

    fn unindex_attachment(&mut self, name: &str) {
        if let Some(node) = self
            .attachments
            .get(name)
            .map(|attachment| attachment.spec.node_name.clone())
        {
            if let Some(names) = self.attachments_by_node.get_mut(&node) {
                names.remove(name);
            }
        }
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("in-memory cluster lock poisoned")
    }

    pub fn upsert_node(&self, node: Node) {
        self.lock().nodes.insert(node.name().to_string(), node);
    }

    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.remove(name);
    }

    pub fn upsert_pod(&self, pod: Pod) {
        let key = pod.key();
        let mut state = self.lock();
        state.unindex_pod(&key);
        if let Some(node) = pod.spec.node_name.clone() {
            state
                .pods_by_node
                .entry(node)
                .or_default()
                .insert(key.clone());
        }
        state.pods.insert(key, pod);
    }

    pub fn upsert_claim(&self, claim: PersistentVolumeClaim) {
        let key = object_key(claim.namespace(), claim.name());
        self.lock().claims.insert(key, claim);
    }

    pub fn upsert_volume(&self, volume: PersistentVolume) {
        self.lock()
            .volumes
            .insert(volume.name().to_string(), volume);
    }

    pub fn upsert_attachment(&self, attachment: VolumeAttachment) {
        let name = attachment.name().to_string();
        let mut state = self.lock();
        state.unindex_attachment(&name);
        state
            .attachments_by_node
            .entry(attachment.spec.node_name.clone())
            .or_default()
            .insert(name.clone());
        state.attachments.insert(name, attachment);
    }

    /// Makes the next `times` invocations of `point` fail with an API error.
    pub fn fail(&self, point: FailurePoint, times: usize) {
        self.lock().failures.insert(point, times);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&object_key(namespace, name)).cloned()
    }

    pub fn attachment(&self, name: &str) -> Option<VolumeAttachment> {
        self.lock().attachments.get(name).cloned()
    }

    /// `namespace/name` of every pod deleted so far, in deletion order.
    pub fn deleted_pods(&self) -> Vec<String> {
        self.lock().deleted_pods.clone()
    }

    pub fn deleted_attachments(&self) -> Vec<String> {
        self.lock().deleted_attachments.clone()
    }
}

impl ClusterApi for InMemoryCluster {
    fn get_node(&self, name: &str) -> ClusterFuture<Option<Node>> {
        let node = self.lock().nodes.get(name).cloned();
        Box::pin(std::future::ready(Ok(node)))
    }

    fn list_pods_on_node(&self, node: &str) -> ClusterFuture<Vec<Pod>> {
        let mut state = self.lock();
        let result: Result<Vec<Pod>, ClusterError> = state
            .take_failure(FailurePoint::ListPods {
                node: node.to_string(),
            })
            .map(|_| {
                state
                    .pods_by_node
                    .get(node)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(|key| state.pods.get(key).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            });
        Box::pin(std::future::ready(result))
    }

    fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterFuture<Option<PersistentVolumeClaim>> {
        let mut state = self.lock();
        let result = state
            .take_failure(FailurePoint::GetClaim {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .map(|_| state.claims.get(&object_key(namespace, name)).cloned());
        Box::pin(std::future::ready(result))
    }

    fn get_persistent_volume(&self, name: &str) -> ClusterFuture<Option<PersistentVolume>> {
        let mut state = self.lock();
        let result = state
            .take_failure(FailurePoint::GetVolume {
                name: name.to_string(),
            })
            .map(|_| state.volumes.get(name).cloned());
        Box::pin(std::future::ready(result))
    }

    fn list_attachments_on_node(&self, node: &str) -> ClusterFuture<Vec<VolumeAttachment>> {
        let mut state = self.lock();
        let result: Result<Vec<VolumeAttachment>, ClusterError> = state
            .take_failure(FailurePoint::ListAttachments {
                node: node.to_string(),
            })
            .map(|_| {
                state
                    .attachments_by_node
                    .get(node)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(|name| state.attachments.get(name).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            });
        Box::pin(std::future::ready(result))
    }

    fn delete_pod(&self, namespace: &str, name: &str) -> ClusterFuture<()> {
        let key = object_key(namespace, name);
        let mut state = self.lock();
        let result = state
            .take_failure(FailurePoint::DeletePod {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .and_then(|_| {
                if !state.pods.contains_key(&key) {
                    return Err(ClusterError::NotFound(format!("pod {key}")));
                }
                state.unindex_pod(&key);
                state.pods.remove(&key);
                state.deleted_pods.push(key.clone());
                Ok(())
            });
        Box::pin(std::future::ready(result))
    }

    fn delete_attachment(&self, name: &str) -> ClusterFuture<()> {
        let mut state = self.lock();
        let result = state
            .take_failure(FailurePoint::DeleteAttachment {
                name: name.to_string(),
            })
            .and_then(|_| {
                if !state.attachments.contains_key(name) {
                    return Err(ClusterError::NotFound(format!("volumeattachment {name}")));
                }
                state.unindex_attachment(name);
                state.attachments.remove(name);
                state.deleted_attachments.push(name.to_string());
                Ok(())
            });
        Box::pin(std::future::ready(result))
    }
}
