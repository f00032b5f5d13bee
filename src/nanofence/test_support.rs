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

//! Fixtures shared by unit and integration tests: a scriptable storage
//! backend and builders for the cluster objects the fencing core reads.

use crate::nanofence::backend::{
    BackendClient, BackendError, BackendFuture, BackendHandle, BackendNode, BackendVolume,
    NodeHealth, VolumeKey,
};
use crate::nanofence::k8s::types::{
    AttachmentSource, AttachmentSpec, AttachmentStatus, ClaimSpec, ClaimVolumeSource,
    CsiVolumeSource, Node, ObjectMeta, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec, Pod, PodSpec, PodVolume, VolumeAttachment,
    STORAGE_PROVISIONER_ANNOTATION,
};
use crate::nanofence::k8s::InMemoryCluster;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_DRIVER: &str = "csi.nanocloud.io";
pub const TEST_LABEL: &str = "nanofence.io/node-fencing";

#[derive(Default)]
struct BackendState {
    nodes: BTreeMap<String, BackendNode>,
    volumes: HashMap<VolumeKey, bool>,
    failing_volumes: HashSet<VolumeKey>,
    list_failures: usize,
}

/// In-process storage backend whose answers tests can change at any time.
#[derive(Default)]
pub struct StaticBackend {
    state: Mutex<BackendState>,
    list_calls: AtomicUsize,
}

impl StaticBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn set_node(&self, name: &str, health: NodeHealth) {
        self.with_state(|state| {
            state
                .nodes
                .insert(name.to_string(), BackendNode::new(name, health))
        });
    }

    pub fn set_volume_health(&self, namespace: &str, name: &str, healthy: bool) {
        self.with_state(|state| state.volumes.insert(VolumeKey::new(namespace, name), healthy));
    }

    /// Makes volume queries for the given volume fail until cleared.
    pub fn set_volume_failing(&self, namespace: &str, name: &str, failing: bool) {
        let key = VolumeKey::new(namespace, name);
        self.with_state(|state| {
            if failing {
                state.failing_volumes.insert(key);
            } else {
                state.failing_volumes.remove(&key);
            }
        });
    }

    /// Makes the next `times` node listings fail.
    pub fn fail_list_nodes(&self, times: usize) {
        self.with_state(|state| state.list_failures = times);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn handle(self: &Arc<Self>) -> BackendHandle {
        BackendHandle::from_client(
            Arc::clone(self) as Arc<dyn BackendClient>,
            Duration::from_secs(5),
        )
    }
}

impl BackendClient for StaticBackend {
    fn list_nodes(&self) -> BackendFuture<Vec<BackendNode>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let result: Result<Vec<BackendNode>, BackendError> = self.with_state(|state| {
            if state.list_failures > 0 {
                state.list_failures -= 1;
                Err(BackendError::Unavailable("connection refused".to_string()))
            } else {
                Ok(state.nodes.values().cloned().collect())
            }
        });
        Box::pin(std::future::ready(result))
    }

    fn get_volume(&self, key: &VolumeKey) -> BackendFuture<BackendVolume> {
        let result = self.with_state(|state| {
            if state.failing_volumes.contains(key) {
                return Err(BackendError::Unavailable("volume service down".to_string()));
            }
            state
                .volumes
                .get(key)
                .map(|healthy| BackendVolume {
                    name: key.name.clone(),
                    namespace: key.namespace.clone(),
                    healthy: *healthy,
                })
                .ok_or_else(|| BackendError::NotFound(format!("volume {key}")))
        });
        Box::pin(std::future::ready(result))
    }
}

/// Pod on `node` mounting `claims`, with the fencing label set to `label`.
pub fn pod(namespace: &str, name: &str, node: &str, label: Option<&str>, claims: &[&str]) -> Pod {
    let mut metadata = ObjectMeta::namespaced(namespace, name);
    if let Some(value) = label {
        metadata
            .labels
            .insert(TEST_LABEL.to_string(), value.to_string());
    }
    let volumes = claims
        .iter()
        .map(|claim| PodVolume {
            name: format!("vol-{claim}"),
            persistent_volume_claim: Some(ClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: false,
            }),
        })
        .collect();
    Pod {
        metadata,
        spec: PodSpec {
            node_name: Some(node.to_string()),
            volumes,
        },
    }
}

/// Pod that opted into fencing.
pub fn fenced_pod(namespace: &str, name: &str, node: &str, claims: &[&str]) -> Pod {
    pod(namespace, name, node, Some("true"), claims)
}

/// Claim bound to `volume`, annotated with `provisioner` when given.
pub fn claim(
    namespace: &str,
    name: &str,
    volume: &str,
    provisioner: Option<&str>,
) -> PersistentVolumeClaim {
    let mut metadata = ObjectMeta::namespaced(namespace, name);
    if let Some(provisioner) = provisioner {
        metadata.annotations.insert(
            STORAGE_PROVISIONER_ANNOTATION.to_string(),
            provisioner.to_string(),
        );
    }
    PersistentVolumeClaim {
        metadata,
        spec: ClaimSpec {
            volume_name: Some(volume.to_string()),
            storage_class_name: None,
        },
    }
}

pub fn persistent_volume(name: &str, driver: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta::named(name),
        spec: PersistentVolumeSpec {
            csi: Some(CsiVolumeSource {
                driver: driver.to_string(),
                volume_handle: format!("handle-{name}"),
            }),
        },
    }
}

pub fn attachment(name: &str, node: &str, volume: &str, attacher: &str) -> VolumeAttachment {
    VolumeAttachment {
        metadata: ObjectMeta::named(name),
        spec: AttachmentSpec {
            attacher: attacher.to_string(),
            node_name: node.to_string(),
            source: AttachmentSource {
                persistent_volume_name: Some(volume.to_string()),
            },
        },
        status: Some(AttachmentStatus { attached: true }),
    }
}

/// Cluster and backend populated together.
#[derive(Clone)]
pub struct FencingFixture {
    pub cluster: InMemoryCluster,
    pub backend: Arc<StaticBackend>,
}

impl Default for FencingFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl FencingFixture {
    pub fn new() -> Self {
        Self {
            cluster: InMemoryCluster::new(),
            backend: StaticBackend::new(),
        }
    }

    /// Registers `name` in the cluster and in the backend with `health`.
    pub fn node(&self, name: &str, health: NodeHealth) -> &Self {
        self.cluster.upsert_node(Node::new(name));
        self.backend.set_node(name, health);
        self
    }

    /// Adds a backend-provisioned claim bound to `pv-<claim>`, its volume
    /// record, an attachment `va-<claim>` on `node` and the backend health.
    pub fn backend_claim(&self, namespace: &str, claim_name: &str, node: &str, healthy: bool) -> &Self {
        let volume = format!("pv-{claim_name}");
        self.cluster
            .upsert_claim(claim(namespace, claim_name, &volume, Some(TEST_DRIVER)));
        self.cluster
            .upsert_volume(persistent_volume(&volume, TEST_DRIVER));
        self.cluster.upsert_attachment(attachment(
            &format!("va-{claim_name}"),
            node,
            &volume,
            TEST_DRIVER,
        ));
        self.backend.set_volume_health(namespace, &volume, healthy);
        self
    }

    pub fn pod(&self, pod: Pod) -> &Self {
        self.cluster.upsert_pod(pod);
        self
    }
}
