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

//! `ClusterApi` backed by the Kubernetes API server.

use super::cluster::{ClusterApi, ClusterError, ClusterFuture};
use super::types::{
    AttachmentSource, AttachmentSpec, AttachmentStatus, ClaimSpec, ClaimVolumeSource,
    CsiVolumeSource, Node, ObjectMeta, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec, Pod, PodSpec, PodVolume, VolumeAttachment,
};
use ::kube::api::{Api, DeleteParams, ListParams};
use ::kube::Client;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::storage::v1 as storagev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self, ::kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }
}

impl From<::kube::Error> for ClusterError {
    fn from(err: ::kube::Error) -> Self {
        match err {
            ::kube::Error::Api(response) if response.code == 404 => {
                ClusterError::NotFound(response.message)
            }
            ::kube::Error::Api(response) if response.code == 409 => {
                ClusterError::Conflict(response.message)
            }
            other => ClusterError::Api(other.to_string()),
        }
    }
}

fn node_selector(node: &str) -> ListParams {
    ListParams::default().fields(&format!("spec.nodeName={node}"))
}

impl ClusterApi for KubeCluster {
    fn get_node(&self, name: &str) -> ClusterFuture<Option<Node>> {
        let api: Api<corev1::Node> = Api::all(self.client.clone());
        let name = name.to_string();
        Box::pin(async move {
            let node = api.get_opt(&name).await?;
            Ok::<_, ClusterError>(node.map(|node| Node {
                metadata: convert_meta(node.metadata),
            }))
        })
    }

    fn list_pods_on_node(&self, node: &str) -> ClusterFuture<Vec<Pod>> {
        let api: Api<corev1::Pod> = Api::all(self.client.clone());
        let params = node_selector(node);
        Box::pin(async move {
            let pods = api.list(&params).await?;
            Ok::<_, ClusterError>(pods.items.into_iter().map(convert_pod).collect())
        })
    }

    fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterFuture<Option<PersistentVolumeClaim>> {
        let api: Api<corev1::PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        Box::pin(async move {
            let claim = api.get_opt(&name).await?;
            Ok::<_, ClusterError>(claim.map(convert_claim))
        })
    }

    fn get_persistent_volume(&self, name: &str) -> ClusterFuture<Option<PersistentVolume>> {
        let api: Api<corev1::PersistentVolume> = Api::all(self.client.clone());
        let name = name.to_string();
        Box::pin(async move {
            let volume = api.get_opt(&name).await?;
            Ok::<_, ClusterError>(volume.map(convert_volume))
        })
    }

    fn list_attachments_on_node(&self, node: &str) -> ClusterFuture<Vec<VolumeAttachment>> {
        // The API server has no field selector for spec.nodeName on attachments.
        let api: Api<storagev1::VolumeAttachment> = Api::all(self.client.clone());
        let node = node.to_string();
        Box::pin(async move {
            let attachments = api.list(&ListParams::default()).await?;
            Ok::<_, ClusterError>(
                attachments
                    .items
                    .into_iter()
                    .map(convert_attachment)
                    .filter(|attachment| attachment.node_name() == node)
                    .collect(),
            )
        })
    }

    fn delete_pod(&self, namespace: &str, name: &str) -> ClusterFuture<()> {
        let api: Api<corev1::Pod> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        Box::pin(async move {
            let params = DeleteParams {
                grace_period_seconds: Some(0),
                ..DeleteParams::default()
            };
            api.delete(&name, &params).await?;
            Ok::<_, ClusterError>(())
        })
    }

    fn delete_attachment(&self, name: &str) -> ClusterFuture<()> {
        let api: Api<storagev1::VolumeAttachment> = Api::all(self.client.clone());
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default()).await?;
            Ok::<_, ClusterError>(())
        })
    }
}

fn convert_meta(metadata: metav1::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: metadata.name.unwrap_or_default(),
        namespace: metadata.namespace,
        labels: metadata.labels.unwrap_or_default().into_iter().collect(),
        annotations: metadata.annotations.unwrap_or_default().into_iter().collect(),
    }
}

fn convert_pod(pod: corev1::Pod) -> Pod {
    let spec = pod.spec.unwrap_or_default();
    let volumes = spec
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|volume| PodVolume {
            name: volume.name,
            persistent_volume_claim: volume.persistent_volume_claim.map(|source| {
                ClaimVolumeSource {
                    claim_name: source.claim_name,
                    read_only: source.read_only.unwrap_or(false),
                }
            }),
        })
        .collect();
    Pod {
        metadata: convert_meta(pod.metadata),
        spec: PodSpec {
            node_name: spec.node_name,
            volumes,
        },
    }
}

fn convert_claim(claim: corev1::PersistentVolumeClaim) -> PersistentVolumeClaim {
    let spec = claim.spec.unwrap_or_default();
    PersistentVolumeClaim {
        metadata: convert_meta(claim.metadata),
        spec: ClaimSpec {
            volume_name: spec.volume_name,
            storage_class_name: spec.storage_class_name,
        },
    }
}

fn convert_volume(volume: corev1::PersistentVolume) -> PersistentVolume {
    let csi = volume
        .spec
        .and_then(|spec| spec.csi)
        .map(|csi| CsiVolumeSource {
            driver: csi.driver,
            volume_handle: csi.volume_handle,
        });
    PersistentVolume {
        metadata: convert_meta(volume.metadata),
        spec: PersistentVolumeSpec { csi },
    }
}

fn convert_attachment(attachment: storagev1::VolumeAttachment) -> VolumeAttachment {
    VolumeAttachment {
        metadata: convert_meta(attachment.metadata),
        spec: AttachmentSpec {
            attacher: attachment.spec.attacher,
            node_name: attachment.spec.node_name,
            source: AttachmentSource {
                persistent_volume_name: attachment.spec.source.persistent_volume_name,
            },
        },
        status: attachment.status.map(|status| AttachmentStatus {
            attached: status.attached,
        }),
    }
}
