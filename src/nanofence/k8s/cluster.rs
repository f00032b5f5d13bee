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

use super::types::{Node, PersistentVolume, PersistentVolumeClaim, Pod, VolumeAttachment};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;

pub type ClusterFuture<T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    NotFound(String),
    Conflict(String),
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::NotFound(what) => write!(f, "{what} not found"),
            ClusterError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ClusterError::Api(msg) => write!(f, "cluster API error: {msg}"),
        }
    }
}

impl Error for ClusterError {}

/// Cluster operations consumed by the fencing core.
///
/// Reads return `None` for absent objects. Deletes return
/// `ClusterError::NotFound` for absent objects so callers can decide whether
/// that counts as success.
pub trait ClusterApi: Send + Sync {
    fn get_node(&self, name: &str) -> ClusterFuture<Option<Node>>;

    /// Pods whose `spec.nodeName` is `node`.
    fn list_pods_on_node(&self, node: &str) -> ClusterFuture<Vec<Pod>>;

    fn get_claim(&self, namespace: &str, name: &str)
        -> ClusterFuture<Option<PersistentVolumeClaim>>;

    fn get_persistent_volume(&self, name: &str) -> ClusterFuture<Option<PersistentVolume>>;

    /// Attachments whose `spec.nodeName` is `node`.
    fn list_attachments_on_node(&self, node: &str) -> ClusterFuture<Vec<VolumeAttachment>>;

    /// Deletes the pod immediately, without a termination grace period.
    fn delete_pod(&self, namespace: &str, name: &str) -> ClusterFuture<()>;

    fn delete_attachment(&self, name: &str) -> ClusterFuture<()>;
}
