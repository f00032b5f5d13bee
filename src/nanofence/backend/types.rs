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

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Health reported by the storage backend for one of its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Online,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

impl NodeHealth {
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeHealth::Online => "online",
            NodeHealth::Offline => "offline",
            NodeHealth::Unknown => "unknown",
        }
    }
}

impl Display for NodeHealth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
}

/// A node as seen by the storage backend. Only `health` drives fencing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendNode {
    pub name: String,
    #[serde(default)]
    pub health: NodeHealth,
    #[serde(default)]
    pub capacity: NodeCapacity,
}

impl BackendNode {
    pub fn new(name: impl Into<String>, health: NodeHealth) -> Self {
        Self {
            name: name.into(),
            health,
            capacity: NodeCapacity::default(),
        }
    }

    /// Stable identity used as the cache and work-queue key.
    pub fn key(&self) -> &str {
        &self.name
    }

    pub fn is_offline(&self) -> bool {
        self.health == NodeHealth::Offline
    }
}

/// Identity of a backend volume: the claim namespace plus the bound volume name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeKey {
    pub namespace: String,
    pub name: String,
}

impl VolumeKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for VolumeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVolume {
    pub name: String,
    pub namespace: String,
    pub healthy: bool,
}

impl BackendVolume {
    pub fn key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.name.clone())
    }
}
