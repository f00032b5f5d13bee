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

//! Storage backend integration: node/volume records, the client contract and
//! the node health poller.

pub mod client;
pub mod poller;
pub mod types;

pub use client::{
    spawn_reset_listener, BackendClient, BackendError, BackendFuture, BackendHandle,
    HttpBackendClient,
};
pub use poller::{NodeEvent, NodeHealthPoller};
pub use types::{BackendNode, BackendVolume, NodeCapacity, NodeHealth, VolumeKey};
