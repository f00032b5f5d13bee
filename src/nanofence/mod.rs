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

//! Node fencing for storage-backed workloads.
//!
//! The controller polls the storage backend for node health, keeps the
//! result in an expiring cache, and evicts opted-in pods (plus their volume
//! attachments) from nodes the backend reports offline, but only when every
//! backend volume the pod uses is healthy.

pub mod backend;
pub mod config;
pub mod controller;
pub mod k8s;
pub mod logger;
pub mod observability;
pub mod server;
pub mod test_support;
pub mod util;
