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

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Poll status shared between the node health poller and the probes.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    polled_once: AtomicBool,
    last_poll_ok: AtomicBool,
    last_success_unix: AtomicU64,
    consecutive_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll_success(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.inner.polled_once.store(true, Ordering::SeqCst);
        self.inner.last_poll_ok.store(true, Ordering::SeqCst);
        self.inner.last_success_unix.store(now, Ordering::SeqCst);
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
        *self.lock_error() = None;
    }

    pub fn record_poll_failure(&self, error: impl ToString) {
        self.inner.last_poll_ok.store(false, Ordering::SeqCst);
        self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.lock_error() = Some(error.to_string());
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Readiness requires at least one successful poll and a healthy last poll.
    pub fn readiness_report(&self) -> HealthReport {
        let component = if !self.inner.polled_once.load(Ordering::SeqCst)
            && self.consecutive_failures() == 0
        {
            ComponentHealth::unhealthy("backend_poller", "waiting for first poll")
        } else if self.inner.last_poll_ok.load(Ordering::SeqCst) {
            ComponentHealth::healthy("backend_poller")
        } else {
            let error = self
                .lock_error()
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            ComponentHealth::unhealthy(
                "backend_poller",
                format!(
                    "{} consecutive failures; last error: {}",
                    self.consecutive_failures(),
                    error
                ),
            )
        };

        let status = if component.healthy {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            components: vec![component],
        }
    }

    fn lock_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Liveness probes only confirm the process is serving requests.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}
