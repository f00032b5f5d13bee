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

use crate::nanofence::controller::reconcile::Reconciler;
use crate::nanofence::logger::{log_debug, log_warn};
use crate::nanofence::observability::metrics::{self, ControllerReconcileResult};
use crate::nanofence::observability::tracing::with_span;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller-runtime";

/// Keyed, de-duplicating work queue.
///
/// A key is queued at most once. A key handed to a worker is not handed to a
/// second one until `done` is called; adding it in the meantime marks it
/// dirty and it is queued again on `done`.
#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

#[derive(Default)]
struct WorkQueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("work queue lock poisoned")
    }

    /// Queues `key` unless it is already waiting. Never blocks.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue shuts down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as finished, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the work queue and the bounded pool of reconcile workers.
#[derive(Clone, Default)]
pub struct ControllerRuntime {
    work_queue: WorkQueue,
}

impl ControllerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn work_queue(&self) -> WorkQueue {
        self.work_queue.clone()
    }

    /// Starts `count` workers feeding keys to `reconciler`. At most `count`
    /// reconciles run at once and a key is never reconciled concurrently.
    /// Cancellation abandons in-flight reconciles.
    pub fn spawn_workers(
        &self,
        count: usize,
        reconciler: Arc<dyn Reconciler>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let queue = self.work_queue.clone();
        let stopper = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                queue.shutdown();
            })
        };

        let mut handles = vec![stopper];
        for worker in 0..count.max(1) {
            let queue = queue.clone();
            let reconciler = Arc::clone(&reconciler);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    let finished = tokio::select! {
                        _ = cancel.cancelled() => false,
                        _ = process(reconciler.as_ref(), &key) => true,
                    };
                    queue.done(&key);
                    if !finished {
                        break;
                    }
                }
                let worker = worker.to_string();
                log_debug(COMPONENT, "Worker stopped", &[("worker", worker.as_str())]);
            }));
        }
        handles
    }
}

async fn process(reconciler: &dyn Reconciler, key: &str) {
    let kind = reconciler.kind();
    let result = with_span(COMPONENT, format!("{kind}/{key}"), reconciler.reconcile(key)).await;
    match result {
        Ok(()) => metrics::record_controller_reconcile(kind, ControllerReconcileResult::Success),
        Err(err) => {
            metrics::record_controller_reconcile(kind, ControllerReconcileResult::Error);
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Reconcile failed",
                &[("controller", kind), ("key", key), ("error", error.as_str())],
            );
        }
    }
}
