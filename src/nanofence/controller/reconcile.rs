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

//! Reconciliation framework shared by every controller.
//!
//! Health-driven controllers implement [`ActionController`]: they look up the
//! object behind a key, decide whether it needs action and build an
//! [`ActionManager`] that performs and verifies that action. Plain sync loops
//! implement [`Ensurer`] instead. Both are adapted to [`Reconciler`], which is
//! what the worker pool runs.

use crate::nanofence::controller::action::{self, ActionOutcome, ActionPolicy};
use crate::nanofence::observability::metrics;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ReconcileFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ReconcileError>> + Send + 'a>>;
pub type ActionFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Entry point the worker pool drives for every dequeued key.
pub trait Reconciler: Send + Sync {
    /// Logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileError {
    kind: &'static str,
    key: String,
    message: String,
}

impl ReconcileError {
    pub fn new(kind: &'static str, key: &str, message: impl Display) -> Self {
        Self {
            kind,
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} reconcile of {} failed: {}", self.kind, self.key, self.message)
    }
}

impl Error for ReconcileError {}

/// Result of verifying an action round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCheck {
    /// Nothing left to do for this object.
    Done,
    /// Work remains; run again after the backoff.
    Retry,
}

/// Performs and verifies the action for one object. `run` must be
/// idempotent: it is repeated until `check` reports `Done`.
pub trait ActionManager: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    fn run(&self) -> ActionFuture<'_, (), Self::Error>;

    fn check(&self) -> ActionFuture<'_, ActionCheck, Self::Error>;
}

pub trait ActionController: Send + Sync {
    type Object: Send + Sync;
    type Error: Error + Send + Sync + 'static;

    fn kind(&self) -> &'static str;

    /// Resolves `key` to the object to act on. `None` means the key is stale.
    fn get_object<'a>(&'a self, key: &'a str) -> ActionFuture<'a, Option<Self::Object>, Self::Error>;

    fn require_action<'a>(&'a self, object: &'a Self::Object) -> ActionFuture<'a, bool, Self::Error>;

    fn build_action_manager(
        &self,
        object: Self::Object,
    ) -> Box<dyn ActionManager<Error = Self::Error>>;

    fn policy(&self) -> ActionPolicy;
}

/// Runs an [`ActionController`] through the action state machine.
pub struct ActionReconciler<C> {
    controller: Arc<C>,
}

impl<C> ActionReconciler<C>
where
    C: ActionController + 'static,
{
    pub fn new(controller: Arc<C>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<C> {
        &self.controller
    }
}

impl<C> Reconciler for ActionReconciler<C>
where
    C: ActionController + 'static,
{
    fn kind(&self) -> &'static str {
        self.controller.kind()
    }

    fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a> {
        Box::pin(async move {
            let kind = self.controller.kind();
            let policy = self.controller.policy();
            let outcome = action::drive(self.controller.as_ref(), key, &policy).await;
            metrics::record_action_outcome(kind, outcome.as_label());
            match outcome {
                ActionOutcome::Error(message) => Err(ReconcileError::new(kind, key, message)),
                ActionOutcome::TimedOut { rounds } => Err(ReconcileError::new(
                    kind,
                    key,
                    format!(
                        "action abandoned after {} ({rounds} rounds)",
                        humantime::format_duration(policy.timeout)
                    ),
                )),
                ActionOutcome::Idle | ActionOutcome::Stale | ActionOutcome::Completed { .. } => {
                    Ok(())
                }
            }
        })
    }
}

pub type EnsureFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send + 'a>>;

/// Entry point of the simpler diff-and-apply sync loops.
pub trait Ensurer: Send + Sync {
    fn kind(&self) -> &'static str;

    fn ensure<'a>(&'a self, key: &'a str) -> EnsureFuture<'a>;
}

/// Adapts an [`Ensurer`] to the worker pool.
pub struct EnsureReconciler<E> {
    ensurer: E,
}

impl<E: Ensurer> EnsureReconciler<E> {
    pub fn new(ensurer: E) -> Self {
        Self { ensurer }
    }
}

impl<E: Ensurer> Reconciler for EnsureReconciler<E> {
    fn kind(&self) -> &'static str {
        self.ensurer.kind()
    }

    fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a> {
        Box::pin(async move {
            self.ensurer
                .ensure(key)
                .await
                .map_err(|err| ReconcileError::new(self.ensurer.kind(), key, err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanofence::util::error::new_error;
    use std::sync::Mutex;

    struct RecordingEnsurer {
        seen: Mutex<Vec<String>>,
    }

    impl Ensurer for RecordingEnsurer {
        fn kind(&self) -> &'static str {
            "Labels"
        }

        fn ensure<'a>(&'a self, key: &'a str) -> EnsureFuture<'a> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(key.to_string());
                if key == "broken" {
                    return Err(new_error("label patch rejected"));
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn ensure_reconciler_forwards_keys_and_wraps_errors() {
        let reconciler = EnsureReconciler::new(RecordingEnsurer {
            seen: Mutex::new(Vec::new()),
        });
        assert_eq!(reconciler.kind(), "Labels");

        reconciler.reconcile("apps").await.expect("ok");
        let err = reconciler.reconcile("broken").await.expect_err("error");
        assert_eq!(err.key(), "broken");
        assert_eq!(
            err.to_string(),
            "Labels reconcile of broken failed: label patch rejected"
        );
        assert_eq!(
            reconciler.ensurer.seen.lock().unwrap().clone(),
            vec!["apps".to_string(), "broken".to_string()]
        );
    }
}
