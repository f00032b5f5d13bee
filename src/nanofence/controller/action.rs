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

//! Timed, retrying action state machine.
//!
//! `Deciding -> Running -> Checking -> (Done | Retrying -> Running ...)`,
//! with the whole Run/Check loop bounded by the policy timeout. When the
//! timeout fires the in-flight round is dropped and the action is abandoned.

use crate::nanofence::controller::reconcile::{ActionCheck, ActionController, ActionManager};
use crate::nanofence::logger::{log_debug, log_error, log_info, log_warn};
use std::time::Duration;
use tokio::time;

const COMPONENT: &str = "action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl ActionPolicy {
    pub fn new(timeout: Duration, backoff: Duration) -> Self {
        Self { timeout, backoff }
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Idle,
    Deciding,
    Running,
    Checking,
    Retrying,
    TimedOut,
}

impl ActionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActionState::Idle => "idle",
            ActionState::Deciding => "deciding",
            ActionState::Running => "running",
            ActionState::Checking => "checking",
            ActionState::Retrying => "retrying",
            ActionState::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The object did not need action.
    Idle,
    /// The key no longer resolves to an object; dropped without retry.
    Stale,
    /// `check` reported `Done` after the given number of rounds.
    Completed { rounds: u32 },
    /// The policy timeout elapsed before `check` reported `Done`.
    TimedOut { rounds: u32 },
    /// Lookup or decision failed.
    Error(String),
}

impl ActionOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            ActionOutcome::Idle => "idle",
            ActionOutcome::Stale => "stale",
            ActionOutcome::Completed { .. } => "completed",
            ActionOutcome::TimedOut { .. } => "timeout",
            ActionOutcome::Error(_) => "error",
        }
    }
}

fn transition(kind: &str, key: &str, state: ActionState) {
    log_debug(
        COMPONENT,
        "Action state changed",
        &[("controller", kind), ("key", key), ("state", state.as_str())],
    );
}

/// Drives one key through decide, run and check.
pub async fn drive<C>(controller: &C, key: &str, policy: &ActionPolicy) -> ActionOutcome
where
    C: ActionController + ?Sized,
{
    let kind = controller.kind();
    transition(kind, key, ActionState::Deciding);

    let object = match controller.get_object(key).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            log_info(
                COMPONENT,
                "Dropping stale request",
                &[("controller", kind), ("key", key)],
            );
            return ActionOutcome::Stale;
        }
        Err(err) => {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to resolve object",
                &[("controller", kind), ("key", key), ("error", error.as_str())],
            );
            return ActionOutcome::Error(error);
        }
    };

    match controller.require_action(&object).await {
        Ok(true) => {}
        Ok(false) => {
            transition(kind, key, ActionState::Idle);
            return ActionOutcome::Idle;
        }
        Err(err) => {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to decide on action",
                &[("controller", kind), ("key", key), ("error", error.as_str())],
            );
            return ActionOutcome::Error(error);
        }
    }

    let manager = controller.build_action_manager(object);
    let mut rounds = 0u32;
    let result = time::timeout(
        policy.timeout,
        run_rounds(manager.as_ref(), kind, key, policy.backoff, &mut rounds),
    )
    .await;

    match result {
        Ok(()) => {
            transition(kind, key, ActionState::Idle);
            let rounds_label = rounds.to_string();
            log_info(
                COMPONENT,
                "Action completed",
                &[("controller", kind), ("key", key), ("rounds", rounds_label.as_str())],
            );
            ActionOutcome::Completed { rounds }
        }
        Err(_) => {
            transition(kind, key, ActionState::TimedOut);
            let timeout = humantime::format_duration(policy.timeout).to_string();
            let rounds_label = rounds.to_string();
            log_error(
                COMPONENT,
                "Action timed out; abandoning until next trigger",
                &[
                    ("controller", kind),
                    ("key", key),
                    ("timeout", timeout.as_str()),
                    ("rounds", rounds_label.as_str()),
                ],
            );
            ActionOutcome::TimedOut { rounds }
        }
    }
}

async fn run_rounds<E>(
    manager: &dyn ActionManager<Error = E>,
    kind: &str,
    key: &str,
    backoff: Duration,
    rounds: &mut u32,
) where
    E: std::error::Error + Send + Sync + 'static,
{
    loop {
        *rounds += 1;
        transition(kind, key, ActionState::Running);
        if let Err(err) = manager.run().await {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Action run failed",
                &[("controller", kind), ("key", key), ("error", error.as_str())],
            );
        }

        transition(kind, key, ActionState::Checking);
        match manager.check().await {
            Ok(ActionCheck::Done) => return,
            Ok(ActionCheck::Retry) => {}
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Action check failed",
                    &[("controller", kind), ("key", key), ("error", error.as_str())],
                );
            }
        }

        transition(kind, key, ActionState::Retrying);
        time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanofence::controller::reconcile::ActionFuture;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Default)]
    struct Counters {
        runs: AtomicU32,
        checks: AtomicU32,
    }

    struct ScriptedManager {
        counters: Arc<Counters>,
        done_after: u32,
        fail_runs: bool,
    }

    impl ActionManager for ScriptedManager {
        type Error = TestError;

        fn run(&self) -> ActionFuture<'_, (), TestError> {
            Box::pin(async move {
                self.counters.runs.fetch_add(1, Ordering::SeqCst);
                if self.fail_runs {
                    return Err(TestError("delete failed"));
                }
                Ok(())
            })
        }

        fn check(&self) -> ActionFuture<'_, ActionCheck, TestError> {
            Box::pin(async move {
                let checks = self.counters.checks.fetch_add(1, Ordering::SeqCst) + 1;
                if checks >= self.done_after {
                    Ok(ActionCheck::Done)
                } else if checks % 2 == 0 {
                    Err(TestError("transient"))
                } else {
                    Ok(ActionCheck::Retry)
                }
            })
        }
    }

    struct ScriptedController {
        exists: bool,
        needs_action: bool,
        done_after: u32,
        fail_runs: bool,
        policy: ActionPolicy,
        counters: Arc<Counters>,
    }

    impl ScriptedController {
        fn new(done_after: u32) -> Self {
            Self {
                exists: true,
                needs_action: true,
                done_after,
                fail_runs: false,
                policy: ActionPolicy::new(Duration::from_secs(60), Duration::from_secs(10)),
                counters: Arc::new(Counters::default()),
            }
        }
    }

    impl ActionController for ScriptedController {
        type Object = String;
        type Error = TestError;

        fn kind(&self) -> &'static str {
            "Scripted"
        }

        fn get_object<'a>(&'a self, key: &'a str) -> ActionFuture<'a, Option<String>, TestError> {
            let object = self.exists.then(|| key.to_string());
            Box::pin(async move { Ok(object) })
        }

        fn require_action<'a>(&'a self, _object: &'a String) -> ActionFuture<'a, bool, TestError> {
            Box::pin(async move { Ok(self.needs_action) })
        }

        fn build_action_manager(&self, _object: String) -> Box<dyn ActionManager<Error = TestError>> {
            Box::new(ScriptedManager {
                counters: Arc::clone(&self.counters),
                done_after: self.done_after,
                fail_runs: self.fail_runs,
            })
        }

        fn policy(&self) -> ActionPolicy {
            self.policy
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_object_is_stale_and_never_runs() {
        let mut controller = ScriptedController::new(1);
        controller.exists = false;
        let outcome = drive(&controller, "n1", &controller.policy()).await;
        assert_eq!(outcome, ActionOutcome::Stale);
        assert_eq!(controller.counters.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_action_required_is_idle() {
        let mut controller = ScriptedController::new(1);
        controller.needs_action = false;
        let outcome = drive(&controller, "n1", &controller.policy()).await;
        assert_eq!(outcome, ActionOutcome::Idle);
        assert_eq!(controller.counters.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_check_reports_done() {
        let controller = ScriptedController::new(4);
        let started = time::Instant::now();
        let outcome = drive(&controller, "n1", &controller.policy()).await;

        assert_eq!(outcome, ActionOutcome::Completed { rounds: 4 });
        assert_eq!(controller.counters.runs.load(Ordering::SeqCst), 4);
        // Three backoffs between four rounds; a failed check also retries.
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn run_errors_still_reach_check() {
        let mut controller = ScriptedController::new(1);
        controller.fail_runs = true;
        let outcome = drive(&controller, "n1", &controller.policy()).await;
        assert_eq!(outcome, ActionOutcome::Completed { rounds: 1 });
        assert_eq!(controller.counters.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let mut controller = ScriptedController::new(u32::MAX);
        controller.policy = ActionPolicy::new(Duration::from_secs(60), Duration::from_secs(7));
        let outcome = drive(&controller, "n1", &controller.policy()).await;
        // Rounds start every 7s up to 56s; the 60s deadline interrupts the
        // backoff that follows the ninth round.
        assert_eq!(outcome, ActionOutcome::TimedOut { rounds: 9 });
        assert_eq!(outcome.as_label(), "timeout");
    }
}
