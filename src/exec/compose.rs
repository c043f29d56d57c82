//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Structural steps: everything that composes other steps.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec::compose_errors;
use crate::exec::BoxedStep;
use crate::exec::RunState;
use crate::exec::Step;
use crate::resource::ResourceError;

/// Runs all children concurrently and joins on all of them.
pub struct AggregateStep {
    steps: Vec<BoxedStep>,
}

impl AggregateStep {
    pub fn new(steps: Vec<BoxedStep>) -> Self {
        AggregateStep { steps }
    }
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        let results = futures::future::join_all(
            self.steps.iter_mut().map(|step| step.run(token, state)),
        )
        .await;

        let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();

        // A cancellation wins so the build classifies as aborted.
        if let Some(idx) = errors.iter().position(ResourceError::is_cancelled) {
            return Err(errors.swap_remove(idx));
        }

        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn succeeded(&self) -> bool {
        self.steps.iter().all(|step| step.succeeded())
    }
}

/// Runs children in order; a child that errors or fails short-circuits the
/// rest.
pub struct DoStep {
    steps: Vec<BoxedStep>,
    ran_all: bool,
}

impl DoStep {
    pub fn new(steps: Vec<BoxedStep>) -> Self {
        DoStep {
            steps,
            ran_all: false,
        }
    }
}

#[async_trait]
impl Step for DoStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        for step in self.steps.iter_mut() {
            step.run(token, state).await?;

            if !step.succeeded() {
                return Ok(());
            }
        }

        self.ran_all = true;
        Ok(())
    }

    fn succeeded(&self) -> bool {
        self.ran_all && self.steps.iter().all(|step| step.succeeded())
    }
}

/// Swallows child errors; a try step always counts as successful. Only a
/// cancellation still propagates, since an aborted build must stay aborted.
pub struct TryStep {
    step: BoxedStep,
}

impl TryStep {
    pub fn new(step: BoxedStep) -> Self {
        TryStep { step }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        match self.step.run(token, state).await {
            Ok(()) => Ok(()),
            Err(e) if ResourceError::is_cancelled(&e) => Err(e),
            Err(e) => {
                debug!(error = %e, "try step swallowed error");
                Ok(())
            }
        }
    }

    fn succeeded(&self) -> bool {
        true
    }
}

/// Interrupts the child after a wall-clock budget. A timeout makes the step
/// unsuccessful without erroring the build.
pub struct TimeoutStep {
    step: BoxedStep,
    duration: std::time::Duration,
    timed_out: bool,
}

impl TimeoutStep {
    pub fn new(step: BoxedStep, duration: std::time::Duration) -> Self {
        TimeoutStep {
            step,
            duration,
            timed_out: false,
        }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        let child = token.child_token();

        match tokio::time::timeout(self.duration, self.step.run(&child, state)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                debug!("step timed out");
                child.cancel();
                self.timed_out = true;
                Ok(())
            }
        }
    }

    fn succeeded(&self) -> bool {
        !self.timed_out && self.step.succeeded()
    }
}

/// Runs the hook after the step, but only if the step succeeded.
pub struct OnSuccessStep {
    step: BoxedStep,
    hook: BoxedStep,
}

impl OnSuccessStep {
    pub fn new(step: BoxedStep, hook: BoxedStep) -> Self {
        OnSuccessStep { step, hook }
    }
}

#[async_trait]
impl Step for OnSuccessStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        self.step.run(token, state).await?;

        if !self.step.succeeded() {
            return Ok(());
        }

        self.hook.run(token, state).await
    }

    fn succeeded(&self) -> bool {
        self.step.succeeded() && self.hook.succeeded()
    }
}

/// Runs the hook after the step, but only if the step ran and failed.
/// The step's own result is what counts.
pub struct OnFailureStep {
    step: BoxedStep,
    hook: BoxedStep,
}

impl OnFailureStep {
    pub fn new(step: BoxedStep, hook: BoxedStep) -> Self {
        OnFailureStep { step, hook }
    }
}

#[async_trait]
impl Step for OnFailureStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        self.step.run(token, state).await?;

        if self.step.succeeded() {
            return Ok(());
        }

        self.hook.run(token, state).await
    }

    fn succeeded(&self) -> bool {
        self.step.succeeded()
    }
}

/// Runs the hook when the step was cancelled, then still surfaces the
/// cancellation.
pub struct OnAbortStep {
    step: BoxedStep,
    hook: BoxedStep,
}

impl OnAbortStep {
    pub fn new(step: BoxedStep, hook: BoxedStep) -> Self {
        OnAbortStep { step, hook }
    }
}

#[async_trait]
impl Step for OnAbortStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        match self.step.run(token, state).await {
            Err(e) if ResourceError::is_cancelled(&e) => {
                // The hook may add errors but the cancellation itself is
                // what the engine must classify from.
                if let Err(hook_error) = self.hook.run(token, state).await {
                    debug!(error = %hook_error, "abort hook failed");
                }
                Err(e)
            }
            other => other,
        }
    }

    fn succeeded(&self) -> bool {
        self.step.succeeded()
    }
}

/// Always runs the hook, composing errors without ever replacing a
/// cancellation.
pub struct EnsureStep {
    step: BoxedStep,
    hook: BoxedStep,
}

impl EnsureStep {
    pub fn new(step: BoxedStep, hook: BoxedStep) -> Self {
        EnsureStep { step, hook }
    }
}

#[async_trait]
impl Step for EnsureStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        let step_error = self.step.run(token, state).await.err();
        let hook_error = self.hook.run(token, state).await.err();

        match compose_errors(step_error, hook_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn succeeded(&self) -> bool {
        self.step.succeeded() && self.hook.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    /// A scripted step for exercising the structural combinators.
    struct ScriptedStep {
        outcome: Option<&'static str>,
        ran: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl ScriptedStep {
        fn ok() -> Self {
            Self::new(None)
        }

        fn failing() -> Self {
            Self::new(Some("failed"))
        }

        fn erroring() -> Self {
            Self::new(Some("error"))
        }

        fn cancelled() -> Self {
            Self::new(Some("cancelled"))
        }

        fn new(outcome: Option<&'static str>) -> Self {
            ScriptedStep {
                outcome,
                ran: Default::default(),
            }
        }

        fn tracker(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
            self.ran.clone()
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        async fn run(&mut self, _token: &CancellationToken, _state: &RunState) -> Result<()> {
            self.ran.store(true, std::sync::atomic::Ordering::SeqCst);
            match self.outcome {
                None | Some("failed") => Ok(()),
                Some("cancelled") => Err(ResourceError::Cancelled.into()),
                _ => Err(anyhow!("scripted error")),
            }
        }

        fn succeeded(&self) -> bool {
            self.outcome.is_none()
        }
    }

    #[tokio::test]
    async fn aggregate_succeeds_iff_all_children_do() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let mut all_ok = AggregateStep::new(vec![Box::new(ScriptedStep::ok()), Box::new(ScriptedStep::ok())]);
        all_ok.run(&token, &state).await.unwrap();
        assert!(all_ok.succeeded());

        let mut one_failed = AggregateStep::new(vec![Box::new(ScriptedStep::ok()), Box::new(ScriptedStep::failing())]);
        one_failed.run(&token, &state).await.unwrap();
        assert!(!one_failed.succeeded());
    }

    #[tokio::test]
    async fn aggregate_prefers_cancellation_over_other_errors() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let mut step =
            AggregateStep::new(vec![Box::new(ScriptedStep::erroring()), Box::new(ScriptedStep::cancelled())]);
        let err = step.run(&token, &state).await.unwrap_err();
        assert!(ResourceError::is_cancelled(&err));
    }

    #[tokio::test]
    async fn do_stops_after_a_failed_child() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let second = ScriptedStep::ok();
        let ran_second = second.tracker();

        let mut step = DoStep::new(vec![Box::new(ScriptedStep::failing()), Box::new(second)]);
        step.run(&token, &state).await.unwrap();

        assert!(!step.succeeded());
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn try_swallows_errors_but_not_cancellation() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let mut swallowed = TryStep::new(Box::new(ScriptedStep::erroring()));
        swallowed.run(&token, &state).await.unwrap();
        assert!(swallowed.succeeded());

        let mut aborted = TryStep::new(Box::new(ScriptedStep::cancelled()));
        assert!(aborted.run(&token, &state).await.is_err());
    }

    #[tokio::test]
    async fn on_failure_runs_hook_only_on_failure() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let hook = ScriptedStep::ok();
        let hook_ran = hook.tracker();
        let mut step = OnFailureStep::new(Box::new(ScriptedStep::failing()), Box::new(hook));
        step.run(&token, &state).await.unwrap();
        assert!(hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!step.succeeded());

        let hook = ScriptedStep::ok();
        let hook_ran = hook.tracker();
        let mut step = OnFailureStep::new(Box::new(ScriptedStep::ok()), Box::new(hook));
        step.run(&token, &state).await.unwrap();
        assert!(!hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(step.succeeded());
    }

    #[tokio::test]
    async fn on_abort_runs_hook_and_stays_cancelled() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let hook = ScriptedStep::erroring();
        let hook_ran = hook.tracker();
        let mut step = OnAbortStep::new(Box::new(ScriptedStep::cancelled()), Box::new(hook));

        let err = step.run(&token, &state).await.unwrap_err();
        assert!(hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(ResourceError::is_cancelled(&err));
    }

    #[tokio::test]
    async fn ensure_always_runs_hook() {
        let state = RunState::new();
        let token = CancellationToken::new();

        let hook = ScriptedStep::ok();
        let hook_ran = hook.tracker();
        let mut step = EnsureStep::new(Box::new(ScriptedStep::erroring()), Box::new(hook));

        assert!(step.run(&token, &state).await.is_err());
        assert!(hook_ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_interrupts_and_fails_the_step() {
        struct SleepyStep;

        #[async_trait]
        impl Step for SleepyStep {
            async fn run(&mut self, token: &CancellationToken, _state: &RunState) -> Result<()> {
                token.cancelled().await;
                Err(ResourceError::Cancelled.into())
            }

            fn succeeded(&self) -> bool {
                true
            }
        }

        let state = RunState::new();
        let token = CancellationToken::new();

        let mut step = TimeoutStep::new(
            Box::new(SleepyStep),
            std::time::Duration::from_millis(10),
        );
        step.run(&token, &state).await.unwrap();
        assert!(!step.succeeded());
    }
}
