//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Per-build supervision.
//!
//! Every supervised build acquires its tracking lock (so that at most one
//! control plane replica drives it), wires the abort notifier into a
//! cancellation token, runs the step tree and persists the terminal state.
//! Closing the engine's release channel makes all supervisors return
//! without finishing their builds; a later tracker picks the builds up from
//! the state they left in the database.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::db::models::BuildStatus;
use crate::db::AbortBus;
use crate::db::LockId;
use crate::db::LockService;
use crate::engine::StepBuilder;
use crate::engine::TrackedBuild;
use crate::exec::RunState;
use crate::resource::ResourceError;

pub struct Engine<B, S> {
    builder: Arc<S>,
    locks: Arc<dyn LockService>,
    aborts: Arc<AbortBus>,
    lock_ttl: Duration,

    release_tx: watch::Sender<bool>,
    tracked: Arc<Mutex<HashMap<i32, Arc<RunState>>>>,
    tracker: TaskTracker,

    _build: PhantomData<fn(B)>,
}

#[derive(typed_builder::TypedBuilder)]
pub struct EngineSetup<B, S> {
    builder: Arc<S>,
    locks: Arc<dyn LockService>,
    aborts: Arc<AbortBus>,
    lock_ttl: Duration,

    #[builder(default, setter(skip))]
    _build: PhantomData<fn(B)>,
}

impl<B, S> EngineSetup<B, S>
where
    B: TrackedBuild,
    S: StepBuilder<B>,
{
    pub fn setup(self) -> Engine<B, S> {
        Engine::new(self.builder, self.locks, self.aborts, self.lock_ttl)
    }
}

impl<B, S> Engine<B, S>
where
    B: TrackedBuild,
    S: StepBuilder<B>,
{
    pub fn new(
        builder: Arc<S>,
        locks: Arc<dyn LockService>,
        aborts: Arc<AbortBus>,
        lock_ttl: Duration,
    ) -> Self {
        let (release_tx, _) = watch::channel(false);

        Engine {
            builder,
            locks,
            aborts,
            lock_ttl,
            release_tx,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            _build: PhantomData,
        }
    }

    pub fn new_build(&self, build: B) -> EngineBuild<B, S> {
        EngineBuild {
            build,
            builder: self.builder.clone(),
            locks: self.locks.clone(),
            aborts: self.aborts.clone(),
            lock_ttl: self.lock_ttl,
            release_rx: self.release_tx.subscribe(),
            tracked: self.tracked.clone(),
        }
    }

    /// Supervise the build on its own task.
    pub fn spawn(&self, build: B) {
        let engine_build = self.new_build(build);
        self.tracker.spawn(engine_build.run());
    }

    /// Graceful drain: tell every supervisor to return without finishing
    /// its build, then wait for all of them.
    pub async fn release_all(&self) {
        info!("calling release on builds");
        let _ = self.release_tx.send(true);

        self.tracker.close();
        info!("waiting on builds");
        self.tracker.wait().await;
        info!("finished waiting on builds");
    }
}

pub struct EngineBuild<B, S> {
    build: B,
    builder: Arc<S>,
    locks: Arc<dyn LockService>,
    aborts: Arc<AbortBus>,
    lock_ttl: Duration,
    release_rx: watch::Receiver<bool>,
    tracked: Arc<Mutex<HashMap<i32, Arc<RunState>>>>,
}

impl<B, S> EngineBuild<B, S>
where
    B: TrackedBuild,
    S: StepBuilder<B>,
{
    pub async fn run(mut self) {
        let build_id = self.build.id();

        let _lock = match self
            .locks
            .acquire(&LockId::BuildTracking(build_id), self.lock_ttl)
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(build = build_id, "build already tracked");
                return;
            }
            Err(e) => {
                error!(build = build_id, error = %e, "failed to get lock");
                return;
            }
        };

        match self.build.reload() {
            Ok(true) => {}
            Ok(false) => {
                info!(build = build_id, "build not found");
                return;
            }
            Err(e) => {
                error!(build = build_id, error = %e, "failed to load build from db");
                return;
            }
        }

        if !self.build.is_running() {
            info!(build = build_id, "build already finished");
            return;
        }

        if let Err(e) = self.build.start() {
            error!(build = build_id, error = %e, "failed to start build");
            return;
        }

        let mut step = match self.builder.build_step(&self.build) {
            Ok(step) => step,
            Err(e) => {
                error!(build = build_id, error = %e, "failed to build step");
                return;
            }
        };

        // Re-entry after a crash recovers the state registered so far.
        let state = self
            .tracked
            .lock()
            .entry(build_id)
            .or_insert_with(|| Arc::new(RunState::new()))
            .clone();

        let token = CancellationToken::new();
        let noleak = CancellationToken::new();

        // The abort notifier is converted to context cancellation here;
        // nothing downstream ever sees the notifier itself.
        let mut abort_rx = self.aborts.subscribe(build_id);
        let abort_token = token.clone();
        let abort_guard = noleak.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort_guard.cancelled() => {}
                changed = abort_rx.wait_for(|aborted| *aborted) => {
                    if changed.is_ok() {
                        info!(build = build_id, "aborting");
                        abort_token.cancel();
                    }
                }
            }
        });

        let run_token = token.clone();
        let run_state = state.clone();
        let mut done = tokio::spawn(async move {
            let result = step.run(&run_token, &run_state).await;
            (step, result)
        });

        info!(build = build_id, "running");

        let outcome = tokio::select! {
            _ = self.release_rx.wait_for(|released| *released) => None,
            joined = &mut done => Some(joined),
        };

        match outcome {
            None => {
                // Another tracker picks the build up after restart; the
                // step task keeps running until the process exits.
                info!(build = build_id, "releasing");
            }
            Some(Ok((step, result))) => {
                self.finish(result, step.succeeded());
                self.aborts.forget(build_id);
            }
            Some(Err(e)) => {
                error!(build = build_id, error = %e, "build task panicked");
                self.aborts.forget(build_id);
            }
        }

        noleak.cancel();
        self.tracked.lock().remove(&build_id);
    }

    fn finish(&mut self, result: Result<()>, succeeded: bool) {
        let build_id = self.build.id();

        let status = match &result {
            Err(e) if ResourceError::is_cancelled(e) => {
                info!(build = build_id, "aborted");
                BuildStatus::Aborted
            }
            Err(e) => {
                info!(build = build_id, error = %e, "errored");
                BuildStatus::Errored
            }
            Ok(()) if succeeded => {
                info!(build = build_id, "succeeded");
                BuildStatus::Succeeded
            }
            Ok(()) => {
                info!(build = build_id, "failed");
                BuildStatus::Failed
            }
        };

        if let Err(e) = self.build.finish(status) {
            error!(build = build_id, error = %e, "failed to finish build");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryLockService;
    use crate::exec::BoxedStep;
    use crate::exec::Step;
    use async_trait::async_trait;

    #[derive(Clone, Default)]
    struct BuildRecord {
        finished: Arc<Mutex<Option<BuildStatus>>>,
        started: Arc<Mutex<bool>>,
    }

    struct FakeBuild {
        id: i32,
        running: bool,
        record: BuildRecord,
    }

    impl TrackedBuild for FakeBuild {
        fn id(&self) -> i32 {
            self.id
        }

        fn reload(&mut self) -> Result<bool> {
            Ok(true)
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn start(&mut self) -> Result<()> {
            *self.record.started.lock() = true;
            Ok(())
        }

        fn finish(&mut self, status: BuildStatus) -> Result<()> {
            *self.record.finished.lock() = Some(status);
            Ok(())
        }
    }

    enum StepKind {
        Ok,
        Failing,
        BlockUntilCancelled,
    }

    struct FakeStep {
        kind: StepKind,
        succeeded: bool,
    }

    #[async_trait]
    impl Step for FakeStep {
        async fn run(&mut self, token: &CancellationToken, _state: &RunState) -> Result<()> {
            match self.kind {
                StepKind::Ok => {
                    self.succeeded = true;
                    Ok(())
                }
                StepKind::Failing => Ok(()),
                StepKind::BlockUntilCancelled => {
                    token.cancelled().await;
                    Err(ResourceError::Cancelled.into())
                }
            }
        }

        fn succeeded(&self) -> bool {
            self.succeeded
        }
    }

    struct FakeStepBuilder {
        kind: fn() -> StepKind,
    }

    impl StepBuilder<FakeBuild> for FakeStepBuilder {
        fn build_step(&self, _build: &FakeBuild) -> Result<BoxedStep> {
            Ok(Box::new(FakeStep {
                kind: (self.kind)(),
                succeeded: false,
            }))
        }
    }

    fn engine(kind: fn() -> StepKind) -> Engine<FakeBuild, FakeStepBuilder> {
        Engine::new(
            Arc::new(FakeStepBuilder { kind }),
            Arc::new(InMemoryLockService::new()),
            Arc::new(AbortBus::new()),
            Duration::from_secs(60),
        )
    }

    fn build(id: i32) -> (FakeBuild, BuildRecord) {
        let record = BuildRecord::default();
        (
            FakeBuild {
                id,
                running: true,
                record: record.clone(),
            },
            record,
        )
    }

    #[tokio::test]
    async fn a_successful_step_finishes_the_build_succeeded() {
        let engine = engine(|| StepKind::Ok);
        let (fake, record) = build(1);

        engine.new_build(fake).run().await;

        assert!(*record.started.lock());
        assert_eq!(*record.finished.lock(), Some(BuildStatus::Succeeded));
    }

    #[tokio::test]
    async fn an_unsuccessful_step_finishes_the_build_failed() {
        let engine = engine(|| StepKind::Failing);
        let (fake, record) = build(2);

        engine.new_build(fake).run().await;

        assert_eq!(*record.finished.lock(), Some(BuildStatus::Failed));
    }

    #[tokio::test]
    async fn a_contended_tracking_lock_means_somebody_else_tracks() {
        let engine = engine(|| StepKind::Ok);
        let (fake, record) = build(3);

        let _held = engine
            .locks
            .acquire(&LockId::BuildTracking(3), Duration::from_secs(60))
            .unwrap()
            .unwrap();

        engine.new_build(fake).run().await;

        assert_eq!(*record.finished.lock(), None);
    }

    #[tokio::test]
    async fn an_abort_cancels_and_finishes_the_build_aborted() {
        let engine = engine(|| StepKind::BlockUntilCancelled);
        let (fake, record) = build(4);

        engine.spawn(fake);

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.aborts.abort(4);
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.release_all().await;

        assert_eq!(*record.finished.lock(), Some(BuildStatus::Aborted));
    }

    #[tokio::test]
    async fn release_drains_without_finishing_builds() {
        let engine = engine(|| StepKind::BlockUntilCancelled);
        let (fake, record) = build(5);

        engine.spawn(fake);
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.release_all().await;

        // The build was left untouched for the next tracker.
        assert_eq!(*record.finished.lock(), None);
    }
}
