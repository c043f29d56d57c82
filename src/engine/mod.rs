//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The build engine: per-build supervisors with graceful drain.

use anyhow::Result;

use crate::db::models::BuildStatus;
use crate::exec::BoxedStep;

mod build;
pub use build::*;

#[allow(clippy::module_inception)]
mod engine;
pub use engine::*;

/// The persistence surface of a supervised build.
///
/// The engine only ever needs to refresh the row, check whether it still
/// runs, and record the terminal state; everything else stays behind this
/// seam so supervisors can be exercised without a database.
pub trait TrackedBuild: Send + 'static {
    fn id(&self) -> i32;

    /// Refresh from the store. `false` means the build row is gone.
    fn reload(&mut self) -> Result<bool>;

    fn is_running(&self) -> bool;

    /// Mark the build started. Must be idempotent.
    fn start(&mut self) -> Result<()>;

    fn finish(&mut self, status: BuildStatus) -> Result<()>;
}

/// Builds the step tree for a build about to be supervised.
pub trait StepBuilder<B>: Send + Sync + 'static {
    fn build_step(&self, build: &B) -> Result<BoxedStep>;
}
