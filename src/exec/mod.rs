//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The step executor: a build is a tree of steps sharing one run state.

use anyhow::Error;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceError;

mod builder;
pub use builder::*;

mod compose;
pub use compose::*;

mod get_step;
pub use get_step::*;

mod plan;
pub use plan::*;

mod put_step;
pub use put_step::*;

mod run_state;
pub use run_state::*;

mod task_step;
pub use task_step::*;

/// One node of the step tree.
///
/// `run` drives the step to completion; `succeeded` is only meaningful
/// after `run` returned without error. A step that ran its script and saw a
/// non-zero exit is unsuccessful, not errored.
#[async_trait]
pub trait Step: Send {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()>;
    fn succeeded(&self) -> bool;
}

pub type BoxedStep = Box<dyn Step>;

/// Combine a step error with a hook error.
///
/// The step's error keeps priority, and a cancellation is never wrapped or
/// replaced: the engine must still classify the build as aborted.
pub(crate) fn compose_errors(
    step_error: Option<Error>,
    hook_error: Option<Error>,
) -> Option<Error> {
    match (step_error, hook_error) {
        (None, hook) => hook,
        (step, None) => step,
        (Some(step), Some(hook)) => {
            if ResourceError::is_cancelled(&step) {
                Some(step)
            } else {
                Some(step.context(format!("cleanup also failed: {hook:#}")))
            }
        }
    }
}
