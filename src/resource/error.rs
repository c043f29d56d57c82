//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use thiserror::Error as ThisError;

use crate::resource::Space;

/// Error kinds surfaced by the resource protocol driver.
///
/// The engine classifies terminal build state from these: [ResourceError::ScriptFailed]
/// becomes a failed build, [ResourceError::Cancelled] becomes an aborted one,
/// everything else errors the build.
#[derive(ThisError, Debug)]
pub enum ResourceError {
    #[error("resource script exited with status {exit_status}")]
    ScriptFailed { exit_status: i32, stderr_tail: String },

    #[error("unknown action: {action}")]
    ActionNotFound { action: String },

    #[error("failed to decode resource event stream: {0}")]
    DecodeError(String),

    #[error("action cancelled")]
    Cancelled,

    #[error("unknown space \"{0}\" for v1 resource")]
    UnknownSpace(Space),

    #[error("unknown resource api version: {0}")]
    UnknownResourceVersion(String),
}

impl ResourceError {
    /// Whether an error chain bottoms out in a cancellation.
    ///
    /// Cancellation must never be reclassified by wrapping, so callers test
    /// the chain instead of the outermost value.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref(), Some(ResourceError::Cancelled)))
    }
}
