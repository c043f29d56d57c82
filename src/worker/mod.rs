//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The worker subsystem: the runtime that resource and task processes
//! execute in.
//!
//! The traits in this module are the seam between the execution core and the
//! container runtime. The core only ever talks to [Worker], [Container],
//! [Process] and [Volume]; the bundled docker implementation lives in
//! [docker], and the tests run against in-memory fakes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::util::docker::ImageName;

pub mod docker;
mod image;
#[cfg(test)]
pub(crate) mod test_support;
mod volume;

pub use image::*;
pub use volume::*;

#[derive(ThisError, Debug)]
pub enum WorkerError {
    #[error("executable not found in container: {0}")]
    ExecutableNotFound(String),

    #[error("no process with id '{0}' in container")]
    ProcessNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("file not found in container: {0}")]
    FileNotFound(String),
}

/// Who a container belongs to, for lookup and for garbage collection.
///
/// A container is either doing work for one step of one build, or it is the
/// long-lived container a resource config is checked in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerOwner {
    Build { build_id: i32, plan_id: uuid::Uuid },
    ResourceCheck { resource_config_id: i32 },
}

impl ContainerOwner {
    /// A stable string form, used to derive deterministic container names so
    /// that a restarted control plane finds its containers again.
    pub fn handle(&self) -> String {
        match self {
            ContainerOwner::Build { build_id, plan_id } => {
                format!("build-{build_id}-plan-{plan_id}")
            }
            ContainerOwner::ResourceCheck { resource_config_id } => {
                format!("check-{resource_config_id}")
            }
        }
    }
}

/// Descriptive container fields, only used for log/inspect output.
#[derive(Clone, Debug, Default)]
pub struct ContainerMetadata {
    pub pipeline_name: String,
    pub job_name: String,
    pub step_name: String,
}

#[derive(Clone, Debug)]
pub struct VolumeMount {
    pub volume: Arc<dyn Volume>,
    pub mount_path: String,
}

#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub image: ImageName,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<VolumeMount>,
}

/// What to execute inside a container.
///
/// The `id` is one of the well-known process ids from [crate::consts]; it is
/// the key under which a process can be re-attached after a control plane
/// restart.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub id: String,
    pub path: String,
    pub args: Vec<String>,
}

/// The I/O wiring for a process.
///
/// `stdin` is written to the process before it starts. Output arrives as raw
/// chunks on the optional senders, following the teacher's pattern of
/// shipping container output over a channel instead of a shared writer.
#[derive(Clone, Debug, Default)]
pub struct ProcessIo {
    pub stdin: Vec<u8>,
    pub stdout: Option<UnboundedSender<Vec<u8>>>,
    pub stderr: Option<UnboundedSender<Vec<u8>>>,
}

#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> &str;

    /// Wait for the process to exit and return its exit status.
    async fn wait(&mut self) -> Result<i32>;
}

#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    /// Start a fresh process with the given spec.
    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>>;

    /// Attach to a process previously started with [Container::run].
    ///
    /// Fails with [WorkerError::ProcessNotFound] if no process with that id
    /// was ever started in this container.
    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn Process>>;

    /// Stream a path out of the container as a tar archive.
    async fn stream_out(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Stop the container. `kill = false` means a graceful stop; no signal is
    /// ever delivered to the contained process over the protocol channel.
    async fn stop(&self, kill: bool) -> Result<()>;
}

/// A named artifact holding files, attachable to containers.
pub trait Volume: Send + Sync + std::fmt::Debug {
    fn handle(&self) -> &str;

    /// Where the volume contents live on the worker host.
    fn host_path(&self) -> PathBuf;
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn find_or_create_container(
        &self,
        token: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn Container>>;
}
