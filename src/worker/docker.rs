//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The docker-backed container runtime.
//!
//! Containers are named deterministically from their owner, so a restarted
//! control plane finds them again instead of starting over. A process is
//! executed with its request payload staged as a file and its exit status
//! written to a well-known path, which is what makes re-attaching possible
//! on a runtime that does not track execs across clients.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context as AnyhowContext;
use anyhow::Error;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use itertools::Itertools;
use shiplift::tty::TtyChunk;
use shiplift::ContainerOptions;
use shiplift::Docker;
use shiplift::ExecContainerOptions;
use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::Endpoint;
use crate::config::EndpointType;
use crate::resource::script::extract_single_file;
use crate::worker::Container;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::Process;
use crate::worker::ProcessIo;
use crate::worker::ProcessSpec;
use crate::worker::Worker;
use crate::worker::WorkerError;

/// How often the exit file of a re-attached process is polled.
const EXIT_POLL_DELAY: Duration = Duration::from_secs(1);

fn stdin_path(process_id: &str) -> String {
    format!("/tmp/{process_id}.stdin")
}

fn exit_path(process_id: &str) -> String {
    format!("/tmp/{process_id}.exit")
}

pub struct DockerWorker {
    docker: Docker,
    name: String,
}

impl DockerWorker {
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        let docker = match endpoint.endpoint_type() {
            EndpointType::Http => shiplift::Uri::from_str(endpoint.uri())
                .map(Docker::host)
                .map_err(Error::from)?,
            EndpointType::Socket => Docker::unix(endpoint.uri()),
        };

        Ok(DockerWorker {
            docker,
            name: endpoint.name().clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Worker for DockerWorker {
    async fn find_or_create_container(
        &self,
        token: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn Container>> {
        if token.is_cancelled() {
            return Err(crate::resource::ResourceError::Cancelled.into());
        }

        let container_name = format!("conveyor-{}", owner.handle());
        let containers = self.docker.containers();

        if containers.get(&container_name).inspect().await.is_ok() {
            trace!(container = %container_name, "found existing container");
            return Ok(Arc::new(DockerContainer {
                docker: self.docker.clone(),
                name: container_name,
            }));
        }

        debug!(
            container = %container_name,
            image = %spec.image,
            pipeline = %metadata.pipeline_name,
            job = %metadata.job_name,
            step = %metadata.step_name,
            "creating container"
        );

        let envs: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|mount| {
                format!(
                    "{}:{}",
                    mount.volume.host_path().display(),
                    mount.mount_path
                )
            })
            .collect();

        let options = ContainerOptions::builder(spec.image.as_ref())
            .name(&container_name)
            .env(envs.iter().map(AsRef::as_ref).collect::<Vec<&str>>())
            .volumes(binds.iter().map(AsRef::as_ref).collect::<Vec<&str>>())
            // Keep the container alive; processes are dispatched into it.
            .cmd(vec!["/bin/sh", "-c", "while :; do sleep 3600; done"])
            .build();

        let create_info = containers
            .create(&options)
            .await
            .context("Creating container")?;

        if let Some(warnings) = create_info.warnings {
            for warning in warnings {
                warn!(container = %container_name, warning, "container create warning");
            }
        }

        containers
            .get(&create_info.id)
            .start()
            .await
            .context("Starting container")?;

        Ok(Arc::new(DockerContainer {
            docker: self.docker.clone(),
            name: container_name,
        }))
    }
}

pub struct DockerContainer {
    docker: Docker,
    name: String,
}

impl DockerContainer {
    async fn copy_file_from(&self, path: &str) -> Result<Option<String>> {
        let containers = self.docker.containers();
        let container = containers.get(&self.name);

        let mut archive = Vec::new();
        let stream = container.copy_from(&PathBuf::from(path));
        tokio::pin!(stream);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend(bytes),
                // Missing path; docker reports it as an API error.
                Err(_) if archive.is_empty() => return Ok(None),
                Err(e) => return Err(Error::from(e)),
            }
        }

        extract_single_file(&archive).map(Some)
    }

    async fn executable_exists(&self, path: &str) -> Result<bool> {
        let probe = format!("if [ -x '{path}' ]; then echo __ok__; else echo __missing__; fi");
        let options = ExecContainerOptions::builder()
            .cmd(vec!["/bin/sh", "-c", probe.as_str()])
            .attach_stdout(true)
            .attach_stderr(true)
            .build();

        let containers = self.docker.containers();
        let container = containers.get(&self.name);

        let mut output = Vec::new();
        let stream = container.exec(&options);
        tokio::pin!(stream);
        while let Some(chunk) = stream.next().await {
            if let TtyChunk::StdOut(bytes) = chunk.context("Probing executable")? {
                output.extend(bytes);
            }
        }

        Ok(String::from_utf8_lossy(&output).contains("__ok__"))
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn handle(&self) -> &str {
        &self.name
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>> {
        let containers = self.docker.containers();
        let container = containers.get(&self.name);

        if !self.executable_exists(&spec.path).await? {
            return Err(WorkerError::ExecutableNotFound(spec.path).into());
        }

        // Stage stdin as a file: its presence is also the marker that this
        // process was started, which is what attach probes for.
        container
            .copy_file_into(PathBuf::from(stdin_path(&spec.id)), &io.stdin)
            .await
            .context("Copying request payload into container")?;

        let args = spec.args.iter().map(|a| format!("'{a}'")).join(" ");
        let command = format!(
            "'{path}' {args} < {stdin}; echo $? > {exit}",
            path = spec.path,
            stdin = stdin_path(&spec.id),
            exit = exit_path(&spec.id),
        );

        let docker = self.docker.clone();
        let container_name = self.name.clone();
        let stdout = io.stdout.clone();
        let stderr = io.stderr.clone();

        let pump = tokio::spawn(async move {
            let options = ExecContainerOptions::builder()
                .cmd(vec!["/bin/sh", "-c", command.as_str()])
                .attach_stdout(true)
                .attach_stderr(true)
                .build();

            let containers = docker.containers();
            let container = containers.get(&container_name);

            let stream = container.exec(&options);
            tokio::pin!(stream);
            while let Some(chunk) = stream.next().await {
                match chunk.context("Reading process output")? {
                    TtyChunk::StdOut(bytes) => {
                        if let Some(tx) = stdout.as_ref() {
                            let _ = tx.send(bytes);
                        }
                    }
                    TtyChunk::StdErr(bytes) => {
                        if let Some(tx) = stderr.as_ref() {
                            let _ = tx.send(bytes);
                        }
                    }
                    TtyChunk::StdIn(_) => {}
                }
            }

            Ok(())
        });

        Ok(Box::new(DockerProcess {
            container: DockerContainer {
                docker: self.docker.clone(),
                name: self.name.clone(),
            },
            process_id: spec.id,
            pump: Some(pump),
        }))
    }

    async fn attach(&self, process_id: &str, _io: ProcessIo) -> Result<Box<dyn Process>> {
        // Either the process already finished (exit file) or it is still
        // running (stdin marker). Output of a re-attached process cannot be
        // re-followed on this runtime; only its exit status is recovered.
        let finished = self.copy_file_from(&exit_path(process_id)).await?.is_some();
        let started = finished
            || self
                .copy_file_from(&stdin_path(process_id))
                .await?
                .is_some();

        if !started {
            return Err(WorkerError::ProcessNotFound(process_id.to_string()).into());
        }

        trace!(process_id, container = %self.name, finished, "attached to process");

        Ok(Box::new(DockerProcess {
            container: DockerContainer {
                docker: self.docker.clone(),
                name: self.name.clone(),
            },
            process_id: process_id.to_string(),
            pump: None,
        }))
    }

    async fn stream_out(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let docker = self.docker.clone();
        let container_name = self.name.clone();
        let path = PathBuf::from(path);

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let containers = docker.containers();
            let container = containers.get(&container_name);

            let stream = container.copy_from(&path);
            tokio::pin!(stream);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "streaming out of container failed");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(reader))
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        let containers = self.docker.containers();
        let container = containers.get(&self.name);

        if kill {
            container.kill(None).await.map_err(Error::from)
        } else {
            container
                .stop(Some(Duration::from_secs(10)))
                .await
                .map_err(Error::from)
        }
    }
}

pub struct DockerProcess {
    container: DockerContainer,
    process_id: String,
    pump: Option<tokio::task::JoinHandle<Result<()>>>,
}

#[async_trait]
impl Process for DockerProcess {
    fn id(&self) -> &str {
        &self.process_id
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(pump) = self.pump.take() {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(anyhow!("Process output pump failed: {e}")),
            }
        }

        loop {
            if let Some(content) = self
                .container
                .copy_file_from(&exit_path(&self.process_id))
                .await?
            {
                return content
                    .trim()
                    .parse::<i32>()
                    .with_context(|| format!("Parsing exit status '{}'", content.trim()));
            }

            tokio::time::sleep(EXIT_POLL_DELAY).await;
        }
    }
}
