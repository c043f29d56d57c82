//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! In-memory fakes of the worker runtime for tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::worker::Container;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::Process;
use crate::worker::ProcessIo;
use crate::worker::ProcessSpec;
use crate::worker::Worker;
use crate::worker::WorkerError;

/// What a fake process does when executed.
#[derive(Clone, Default)]
pub(crate) struct ProcessScript {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Never exit; the action can only end through cancellation.
    pub block: bool,
}

#[derive(Default)]
pub(crate) struct FakeContainer {
    pub scripts: Mutex<HashMap<String, ProcessScript>>,
    pub responses: Mutex<HashMap<String, Vec<u8>>>,
    pub attachable: Mutex<HashSet<String>>,

    pub requests: Mutex<Vec<(String, Vec<u8>)>>,
    pub runs: Mutex<Vec<String>>,
    pub attaches: Mutex<Vec<String>>,
    pub stop_calls: Mutex<Vec<bool>>,
}

impl FakeContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, process_id: &str, script: ProcessScript) {
        self.scripts.lock().insert(process_id.to_string(), script);
    }

    pub fn respond(&self, path: &str, archive: Vec<u8>) {
        self.responses.lock().insert(path.to_string(), archive);
    }

    fn start(&self, process_id: &str, io: &ProcessIo) -> Result<Box<dyn Process>> {
        let script = self
            .scripts
            .lock()
            .get(process_id)
            .cloned()
            .ok_or_else(|| WorkerError::ExecutableNotFound(process_id.to_string()))?;

        if !script.stdout.is_empty() {
            if let Some(tx) = io.stdout.as_ref() {
                let _ = tx.send(script.stdout.clone());
            }
        }
        if !script.stderr.is_empty() {
            if let Some(tx) = io.stderr.as_ref() {
                let _ = tx.send(script.stderr.clone());
            }
        }

        Ok(Box::new(FakeProcess {
            id: process_id.to_string(),
            exit_status: script.exit_status,
            block: script.block,
        }))
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        "fake-container"
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>> {
        self.runs.lock().push(spec.id.clone());
        self.requests.lock().push((spec.id.clone(), io.stdin.clone()));
        self.start(&spec.id, &io)
    }

    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn Process>> {
        if !self.attachable.lock().contains(process_id) {
            return Err(WorkerError::ProcessNotFound(process_id.to_string()).into());
        }

        self.attaches.lock().push(process_id.to_string());
        self.start(process_id, &io)
    }

    async fn stream_out(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let archive = self
            .responses
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| WorkerError::FileNotFound(path.to_string()))?;

        Ok(Box::new(std::io::Cursor::new(archive)))
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        self.stop_calls.lock().push(kill);
        Ok(())
    }
}

struct FakeProcess {
    id: String,
    exit_status: i32,
    block: bool,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i32> {
        if self.block {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_status)
    }
}

pub(crate) struct FakeWorker {
    pub container: Arc<FakeContainer>,
    pub specs: Mutex<Vec<ContainerSpec>>,
}

impl FakeWorker {
    pub fn new(container: Arc<FakeContainer>) -> Arc<Self> {
        Arc::new(FakeWorker {
            container,
            specs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn find_or_create_container(
        &self,
        _token: &CancellationToken,
        _owner: &ContainerOwner,
        _metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn Container>> {
        self.specs.lock().push(spec.clone());
        Ok(self.container.clone())
    }
}

/// Build a tar archive holding one response file with the given lines.
pub(crate) fn response_archive(lines: &[&str]) -> Vec<u8> {
    let content = lines.join("\n");
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "response", content.as_bytes())
        .unwrap();
    builder.into_inner().unwrap()
}

/// A v2 info stdout document for a well-behaved resource container.
pub(crate) fn v2_info_json() -> Vec<u8> {
    br#"{"artifacts": {"api_version": "2.0", "check": "/opt/resource/check", "get": "/opt/resource/get", "put": "/opt/resource/put"}}"#
        .to_vec()
}
