//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Shared process-driving logic for both protocol dialects.
//!
//! Every resource action follows the same sequence: attach to a process with
//! the action's well-known id, fall back to running a fresh one, forward
//! output, and wait for the exit status while honouring cancellation.

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::resource::IoConfig;
use crate::resource::ResourceError;
use crate::worker::Container;
use crate::worker::ProcessIo;
use crate::worker::ProcessSpec;
use crate::worker::WorkerError;

/// How much trailing stderr is kept for error reports.
const STDERR_TAIL_BYTES: usize = 1024;

pub(crate) struct ScriptRun {
    pub status: i32,
    pub stderr_tail: String,
    pub stdout: Vec<u8>,
}

/// Run (or re-attach to) the process identified by `process_id` and wait for
/// it.
///
/// Cancellation stops the container without delivering any in-band signal to
/// the process and surfaces as [ResourceError::Cancelled].
pub(crate) async fn run_script(
    container: &Arc<dyn Container>,
    token: &CancellationToken,
    process_id: &str,
    path: &str,
    args: Vec<String>,
    stdin: Vec<u8>,
    io: &IoConfig,
    capture_stdout: bool,
) -> Result<ScriptRun> {
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_tail = Arc::new(Mutex::new(Vec::new()));

    let (stdout_tx, stdout_task) = tee(
        io.stdout.clone(),
        capture_stdout.then(|| stdout_buf.clone()),
        usize::MAX,
    );
    let (stderr_tx, stderr_task) = tee(
        io.stderr.clone(),
        Some(stderr_tail.clone()),
        STDERR_TAIL_BYTES,
    );

    let process_io = ProcessIo {
        stdin,
        stdout: Some(stdout_tx),
        stderr: Some(stderr_tx),
    };

    let mut process = match container.attach(process_id, process_io.clone()).await {
        Ok(process) => {
            debug!(process_id, container = container.handle(), "reattached");
            // The attached process holds the only sender clones now; keeping
            // ours alive would keep the output tees from ever draining.
            drop(process_io);
            process
        }
        Err(e) => {
            let not_found = e
                .downcast_ref::<WorkerError>()
                .map(|w| matches!(w, WorkerError::ProcessNotFound(_)))
                .unwrap_or(false);
            if !not_found {
                return Err(e);
            }

            trace!(process_id, "no process to attach to, running fresh");
            container
                .run(
                    ProcessSpec {
                        id: process_id.to_string(),
                        path: path.to_string(),
                        args,
                    },
                    process_io,
                )
                .await?
        }
    };

    let status = tokio::select! {
        status = process.wait() => status?,
        _ = token.cancelled() => {
            debug!(process_id, "cancelled, stopping container");
            container.stop(false).await?;
            return Err(ResourceError::Cancelled.into());
        }
    };

    // The process (and with it the runtime's output pump) holds the only
    // remaining sender clones; dropping it lets the tee tasks drain and end.
    drop(process);
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let stdout = std::mem::take(&mut *stdout_buf.lock());
    let stderr_tail = String::from_utf8_lossy(&stderr_tail.lock()).into_owned();

    Ok(ScriptRun {
        status,
        stderr_tail,
        stdout,
    })
}

/// Stream the response archive out of the container and return the contents
/// of its single file entry.
pub(crate) async fn read_response(
    container: &Arc<dyn Container>,
    response_path: &str,
) -> Result<String> {
    let mut reader = container
        .stream_out(response_path)
        .await
        .with_context(|| format!("Streaming response archive from {response_path}"))?;

    let mut archive_bytes = Vec::new();
    reader
        .read_to_end(&mut archive_bytes)
        .await
        .context("Reading response archive")?;

    extract_single_file(&archive_bytes)
}

/// Read the first regular file out of a tar archive held in memory.
///
/// Response files are small; buffering the archive avoids driving the sync
/// tar reader from async code.
pub(crate) fn extract_single_file(archive_bytes: &[u8]) -> Result<String> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));

    for entry in archive.entries().context("Listing response archive")? {
        let mut entry = entry.context("Reading response archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .context("Reading response file")?;
        return Ok(content);
    }

    Err(ResourceError::DecodeError("response archive contains no file".to_string()).into())
}

/// Fan a chunk stream out to an optional forward sender and an optional
/// collection buffer capped at `cap` bytes (older bytes are discarded).
fn tee(
    forward: Option<UnboundedSender<Vec<u8>>>,
    collect: Option<Arc<Mutex<Vec<u8>>>>,
    cap: usize,
) -> (UnboundedSender<Vec<u8>>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    let task = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Some(buf) = collect.as_ref() {
                let mut buf = buf.lock();
                buf.extend_from_slice(&chunk);
                if buf.len() > cap {
                    let excess = buf.len() - cap;
                    buf.drain(..excess);
                }
            }

            if let Some(fwd) = forward.as_ref() {
                // A receiver that went away only means nobody is watching.
                let _ = fwd.send(chunk);
            }
        }
    });

    (tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_with(path: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_the_single_response_file() {
        let archive = tar_with("response", b"{\"action\": \"latest_versions\"}\n");
        let content = extract_single_file(&archive).unwrap();
        assert!(content.contains("latest_versions"));
    }

    #[test]
    fn empty_archive_is_a_decode_error() {
        let builder = tar::Builder::new(Vec::new());
        let archive = builder.into_inner().unwrap();
        let err = extract_single_file(&archive).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResourceError>(),
            Some(ResourceError::DecodeError(_))
        ));
    }
}
