//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Volumes: named artifact directories on the worker host.
//!
//! Creation is guarded by the volume-creating lock so that two steps
//! wanting the same artifact do not race; contention is resolved by
//! retrying with a fixed delay.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::db::LockId;
use crate::db::LockService;
use crate::resource::ResourceError;
use crate::worker::Volume;

#[derive(Debug)]
pub struct HostVolume {
    handle: String,
    path: PathBuf,
}

impl Volume for HostVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn host_path(&self) -> PathBuf {
        self.path.clone()
    }
}

pub struct VolumeClient {
    root: PathBuf,
    locks: Arc<dyn LockService>,
    retry_delay: Duration,
    lock_ttl: Duration,
}

impl VolumeClient {
    pub fn new(
        root: PathBuf,
        locks: Arc<dyn LockService>,
        retry_delay: Duration,
        lock_ttl: Duration,
    ) -> Self {
        VolumeClient {
            root,
            locks,
            retry_delay,
            lock_ttl,
        }
    }

    /// Find the volume with this handle, creating it under the
    /// volume-creating lock if it does not exist yet.
    pub async fn find_or_create_volume(
        &self,
        token: &CancellationToken,
        handle: &str,
    ) -> Result<Arc<dyn Volume>> {
        let path = self.root.join(handle);

        loop {
            if path.is_dir() {
                return Ok(Arc::new(HostVolume {
                    handle: handle.to_string(),
                    path,
                }));
            }

            if token.is_cancelled() {
                return Err(ResourceError::Cancelled.into());
            }

            let lock_id = LockId::VolumeCreating(handle.to_string());
            match self.locks.acquire(&lock_id, self.lock_ttl)? {
                Some(_lock) => {
                    debug!(handle, "creating volume");
                    tokio::fs::create_dir_all(&path)
                        .await
                        .with_context(|| format!("Creating volume directory {}", path.display()))?;

                    return Ok(Arc::new(HostVolume {
                        handle: handle.to_string(),
                        path,
                    }));
                }
                None => {
                    // Somebody else is creating it; check again shortly.
                    trace!(handle, "volume creating lock held elsewhere, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Unpack a tar stream into a volume.
    pub async fn write_tar_stream(
        &self,
        volume: &Arc<dyn Volume>,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let mut archive_bytes = Vec::new();
        reader
            .read_to_end(&mut archive_bytes)
            .await
            .context("Reading tar stream")?;

        unpack_archive(&archive_bytes, &volume.host_path())
    }
}

fn unpack_archive(archive_bytes: &[u8], destination: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
    archive
        .unpack(destination)
        .with_context(|| format!("Unpacking archive into {}", destination.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryLockService;

    fn client(root: &Path) -> VolumeClient {
        VolumeClient::new(
            root.to_path_buf(),
            Arc::new(InMemoryLockService::new()),
            Duration::from_millis(1),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn creates_and_finds_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let token = CancellationToken::new();

        let created = client.find_or_create_volume(&token, "artifact-1").await.unwrap();
        assert!(created.host_path().is_dir());

        let found = client.find_or_create_volume(&token, "artifact-1").await.unwrap();
        assert_eq!(found.host_path(), created.host_path());
    }

    #[tokio::test]
    async fn unpacks_tar_streams() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let token = CancellationToken::new();
        let volume = client.find_or_create_volume(&token, "v").await.unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "file.txt", &b"hello"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        client
            .write_tar_stream(&volume, Box::new(std::io::Cursor::new(archive)))
            .await
            .unwrap();

        let content = std::fs::read_to_string(volume.host_path().join("file.txt")).unwrap();
        assert_eq!(content, "hello");
    }
}
