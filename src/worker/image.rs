//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Fetching container images that are themselves resources.
//!
//! A step whose image is declared as a resource (e.g. a registry image)
//! resolves it with a check (unless a version is pinned) followed by a get
//! into a volume, exactly like any other resource interaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consts::IMAGE_METADATA_FILE;
use crate::resource;
use crate::resource::IoConfig;
use crate::resource::Metadata;
use crate::resource::Params;
use crate::resource::ResourceFactory;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::Version;
use crate::util::docker::ImageName;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::Volume;
use crate::worker::VolumeClient;
use crate::worker::VolumeMount;

#[derive(ThisError, Debug)]
pub enum ImageError {
    #[error("no versions of image available")]
    ImageUnavailable,

    #[error("no space specified and no default space available")]
    NoSpaceSpecified,

    #[error("fetching the image did not produce a volume")]
    ImageGetDidNotProduceVolume,
}

/// An image declared as a resource in the pipeline.
#[derive(Clone, Debug)]
pub struct ImageResource {
    pub resource_type: String,
    pub source: Source,
}

/// Collects a check's discoveries so the fetcher can pick the version to
/// pull.
#[derive(Default)]
struct CollectingCheckHandler {
    default_space: Option<Space>,
    latest: BTreeMap<Space, Version>,
}

#[async_trait]
impl resource::CheckEventHandler for CollectingCheckHandler {
    async fn default_space(&mut self, space: Space) -> Result<()> {
        self.default_space = Some(space);
        Ok(())
    }

    async fn discovered(&mut self, space: Space, version: Version, _metadata: Metadata) -> Result<()> {
        // Discovery order is oldest to newest, so the last version seen per
        // space is that space's latest.
        self.latest.insert(space, version);
        Ok(())
    }

    async fn latest_versions(&mut self) -> Result<()> {
        Ok(())
    }
}

struct RecordingGetHandler {
    fetched: Option<Version>,
}

#[async_trait]
impl resource::GetEventHandler for RecordingGetHandler {
    async fn fetched(&mut self, _space: Space, version: Version, _metadata: Metadata) -> Result<()> {
        self.fetched = Some(version);
        Ok(())
    }
}

pub struct ImageResourceFetcher {
    factory: ResourceFactory,
    volumes: Arc<VolumeClient>,
}

impl ImageResourceFetcher {
    pub fn new(factory: ResourceFactory, volumes: Arc<VolumeClient>) -> Self {
        ImageResourceFetcher { factory, volumes }
    }

    /// Resolve and fetch the image, returning the volume holding its rootfs
    /// plus the version that was fetched.
    ///
    /// Without a pinned version, a check is run first and the latest
    /// version of the requested (or default) space is used.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch(
        &self,
        token: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        image: &ImageResource,
        base_image: &ImageName,
        version: Option<Version>,
        space: Option<Space>,
    ) -> Result<(Arc<dyn Volume>, Version)> {
        let spec = ContainerSpec {
            image: base_image.clone(),
            env: Vec::new(),
            mounts: Vec::new(),
        };

        let resource = self
            .factory
            .new_resource(token, owner, metadata, &spec)
            .await?;

        let (space, version) = match version {
            Some(version) => {
                let space = space.ok_or(ImageError::NoSpaceSpecified)?;
                (space, version)
            }
            None => {
                let mut handler = CollectingCheckHandler::default();
                resource
                    .check(token, &mut handler, &image.source, &BTreeMap::new())
                    .await?;

                let space = space
                    .or(handler.default_space.clone())
                    .ok_or(ImageError::NoSpaceSpecified)?;

                let version = handler
                    .latest
                    .get(&space)
                    .cloned()
                    .ok_or(ImageError::ImageUnavailable)?;

                (space, version)
            }
        };

        debug!(%space, version = %version.digest(), "fetching image version");

        let volume_handle = format!("image-{}", version.digest());
        let volume = self
            .volumes
            .find_or_create_volume(token, &volume_handle)
            .await?;

        let get_spec = ContainerSpec {
            image: base_image.clone(),
            env: Vec::new(),
            mounts: vec![VolumeMount {
                volume: volume.clone(),
                mount_path: crate::consts::GET_ARTIFACT_DIR_PATH.to_string(),
            }],
        };

        let get_resource = self
            .factory
            .new_resource(token, owner, metadata, &get_spec)
            .await?;

        let mut get_handler = RecordingGetHandler { fetched: None };
        get_resource
            .get(
                token,
                &mut get_handler,
                &volume,
                &IoConfig::default(),
                &image.source,
                &Params::new(),
                &space,
                &version,
            )
            .await?;

        if !volume.host_path().is_dir() {
            return Err(ImageError::ImageGetDidNotProduceVolume.into());
        }

        Ok((volume, get_handler.fetched.unwrap_or(version)))
    }

    /// The fetched image's metadata document, read out of the volume.
    pub fn image_metadata(volume: &Arc<dyn Volume>) -> Result<Vec<u8>> {
        let path = volume.host_path().join(IMAGE_METADATA_FILE);
        std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("Reading image metadata {}: {e}", path.display()))
    }
}
