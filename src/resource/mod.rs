//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The resource protocol driver.
//!
//! A "resource" is an external, versioned thing (a git repository, a
//! registry image, a blob store prefix). This module speaks the resource
//! wire protocol to a script running inside a worker container. Protocol v2
//! is the native dialect; containers that predate it are wrapped in a
//! [V1Adapter] so that callers only ever see one operation set.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::consts::*;
use crate::worker::Container;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::Volume;
use crate::worker::Worker;
use crate::worker::WorkerError;

mod error;
pub mod protocol;
pub(crate) mod script;
mod v1;
mod v2;

pub use error::*;
pub use v1::V1Adapter;
pub use v2::V2Resource;

/// A named stream of versions within a resource config scope, e.g. a git
/// branch or a tag pattern.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct Space(String);

impl From<String> for Space {
    fn from(s: String) -> Self {
        Space(s)
    }
}

impl From<&str> for Space {
    fn from(s: &str) -> Self {
        Space(s.to_string())
    }
}

impl AsRef<str> for Space {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

impl Space {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A version of a resource: an opaque string-to-string mapping.
///
/// The map is kept ordered so that serialisation is canonical and the digest
/// of a version never depends on the order keys were inserted in.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
#[serde(transparent)]
pub struct Version(BTreeMap<String, String>);

impl Version {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Version(map)
    }

    pub fn canonical_json(&self) -> String {
        // BTreeMap serialises in key order, which makes this canonical.
        serde_json::to_string(&self.0).expect("string map serialisation cannot fail")
    }

    pub fn digest(&self) -> VersionDigest {
        VersionDigest(format!("{:x}", md5::compute(self.canonical_json())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Version {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Version(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// The md5 digest of a canonically serialised version map.
///
/// This is the stable handle versions are referenced by across tables and
/// caches.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct VersionDigest(String);

impl From<String> for VersionDigest {
    fn from(s: String) -> Self {
        VersionDigest(s)
    }
}

impl AsRef<str> for VersionDigest {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for VersionDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

pub type Metadata = Vec<MetadataField>;

/// One discovered or created version, qualified by the space it lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpaceVersion {
    pub space: Space,
    pub version: Version,
    pub metadata: Metadata,
}

/// Resource source configuration as declared in the pipeline.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// Per-step parameters merged over the source for an action.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Where process output chunks are forwarded to.
#[derive(Clone, Debug, Default)]
pub struct IoConfig {
    pub stdout: Option<UnboundedSender<Vec<u8>>>,
    pub stderr: Option<UnboundedSender<Vec<u8>>>,
}

/// Callback surface for a check: events are observable as they arrive, and
/// the result stream is open-ended.
#[async_trait]
pub trait CheckEventHandler: Send {
    async fn default_space(&mut self, space: Space) -> Result<()>;
    async fn discovered(
        &mut self,
        space: Space,
        version: Version,
        metadata: Metadata,
    ) -> Result<()>;
    async fn latest_versions(&mut self) -> Result<()>;
}

#[async_trait]
pub trait GetEventHandler: Send {
    async fn fetched(&mut self, space: Space, version: Version, metadata: Metadata) -> Result<()>;
}

#[async_trait]
pub trait PutEventHandler: Send {
    async fn created(&mut self, created: &SpaceVersion) -> Result<()>;
}

/// A resource, dispatching over the protocol version its container speaks.
#[derive(Debug)]
pub enum Resource {
    V2(V2Resource),
    V1(V1Adapter),
}

impl Resource {
    pub fn container(&self) -> &Arc<dyn Container> {
        match self {
            Resource::V2(r) => r.container(),
            Resource::V1(a) => a.container(),
        }
    }

    pub async fn check(
        &self,
        token: &CancellationToken,
        handler: &mut dyn CheckEventHandler,
        source: &Source,
        from: &BTreeMap<Space, Version>,
    ) -> Result<()> {
        match self {
            Resource::V2(r) => r.check(token, handler, source, from).await,
            Resource::V1(a) => a.check(token, handler, source, from).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get(
        &self,
        token: &CancellationToken,
        handler: &mut dyn GetEventHandler,
        volume: &Arc<dyn Volume>,
        io: &IoConfig,
        source: &Source,
        params: &Params,
        space: &Space,
        version: &Version,
    ) -> Result<()> {
        match self {
            Resource::V2(r) => {
                r.get(token, handler, volume, io, source, params, space, version)
                    .await
            }
            Resource::V1(a) => {
                a.get(token, handler, volume, io, source, params, space, version)
                    .await
            }
        }
    }

    pub async fn put(
        &self,
        token: &CancellationToken,
        handler: &mut dyn PutEventHandler,
        io: &IoConfig,
        source: &Source,
        params: &Params,
    ) -> Result<Vec<SpaceVersion>> {
        match self {
            Resource::V2(r) => r.put(token, handler, io, source, params).await,
            Resource::V1(a) => a.put(token, handler, io, source, params).await,
        }
    }
}

/// Info reported by a v2 resource's info process.
#[derive(Deserialize, Clone, Debug)]
pub struct ResourceInfo {
    pub artifacts: ArtifactsInfo,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ArtifactsInfo {
    pub api_version: String,
    pub check: String,
    pub get: String,
    pub put: String,
}

/// Creates [Resource] values by resolving a container for the resource type
/// and probing which protocol dialect it speaks.
#[derive(Clone)]
pub struct ResourceFactory {
    worker: Arc<dyn Worker>,
}

impl ResourceFactory {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        ResourceFactory { worker }
    }

    pub async fn new_resource(
        &self,
        token: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Resource> {
        let container = self
            .worker
            .find_or_create_container(token, owner, metadata, spec)
            .await?;

        match v2::info(&container, token).await {
            Ok(info) if info.artifacts.api_version == V2_API_VERSION => {
                Ok(Resource::V2(V2Resource::new(container, info)))
            }
            Ok(info) => {
                Err(ResourceError::UnknownResourceVersion(info.artifacts.api_version).into())
            }
            Err(e) => {
                let executable_missing = e
                    .downcast_ref::<WorkerError>()
                    .map(|w| matches!(w, WorkerError::ExecutableNotFound(_)))
                    .unwrap_or(false);

                if executable_missing {
                    Ok(Resource::V1(V1Adapter::new(container)))
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Merge source and params into the flat `config` object sent to a process.
pub(crate) fn merge_config(source: &Source, params: &Params) -> Source {
    let mut config = source.clone();
    for (k, v) in params {
        config.insert(k.clone(), v.clone());
    }
    config
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::INFO_PROCESS_ID;
    use crate::worker::test_support::*;
    use crate::worker::ContainerMetadata;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn version_digest_ignores_insertion_order() {
        let a = Version::from([("digest", "abc"), ("tag", "latest")]);
        let b = Version::from([("tag", "latest"), ("digest", "abc")]);

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.canonical_json(), r#"{"digest":"abc","tag":"latest"}"#);
    }

    #[test]
    fn version_digest_distinguishes_values() {
        let a = Version::from([("ref", "v1")]);
        let b = Version::from([("ref", "v2")]);

        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn merge_config_params_shadow_source() {
        let mut source = Source::new();
        source.insert("uri".into(), "https://example.com".into());
        source.insert("branch".into(), "main".into());

        let mut params = Params::new();
        params.insert("branch".into(), "feature".into());

        let merged = merge_config(&source, &params);
        assert_eq!(merged.get("uri").unwrap(), "https://example.com");
        assert_eq!(merged.get("branch").unwrap(), "feature");
    }

    async fn resource_for(container: std::sync::Arc<FakeContainer>) -> Result<Resource> {
        let factory = ResourceFactory::new(FakeWorker::new(container));
        factory
            .new_resource(
                &CancellationToken::new(),
                &ContainerOwner::ResourceCheck {
                    resource_config_id: 1,
                },
                &ContainerMetadata::default(),
                &ContainerSpec {
                    image: crate::util::docker::ImageName::from("git-resource"),
                    env: Vec::new(),
                    mounts: Vec::new(),
                },
            )
            .await
    }

    #[tokio::test]
    async fn factory_selects_v2_for_api_version_2() {
        let container = FakeContainer::new();
        container.script(
            INFO_PROCESS_ID,
            ProcessScript {
                stdout: v2_info_json(),
                ..Default::default()
            },
        );

        let resource = resource_for(container).await.unwrap();
        assert!(matches!(resource, Resource::V2(_)));
    }

    #[tokio::test]
    async fn factory_falls_back_to_v1_without_info_executable() {
        let container = FakeContainer::new();

        let resource = resource_for(container).await.unwrap();
        assert!(matches!(resource, Resource::V1(_)));
    }

    #[tokio::test]
    async fn factory_rejects_unknown_api_versions() {
        let container = FakeContainer::new();
        container.script(
            INFO_PROCESS_ID,
            ProcessScript {
                stdout: br#"{"artifacts": {"api_version": "3.0", "check": "c", "get": "g", "put": "p"}}"#.to_vec(),
                ..Default::default()
            },
        );

        let err = resource_for(container).await.unwrap_err();
        match err.downcast_ref::<ResourceError>() {
            Some(ResourceError::UnknownResourceVersion(version)) => assert_eq!(version, "3.0"),
            other => panic!("expected UnknownResourceVersion, got {other:?}"),
        }
    }
}
