//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The get step: fetch a version of a resource into an artifact volume.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::consts::GET_ARTIFACT_DIR_PATH;
use crate::db::models::ResourceConfigScope;
use crate::db::DbPool;
use crate::exec::RunState;
use crate::exec::Step;
use crate::exec::VersionInfo;
use crate::resource;
use crate::resource::IoConfig;
use crate::resource::Metadata;
use crate::resource::Params;
use crate::resource::ResourceError;
use crate::resource::ResourceFactory;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::Version;
use crate::util::docker::ImageName;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::ImageError;
use crate::worker::VolumeClient;
use crate::worker::VolumeMount;

/// How a get step fills in an unspecified space or version.
pub trait VersionResolver: Send + Sync {
    fn default_space(&self) -> Result<Option<Space>>;
    fn latest_version(&self, space: &Space) -> Result<Option<Version>>;
}

/// [VersionResolver] reading from the resource's config scope.
pub struct DbVersionResolver {
    pool: DbPool,
    scope: Option<ResourceConfigScope>,
}

impl DbVersionResolver {
    pub fn new(pool: DbPool, scope: Option<ResourceConfigScope>) -> Self {
        DbVersionResolver { pool, scope }
    }
}

impl VersionResolver for DbVersionResolver {
    fn default_space(&self) -> Result<Option<Space>> {
        Ok(self
            .scope
            .as_ref()
            .and_then(|scope| scope.default_space.as_deref())
            .map(Space::from))
    }

    fn latest_version(&self, space: &Space) -> Result<Option<Version>> {
        let Some(scope) = self.scope.as_ref() else {
            return Ok(None);
        };

        let mut conn = self.pool.get().context("Getting connection for resolve")?;
        match scope.version(&mut conn, Some(space))? {
            Some(row) => Ok(Some(row.version()?)),
            None => Ok(None),
        }
    }
}

struct RecordingGetHandler {
    fetched: Option<(Space, Version)>,
}

#[async_trait]
impl resource::GetEventHandler for RecordingGetHandler {
    async fn fetched(&mut self, space: Space, version: Version, _metadata: Metadata) -> Result<()> {
        self.fetched = Some((space, version));
        Ok(())
    }
}

pub struct GetStep {
    plan_id: Uuid,
    step_name: String,
    source: Source,
    params: Params,
    space: Option<Space>,
    version: Option<Version>,
    image: ImageName,
    build_id: i32,
    metadata: ContainerMetadata,
    factory: ResourceFactory,
    volumes: Arc<VolumeClient>,
    resolver: Arc<dyn VersionResolver>,
    io: IoConfig,

    exit_status: Option<i32>,
    succeeded: bool,
}

impl GetStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: Uuid,
        step_name: String,
        source: Source,
        params: Params,
        space: Option<Space>,
        version: Option<Version>,
        image: ImageName,
        build_id: i32,
        metadata: ContainerMetadata,
        factory: ResourceFactory,
        volumes: Arc<VolumeClient>,
        resolver: Arc<dyn VersionResolver>,
        io: IoConfig,
    ) -> Self {
        GetStep {
            plan_id,
            step_name,
            source,
            params,
            space,
            version,
            image,
            build_id,
            metadata,
            factory,
            volumes,
            resolver,
            io,
            exit_status: None,
            succeeded: false,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

#[async_trait]
impl Step for GetStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        let space = match self.space.clone() {
            Some(space) => space,
            None => self
                .resolver
                .default_space()?
                .ok_or(ImageError::NoSpaceSpecified)?,
        };

        let version = match self.version.clone() {
            Some(version) => version,
            None => self
                .resolver
                .latest_version(&space)?
                .ok_or_else(|| anyhow!("No version of resource available in space {space}"))?,
        };

        debug!(step = %self.step_name, %space, version = %version.digest(), "fetching");

        let volume = self
            .volumes
            .find_or_create_volume(token, &format!("get-{}", self.plan_id))
            .await?;

        let spec = ContainerSpec {
            image: self.image.clone(),
            env: Vec::new(),
            mounts: vec![VolumeMount {
                volume: volume.clone(),
                mount_path: GET_ARTIFACT_DIR_PATH.to_string(),
            }],
        };

        let owner = ContainerOwner::Build {
            build_id: self.build_id,
            plan_id: self.plan_id,
        };

        let resource = self
            .factory
            .new_resource(token, &owner, &self.metadata, &spec)
            .await?;

        let mut handler = RecordingGetHandler { fetched: None };
        match resource
            .get(
                token,
                &mut handler,
                &volume,
                &self.io,
                &self.source,
                &self.params,
                &space,
                &version,
            )
            .await
        {
            Ok(()) => {}
            Err(e) => {
                if let Some(ResourceError::ScriptFailed { exit_status, .. }) =
                    e.downcast_ref::<ResourceError>()
                {
                    debug!(exit_status, "get script failed");
                    self.exit_status = Some(*exit_status);
                    self.succeeded = false;
                    return Ok(());
                }
                return Err(e);
            }
        }

        state.register_artifact(&self.step_name, volume);

        let (space, version) = handler.fetched.unwrap_or((space, version));
        state.store_result(self.plan_id, VersionInfo { space, version });

        self.exit_status = Some(0);
        self.succeeded = true;
        Ok(())
    }

    fn succeeded(&self) -> bool {
        self.succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::*;
    use crate::db::InMemoryLockService;
    use crate::worker::test_support::*;

    struct StaticResolver {
        default_space: Option<Space>,
        latest: Option<Version>,
    }

    impl VersionResolver for StaticResolver {
        fn default_space(&self) -> Result<Option<Space>> {
            Ok(self.default_space.clone())
        }

        fn latest_version(&self, _space: &Space) -> Result<Option<Version>> {
            Ok(self.latest.clone())
        }
    }

    fn volumes(root: &std::path::Path) -> Arc<VolumeClient> {
        Arc::new(VolumeClient::new(
            root.to_path_buf(),
            Arc::new(InMemoryLockService::new()),
            std::time::Duration::from_millis(1),
            std::time::Duration::from_secs(60),
        ))
    }

    fn get_step(
        container: &std::sync::Arc<FakeContainer>,
        volumes: Arc<VolumeClient>,
        space: Option<Space>,
        version: Option<Version>,
        resolver: StaticResolver,
    ) -> GetStep {
        let worker = FakeWorker::new(container.clone());
        GetStep::new(
            Uuid::new_v4(),
            "sources".to_string(),
            Source::new(),
            Params::new(),
            space,
            version,
            ImageName::from("git-resource"),
            7,
            ContainerMetadata::default(),
            ResourceFactory::new(worker),
            volumes,
            Arc::new(resolver),
            IoConfig::default(),
        )
    }

    fn v2_container() -> std::sync::Arc<FakeContainer> {
        let container = FakeContainer::new();
        container.script(
            INFO_PROCESS_ID,
            ProcessScript {
                stdout: v2_info_json(),
                ..Default::default()
            },
        );
        container.script(GET_PROCESS_ID, ProcessScript::default());
        container.respond(RESPONSE_PATH, response_archive(&[]));
        container
    }

    #[tokio::test]
    async fn registers_the_artifact_and_stores_the_version() {
        let dir = tempfile::tempdir().unwrap();
        let container = v2_container();

        let mut step = get_step(
            &container,
            volumes(dir.path()),
            Some(Space::from("main")),
            Some(Version::from([("ref", "abc")])),
            StaticResolver {
                default_space: None,
                latest: None,
            },
        );

        let state = RunState::new();
        step.run(&CancellationToken::new(), &state).await.unwrap();

        assert!(step.succeeded());
        assert!(state.artifact("sources").is_some());
        assert_eq!(
            state.result(&step.plan_id).unwrap().version,
            Version::from([("ref", "abc")])
        );
    }

    #[tokio::test]
    async fn resolves_space_and_version_when_unspecified() {
        let dir = tempfile::tempdir().unwrap();
        let container = v2_container();

        let mut step = get_step(
            &container,
            volumes(dir.path()),
            None,
            None,
            StaticResolver {
                default_space: Some(Space::from("main")),
                latest: Some(Version::from([("ref", "head")])),
            },
        );

        let state = RunState::new();
        step.run(&CancellationToken::new(), &state).await.unwrap();

        let result = state.result(&step.plan_id).unwrap();
        assert_eq!(result.space, Space::from("main"));
        assert_eq!(result.version, Version::from([("ref", "head")]));
    }

    #[tokio::test]
    async fn missing_space_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let container = v2_container();

        let mut step = get_step(
            &container,
            volumes(dir.path()),
            None,
            Some(Version::from([("ref", "abc")])),
            StaticResolver {
                default_space: None,
                latest: None,
            },
        );

        let err = step
            .run(&CancellationToken::new(), &RunState::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::NoSpaceSpecified)
        ));
    }
}
