//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The put step: create new versions of a resource.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::consts::PUT_INPUTS_DIR_PATH;
use crate::db::models::Build;
use crate::db::models::Resource as DbResource;
use crate::db::models::ResourceConfig;
use crate::db::DbPool;
use crate::exec::RunState;
use crate::exec::Step;
use crate::exec::VersionInfo;
use crate::resource;
use crate::resource::IoConfig;
use crate::resource::Params;
use crate::resource::ResourceError;
use crate::resource::ResourceFactory;
use crate::resource::Source;
use crate::resource::SpaceVersion;
use crate::schema::jobs;
use crate::util::docker::ImageName;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::VolumeMount;

/// Persistence seam of the put step: saving created versions and the
/// build's output edges for them.
pub trait BuildOutputStore: Send + Sync {
    fn save_output(
        &self,
        pipeline_resource_name: &str,
        created: &SpaceVersion,
        output_name: &str,
    ) -> Result<()>;
}

/// [BuildOutputStore] writing through the version store.
pub struct DbBuildOutputStore {
    pool: DbPool,
    build: Build,
    resource_type: String,
    source: Source,
}

impl DbBuildOutputStore {
    pub fn new(pool: DbPool, build: Build, resource_type: String, source: Source) -> Self {
        DbBuildOutputStore {
            pool,
            build,
            resource_type,
            source,
        }
    }
}

impl BuildOutputStore for DbBuildOutputStore {
    fn save_output(
        &self,
        pipeline_resource_name: &str,
        created: &SpaceVersion,
        output_name: &str,
    ) -> Result<()> {
        let mut conn = self.pool.get().context("Getting connection for output")?;

        let pipeline_id = {
            use diesel::prelude::*;
            jobs::table
                .find(self.build.job_id)
                .select(jobs::pipeline_id)
                .first::<i32>(&mut conn)
                .context("Finding pipeline of build")?
        };

        let mut resource = DbResource::find_by_name(&mut conn, pipeline_id, pipeline_resource_name)?
            .ok_or_else(|| anyhow!("No resource '{pipeline_resource_name}' in pipeline"))?;

        let scope = match resource.resource_config_scope_id {
            Some(scope_id) => crate::db::models::ResourceConfigScope::find(&mut conn, scope_id)?
                .ok_or_else(|| anyhow!("Scope {scope_id} is gone"))?,
            None => {
                let config = ResourceConfig::find_or_create(
                    &mut conn,
                    &self.resource_type,
                    &self.source,
                    &[],
                )?;
                let scope = config.find_or_create_scope(&mut conn, Some(&resource))?;
                resource.assign_scope(&mut conn, &scope)?;
                scope
            }
        };

        scope.save_version(&mut conn, &created.space, &created.version, &created.metadata)?;

        self.build.save_output(
            &mut conn,
            resource.id,
            &created.version.digest(),
            output_name,
        )
    }
}

struct LoggingPutEventHandler;

#[async_trait]
impl resource::PutEventHandler for LoggingPutEventHandler {
    async fn created(&mut self, created: &SpaceVersion) -> Result<()> {
        info!(
            space = %created.space,
            version = %created.version.digest(),
            "version created"
        );
        Ok(())
    }
}

pub struct PutStep {
    plan_id: Uuid,
    step_name: String,
    /// The pipeline resource the outputs are recorded against. Without one
    /// (an anonymous put) nothing is persisted.
    pipeline_resource_name: Option<String>,
    source: Source,
    params: Params,
    image: ImageName,
    build_id: i32,
    metadata: ContainerMetadata,
    factory: ResourceFactory,
    store: Arc<dyn BuildOutputStore>,
    io: IoConfig,

    exit_status: Option<i32>,
    version_info: Option<VersionInfo>,
    succeeded: bool,
}

impl PutStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: Uuid,
        step_name: String,
        pipeline_resource_name: Option<String>,
        source: Source,
        params: Params,
        image: ImageName,
        build_id: i32,
        metadata: ContainerMetadata,
        factory: ResourceFactory,
        store: Arc<dyn BuildOutputStore>,
        io: IoConfig,
    ) -> Self {
        PutStep {
            plan_id,
            step_name,
            pipeline_resource_name,
            source,
            params,
            image,
            build_id,
            metadata,
            factory,
            store,
            io,
            exit_status: None,
            version_info: None,
            succeeded: false,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        self.version_info.as_ref()
    }
}

#[async_trait]
impl Step for PutStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        // Every artifact the build produced so far is offered to the put
        // script as an input.
        let mounts = state
            .artifacts()
            .into_iter()
            .map(|(name, volume)| VolumeMount {
                volume,
                mount_path: format!("{PUT_INPUTS_DIR_PATH}/{name}"),
            })
            .collect();

        let spec = ContainerSpec {
            image: self.image.clone(),
            env: Vec::new(),
            mounts,
        };

        let owner = ContainerOwner::Build {
            build_id: self.build_id,
            plan_id: self.plan_id,
        };

        let resource = self
            .factory
            .new_resource(token, &owner, &self.metadata, &spec)
            .await?;

        let mut handler = LoggingPutEventHandler;
        let space_versions = match resource
            .put(token, &mut handler, &self.io, &self.source, &self.params)
            .await
        {
            Ok(space_versions) => space_versions,
            Err(e) => {
                if let Some(ResourceError::ScriptFailed { exit_status, .. }) =
                    e.downcast_ref::<ResourceError>()
                {
                    debug!(exit_status, "put script failed");
                    self.exit_status = Some(*exit_status);
                    self.succeeded = false;
                    return Ok(());
                }
                return Err(e);
            }
        };

        if let Some(resource_name) = self.pipeline_resource_name.clone() {
            for space_version in &space_versions {
                self.store
                    .save_output(&resource_name, space_version, &self.step_name)?;
            }
        }

        if let Some(last) = space_versions.last() {
            let info = VersionInfo {
                space: last.space.clone(),
                version: last.version.clone(),
            };
            state.store_result(self.plan_id, info.clone());
            self.version_info = Some(info);
        }

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
    use crate::resource::Space;
    use crate::resource::Version;
    use crate::worker::test_support::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<(String, SpaceVersion, String)>>,
    }

    impl BuildOutputStore for RecordingStore {
        fn save_output(
            &self,
            pipeline_resource_name: &str,
            created: &SpaceVersion,
            output_name: &str,
        ) -> Result<()> {
            self.saved.lock().push((
                pipeline_resource_name.to_string(),
                created.clone(),
                output_name.to_string(),
            ));
            Ok(())
        }
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
        container
    }

    fn put_step(
        container: &std::sync::Arc<FakeContainer>,
        store: Arc<RecordingStore>,
        resource_name: Option<&str>,
    ) -> PutStep {
        let worker = FakeWorker::new(container.clone());
        PutStep::new(
            Uuid::new_v4(),
            "version".to_string(),
            resource_name.map(String::from),
            Source::new(),
            Params::new(),
            ImageName::from("registry-image-resource"),
            42,
            ContainerMetadata::default(),
            ResourceFactory::new(worker),
            store,
            IoConfig::default(),
        )
    }

    #[tokio::test]
    async fn saves_an_output_row_per_created_version_in_order() {
        let container = v2_container();
        container.script(PUT_PROCESS_ID, ProcessScript::default());
        container.respond(
            RESPONSE_PATH,
            response_archive(&[
                r#"{"action": "created", "space": "s", "version": {"v": "1"}}"#,
                r#"{"action": "created", "space": "s", "version": {"v": "2"}}"#,
            ]),
        );

        let store = Arc::new(RecordingStore::default());
        let mut step = put_step(&container, store.clone(), Some("my-resource"));

        let state = RunState::new();
        step.run(&CancellationToken::new(), &state).await.unwrap();

        assert!(step.succeeded());
        let saved = store.saved.lock();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].0, "my-resource");
        assert_eq!(saved[0].1.version, Version::from([("v", "1")]));
        assert_eq!(saved[1].1.version, Version::from([("v", "2")]));
        assert_eq!(saved[1].2, "version");

        // The step's result is the last created version.
        let result = state.result(&step.plan_id).unwrap();
        assert_eq!(result.version, Version::from([("v", "2")]));
        assert_eq!(result.space, Space::from("s"));
        assert_eq!(step.version_info().unwrap().version, Version::from([("v", "2")]));
    }

    #[tokio::test]
    async fn anonymous_put_persists_nothing() {
        let container = v2_container();
        container.script(PUT_PROCESS_ID, ProcessScript::default());
        container.respond(
            RESPONSE_PATH,
            response_archive(&[r#"{"action": "created", "space": "s", "version": {"v": "1"}}"#]),
        );

        let store = Arc::new(RecordingStore::default());
        let mut step = put_step(&container, store.clone(), None);

        step.run(&CancellationToken::new(), &RunState::new())
            .await
            .unwrap();

        assert!(step.succeeded());
        assert!(store.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn script_failure_is_unsuccessful_but_not_an_error() {
        let container = v2_container();
        container.script(
            PUT_PROCESS_ID,
            ProcessScript {
                exit_status: 2,
                stderr: b"boom".to_vec(),
                ..Default::default()
            },
        );

        let store = Arc::new(RecordingStore::default());
        let mut step = put_step(&container, store.clone(), Some("my-resource"));

        step.run(&CancellationToken::new(), &RunState::new())
            .await
            .unwrap();

        assert!(!step.succeeded());
        assert_eq!(step.exit_status(), Some(2));
        assert!(store.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn abort_stops_the_container_exactly_once() {
        let container = v2_container();
        container.script(
            PUT_PROCESS_ID,
            ProcessScript {
                block: true,
                ..Default::default()
            },
        );

        let store = Arc::new(RecordingStore::default());
        let mut step = put_step(&container, store, Some("my-resource"));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = step
            .run(&token, &RunState::new())
            .await
            .expect_err("cancelled put must error");

        assert!(ResourceError::is_cancelled(&err));
        // Stopped gracefully, once, with no in-band signal.
        assert_eq!(container.stop_calls.lock().as_slice(), &[false]);
    }
}
