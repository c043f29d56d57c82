//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The v2 resource protocol driver.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::consts::*;
use crate::resource::protocol;
use crate::resource::protocol::Event;
use crate::resource::script;
use crate::resource::CheckEventHandler;
use crate::resource::GetEventHandler;
use crate::resource::IoConfig;
use crate::resource::Params;
use crate::resource::PutEventHandler;
use crate::resource::ResourceError;
use crate::resource::ResourceInfo;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::SpaceVersion;
use crate::resource::Version;
use crate::worker::Container;
use crate::worker::Volume;

/// The path of the v2 info executable inside a resource container.
const INFO_SCRIPT_PATH: &str = "/opt/resource/info";

/// Probe a container for its resource protocol dialect.
///
/// Runs the info process and parses its stdout. A container without the
/// info executable fails with [crate::worker::WorkerError::ExecutableNotFound],
/// which the factory treats as "speaks v1".
pub(crate) async fn info(
    container: &Arc<dyn Container>,
    token: &CancellationToken,
) -> Result<ResourceInfo> {
    let run = script::run_script(
        container,
        token,
        INFO_PROCESS_ID,
        INFO_SCRIPT_PATH,
        vec![],
        vec![],
        &IoConfig::default(),
        true,
    )
    .await?;

    if run.status != 0 {
        return Err(ResourceError::ScriptFailed {
            exit_status: run.status,
            stderr_tail: run.stderr_tail,
        }
        .into());
    }

    serde_json::from_slice(&run.stdout).context("Parsing resource info")
}

pub struct V2Resource {
    container: Arc<dyn Container>,
    info: ResourceInfo,
}

impl std::fmt::Debug for V2Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V2Resource")
            .field("container", &self.container.handle())
            .field("info", &self.info)
            .finish()
    }
}

impl V2Resource {
    pub fn new(container: Arc<dyn Container>, info: ResourceInfo) -> Self {
        V2Resource { container, info }
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    pub async fn check(
        &self,
        token: &CancellationToken,
        handler: &mut dyn CheckEventHandler,
        source: &Source,
        from: &BTreeMap<Space, Version>,
    ) -> Result<()> {
        let request = serde_json::to_vec(&protocol::CheckRequest {
            config: source,
            from,
            response_path: RESPONSE_PATH,
        })
        .context("Serialising check request")?;

        let events = self
            .run_action(token, CHECK_PROCESS_ID, &self.info.artifacts.check, request, &IoConfig::default())
            .await?;

        for event in events {
            match event {
                Event::DefaultSpace { space } => handler.default_space(space).await?,
                Event::Discovered {
                    space,
                    version,
                    metadata,
                } => handler.discovered(space, version, metadata).await?,
                Event::LatestVersions {} => handler.latest_versions().await?,
                other => return Err(action_not_found(other).into()),
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get(
        &self,
        token: &CancellationToken,
        handler: &mut dyn GetEventHandler,
        _volume: &Arc<dyn Volume>,
        io: &IoConfig,
        source: &Source,
        params: &Params,
        space: &Space,
        version: &Version,
    ) -> Result<()> {
        let request = serde_json::to_vec(&protocol::GetRequest {
            config: crate::resource::merge_config(source, params),
            space: space.clone(),
            version: version.clone(),
            response_path: RESPONSE_PATH.to_string(),
        })
        .context("Serialising get request")?;

        let events = self
            .run_action(token, GET_PROCESS_ID, &self.info.artifacts.get, request, io)
            .await?;

        for event in events {
            match event {
                Event::Fetched {
                    space,
                    version,
                    metadata,
                } => handler.fetched(space, version, metadata).await?,
                other => return Err(action_not_found(other).into()),
            }
        }

        Ok(())
    }

    pub async fn put(
        &self,
        token: &CancellationToken,
        handler: &mut dyn PutEventHandler,
        io: &IoConfig,
        source: &Source,
        params: &Params,
    ) -> Result<Vec<SpaceVersion>> {
        let request = serde_json::to_vec(&protocol::PutRequest {
            config: crate::resource::merge_config(source, params),
            response_path: RESPONSE_PATH.to_string(),
        })
        .context("Serialising put request")?;

        let events = self
            .run_action(token, PUT_PROCESS_ID, &self.info.artifacts.put, request, io)
            .await?;

        let mut created = Vec::with_capacity(events.len());
        for event in events {
            match event {
                Event::Created {
                    space,
                    version,
                    metadata,
                } => {
                    let space_version = SpaceVersion {
                        space,
                        version,
                        metadata,
                    };
                    handler.created(&space_version).await?;
                    created.push(space_version);
                }
                other => return Err(action_not_found(other).into()),
            }
        }

        Ok(created)
    }

    async fn run_action(
        &self,
        token: &CancellationToken,
        process_id: &str,
        path: &str,
        request: Vec<u8>,
        io: &IoConfig,
    ) -> Result<Vec<Event>> {
        let run = script::run_script(
            &self.container,
            token,
            process_id,
            path,
            vec![],
            request,
            io,
            false,
        )
        .await?;

        if run.status != 0 {
            return Err(ResourceError::ScriptFailed {
                exit_status: run.status,
                stderr_tail: run.stderr_tail,
            }
            .into());
        }

        let response = script::read_response(&self.container, RESPONSE_PATH).await?;
        trace!(process_id, bytes = response.len(), "response received");

        Ok(protocol::parse_events(&response)?)
    }
}

/// A structurally valid event arrived in a response where its action has no
/// meaning.
fn action_not_found(event: Event) -> ResourceError {
    let action = match event {
        Event::DefaultSpace { .. } => "default_space",
        Event::Discovered { .. } => "discovered",
        Event::LatestVersions {} => "latest_versions",
        Event::Created { .. } => "created",
        Event::Fetched { .. } => "fetched",
    };

    ResourceError::ActionNotFound {
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_util::RecordingCheckHandler;
    use crate::worker::test_support::*;

    fn v2_resource(container: &Arc<FakeContainer>) -> V2Resource {
        let info: ResourceInfo = serde_json::from_slice(&v2_info_json()).unwrap();
        V2Resource::new(container.clone(), info)
    }

    fn check_container(lines: &[&str]) -> Arc<FakeContainer> {
        let container = FakeContainer::new();
        container.script(CHECK_PROCESS_ID, ProcessScript::default());
        container.respond(RESPONSE_PATH, response_archive(lines));
        container
    }

    #[tokio::test]
    async fn check_dispatches_events_in_order() {
        let container = check_container(&[
            r#"{"action": "default_space", "space": "main"}"#,
            r#"{"action": "discovered", "space": "main", "version": {"ref": "a"}}"#,
            r#"{"action": "discovered", "space": "main", "version": {"ref": "b"}}"#,
            r#"{"action": "latest_versions"}"#,
        ]);

        let resource = v2_resource(&container);
        let mut handler = RecordingCheckHandler::default();

        let mut source = Source::new();
        source.insert("uri".into(), "https://example.com".into());

        resource
            .check(&CancellationToken::new(), &mut handler, &source, &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            handler.events,
            vec![
                "default_space:main",
                r#"discovered:main:{"ref":"a"}:0"#,
                r#"discovered:main:{"ref":"b"}:0"#,
                "latest_versions",
            ]
        );

        // The request carried the config and the response path.
        let requests = container.requests.lock();
        let (process, stdin) = &requests[0];
        assert_eq!(process, CHECK_PROCESS_ID);
        let request: serde_json::Value = serde_json::from_slice(stdin).unwrap();
        assert_eq!(request["config"]["uri"], "https://example.com");
        assert_eq!(request["response_path"], RESPONSE_PATH);
    }

    #[tokio::test]
    async fn check_reattaches_to_a_running_process() {
        let container = check_container(&[r#"{"action": "latest_versions"}"#]);
        container.attachable.lock().insert(CHECK_PROCESS_ID.to_string());

        let resource = v2_resource(&container);
        let mut handler = RecordingCheckHandler::default();

        resource
            .check(
                &CancellationToken::new(),
                &mut handler,
                &Source::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(container.attaches.lock().len(), 1);
        assert!(container.runs.lock().is_empty());
    }

    #[tokio::test]
    async fn misplaced_actions_fail_the_action() {
        // "created" has no meaning in a check response.
        let container = check_container(&[r#"{"action": "created", "space": "s", "version": {"v": "1"}}"#]);

        let resource = v2_resource(&container);
        let mut handler = RecordingCheckHandler::default();

        let err = resource
            .check(
                &CancellationToken::new(),
                &mut handler,
                &Source::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();

        match err.downcast_ref::<ResourceError>() {
            Some(ResourceError::ActionNotFound { action }) => assert_eq!(action, "created"),
            other => panic!("expected ActionNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_carries_the_stderr_tail() {
        let container = FakeContainer::new();
        container.script(
            CHECK_PROCESS_ID,
            ProcessScript {
                exit_status: 1,
                stderr: b"fatal: repository not found".to_vec(),
                ..Default::default()
            },
        );

        let resource = v2_resource(&container);
        let mut handler = RecordingCheckHandler::default();

        let err = resource
            .check(
                &CancellationToken::new(),
                &mut handler,
                &Source::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();

        match err.downcast_ref::<ResourceError>() {
            Some(ResourceError::ScriptFailed {
                exit_status,
                stderr_tail,
            }) => {
                assert_eq!(*exit_status, 1);
                assert!(stderr_tail.contains("repository not found"));
            }
            other => panic!("expected ScriptFailed, got {other:?}"),
        }
    }
}
