//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Back-compat adapter for containers that speak the v1 resource protocol.
//!
//! v1 scripts live at fixed paths, take one JSON request on stdin and answer
//! on stdout. The adapter translates that into the v2 operation set: every
//! version a v1 resource reports lives in the single synthetic space
//! `v1space`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::consts::*;
use crate::resource::script;
use crate::resource::CheckEventHandler;
use crate::resource::GetEventHandler;
use crate::resource::IoConfig;
use crate::resource::Metadata;
use crate::resource::Params;
use crate::resource::PutEventHandler;
use crate::resource::ResourceError;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::SpaceVersion;
use crate::resource::Version;
use crate::worker::Container;
use crate::worker::Volume;

const V1_CHECK_PATH: &str = "/opt/resource/check";
const V1_IN_PATH: &str = "/opt/resource/in";
const V1_OUT_PATH: &str = "/opt/resource/out";

#[derive(Serialize, Debug)]
struct V1Request<'a> {
    source: &'a Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a Version>,
}

#[derive(Deserialize, Debug)]
struct V1VersionedSource {
    version: Version,
    #[serde(default)]
    metadata: Metadata,
}

pub struct V1Adapter {
    container: Arc<dyn Container>,
}

impl std::fmt::Debug for V1Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V1Adapter")
            .field("container", &self.container.handle())
            .finish()
    }
}

impl V1Adapter {
    pub fn new(container: Arc<dyn Container>) -> Self {
        V1Adapter { container }
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
        let v1_space = Space::from(V1_SPACE_NAME);

        // A v1 resource only ever has the one space; asking to continue from
        // any other is a caller bug.
        let from_version = if from.is_empty() {
            None
        } else {
            match from.get(&v1_space) {
                Some(version) => Some(version),
                None => {
                    let space = from
                        .keys()
                        .next()
                        .cloned()
                        .unwrap_or_else(|| v1_space.clone());
                    return Err(ResourceError::UnknownSpace(space).into());
                }
            }
        };

        let request = serde_json::to_vec(&V1Request {
            source,
            params: None,
            version: from_version,
        })
        .context("Serialising v1 check request")?;

        let run = self
            .run_v1(token, CHECK_PROCESS_ID, V1_CHECK_PATH, vec![], request, &IoConfig::default())
            .await?;

        let versions: Vec<Version> =
            serde_json::from_slice(&run).map_err(|e| ResourceError::DecodeError(e.to_string()))?;

        handler.default_space(v1_space.clone()).await?;

        for version in versions {
            handler
                .discovered(v1_space.clone(), version, Metadata::new())
                .await?;
        }

        handler.latest_versions().await
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
        _space: &Space,
        version: &Version,
    ) -> Result<()> {
        let request = serde_json::to_vec(&V1Request {
            source,
            params: Some(params),
            version: Some(version),
        })
        .context("Serialising v1 get request")?;

        let stdout = self
            .run_v1(
                token,
                GET_PROCESS_ID,
                V1_IN_PATH,
                vec![GET_ARTIFACT_DIR_PATH.to_string()],
                request,
                io,
            )
            .await?;

        let fetched: V1VersionedSource =
            serde_json::from_slice(&stdout).map_err(|e| ResourceError::DecodeError(e.to_string()))?;

        handler
            .fetched(Space::from(V1_SPACE_NAME), fetched.version, fetched.metadata)
            .await
    }

    pub async fn put(
        &self,
        token: &CancellationToken,
        handler: &mut dyn PutEventHandler,
        io: &IoConfig,
        source: &Source,
        params: &Params,
    ) -> Result<Vec<SpaceVersion>> {
        let request = serde_json::to_vec(&V1Request {
            source,
            params: Some(params),
            version: None,
        })
        .context("Serialising v1 put request")?;

        let stdout = self
            .run_v1(
                token,
                PUT_PROCESS_ID,
                V1_OUT_PATH,
                vec![PUT_INPUTS_DIR_PATH.to_string()],
                request,
                io,
            )
            .await?;

        let created: V1VersionedSource =
            serde_json::from_slice(&stdout).map_err(|e| ResourceError::DecodeError(e.to_string()))?;

        let space_version = SpaceVersion {
            space: Space::from(V1_SPACE_NAME),
            version: created.version,
            metadata: created.metadata,
        };

        handler.created(&space_version).await?;

        Ok(vec![space_version])
    }

    async fn run_v1(
        &self,
        token: &CancellationToken,
        process_id: &str,
        path: &str,
        args: Vec<String>,
        request: Vec<u8>,
        io: &IoConfig,
    ) -> Result<Vec<u8>> {
        let run = script::run_script(
            &self.container,
            token,
            process_id,
            path,
            args,
            request,
            io,
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

        Ok(run.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_util::RecordingCheckHandler;
    use crate::worker::test_support::*;

    fn adapter(container: &Arc<FakeContainer>) -> V1Adapter {
        V1Adapter::new(container.clone())
    }

    #[tokio::test]
    async fn check_translates_versions_into_the_synthetic_space() {
        let container = FakeContainer::new();
        container.script(
            CHECK_PROCESS_ID,
            ProcessScript {
                stdout: br#"[{"ref": "a"}, {"ref": "b"}]"#.to_vec(),
                ..Default::default()
            },
        );

        let mut handler = RecordingCheckHandler::default();
        let mut from = BTreeMap::new();
        from.insert(Space::from(V1_SPACE_NAME), Version::from([("ref", "a")]));

        adapter(&container)
            .check(&CancellationToken::new(), &mut handler, &Source::new(), &from)
            .await
            .unwrap();

        assert_eq!(
            handler.events,
            vec![
                "default_space:v1space",
                r#"discovered:v1space:{"ref":"a"}:0"#,
                r#"discovered:v1space:{"ref":"b"}:0"#,
                "latest_versions",
            ]
        );

        // The v1 request carried the version to continue from.
        let requests = container.requests.lock();
        let request: serde_json::Value = serde_json::from_slice(&requests[0].1).unwrap();
        assert_eq!(request["version"]["ref"], "a");
    }

    #[tokio::test]
    async fn check_rejects_unknown_spaces() {
        let container = FakeContainer::new();
        let mut handler = RecordingCheckHandler::default();

        let mut from = BTreeMap::new();
        from.insert(Space::from("feature"), Version::from([("ref", "a")]));

        let err = adapter(&container)
            .check(&CancellationToken::new(), &mut handler, &Source::new(), &from)
            .await
            .unwrap_err();

        match err.downcast_ref::<ResourceError>() {
            Some(ResourceError::UnknownSpace(space)) => {
                assert_eq!(space, &Space::from("feature"))
            }
            other => panic!("expected UnknownSpace, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_yields_exactly_one_space_version() {
        let container = FakeContainer::new();
        container.script(
            PUT_PROCESS_ID,
            ProcessScript {
                stdout: br#"{"version": {"ref": "xyz"}, "metadata": [{"name": "author", "value": "me"}]}"#
                    .to_vec(),
                ..Default::default()
            },
        );

        struct CountingHandler(usize);

        #[async_trait::async_trait]
        impl crate::resource::PutEventHandler for CountingHandler {
            async fn created(&mut self, _created: &SpaceVersion) -> Result<()> {
                self.0 += 1;
                Ok(())
            }
        }

        let mut handler = CountingHandler(0);
        let created = adapter(&container)
            .put(
                &CancellationToken::new(),
                &mut handler,
                &IoConfig::default(),
                &Source::new(),
                &Params::new(),
            )
            .await
            .unwrap();

        assert_eq!(handler.0, 1);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].space, Space::from(V1_SPACE_NAME));
        assert_eq!(created[0].version, Version::from([("ref", "xyz")]));
        assert_eq!(created[0].metadata.len(), 1);
    }
}
