//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The task step: run a user-supplied command in a container.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::consts::TASK_INPUTS_DIR_PATH;
use crate::exec::RunState;
use crate::exec::Step;
use crate::resource::script;
use crate::resource::IoConfig;
use crate::util::docker::ImageName;
use crate::worker::ContainerMetadata;
use crate::worker::ContainerOwner;
use crate::worker::ContainerSpec;
use crate::worker::VolumeMount;
use crate::worker::Worker;

pub struct TaskStep {
    plan_id: Uuid,
    step_name: String,
    image: ImageName,
    path: String,
    args: Vec<String>,
    build_id: i32,
    metadata: ContainerMetadata,
    worker: Arc<dyn Worker>,
    io: IoConfig,

    exit_status: Option<i32>,
}

impl TaskStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: Uuid,
        step_name: String,
        image: ImageName,
        path: String,
        args: Vec<String>,
        build_id: i32,
        metadata: ContainerMetadata,
        worker: Arc<dyn Worker>,
        io: IoConfig,
    ) -> Self {
        TaskStep {
            plan_id,
            step_name,
            image,
            path,
            args,
            build_id,
            metadata,
            worker,
            io,
            exit_status: None,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

#[async_trait]
impl Step for TaskStep {
    async fn run(&mut self, token: &CancellationToken, state: &RunState) -> Result<()> {
        let mounts = state
            .artifacts()
            .into_iter()
            .map(|(name, volume)| VolumeMount {
                volume,
                mount_path: format!("{TASK_INPUTS_DIR_PATH}/{name}"),
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

        let container = self
            .worker
            .find_or_create_container(token, &owner, &self.metadata, &spec)
            .await?;

        // The task's process id is derived from the plan so a restarted
        // supervisor re-attaches instead of re-running the command.
        let process_id = format!("task-{}", self.plan_id);

        let run = script::run_script(
            &container,
            token,
            &process_id,
            &self.path,
            self.args.clone(),
            Vec::new(),
            &self.io,
            false,
        )
        .await?;

        debug!(step = %self.step_name, status = run.status, "task finished");
        self.exit_status = Some(run.status);
        Ok(())
    }

    fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}
