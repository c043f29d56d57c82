//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Turning a build's plan into a runnable step tree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use diesel::prelude::*;

use crate::db::models::Build;
use crate::db::models::Resource as DbResource;
use crate::db::models::ResourceConfigScope;
use crate::db::DbPool;
use crate::exec::AggregateStep;
use crate::exec::BoxedStep;
use crate::exec::DbBuildOutputStore;
use crate::exec::DbVersionResolver;
use crate::exec::DoStep;
use crate::exec::EnsureStep;
use crate::exec::GetStep;
use crate::exec::OnAbortStep;
use crate::exec::OnFailureStep;
use crate::exec::OnSuccessStep;
use crate::exec::Plan;
use crate::exec::PlanStep;
use crate::exec::PutStep;
use crate::exec::TaskStep;
use crate::exec::TimeoutStep;
use crate::exec::TryStep;
use crate::resource::IoConfig;
use crate::resource::ResourceFactory;
use crate::schema::jobs;
use crate::schema::pipelines;
use crate::util::docker::ImageName;
use crate::worker::ContainerMetadata;
use crate::worker::VolumeClient;
use crate::worker::Worker;

/// Builds step trees for builds.
///
/// Holds everything step construction needs: the worker, the volume
/// client, the database pool and the mapping from base resource type names
/// to their container images.
pub struct StepFactory {
    pool: DbPool,
    worker: Arc<dyn Worker>,
    volumes: Arc<VolumeClient>,
    base_images: HashMap<String, ImageName>,
}

impl StepFactory {
    pub fn new(
        pool: DbPool,
        worker: Arc<dyn Worker>,
        volumes: Arc<VolumeClient>,
        base_images: HashMap<String, ImageName>,
    ) -> Self {
        StepFactory {
            pool,
            worker,
            volumes,
            base_images,
        }
    }

    pub fn build_step(&self, build: &Build, plan: &Plan) -> Result<BoxedStep> {
        let metadata = self.container_metadata(build)?;
        self.build_node(build, plan, &metadata)
    }

    fn build_node(
        &self,
        build: &Build,
        plan: &Plan,
        metadata: &ContainerMetadata,
    ) -> Result<BoxedStep> {
        let step: BoxedStep = match &plan.step {
            PlanStep::Get {
                name,
                type_,
                resource,
                source,
                params,
                space,
                version,
            } => {
                let scope = match resource {
                    Some(resource_name) => self.scope_of(build, resource_name)?,
                    None => None,
                };

                Box::new(GetStep::new(
                    plan.id,
                    name.clone(),
                    source.clone(),
                    params.clone(),
                    space.clone(),
                    version.clone(),
                    self.image_for(type_)?,
                    build.id,
                    metadata.clone(),
                    ResourceFactory::new(self.worker.clone()),
                    self.volumes.clone(),
                    Arc::new(DbVersionResolver::new(self.pool.clone(), scope)),
                    IoConfig::default(),
                ))
            }

            PlanStep::Put {
                name,
                type_,
                resource,
                source,
                params,
            } => Box::new(PutStep::new(
                plan.id,
                name.clone(),
                resource.clone(),
                source.clone(),
                params.clone(),
                self.image_for(type_)?,
                build.id,
                metadata.clone(),
                ResourceFactory::new(self.worker.clone()),
                Arc::new(DbBuildOutputStore::new(
                    self.pool.clone(),
                    build.clone(),
                    type_.clone(),
                    source.clone(),
                )),
                IoConfig::default(),
            )),

            PlanStep::Task {
                name,
                image,
                path,
                args,
            } => Box::new(TaskStep::new(
                plan.id,
                name.clone(),
                ImageName::from(image.as_str()),
                path.clone(),
                args.clone(),
                build.id,
                metadata.clone(),
                self.worker.clone(),
                IoConfig::default(),
            )),

            PlanStep::Aggregate { steps } => Box::new(AggregateStep::new(
                steps
                    .iter()
                    .map(|p| self.build_node(build, p, metadata))
                    .collect::<Result<Vec<_>>>()?,
            )),

            PlanStep::Do { steps } => Box::new(DoStep::new(
                steps
                    .iter()
                    .map(|p| self.build_node(build, p, metadata))
                    .collect::<Result<Vec<_>>>()?,
            )),

            PlanStep::Try { inner } => {
                Box::new(TryStep::new(self.build_node(build, inner, metadata)?))
            }

            PlanStep::Timeout { seconds, inner } => Box::new(TimeoutStep::new(
                self.build_node(build, inner, metadata)?,
                Duration::from_secs(*seconds),
            )),

            PlanStep::OnSuccess { inner, hook } => Box::new(OnSuccessStep::new(
                self.build_node(build, inner, metadata)?,
                self.build_node(build, hook, metadata)?,
            )),

            PlanStep::OnFailure { inner, hook } => Box::new(OnFailureStep::new(
                self.build_node(build, inner, metadata)?,
                self.build_node(build, hook, metadata)?,
            )),

            PlanStep::OnAbort { inner, hook } => Box::new(OnAbortStep::new(
                self.build_node(build, inner, metadata)?,
                self.build_node(build, hook, metadata)?,
            )),

            PlanStep::Ensure { inner, hook } => Box::new(EnsureStep::new(
                self.build_node(build, inner, metadata)?,
                self.build_node(build, hook, metadata)?,
            )),
        };

        Ok(step)
    }

    fn image_for(&self, resource_type: &str) -> Result<ImageName> {
        self.base_images
            .get(resource_type)
            .cloned()
            .ok_or_else(|| anyhow!("No image configured for resource type '{resource_type}'"))
    }

    fn scope_of(&self, build: &Build, resource_name: &str) -> Result<Option<ResourceConfigScope>> {
        let mut conn = self.pool.get().context("Getting connection for scope")?;

        let pipeline_id = jobs::table
            .find(build.job_id)
            .select(jobs::pipeline_id)
            .first::<i32>(&mut conn)
            .context("Finding pipeline of build")?;

        let Some(resource) = DbResource::find_by_name(&mut conn, pipeline_id, resource_name)?
        else {
            return Ok(None);
        };

        match resource.resource_config_scope_id {
            Some(scope_id) => ResourceConfigScope::find(&mut conn, scope_id),
            None => Ok(None),
        }
    }

    fn container_metadata(&self, build: &Build) -> Result<ContainerMetadata> {
        let mut conn = self.pool.get().context("Getting connection for metadata")?;

        let (job_name, pipeline_name) = jobs::table
            .inner_join(pipelines::table)
            .filter(jobs::id.eq(build.job_id))
            .select((jobs::name, pipelines::name))
            .first::<(String, String)>(&mut conn)
            .context("Finding job and pipeline names")?;

        Ok(ContainerMetadata {
            pipeline_name,
            job_name,
            step_name: String::new(),
        })
    }
}
