//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The database-backed build the engine supervises.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;

use crate::db::models::Build;
use crate::db::models::BuildStatus;
use crate::db::DbPool;
use crate::engine::StepBuilder;
use crate::engine::TrackedBuild;
use crate::exec::BoxedStep;
use crate::exec::Plan;
use crate::exec::StepFactory;

pub struct DbTrackedBuild {
    pool: DbPool,
    build: Build,
}

impl DbTrackedBuild {
    pub fn new(pool: DbPool, build: Build) -> Self {
        DbTrackedBuild { pool, build }
    }

    pub fn build(&self) -> &Build {
        &self.build
    }
}

impl TrackedBuild for DbTrackedBuild {
    fn id(&self) -> i32 {
        self.build.id
    }

    fn reload(&mut self) -> Result<bool> {
        let mut conn = self.pool.get().context("Getting connection for reload")?;
        self.build.reload(&mut conn)
    }

    fn is_running(&self) -> bool {
        self.build.is_running()
    }

    fn start(&mut self) -> Result<()> {
        if self.build.status()? == BuildStatus::Started {
            return Ok(());
        }

        let mut conn = self.pool.get().context("Getting connection for start")?;
        self.build.start(&mut conn)
    }

    fn finish(&mut self, status: BuildStatus) -> Result<()> {
        let mut conn = self.pool.get().context("Getting connection for finish")?;
        self.build.finish(&mut conn, status)
    }
}

impl StepBuilder<DbTrackedBuild> for StepFactory {
    fn build_step(&self, build: &DbTrackedBuild) -> Result<BoxedStep> {
        let plan_json = build
            .build()
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("Build {} has no plan", build.id()))?;

        let plan: Plan =
            serde_json::from_value(plan_json.clone()).context("Deserialising build plan")?;

        StepFactory::build_step(self, build.build(), &plan)
    }
}
