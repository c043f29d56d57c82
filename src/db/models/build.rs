//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Integer;
use diesel::PgConnection;
use tracing::trace;

use crate::db::models::Job;
use crate::resource::VersionDigest;
use crate::schema::build_pipes;
use crate::schema::build_resource_config_version_inputs;
use crate::schema::build_resource_config_version_outputs;
use crate::schema::builds;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(anyhow!("Unknown build status: {other}")),
        }
    }
}

/// Denormalise a finished build's edges into `successful_build_outputs`.
///
/// The jsonb `outputs` object maps resource id to the version digests the
/// build used or produced, which is exactly the shape the walker's
/// containment filter probes with `@>`.
const DENORMALISE_OUTPUTS_QUERY: &str = r#"
    INSERT INTO successful_build_outputs (build_id, job_id, outputs, rerun_of)
    SELECT b.id, b.job_id, json_object_agg(sp.resource_id, sp.v)::jsonb, b.rerun_of
    FROM builds b
    JOIN (
        SELECT build_id, resource_id, json_agg(version_md5) AS v
        FROM (
            (
                SELECT build_id, resource_id, version_md5
                FROM build_resource_config_version_outputs o
                WHERE o.build_id = $1
            )
            UNION ALL
            (
                SELECT build_id, resource_id, version_md5
                FROM build_resource_config_version_inputs i
                WHERE i.build_id = $1
            )
        ) AS agg GROUP BY build_id, resource_id
    ) sp ON sp.build_id = b.id
    WHERE b.id = $1
    GROUP BY b.id, b.job_id, b.rerun_of
    ON CONFLICT (build_id) DO UPDATE SET outputs = EXCLUDED.outputs
"#;

#[derive(Debug, Clone, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(Job))]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i32,
    pub job_id: i32,
    pub name: String,
    pub status: String,
    pub rerun_of: Option<i32>,
    pub inputs_ready: bool,
    pub scheduled: bool,
    pub needs_v6_migration: bool,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub plan: Option<serde_json::Value>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
struct NewBuild<'a> {
    pub job_id: i32,
    pub name: &'a str,
    pub status: &'a str,
    pub rerun_of: Option<i32>,
    pub inputs_ready: bool,
    pub scheduled: bool,
    pub needs_v6_migration: bool,
}

impl Build {
    pub fn create(
        database_connection: &mut PgConnection,
        job: &Job,
        build_name: &str,
        rerun_of: Option<i32>,
    ) -> Result<Build> {
        let new_build = NewBuild {
            job_id: job.id,
            name: build_name,
            status: BuildStatus::Pending.as_str(),
            rerun_of,
            inputs_ready: false,
            scheduled: false,
            // Builds created by this version of the control plane write
            // their denormalised outputs at finish time themselves.
            needs_v6_migration: false,
        };

        trace!("Creating Build in database: {:?}", new_build);
        diesel::insert_into(builds::table)
            .values(&new_build)
            .get_result::<Build>(database_connection)
            .context("Creating build in database")
    }

    pub fn find(database_connection: &mut PgConnection, build_id: i32) -> Result<Option<Build>> {
        builds::table
            .find(build_id)
            .first::<Build>(database_connection)
            .optional()
            .map_err(Error::from)
    }

    /// Refresh this row from the database. Returns false if the build row
    /// is gone.
    pub fn reload(&mut self, database_connection: &mut PgConnection) -> Result<bool> {
        match Build::find(database_connection, self.id)? {
            Some(build) => {
                *self = build;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn status(&self) -> Result<BuildStatus> {
        self.status.parse()
    }

    pub fn set_plan(
        &mut self,
        database_connection: &mut PgConnection,
        plan: &serde_json::Value,
    ) -> Result<()> {
        diesel::update(builds::table.find(self.id))
            .set(builds::plan.eq(plan))
            .execute(database_connection)
            .context("Setting build plan")?;

        self.plan = Some(plan.clone());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            Ok(BuildStatus::Pending) | Ok(BuildStatus::Started)
        )
    }

    pub fn start(&mut self, database_connection: &mut PgConnection) -> Result<()> {
        diesel::update(builds::table.find(self.id))
            .set((
                builds::status.eq(BuildStatus::Started.as_str()),
                builds::start_time.eq(diesel::dsl::now),
            ))
            .execute(database_connection)
            .context("Starting build")?;

        self.status = BuildStatus::Started.as_str().to_string();
        Ok(())
    }

    /// Persist the terminal state of this build.
    ///
    /// A succeeding build also writes its denormalised outputs row so that
    /// it never needs the walker's lazy migration.
    pub fn finish(
        &mut self,
        database_connection: &mut PgConnection,
        terminal: BuildStatus,
    ) -> Result<()> {
        database_connection.transaction::<_, Error, _>(|conn| {
            diesel::update(builds::table.find(self.id))
                .set((
                    builds::status.eq(terminal.as_str()),
                    builds::end_time.eq(diesel::dsl::now),
                    builds::needs_v6_migration.eq(false),
                ))
                .execute(conn)
                .context("Finishing build")?;

            if terminal == BuildStatus::Succeeded {
                sql_query(DENORMALISE_OUTPUTS_QUERY)
                    .bind::<Integer, _>(self.id)
                    .execute(conn)
                    .context("Denormalising build outputs")?;
            }

            Ok(())
        })?;

        self.status = terminal.as_str().to_string();
        Ok(())
    }

    pub fn save_input(
        &self,
        database_connection: &mut PgConnection,
        resource_id: i32,
        digest: &VersionDigest,
        input_name: &str,
    ) -> Result<()> {
        diesel::insert_into(build_resource_config_version_inputs::table)
            .values((
                build_resource_config_version_inputs::build_id.eq(self.id),
                build_resource_config_version_inputs::resource_id.eq(resource_id),
                build_resource_config_version_inputs::version_md5.eq(digest.as_ref()),
                build_resource_config_version_inputs::name.eq(input_name),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Saving build input")
            .map(|_| ())
    }

    pub fn save_output(
        &self,
        database_connection: &mut PgConnection,
        resource_id: i32,
        digest: &VersionDigest,
        output_name: &str,
    ) -> Result<()> {
        trace!(
            build = self.id,
            resource = resource_id,
            %digest,
            output_name,
            "saving build output"
        );
        diesel::insert_into(build_resource_config_version_outputs::table)
            .values((
                build_resource_config_version_outputs::build_id.eq(self.id),
                build_resource_config_version_outputs::resource_id.eq(resource_id),
                build_resource_config_version_outputs::version_md5.eq(digest.as_ref()),
                build_resource_config_version_outputs::name.eq(output_name),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Saving build output")
            .map(|_| ())
    }

    /// Record that this build consumed outputs of an upstream build.
    pub fn save_pipe(
        &self,
        database_connection: &mut PgConnection,
        from_build_id: i32,
    ) -> Result<()> {
        diesel::insert_into(build_pipes::table)
            .values((
                build_pipes::from_build_id.eq(from_build_id),
                build_pipes::to_build_id.eq(self.id),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Saving build pipe")
            .map(|_| ())
    }

    /// The builds an engine instance should currently be supervising.
    pub fn all_running(database_connection: &mut PgConnection) -> Result<Vec<Build>> {
        builds::table
            .filter(
                builds::status
                    .eq(BuildStatus::Started.as_str())
                    .or(builds::status
                        .eq(BuildStatus::Pending.as_str())
                        .and(builds::scheduled.eq(true))
                        .and(builds::inputs_ready.eq(true))),
            )
            .order(builds::id.asc())
            .load::<Build>(database_connection)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_roundtrips() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Started,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
            BuildStatus::Errored,
            BuildStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("exploded".parse::<BuildStatus>().is_err());
    }
}
