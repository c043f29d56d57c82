//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use diesel::prelude::*;
use diesel::PgConnection;
use tracing::trace;

use crate::db::models::Pipeline;
use crate::db::models::ResourceConfigScope;
use crate::resource::VersionDigest;
use crate::schema::resource_disabled_versions;
use crate::schema::resources;

/// A logical input/output declared in a pipeline.
///
/// The scope binding (`resource_config_scope_id`) is what connects a
/// resource to the version stream of its current configuration.
#[derive(Debug, Eq, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(Pipeline))]
#[diesel(table_name = resources)]
pub struct Resource {
    pub id: i32,
    pub pipeline_id: i32,
    pub name: String,
    pub type_: String,
    pub resource_config_scope_id: Option<i32>,
    pub check_error: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = resources)]
struct NewResource<'a> {
    pub pipeline_id: i32,
    pub name: &'a str,
    pub type_: &'a str,
}

impl Resource {
    pub fn create(
        database_connection: &mut PgConnection,
        pipeline: &Pipeline,
        resource_name: &str,
        resource_type: &str,
    ) -> Result<Resource> {
        let new_resource = NewResource {
            pipeline_id: pipeline.id,
            name: resource_name,
            type_: resource_type,
        };

        diesel::insert_into(resources::table)
            .values(&new_resource)
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating resource in database")?;

        resources::table
            .filter(
                resources::pipeline_id
                    .eq(pipeline.id)
                    .and(resources::name.eq(resource_name)),
            )
            .first::<Resource>(database_connection)
            .map_err(Error::from)
    }

    pub fn find_by_name(
        database_connection: &mut PgConnection,
        pipeline_id: i32,
        resource_name: &str,
    ) -> Result<Option<Resource>> {
        resources::table
            .filter(
                resources::pipeline_id
                    .eq(pipeline_id)
                    .and(resources::name.eq(resource_name)),
            )
            .first::<Resource>(database_connection)
            .optional()
            .map_err(Error::from)
    }

    /// Bind this resource to a scope. Linking is a separate step from
    /// creating the resource config so that a failing check setup never
    /// leaves a half-bound resource behind.
    pub fn assign_scope(
        &mut self,
        database_connection: &mut PgConnection,
        scope: &ResourceConfigScope,
    ) -> Result<()> {
        diesel::update(resources::table.find(self.id))
            .set(resources::resource_config_scope_id.eq(scope.id))
            .execute(database_connection)
            .context("Assigning resource config scope")?;

        self.resource_config_scope_id = Some(scope.id);
        Ok(())
    }

    /// Store (or clear, with `None`) the latest check-setup error.
    /// Idempotent: setting the same value twice is fine.
    pub fn set_check_error(
        &self,
        database_connection: &mut PgConnection,
        error: Option<&str>,
    ) -> Result<()> {
        diesel::update(resources::table.find(self.id))
            .set(resources::check_error.eq(error))
            .execute(database_connection)
            .context("Setting resource check error")
            .map(|_| ())
    }

    /// Soft-hide a version from all normal reads. The row itself stays.
    pub fn disable_version(
        &self,
        database_connection: &mut PgConnection,
        digest: &VersionDigest,
    ) -> Result<()> {
        trace!(resource = self.id, %digest, "disabling version");
        diesel::insert_into(resource_disabled_versions::table)
            .values((
                resource_disabled_versions::resource_id.eq(self.id),
                resource_disabled_versions::version_md5.eq(digest.as_ref()),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Disabling version")
            .map(|_| ())
    }

    pub fn enable_version(
        &self,
        database_connection: &mut PgConnection,
        digest: &VersionDigest,
    ) -> Result<()> {
        trace!(resource = self.id, %digest, "enabling version");
        diesel::delete(
            resource_disabled_versions::table.filter(
                resource_disabled_versions::resource_id
                    .eq(self.id)
                    .and(resource_disabled_versions::version_md5.eq(digest.as_ref())),
            ),
        )
        .execute(database_connection)
        .context("Enabling version")
        .map(|_| ())
    }
}
