//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The resource config scope: the unit that owns spaces and versions.

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

use crate::db::models::ResourceVersion;
use crate::db::models::Space;
use crate::resource::Metadata;
use crate::resource::Version;
use crate::schema::resource_config_scopes;
use crate::schema::resource_versions;
use crate::schema::spaces;

#[derive(Debug, Eq, PartialEq, Identifiable, Queryable)]
#[diesel(table_name = resource_config_scopes)]
pub struct ResourceConfigScope {
    pub id: i32,
    pub resource_config_id: i32,
    pub resource_id: Option<i32>,
    pub default_space: Option<String>,
    pub last_check_finished: Option<NaiveDateTime>,
}

const SAVE_CONFIRMED_VERSION_QUERY: &str = r#"
    INSERT INTO resource_versions (space_id, version, version_md5, metadata, check_order, partial)
    SELECT $1, $2, $3, $4,
        (
            SELECT COALESCE(MAX(v.check_order), 0) + 1
            FROM resource_versions v
            JOIN spaces s ON s.id = v.space_id
            WHERE s.resource_config_scope_id = $5
        ),
        false
    ON CONFLICT (space_id, version_md5) DO UPDATE SET metadata = EXCLUDED.metadata
"#;

/// Promote the scope's partial versions to confirmed ones.
///
/// check_order continues from the scope's current maximum and follows row
/// insertion order, so versions become "newer" in exactly the order the
/// check discovered them.
const PROMOTE_PARTIALS_QUERY: &str = r#"
    UPDATE resource_versions v
    SET check_order = mo.mo + ord.rn, partial = false
    FROM (
        SELECT v2.id, ROW_NUMBER() OVER (ORDER BY v2.id ASC) AS rn
        FROM resource_versions v2
        JOIN spaces s2 ON s2.id = v2.space_id
        WHERE s2.resource_config_scope_id = $1 AND v2.partial = true
    ) ord, (
        SELECT COALESCE(MAX(v3.check_order), 0) AS mo
        FROM resource_versions v3
        JOIN spaces s3 ON s3.id = v3.space_id
        WHERE s3.resource_config_scope_id = $1
    ) mo
    WHERE v.id = ord.id
"#;

impl ResourceConfigScope {
    pub fn find(
        database_connection: &mut PgConnection,
        scope_id: i32,
    ) -> Result<Option<ResourceConfigScope>> {
        resource_config_scopes::table
            .find(scope_id)
            .first::<ResourceConfigScope>(database_connection)
            .optional()
            .map_err(Error::from)
    }

    /// Persist a space row for this scope. Idempotent.
    pub fn save_space(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
    ) -> Result<()> {
        diesel::insert_into(spaces::table)
            .values((
                spaces::resource_config_scope_id.eq(self.id),
                spaces::name.eq(space.as_ref()),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating space in database")
            .map(|_| ())
    }

    pub fn save_default_space(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
    ) -> Result<()> {
        diesel::update(resource_config_scopes::table.find(self.id))
            .set(resource_config_scopes::default_space.eq(space.as_ref()))
            .execute(database_connection)
            .context("Saving default space")
            .map(|_| ())
    }

    /// Record a discovered version as partial.
    ///
    /// Partial rows carry check_order 0 and are invisible to every normal
    /// read until [ResourceConfigScope::finish_saving_versions] promotes
    /// them. A crash between the two leaves only invisible rows behind.
    pub fn save_partial_version(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<()> {
        let space_row = self
            .find_space(database_connection, space)?
            .ok_or_else(|| anyhow!("Space {} not saved for scope {}", space, self.id))?;

        let version_json =
            serde_json::to_value(version).context("Serialising version for database")?;
        let metadata_json =
            serde_json::to_value(metadata).context("Serialising metadata for database")?;

        diesel::insert_into(resource_versions::table)
            .values((
                resource_versions::space_id.eq(space_row.id),
                resource_versions::version.eq(&version_json),
                resource_versions::version_md5.eq(version.digest().as_ref()),
                resource_versions::metadata.eq(&metadata_json),
                resource_versions::check_order.eq(0),
                resource_versions::partial.eq(true),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Saving partial version")
            .map(|_| ())
    }

    /// Record a version as confirmed right away, assigning it the scope's
    /// next check order.
    ///
    /// This is the write path for versions produced by put steps: they were
    /// observed for real, so they skip the partial stage a check goes
    /// through. A version that already exists keeps its check order and
    /// only has its metadata refreshed.
    pub fn save_version(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<()> {
        self.save_space(database_connection, space)?;

        let space_row = self
            .find_space(database_connection, space)?
            .ok_or_else(|| anyhow!("Space {} not saved for scope {}", space, self.id))?;

        let version_json =
            serde_json::to_value(version).context("Serialising version for database")?;
        let metadata_json =
            serde_json::to_value(metadata).context("Serialising metadata for database")?;

        sql_query(SAVE_CONFIRMED_VERSION_QUERY)
            .bind::<Integer, _>(space_row.id)
            .bind::<diesel::sql_types::Jsonb, _>(&version_json)
            .bind::<diesel::sql_types::Text, _>(version.digest().as_ref())
            .bind::<diesel::sql_types::Jsonb, _>(&metadata_json)
            .bind::<Integer, _>(self.id)
            .execute(database_connection)
            .context("Saving confirmed version")
            .map(|_| ())
    }

    /// Finish a check: promote all partial versions of this scope, assigning
    /// monotonically increasing check orders. Returns how many versions were
    /// promoted.
    pub fn finish_saving_versions(&self, database_connection: &mut PgConnection) -> Result<usize> {
        let promoted = sql_query(PROMOTE_PARTIALS_QUERY)
            .bind::<Integer, _>(self.id)
            .execute(database_connection)
            .context("Promoting partial versions")?;

        trace!(scope = self.id, promoted, "promoted partial versions");
        Ok(promoted)
    }

    /// Point a space at its latest version.
    pub fn save_space_latest_version(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
        version: &Version,
    ) -> Result<()> {
        let space_row = self
            .find_space(database_connection, space)?
            .ok_or_else(|| anyhow!("Space {} not saved for scope {}", space, self.id))?;

        let version_row_id = resource_versions::table
            .filter(
                resource_versions::space_id
                    .eq(space_row.id)
                    .and(resource_versions::version_md5.eq(version.digest().as_ref())),
            )
            .select(resource_versions::id)
            .first::<i32>(database_connection)
            .optional()
            .context("Finding version row for latest pointer")?
            .ok_or_else(|| anyhow!("Version {} not saved in space {}", version.digest(), space))?;

        diesel::update(spaces::table.find(space_row.id))
            .set(spaces::latest_resource_version_id.eq(version_row_id))
            .execute(database_connection)
            .context("Saving space latest version")
            .map(|_| ())
    }

    /// Stamp the scope's last successful check time.
    pub fn update_last_check_finished(
        &self,
        database_connection: &mut PgConnection,
    ) -> Result<bool> {
        let updated = diesel::update(resource_config_scopes::table.find(self.id))
            .set(resource_config_scopes::last_check_finished.eq(diesel::dsl::now))
            .execute(database_connection)
            .context("Updating last check finished")?;

        Ok(updated > 0)
    }

    /// The latest confirmed version in the requested space, or in the
    /// scope's default space when none is requested.
    pub fn version(
        &self,
        database_connection: &mut PgConnection,
        space: Option<&crate::resource::Space>,
    ) -> Result<Option<ResourceVersion>> {
        let space_name = match space.map(AsRef::as_ref).or(self.default_space.as_deref()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };

        resource_versions::table
            .inner_join(spaces::table)
            .filter(
                spaces::resource_config_scope_id
                    .eq(self.id)
                    .and(spaces::name.eq(space_name)),
            )
            // Confirmed versions only: a check order was assigned and the
            // row is no longer partial.
            .filter(
                resource_versions::check_order
                    .ne(0)
                    .and(resource_versions::partial.eq(false)),
            )
            .order(resource_versions::check_order.desc())
            .select(resource_versions::all_columns)
            .first::<ResourceVersion>(database_connection)
            .optional()
            .map_err(Error::from)
    }

    /// Like [ResourceConfigScope::version], but including partial and
    /// unchecked rows.
    ///
    /// Migration/debug escape hatch only. Never expose this to the
    /// scheduler surface.
    pub fn unchecked_version(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
    ) -> Result<Option<ResourceVersion>> {
        resource_versions::table
            .inner_join(spaces::table)
            .filter(
                spaces::resource_config_scope_id
                    .eq(self.id)
                    .and(spaces::name.eq(space.as_ref())),
            )
            .order(resource_versions::id.desc())
            .select(resource_versions::all_columns)
            .first::<ResourceVersion>(database_connection)
            .optional()
            .map_err(Error::from)
    }

    pub fn find_space(
        &self,
        database_connection: &mut PgConnection,
        space: &crate::resource::Space,
    ) -> Result<Option<Space>> {
        spaces::table
            .filter(
                spaces::resource_config_scope_id
                    .eq(self.id)
                    .and(spaces::name.eq(space.as_ref())),
            )
            .first::<Space>(database_connection)
            .optional()
            .map_err(Error::from)
    }
}
