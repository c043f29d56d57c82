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
use serde::Serialize;
use tracing::trace;

use crate::db::models::Resource;
use crate::db::models::ResourceConfigScope;
use crate::resource::Source;
use crate::resource::Version;
use crate::schema::resource_config_scopes;
use crate::schema::resource_configs;

/// A content-addressed resource configuration.
///
/// Two resources in two pipelines with the same type, the same source and
/// the same parent type version share one config and therefore (when
/// neither pins a unique scope) one version history.
#[derive(Debug, Eq, PartialEq, Identifiable, Queryable)]
#[diesel(table_name = resource_configs)]
pub struct ResourceConfig {
    pub id: i32,
    pub source_hash: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = resource_configs)]
struct NewResourceConfig<'a> {
    pub source_hash: &'a str,
}

#[derive(Serialize)]
struct HashInput<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
    source: &'a Source,
    parent_versions: &'a [Version],
}

/// The content hash of `(type, source, parent type versions)`.
///
/// serde_json maps serialise with sorted keys, so the hash does not depend
/// on declaration order in the pipeline.
pub fn source_hash(type_: &str, source: &Source, parent_versions: &[Version]) -> String {
    let input = HashInput {
        type_,
        source,
        parent_versions,
    };
    let canonical = serde_json::to_string(&input).expect("hash input serialisation cannot fail");
    format!("{:x}", md5::compute(canonical))
}

impl ResourceConfig {
    /// Compute the content hash and upsert the config row.
    ///
    /// This does not touch any resource: binding a resource to the config's
    /// scope is a separate step.
    pub fn find_or_create(
        database_connection: &mut PgConnection,
        resource_type: &str,
        source: &Source,
        parent_versions: &[Version],
    ) -> Result<ResourceConfig> {
        let hash = source_hash(resource_type, source, parent_versions);
        trace!(%hash, %resource_type, "upserting resource config");

        diesel::insert_into(resource_configs::table)
            .values(&NewResourceConfig { source_hash: &hash })
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating resource config in database")?;

        resource_configs::table
            .filter(resource_configs::source_hash.eq(&hash))
            .first::<ResourceConfig>(database_connection)
            .map_err(Error::from)
    }

    /// Find or create the scope that owns this config's versions.
    ///
    /// With a resource the scope is unique to that resource; without one it
    /// is the config's shared scope.
    pub fn find_or_create_scope(
        &self,
        database_connection: &mut PgConnection,
        unique_resource: Option<&Resource>,
    ) -> Result<ResourceConfigScope> {
        let resource_id = unique_resource.map(|r| r.id);

        diesel::insert_into(resource_config_scopes::table)
            .values((
                resource_config_scopes::resource_config_id.eq(self.id),
                resource_config_scopes::resource_id.eq(resource_id),
            ))
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating resource config scope in database")?;

        let mut query = resource_config_scopes::table
            .filter(resource_config_scopes::resource_config_id.eq(self.id))
            .into_boxed();

        query = match resource_id {
            Some(rid) => query.filter(resource_config_scopes::resource_id.eq(rid)),
            None => query.filter(resource_config_scopes::resource_id.is_null()),
        };

        query
            .first::<ResourceConfigScope>(database_connection)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_hash_is_stable_across_key_order() {
        let mut a = Source::new();
        a.insert("uri".into(), "https://example.com".into());
        a.insert("branch".into(), "main".into());

        let mut b = Source::new();
        b.insert("branch".into(), "main".into());
        b.insert("uri".into(), "https://example.com".into());

        assert_eq!(source_hash("git", &a, &[]), source_hash("git", &b, &[]));
    }

    #[test]
    fn source_hash_depends_on_type_and_parent_versions() {
        let source = Source::new();
        let with_parent = [Version::from([("digest", "abc")])];

        assert_ne!(
            source_hash("git", &source, &[]),
            source_hash("registry-image", &source, &[])
        );
        assert_ne!(
            source_hash("git", &source, &[]),
            source_hash("git", &source, &with_parent)
        );
    }
}
