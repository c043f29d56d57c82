//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The read-mostly query layer the scheduler's input resolver runs against.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Integer;
use diesel::PgConnection;
use tracing::trace;

use crate::db::walker::PagedBuild;
use crate::db::walker::PageSource;
use crate::db::DbPool;
use crate::db::PaginatedBuilds;
use crate::db::TtlCache;
use crate::resource::Version;
use crate::resource::VersionDigest;
use crate::schema::build_pipes;
use crate::schema::build_resource_config_version_inputs;
use crate::schema::build_resource_config_version_outputs;
use crate::schema::builds;
use crate::schema::resource_disabled_versions;
use crate::schema::resource_versions;
use crate::schema::resources;
use crate::schema::spaces;
use crate::schema::successful_build_outputs;

/// A version a build used or produced, keyed by resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmVersion {
    pub resource_id: i32,
    pub version: VersionDigest,
}

/// A named input/output edge of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmOutput {
    pub input_name: String,
    pub resource_id: i32,
    pub version: VersionDigest,
}

/// Version digests acceptable per resource, used as a containment
/// constraint on build output sets.
pub type ConstrainingCandidates = BTreeMap<i32, Vec<VersionDigest>>;

#[derive(diesel::QueryableByName)]
struct CheckOrderRow {
    #[diesel(sql_type = Integer)]
    check_order: i32,
}

#[derive(diesel::QueryableByName)]
struct DigestRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    version_md5: String,
}

#[derive(diesel::QueryableByName)]
struct OutputsRow {
    #[diesel(sql_type = diesel::sql_types::Jsonb)]
    outputs: serde_json::Value,
}

const USED_CHECK_ORDER_QUERY: &str = r#"
    SELECT rcv.check_order FROM build_resource_config_version_inputs i
    JOIN resource_versions rcv ON rcv.version_md5 = i.version_md5
    JOIN spaces s ON s.id = rcv.space_id
    WHERE s.resource_config_scope_id =
        (SELECT resource_config_scope_id FROM resources WHERE id = $1)
    AND i.build_id = $2
    LIMIT 1
"#;

const VERSIONS_AFTER_QUERY: &str = r#"
    SELECT rcv.version_md5 FROM resource_versions rcv
    JOIN spaces s ON s.id = rcv.space_id
    WHERE s.resource_config_scope_id =
        (SELECT resource_config_scope_id FROM resources WHERE id = $1)
    AND NOT EXISTS (
        SELECT 1 FROM resource_disabled_versions d
        WHERE d.resource_id = $1 AND d.version_md5 = rcv.version_md5
    )
    AND rcv.check_order > $2
    AND rcv.check_order != 0 AND rcv.partial = false
    ORDER BY rcv.check_order ASC
    LIMIT 2
"#;

const VERSION_AT_OR_BEFORE_QUERY: &str = r#"
    SELECT rcv.version_md5 FROM resource_versions rcv
    JOIN spaces s ON s.id = rcv.space_id
    WHERE s.resource_config_scope_id =
        (SELECT resource_config_scope_id FROM resources WHERE id = $1)
    AND NOT EXISTS (
        SELECT 1 FROM resource_disabled_versions d
        WHERE d.resource_id = $1 AND d.version_md5 = rcv.version_md5
    )
    AND rcv.check_order <= $2
    AND rcv.check_order != 0 AND rcv.partial = false
    ORDER BY rcv.check_order DESC
    LIMIT 1
"#;

/// Single-build variant of the lazy outputs migration, run on a cache miss
/// for a legacy build.
const MIGRATE_SINGLE_QUERY: &str = r#"
    WITH builds_to_migrate AS (
        UPDATE builds SET needs_v6_migration = false WHERE id = $1
    )
    INSERT INTO successful_build_outputs (build_id, job_id, outputs, rerun_of)
    SELECT b.id, b.job_id, json_object_agg(sp.resource_id, sp.v)::jsonb, b.rerun_of
    FROM builds b
    JOIN (
        SELECT build_id, resource_id, json_agg(version_md5) AS v
        FROM (
            (
                SELECT o.build_id, o.resource_id, o.version_md5
                FROM build_resource_config_version_outputs o
                WHERE o.build_id = $1
            )
            UNION ALL
            (
                SELECT i.build_id, i.resource_id, i.version_md5
                FROM build_resource_config_version_inputs i
                WHERE i.build_id = $1
            )
        ) AS agg GROUP BY build_id, resource_id
    ) sp ON sp.build_id = b.id
    WHERE b.id = $1
    GROUP BY b.id, b.job_id, b.rerun_of
    ON CONFLICT (build_id) DO UPDATE SET outputs = EXCLUDED.outputs
    RETURNING outputs
"#;

/// The query surface the scheduler resolves next inputs against.
///
/// Reads of immutable data (build output sets, version digests) go through
/// an in-process cache; everything else hits the database directly, using
/// short transactions where a consistent multi-read is required.
#[derive(Clone)]
pub struct VersionsDb {
    pool: DbPool,
    limit_rows: i64,

    outputs_cache: Arc<TtlCache<Arc<Vec<AlgorithmVersion>>>>,
    digest_cache: Arc<TtlCache<VersionDigest>>,
}

impl VersionsDb {
    pub fn new(pool: DbPool, limit_rows: i64, cache_ttl: Duration) -> Self {
        VersionsDb {
            pool,
            limit_rows,
            outputs_cache: Arc::new(TtlCache::new(cache_ttl)),
            digest_cache: Arc::new(TtlCache::new(cache_ttl)),
        }
    }

    pub fn version_is_disabled(&self, resource_id: i32, digest: &VersionDigest) -> Result<bool> {
        let mut conn = self.conn()?;
        diesel::select(diesel::dsl::exists(
            resource_disabled_versions::table.filter(
                resource_disabled_versions::resource_id
                    .eq(resource_id)
                    .and(resource_disabled_versions::version_md5.eq(digest.as_ref())),
            ),
        ))
        .get_result::<bool>(&mut conn)
        .map_err(Error::from)
    }

    /// The highest-check-order enabled version of the resource's scope.
    pub fn latest_version_of_resource(&self, resource_id: i32) -> Result<Option<VersionDigest>> {
        let mut conn = self.conn()?;
        conn.transaction::<_, Error, _>(|conn| latest_version_of_resource(conn, resource_id))
    }

    /// Find a version by content within the resource's scope.
    pub fn find_version_of_resource(
        &self,
        resource_id: i32,
        version: &Version,
    ) -> Result<Option<VersionDigest>> {
        let cache_key = format!("v{}-{}", resource_id, version.canonical_json());
        if let Some(digest) = self.digest_cache.get(&cache_key) {
            return Ok(Some(digest));
        }

        let mut conn = self.conn()?;

        let scope_id: Option<i32> = resources::table
            .find(resource_id)
            .select(resources::resource_config_scope_id)
            .first::<Option<i32>>(&mut conn)
            .optional()?
            .flatten();

        let Some(scope_id) = scope_id else {
            return Ok(None);
        };

        let found = resource_versions::table
            .inner_join(spaces::table)
            .filter(spaces::resource_config_scope_id.eq(scope_id))
            .filter(resource_versions::version_md5.eq(version.digest().as_ref()))
            .filter(
                resource_versions::check_order
                    .ne(0)
                    .and(resource_versions::partial.eq(false)),
            )
            .select(resource_versions::version_md5)
            .first::<String>(&mut conn)
            .optional()?;

        let Some(digest) = found.map(VersionDigest::from) else {
            return Ok(None);
        };

        self.digest_cache.set(cache_key, digest.clone());
        Ok(Some(digest))
    }

    /// The most recent build of the job that is ready and scheduled.
    pub fn latest_build_id(&self, job_id: i32) -> Result<Option<i32>> {
        let mut conn = self.conn()?;

        let ids = builds::table
            .filter(
                builds::job_id
                    .eq(job_id)
                    .and(builds::inputs_ready.eq(true))
                    .and(builds::scheduled.eq(true)),
            )
            .order(diesel::dsl::sql::<diesel::sql_types::Bool>(
                "COALESCE(rerun_of, id) DESC, id DESC",
            ))
            .limit(100)
            .select(builds::id)
            .load::<i32>(&mut conn)?;

        Ok(ids.into_iter().next())
    }

    /// The version the "every" trigger should feed the job's next build.
    ///
    /// Returns the version and whether more versions wait beyond it. When
    /// the head is reached (or passed), the current head comes back again
    /// with `has_next = false`, so the trigger produces exactly one build
    /// per version without ever skipping.
    pub fn next_every_version(
        &self,
        build_id: i32,
        resource_id: i32,
    ) -> Result<Option<(VersionDigest, bool)>> {
        let mut conn = self.conn()?;

        conn.transaction::<_, Error, _>(|conn| {
            let used: Option<CheckOrderRow> = sql_query(USED_CHECK_ORDER_QUERY)
                .bind::<Integer, _>(resource_id)
                .bind::<Integer, _>(build_id)
                .get_result(conn)
                .optional()
                .context("Finding check order used by build")?;

            let Some(used) = used else {
                // The build never took this resource as an input; fall back
                // to the plain latest version.
                return Ok(latest_version_of_resource(conn, resource_id)?
                    .map(|digest| (digest, false)));
            };

            let after: Vec<DigestRow> = sql_query(VERSIONS_AFTER_QUERY)
                .bind::<Integer, _>(resource_id)
                .bind::<Integer, _>(used.check_order)
                .load(conn)
                .context("Finding versions after the used one")?;

            if let Some(next) = after.first() {
                let has_next = after.len() > 1;
                return Ok(Some((VersionDigest::from(next.version_md5.clone()), has_next)));
            }

            let current: Option<DigestRow> = sql_query(VERSION_AT_OR_BEFORE_QUERY)
                .bind::<Integer, _>(resource_id)
                .bind::<Integer, _>(used.check_order)
                .get_result(conn)
                .optional()
                .context("Finding current version")?;

            Ok(current.map(|row| (VersionDigest::from(row.version_md5), false)))
        })
    }

    /// Which upstream build fed each job's inputs of the given build.
    pub fn latest_build_pipes(&self, build_id: i32) -> Result<BTreeMap<i32, i32>> {
        let mut conn = self.conn()?;

        let rows = build_pipes::table
            .inner_join(builds::table.on(builds::id.eq(build_pipes::from_build_id)))
            .filter(build_pipes::to_build_id.eq(build_id))
            .select((builds::job_id, build_pipes::from_build_id))
            .load::<(i32, i32)>(&mut conn)?;

        Ok(rows.into_iter().collect())
    }

    /// The union of a build's input and output edges, deduplicated by name.
    /// An output shadows an input of the same name.
    pub fn build_outputs(&self, build_id: i32) -> Result<Vec<AlgorithmOutput>> {
        let mut conn = self.conn()?;

        let mut unique: BTreeMap<String, AlgorithmOutput> = BTreeMap::new();

        let inputs = build_resource_config_version_inputs::table
            .filter(build_resource_config_version_inputs::build_id.eq(build_id))
            .select((
                build_resource_config_version_inputs::name,
                build_resource_config_version_inputs::resource_id,
                build_resource_config_version_inputs::version_md5,
            ))
            .load::<(String, i32, String)>(&mut conn)?;

        let outputs = build_resource_config_version_outputs::table
            .filter(build_resource_config_version_outputs::build_id.eq(build_id))
            .select((
                build_resource_config_version_outputs::name,
                build_resource_config_version_outputs::resource_id,
                build_resource_config_version_outputs::version_md5,
            ))
            .load::<(String, i32, String)>(&mut conn)?;

        for (name, resource_id, version_md5) in inputs.into_iter().chain(outputs) {
            unique.insert(
                name.clone(),
                AlgorithmOutput {
                    input_name: name,
                    resource_id,
                    version: VersionDigest::from(version_md5),
                },
            );
        }

        let mut result: Vec<AlgorithmOutput> = unique.into_values().collect();
        result.sort_by(|a, b| b.input_name.cmp(&a.input_name));

        Ok(result)
    }

    /// A build's denormalised output set, migrating the single build on a
    /// cache miss against a legacy row.
    pub fn successful_build_outputs(&self, build_id: i32) -> Result<Arc<Vec<AlgorithmVersion>>> {
        let cache_key = format!("o{build_id}");
        if let Some(outputs) = self.outputs_cache.get(&cache_key) {
            return Ok(outputs);
        }

        let mut conn = self.conn()?;

        let outputs_json: Option<serde_json::Value> = successful_build_outputs::table
            .find(build_id)
            .select(successful_build_outputs::outputs)
            .first(&mut conn)
            .optional()?;

        let outputs_json = match outputs_json {
            Some(json) => json,
            None => {
                trace!(build = build_id, "no denormalised outputs, migrating single build");
                let row: OutputsRow = sql_query(MIGRATE_SINGLE_QUERY)
                    .bind::<Integer, _>(build_id)
                    .get_result(&mut conn)
                    .optional()
                    .context("Migrating single build")?
                    .ok_or_else(|| anyhow!("Build {build_id} has no outputs to migrate"))?;
                row.outputs
            }
        };

        let by_resource: BTreeMap<String, Vec<String>> =
            serde_json::from_value(outputs_json).context("Deserialising build outputs")?;

        let mut by_resource_id: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for (resource_id, versions) in by_resource {
            let resource_id = resource_id
                .parse::<i32>()
                .context("Non-numeric resource id in outputs")?;
            by_resource_id.insert(resource_id, versions);
        }

        let outputs: Vec<AlgorithmVersion> = by_resource_id
            .into_iter()
            .flat_map(|(resource_id, versions)| {
                versions.into_iter().map(move |version| AlgorithmVersion {
                    resource_id,
                    version: VersionDigest::from(version),
                })
            })
            .collect();

        let outputs = Arc::new(outputs);
        self.outputs_cache.set(cache_key, outputs.clone());

        Ok(outputs)
    }

    pub fn successful_builds(&self, job_id: i32) -> PaginatedBuilds {
        PaginatedBuilds::new(
            self.pool.clone(),
            PageSource::Builds {
                job_id,
                up_to: None,
            },
            job_id,
            self.limit_rows,
        )
    }

    pub fn successful_builds_version_constrained(
        &self,
        job_id: i32,
        candidates: &ConstrainingCandidates,
    ) -> Result<PaginatedBuilds> {
        Ok(PaginatedBuilds::new(
            self.pool.clone(),
            PageSource::Outputs {
                job_id,
                candidates: candidates_json(candidates)?,
                up_to: None,
            },
            job_id,
            self.limit_rows,
        ))
    }

    /// Walk the job's history starting from the successful builds newer
    /// than `build_id` (oldest-first), then fall back to descending
    /// pagination through everything at or below it.
    pub fn unused_builds(&self, build_id: i32, job_id: i32) -> Result<PaginatedBuilds> {
        let prefix = self.builds_after(job_id, build_id)?;

        Ok(PaginatedBuilds::with_prefix(
            self.pool.clone(),
            PageSource::Builds {
                job_id,
                up_to: Some(build_id),
            },
            job_id,
            self.limit_rows,
            prefix,
        ))
    }

    pub fn unused_builds_version_constrained(
        &self,
        build_id: i32,
        job_id: i32,
        candidates: &ConstrainingCandidates,
    ) -> Result<PaginatedBuilds> {
        let prefix = self.builds_after(job_id, build_id)?;

        Ok(PaginatedBuilds::with_prefix(
            self.pool.clone(),
            PageSource::Outputs {
                job_id,
                candidates: candidates_json(candidates)?,
                up_to: Some(build_id),
            },
            job_id,
            self.limit_rows,
            prefix,
        ))
    }

    /// All successful builds of the job newer than the reference build, in
    /// ascending order so consumers see them oldest-new-first.
    fn builds_after(&self, job_id: i32, build_id: i32) -> Result<Vec<PagedBuild>> {
        let mut conn = self.conn()?;

        let rows = builds::table
            .filter(
                builds::job_id
                    .eq(job_id)
                    .and(builds::status.eq("succeeded"))
                    .and(
                        (builds::rerun_of
                            .gt(build_id)
                            .and(builds::rerun_of.is_not_null()))
                        .or(builds::id.gt(build_id).and(builds::rerun_of.is_null())),
                    ),
            )
            .order(diesel::dsl::sql::<diesel::sql_types::Bool>(
                "COALESCE(rerun_of, id) ASC, id ASC",
            ))
            .select((builds::id, builds::rerun_of))
            .load::<(i32, Option<i32>)>(&mut conn)?;

        Ok(rows
            .into_iter()
            .map(|(id, rerun_of)| PagedBuild { id, rerun_of })
            .collect())
    }

    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>> {
        self.pool.get().context("Getting database connection")
    }
}

fn latest_version_of_resource(
    conn: &mut PgConnection,
    resource_id: i32,
) -> Result<Option<VersionDigest>> {
    let scope_id: Option<i32> = resources::table
        .find(resource_id)
        .select(resources::resource_config_scope_id)
        .first::<Option<i32>>(conn)
        .optional()?
        .flatten();

    let Some(scope_id) = scope_id else {
        return Ok(None);
    };

    let digest = resource_versions::table
        .inner_join(spaces::table)
        .filter(spaces::resource_config_scope_id.eq(scope_id))
        .filter(
            resource_versions::check_order
                .ne(0)
                .and(resource_versions::partial.eq(false)),
        )
        .filter(
            resource_versions::version_md5.ne_all(
                resource_disabled_versions::table
                    .filter(resource_disabled_versions::resource_id.eq(resource_id))
                    .select(resource_disabled_versions::version_md5),
            ),
        )
        .order(resource_versions::check_order.desc())
        .select(resource_versions::version_md5)
        .first::<String>(conn)
        .optional()?;

    Ok(digest.map(VersionDigest::from))
}

fn candidates_json(candidates: &ConstrainingCandidates) -> Result<serde_json::Value> {
    let by_string_id: BTreeMap<String, Vec<&str>> = candidates
        .iter()
        .map(|(resource_id, versions)| {
            (
                resource_id.to_string(),
                versions.iter().map(AsRef::as_ref).collect(),
            )
        })
        .collect();

    serde_json::to_value(by_string_id).context("Serialising constraining candidates")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_serialise_with_string_resource_ids() {
        let mut candidates = ConstrainingCandidates::new();
        candidates.insert(
            7,
            vec![VersionDigest::from("abc".to_string()), VersionDigest::from("def".to_string())],
        );

        let json = candidates_json(&candidates).unwrap();
        assert_eq!(json, serde_json::json!({"7": ["abc", "def"]}));
    }
}
