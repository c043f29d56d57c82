//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Keyset-paginated iteration over the successful builds of a job.
//!
//! Ordering is `COALESCE(rerun_of, id) DESC, id DESC`: a rerun sorts into
//! the neighbourhood of the build it re-ran instead of at the head of the
//! job's history. Pagination carries the last row of the previous page as
//! the boundary, which stays stable under concurrent inserts where offset
//! pagination would not.
//!
//! When a page comes back empty the walker migrates a bounded batch of
//! legacy builds into `successful_build_outputs` and retries; only when
//! there is nothing left to migrate is the walk over.

use anyhow::Context;
use anyhow::Result;
use diesel::sql_query;
use diesel::sql_types::Jsonb;
use diesel::RunQueryDsl;
use tracing::debug;
use tracing::trace;

use crate::db::DbPool;

#[derive(diesel::QueryableByName, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedBuild {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub id: i32,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Integer>)]
    pub rerun_of: Option<i32>,
}

/// Which table a page is read from.
#[derive(Debug, Clone)]
pub(crate) enum PageSource {
    /// All successful builds of the job.
    Builds { job_id: i32, up_to: Option<i32> },
    /// Successful builds whose denormalised output set contains the given
    /// candidates, probed with a jsonb containment filter.
    Outputs {
        job_id: i32,
        candidates: serde_json::Value,
        up_to: Option<i32>,
    },
}

impl PageSource {
    fn column(&self) -> &'static str {
        match self {
            PageSource::Builds { .. } => "id",
            PageSource::Outputs { .. } => "build_id",
        }
    }

    /// The page query with the boundary predicate folded in.
    ///
    /// Integer values are inlined (they come from typed columns, not user
    /// strings); the candidates document stays a bind parameter.
    fn page_sql(&self, boundary: Option<&PagedBuild>, limit: i64) -> String {
        let column = self.column();
        let boundary = boundary
            .map(|b| format!(" AND {}", boundary_predicate(column, b)))
            .unwrap_or_default();

        match self {
            PageSource::Builds { job_id, up_to } => {
                let up_to = up_to
                    .map(|b| format!(" AND id <= {b}"))
                    .unwrap_or_default();
                format!(
                    "SELECT id, rerun_of FROM builds \
                     WHERE job_id = {job_id} AND status = 'succeeded'{up_to}{boundary} \
                     ORDER BY COALESCE(rerun_of, id) DESC, id DESC \
                     LIMIT {limit}"
                )
            }
            PageSource::Outputs { job_id, up_to, .. } => {
                let up_to = up_to
                    .map(|b| format!(" AND build_id <= {b}"))
                    .unwrap_or_default();
                format!(
                    "SELECT build_id AS id, rerun_of FROM successful_build_outputs \
                     WHERE job_id = {job_id} AND outputs @> $1::jsonb{up_to}{boundary} \
                     ORDER BY COALESCE(rerun_of, build_id) DESC, build_id DESC \
                     LIMIT {limit}"
                )
            }
        }
    }
}

/// The strict keyset predicate for everything older than `boundary`.
fn boundary_predicate(column: &str, boundary: &PagedBuild) -> String {
    match boundary.rerun_of {
        Some(rerun_of) => format!(
            "(COALESCE(rerun_of, {column}) < {rerun_of} \
             OR (rerun_of = {rerun_of} AND {column} < {id}))",
            id = boundary.id,
        ),
        None => format!("COALESCE(rerun_of, {column}) < {id}", id = boundary.id),
    }
}

const MIGRATE_LIMIT_QUERY: &str = r#"
    WITH builds_to_migrate AS (
        SELECT id, job_id, rerun_of FROM builds
        WHERE job_id = {job_id} AND needs_v6_migration = true AND status = 'succeeded'
        ORDER BY COALESCE(rerun_of, id) DESC, id DESC
        LIMIT {limit}
    ), migrated_outputs AS (
        INSERT INTO successful_build_outputs (build_id, job_id, outputs, rerun_of)
        SELECT bm.id, bm.job_id, json_object_agg(sp.resource_id, sp.v)::jsonb, bm.rerun_of
        FROM builds_to_migrate bm
        JOIN (
            SELECT build_id, resource_id, json_agg(version_md5) AS v
            FROM (
                (
                    SELECT o.build_id, o.resource_id, o.version_md5
                    FROM build_resource_config_version_outputs o
                    JOIN builds_to_migrate bmo ON bmo.id = o.build_id
                )
                UNION ALL
                (
                    SELECT i.build_id, i.resource_id, i.version_md5
                    FROM build_resource_config_version_inputs i
                    JOIN builds_to_migrate bmi ON bmi.id = i.build_id
                )
            ) AS agg GROUP BY build_id, resource_id
        ) sp ON sp.build_id = bm.id
        GROUP BY bm.id, bm.job_id, bm.rerun_of
        ON CONFLICT (build_id) DO NOTHING
    )
    UPDATE builds SET needs_v6_migration = false
    WHERE id IN (SELECT id FROM builds_to_migrate)
"#;

pub struct PaginatedBuilds {
    source: PageSource,
    job_id: i32,

    builds: Vec<PagedBuild>,
    offset: usize,
    unused_builds: bool,

    limit_rows: i64,
    pool: DbPool,
}

impl PaginatedBuilds {
    pub(crate) fn new(pool: DbPool, source: PageSource, job_id: i32, limit_rows: i64) -> Self {
        PaginatedBuilds {
            source,
            job_id,
            builds: Vec::new(),
            offset: 0,
            unused_builds: false,
            limit_rows,
            pool,
        }
    }

    /// Start the walk with an already-fetched ascending prefix of builds
    /// that succeeded after the reference build.
    pub(crate) fn with_prefix(
        pool: DbPool,
        source: PageSource,
        job_id: i32,
        limit_rows: i64,
        prefix: Vec<PagedBuild>,
    ) -> Self {
        PaginatedBuilds {
            source,
            job_id,
            builds: prefix,
            offset: 0,
            unused_builds: true,
            limit_rows,
            pool,
        }
    }

    /// Whether the walker is still emitting the freshly-succeeded builds
    /// prefix, which the consumer must treat as candidates to re-evaluate.
    pub fn unused_builds(&self) -> bool {
        self.unused_builds
    }

    /// The next build id, newest-first, or `None` once the job's history is
    /// exhausted.
    pub fn next(&mut self) -> Result<Option<i32>> {
        if self.offset >= self.builds.len() {
            loop {
                let page = self.fetch_page()?;

                if page.is_empty() {
                    if !self.migrate_limit()? {
                        return Ok(None);
                    }
                    // Migration filled the table some more; retry the page.
                } else {
                    self.builds = page;
                    self.offset = 0;
                    self.unused_builds = false;
                    break;
                }
            }
        }

        let build = self.builds[self.offset];
        self.offset += 1;

        Ok(Some(build.id))
    }

    /// Whether another build is pending without fetching.
    ///
    /// The arithmetic is only meaningful while the ascending unused-builds
    /// prefix is being drained; once the walker switched to descending
    /// pages, callers must rely on [PaginatedBuilds::next] returning `None`.
    pub fn has_next(&self) -> bool {
        self.unused_builds && self.builds.len() + 1 > self.offset
    }

    fn fetch_page(&mut self) -> Result<Vec<PagedBuild>> {
        let sql = self.source.page_sql(self.builds.last(), self.limit_rows);
        trace!(job = self.job_id, %sql, "fetching build page");

        let mut conn = self.pool.get().context("Getting connection for page")?;

        let page = match &self.source {
            PageSource::Builds { .. } => sql_query(sql)
                .load::<PagedBuild>(&mut conn)
                .context("Loading build page")?,
            PageSource::Outputs { candidates, .. } => sql_query(sql)
                .bind::<Jsonb, _>(candidates.clone())
                .load::<PagedBuild>(&mut conn)
                .context("Loading constrained build page")?,
        };

        Ok(page)
    }

    /// Migrate up to `limit_rows` legacy builds of this job into the
    /// denormalised outputs table. Returns whether anything was migrated.
    fn migrate_limit(&self) -> Result<bool> {
        let sql = MIGRATE_LIMIT_QUERY
            .replace("{job_id}", &self.job_id.to_string())
            .replace("{limit}", &self.limit_rows.to_string());

        let mut conn = self.pool.get().context("Getting connection for migration")?;
        let migrated = sql_query(sql)
            .execute(&mut conn)
            .context("Migrating legacy builds")?;

        debug!(job = self.job_id, migrated, "legacy build migration pass");
        Ok(migrated > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use diesel::r2d2::ConnectionManager;
    use diesel::r2d2::Pool;

    /// A pool that never connects; good enough for everything that stays on
    /// the already-fetched prefix.
    pub(crate) fn lazy_pool() -> DbPool {
        let manager = ConnectionManager::new("postgres://unused");
        Pool::builder().build_unchecked(manager)
    }

    fn build(id: i32, rerun_of: Option<i32>) -> PagedBuild {
        PagedBuild { id, rerun_of }
    }

    #[test]
    fn plain_boundary_compares_the_coalesced_key() {
        assert_eq!(
            boundary_predicate("id", &build(11, None)),
            "COALESCE(rerun_of, id) < 11"
        );
    }

    #[test]
    fn rerun_boundary_breaks_ties_within_the_origin_group() {
        assert_eq!(
            boundary_predicate("build_id", &build(12, Some(10))),
            "(COALESCE(rerun_of, build_id) < 10 OR (rerun_of = 10 AND build_id < 12))"
        );
    }

    #[test]
    fn first_page_has_no_boundary() {
        let source = PageSource::Builds {
            job_id: 3,
            up_to: None,
        };
        let sql = source.page_sql(None, 100);
        assert_eq!(
            sql,
            "SELECT id, rerun_of FROM builds \
             WHERE job_id = 3 AND status = 'succeeded' \
             ORDER BY COALESCE(rerun_of, id) DESC, id DESC \
             LIMIT 100"
        );
    }

    #[test]
    fn constrained_page_probes_containment_and_caps_at_the_reference_build() {
        let source = PageSource::Outputs {
            job_id: 3,
            candidates: serde_json::json!({"7": ["abc"]}),
            up_to: Some(20),
        };
        let sql = source.page_sql(Some(&build(15, None)), 50);
        assert_eq!(
            sql,
            "SELECT build_id AS id, rerun_of FROM successful_build_outputs \
             WHERE job_id = 3 AND outputs @> $1::jsonb AND build_id <= 20 \
             AND COALESCE(rerun_of, build_id) < 15 \
             ORDER BY COALESCE(rerun_of, build_id) DESC, build_id DESC \
             LIMIT 50"
        );
    }

    #[test]
    fn prefix_is_consumed_in_order_and_has_next_reports_while_draining() {
        let mut walker = PaginatedBuilds::with_prefix(
            lazy_pool(),
            PageSource::Builds {
                job_id: 1,
                up_to: None,
            },
            1,
            100,
            vec![build(4, None), build(6, Some(4)), build(7, None)],
        );

        assert!(walker.unused_builds());
        assert!(walker.has_next());
        assert_eq!(walker.next().unwrap(), Some(4));
        assert_eq!(walker.next().unwrap(), Some(6));
        assert!(walker.has_next());
        assert_eq!(walker.next().unwrap(), Some(7));
    }
}
