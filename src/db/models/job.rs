use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use diesel::prelude::*;
use diesel::PgConnection;

use crate::db::models::Pipeline;
use crate::schema::jobs;
use crate::schema::jobs::*;

#[derive(Debug, Eq, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(Pipeline))]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: i32,
    pub pipeline_id: i32,
    pub name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
struct NewJob<'a> {
    pub pipeline_id: i32,
    pub name: &'a str,
}

impl Job {
    pub fn create(
        database_connection: &mut PgConnection,
        pipeline: &Pipeline,
        job_name: &str,
    ) -> Result<Job> {
        let new_job = NewJob {
            pipeline_id: pipeline.id,
            name: job_name,
        };

        diesel::insert_into(jobs::table)
            .values(&new_job)
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating job in database")?;

        dsl::jobs
            .filter(pipeline_id.eq(pipeline.id).and(name.eq(job_name)))
            .first::<Job>(database_connection)
            .map_err(Error::from)
    }
}
