use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use diesel::prelude::*;
use diesel::PgConnection;

use crate::schema::pipelines;
use crate::schema::pipelines::*;

#[derive(Debug, Eq, PartialEq, Identifiable, Queryable)]
#[diesel(table_name = pipelines)]
pub struct Pipeline {
    pub id: i32,
    pub name: String,
    pub team_name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = pipelines)]
struct NewPipeline<'a> {
    pub name: &'a str,
    pub team_name: &'a str,
}

impl Pipeline {
    pub fn create(
        database_connection: &mut PgConnection,
        pipeline_name: &str,
        team: &str,
    ) -> Result<Pipeline> {
        let new_pipeline = NewPipeline {
            name: pipeline_name,
            team_name: team,
        };

        diesel::insert_into(pipelines::table)
            .values(&new_pipeline)
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating pipeline in database")?;

        dsl::pipelines
            .filter(name.eq(pipeline_name).and(team_name.eq(team)))
            .first::<Pipeline>(database_connection)
            .map_err(Error::from)
    }
}
