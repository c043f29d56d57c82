use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use diesel::prelude::*;
use diesel::PgConnection;

use crate::db::models::Pipeline;
use crate::db::models::ResourceConfigScope;
use crate::schema::resource_types;

/// A user-defined resource type declared in a pipeline.
///
/// Same lifecycle as a resource; additionally serves as the image of the
/// resources using it, which is why it participates in checking itself.
#[derive(Debug, Eq, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(Pipeline))]
#[diesel(table_name = resource_types)]
pub struct ResourceType {
    pub id: i32,
    pub pipeline_id: i32,
    pub name: String,
    pub type_: String,
    pub resource_config_scope_id: Option<i32>,
    pub check_error: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = resource_types)]
struct NewResourceType<'a> {
    pub pipeline_id: i32,
    pub name: &'a str,
    pub type_: &'a str,
}

impl ResourceType {
    pub fn create(
        database_connection: &mut PgConnection,
        pipeline: &Pipeline,
        type_name: &str,
        base_type: &str,
    ) -> Result<ResourceType> {
        let new_type = NewResourceType {
            pipeline_id: pipeline.id,
            name: type_name,
            type_: base_type,
        };

        diesel::insert_into(resource_types::table)
            .values(&new_type)
            .on_conflict_do_nothing()
            .execute(database_connection)
            .context("Creating resource type in database")?;

        resource_types::table
            .filter(
                resource_types::pipeline_id
                    .eq(pipeline.id)
                    .and(resource_types::name.eq(type_name)),
            )
            .first::<ResourceType>(database_connection)
            .map_err(Error::from)
    }

    pub fn assign_scope(
        &mut self,
        database_connection: &mut PgConnection,
        scope: &ResourceConfigScope,
    ) -> Result<()> {
        diesel::update(resource_types::table.find(self.id))
            .set(resource_types::resource_config_scope_id.eq(scope.id))
            .execute(database_connection)
            .context("Assigning resource type scope")?;

        self.resource_config_scope_id = Some(scope.id);
        Ok(())
    }

    pub fn set_check_error(
        &self,
        database_connection: &mut PgConnection,
        error: Option<&str>,
    ) -> Result<()> {
        diesel::update(resource_types::table.find(self.id))
            .set(resource_types::check_error.eq(error))
            .execute(database_connection)
            .context("Setting resource type check error")
            .map(|_| ())
    }
}
