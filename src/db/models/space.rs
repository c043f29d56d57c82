use diesel::prelude::*;

use crate::db::models::ResourceConfigScope;
use crate::schema::spaces;

#[derive(Debug, Eq, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(ResourceConfigScope))]
#[diesel(table_name = spaces)]
pub struct Space {
    pub id: i32,
    pub resource_config_scope_id: i32,
    pub name: String,
    pub latest_resource_version_id: Option<i32>,
}
