//! ExternalIdMapping entity model
//!
//! Links a record in a foreign system to the internal entity it produced, e.g.
//! `(quotewerks, "42") -> project "proj-7"`. `(source_system, source_id)` is
//! unique.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;

use super::types::{EntityType, TargetService};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "external_id_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub source_system: TargetService,

    pub source_id: String,

    /// Kind of the internal entity `internal_id` refers to
    pub entity_type: EntityType,

    pub internal_id: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
