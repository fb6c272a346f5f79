//! # External Id Mapping Repository
//!
//! Records which internal entity a source-system record produced, so repeated
//! workflow runs reuse it instead of creating a duplicate.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use tracing::debug;

use super::{MappingStore, NewMapping};
use crate::error::is_unique_violation;
use crate::models::TargetService;
use crate::models::external_id_mapping::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct SeaOrmMappingStore {
    db: DatabaseConnection,
}

impl SeaOrmMappingStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MappingStore for SeaOrmMappingStore {
    async fn find(
        &self,
        source_system: TargetService,
        source_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::SourceSystem.eq(source_system))
            .filter(Column::SourceId.eq(source_id))
            .one(&self.db)
            .await
    }

    async fn insert(&self, mapping: NewMapping) -> Result<Model, DbErr> {
        let row = ActiveModel {
            source_system: Set(mapping.source_system),
            source_id: Set(mapping.source_id.clone()),
            entity_type: Set(mapping.entity_type),
            internal_id: Set(mapping.internal_id),
            created_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        match row.insert(&self.db).await {
            Ok(model) => Ok(model),
            Err(err) if is_unique_violation(&err) => {
                debug!(
                    source_system = %mapping.source_system,
                    source_id = %mapping.source_id,
                    "Mapping already exists; returning existing row"
                );
                self.find(mapping.source_system, &mapping.source_id)
                    .await?
                    .ok_or(err)
            }
            Err(err) => Err(err),
        }
    }
}
