use crate::model::{EntitiesWithExtInfo, EntityWithExtInfo, ObjectId};
use serde::{Deserialize, Serialize};

/// Message published by a metadata source (a hook) for ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookMessage {
    EntityCreate {
        #[serde(default)]
        user: Option<String>,
        entities: EntitiesWithExtInfo,
    },
    EntityPartialUpdate {
        #[serde(default)]
        user: Option<String>,
        #[serde(rename = "entityId")]
        entity_id: ObjectId,
        entity: EntityWithExtInfo,
    },
    EntityFullUpdate {
        #[serde(default)]
        user: Option<String>,
        entities: EntitiesWithExtInfo,
    },
    EntityDelete {
        #[serde(default)]
        user: Option<String>,
        entities: Vec<ObjectId>,
    },
}

impl HookMessage {
    pub fn user(&self) -> Option<&str> {
        match self {
            HookMessage::EntityCreate { user, .. }
            | HookMessage::EntityPartialUpdate { user, .. }
            | HookMessage::EntityFullUpdate { user, .. }
            | HookMessage::EntityDelete { user, .. } => user.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HookMessage::EntityCreate { .. } => "ENTITY_CREATE",
            HookMessage::EntityPartialUpdate { .. } => "ENTITY_PARTIAL_UPDATE",
            HookMessage::EntityFullUpdate { .. } => "ENTITY_FULL_UPDATE",
            HookMessage::EntityDelete { .. } => "ENTITY_DELETE",
        }
    }
}
