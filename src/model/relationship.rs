use crate::model::{AttrValue, Guid, ObjectId, Status, Struct};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Instance of a relationship type connecting two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub type_name: String,
    #[serde(default)]
    pub guid: Option<Guid>,
    pub end1: ObjectId,
    pub end2: ObjectId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
}

impl Relationship {
    pub fn new(type_name: impl Into<String>, end1: ObjectId, end2: ObjectId) -> Self {
        Self {
            type_name: type_name.into(),
            guid: None,
            end1,
            end2,
            status: Status::Active,
            attributes: HashMap::new(),
            created_by: None,
            create_time: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Object id of the entity at the other end of a relationship, decorated with the relationship itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObjectId {
    pub guid: Guid,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub unique_attributes: HashMap<String, Value>,
    #[serde(default)]
    pub entity_status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    pub relationship_type: String,
    pub relationship_guid: Guid,
    pub relationship_status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_attributes: Option<Struct>,
}
