use crate::model::{next_internal_guid, Guid, RelatedObjectId, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reference to an entity, either by guid or by type plus unique attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub unique_attributes: HashMap<String, Value>,
}

impl ObjectId {
    pub fn new(guid: impl Into<Guid>, type_name: impl Into<String>) -> Self {
        Self {
            guid: Some(guid.into()),
            type_name: type_name.into(),
            unique_attributes: HashMap::new(),
        }
    }

    pub fn by_unique_attribute(
        type_name: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let mut unique_attributes = HashMap::new();
        unique_attributes.insert(attribute.into(), value.into());
        Self {
            guid: None,
            type_name: type_name.into(),
            unique_attributes,
        }
    }

    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref().filter(|g| !g.is_empty())
    }

    pub fn is_valid(&self) -> bool {
        self.guid().is_some() || !self.unique_attributes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Struct {
    pub type_name: String,
    pub attributes: HashMap<String, AttrValue>,
}

impl Struct {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// An attribute value as carried by entities, structs and classifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Struct(Struct),
    ObjectId(ObjectId),
    Array(Vec<AttrValue>),
    Map(HashMap<String, AttrValue>),
    Primitive(Value),
}

impl AttrValue {
    pub fn null() -> Self {
        AttrValue::Primitive(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Primitive(Value::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Primitive(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<&ObjectId> {
        match self {
            AttrValue::ObjectId(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            AttrValue::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<AttrValue>> {
        match self {
            AttrValue::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, AttrValue>> {
        match self {
            AttrValue::Map(values) => Some(values),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Primitive(Value::String(value.to_string()))
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Primitive(Value::String(value))
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Primitive(Value::from(value))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Primitive(Value::Bool(value))
    }
}

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        AttrValue::Primitive(value)
    }
}

impl From<ObjectId> for AttrValue {
    fn from(value: ObjectId) -> Self {
        AttrValue::ObjectId(value)
    }
}

impl From<Struct> for AttrValue {
    fn from(value: Struct) -> Self {
        AttrValue::Struct(value)
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(values: Vec<T>) -> Self {
        AttrValue::Array(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub type_name: String,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_guid: Option<Guid>,
}

impl Classification {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: HashMap::new(),
            entity_guid: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Value of a relationship-backed attribute on a retrieved entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipAttrValue {
    Many(Vec<RelatedObjectId>),
    Single(RelatedObjectId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub type_name: String,
    #[serde(default = "next_internal_guid")]
    pub guid: Guid,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub relationship_attributes: HashMap<String, RelationshipAttrValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifications: Vec<Classification>,
}

impl Entity {
    /// New entity carrying a temporary guid
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            guid: next_internal_guid(),
            status: Status::Active,
            version: 0,
            created_by: None,
            updated_by: None,
            create_time: None,
            update_time: None,
            attributes: HashMap::new(),
            relationship_attributes: HashMap::new(),
            classifications: Vec::new(),
        }
    }

    pub fn with_guid(mut self, guid: impl Into<Guid>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classifications.push(classification);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.guid.clone(), self.type_name.clone())
    }

    pub fn classification_names(&self) -> Vec<String> {
        self.classifications.iter().map(|c| c.type_name.clone()).collect()
    }
}

/// Lightweight projection of an entity returned in mutation responses and searches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityHeader {
    pub type_name: String,
    pub guid: Guid,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    #[serde(default)]
    pub classification_names: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
}

/// One entity together with the entities it references, keyed by guid
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityWithExtInfo {
    pub entity: Option<Entity>,
    #[serde(default)]
    pub referred_entities: HashMap<Guid, Entity>,
}

impl EntityWithExtInfo {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity: Some(entity),
            referred_entities: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesWithExtInfo {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub referred_entities: HashMap<Guid, Entity>,
}

impl EntitiesWithExtInfo {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities,
            referred_entities: HashMap::new(),
        }
    }

    pub fn add_referred_entity(&mut self, entity: Entity) {
        self.referred_entities.insert(entity.guid.clone(), entity);
    }

    pub fn get_entity(&self, guid: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.guid == guid)
            .or_else(|| self.referred_entities.get(guid))
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.get_entity(guid).is_some()
    }
}

impl From<EntityWithExtInfo> for EntitiesWithExtInfo {
    fn from(value: EntityWithExtInfo) -> Self {
        Self {
            entities: value.entity.into_iter().collect(),
            referred_entities: value.referred_entities,
        }
    }
}
