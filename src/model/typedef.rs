use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Category of an attribute's type. Closed: every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeCategory {
    Primitive,
    Enum,
    Struct,
    ObjectId,
    Array,
    Map,
    Classification,
}

impl fmt::Display for TypeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeCategory::Primitive => "PRIMITIVE",
            TypeCategory::Enum => "ENUM",
            TypeCategory::Struct => "STRUCT",
            TypeCategory::ObjectId => "OBJECT_ID_TYPE",
            TypeCategory::Array => "ARRAY",
            TypeCategory::Map => "MAP",
            TypeCategory::Classification => "CLASSIFICATION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    #[default]
    Single,
    List,
    Set,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default = "default_true")]
    pub is_optional: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_indexable: bool,
    /// Target lifecycle is bound to the owner (composite reference)
    #[serde(default)]
    pub is_owned_ref: bool,
    /// Stored as a `typeName:guid` string property instead of an edge
    #[serde(default)]
    pub is_soft_ref: bool,
    /// Attribute on the referenced type that mirrors this reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            cardinality: Cardinality::Single,
            is_optional: true,
            is_unique: false,
            is_indexable: false,
            is_owned_ref: false,
            is_soft_ref: false,
            inverse_ref: None,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_optional = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self.is_indexable = true;
        self
    }

    pub fn indexable(mut self) -> Self {
        self.is_indexable = true;
        self
    }

    pub fn owned(mut self) -> Self {
        self.is_owned_ref = true;
        self
    }

    pub fn soft(mut self) -> Self {
        self.is_soft_ref = true;
        self
    }

    pub fn inverse_of(mut self, attribute: impl Into<String>) -> Self {
        self.inverse_ref = Some(attribute.into());
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumDef {
    pub name: String,
    pub elements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructDef {
    pub name: String,
    #[serde(default)]
    pub attribute_defs: Vec<AttributeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationDef {
    pub name: String,
    #[serde(default)]
    pub super_types: Vec<String>,
    #[serde(default)]
    pub attribute_defs: Vec<AttributeDef>,
    /// Entity types this classification may be attached to; empty means any
    #[serde(default)]
    pub entity_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDef {
    pub name: String,
    #[serde(default)]
    pub super_types: Vec<String>,
    #[serde(default)]
    pub attribute_defs: Vec<AttributeDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipCategory {
    #[default]
    Association,
    Aggregation,
    Composition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipEndDef {
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub is_container: bool,
}

impl RelationshipEndDef {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            cardinality,
            is_container: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDef {
    pub name: String,
    #[serde(default)]
    pub category: RelationshipCategory,
    pub end1: RelationshipEndDef,
    pub end2: RelationshipEndDef,
    #[serde(default)]
    pub attribute_defs: Vec<AttributeDef>,
}

impl RelationshipDef {
    /// Edge label shared by every instance of this relationship type
    pub fn edge_label(&self) -> String {
        format!("r:{}", self.name)
    }
}

/// Bundle of type definitions registered together
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypesDef {
    #[serde(default)]
    pub enum_defs: Vec<EnumDef>,
    #[serde(default)]
    pub struct_defs: Vec<StructDef>,
    #[serde(default)]
    pub classification_defs: Vec<ClassificationDef>,
    #[serde(default)]
    pub entity_defs: Vec<EntityDef>,
    #[serde(default)]
    pub relationship_defs: Vec<RelationshipDef>,
}
